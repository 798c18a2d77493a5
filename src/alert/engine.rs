//! Alert decision engine.
//!
//! Consumes debounced status transitions and defacement verdicts, decides
//! when a condition becomes notification-worthy, deduplicates, persists the
//! alert, fans out to channels and publishes a live-update event.
//!
//! Category thresholds differ on purpose: a new untrusted domain is a strong
//! compromise signal and fires immediately, a low structural score needs two
//! consecutive verdicts, and a pixel-only change needs three because it is
//! the noisiest channel.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::db::{Alert, AlertCategory, Severity, Site, Store, Verdict};
use crate::events::{Event, Publisher};
use crate::probe::SiteStatus;

use super::channels;

/// A repeat alert for the same (site, category) within this window returns
/// the existing row instead of creating a new one.
const DEDUP_WINDOW_MINS: i64 = 60;

/// Structural score below this is treated as page-skeleton damage.
const STRUCTURAL_ALERT_FLOOR: f64 = 80.0;
const STRUCTURAL_STREAK: u32 = 2;
const PIXEL_ONLY_STREAK: u32 = 3;

pub struct AlertEngine {
    store: Store,
    publisher: Publisher,
    http: reqwest::Client,
    last_status: DashMap<i64, SiteStatus>,
    structural_streaks: DashMap<i64, u32>,
    pixel_streaks: DashMap<i64, u32>,
}

impl AlertEngine {
    pub fn new(store: Store, publisher: Publisher) -> Self {
        Self {
            store,
            publisher,
            http: reqwest::Client::new(),
            last_status: DashMap::new(),
            structural_streaks: DashMap::new(),
            pixel_streaks: DashMap::new(),
        }
    }

    /// React to a freshly evaluated debounced status.
    pub async fn on_status(&self, site: &Site, status: SiteStatus, response_time_ms: Option<i64>) {
        let previous = self.last_status.insert(site.id, status);

        match status {
            SiteStatus::Down if previous != Some(SiteStatus::Down) => {
                self.raise(
                    site,
                    AlertCategory::Down,
                    Severity::Critical,
                    format!("{} is down after 5 consecutive failed checks", site.name),
                )
                .await;
            }
            SiteStatus::Warning if previous != Some(SiteStatus::Warning) => {
                let ms = response_time_ms.unwrap_or(0);
                self.raise(
                    site,
                    AlertCategory::Slow,
                    Severity::Warning,
                    format!("{} is responding slowly ({} ms)", site.name, ms),
                )
                .await;
            }
            SiteStatus::Up if previous == Some(SiteStatus::Down) => {
                self.raise(
                    site,
                    AlertCategory::Recovered,
                    Severity::Info,
                    format!("{} has recovered", site.name),
                )
                .await;
            }
            _ => {}
        }
    }

    /// React to a defacement verdict. `new_domains` is the verdict's list of
    /// untrusted domains absent from the baseline allowlist.
    pub async fn on_verdict(&self, site: &Site, verdict: &Verdict, new_domains: &[String]) {
        // Domain injection is high-confidence tampering; one occurrence
        // alerts even when the hybrid score stays above the threshold
        // (a single new domain cannot breach it on its own).
        if !new_domains.is_empty() {
            self.raise(
                site,
                AlertCategory::Defaced,
                Severity::Critical,
                format!(
                    "{} is loading content from unexpected domains: {}",
                    site.name,
                    new_domains.join(", ")
                ),
            )
            .await;
        }

        if !verdict.is_defaced {
            self.structural_streaks.remove(&site.id);
            self.pixel_streaks.remove(&site.id);
            return;
        }

        if !new_domains.is_empty() {
            return;
        }

        let structural_damage = verdict
            .structural_score
            .is_some_and(|s| s < STRUCTURAL_ALERT_FLOOR);

        if structural_damage {
            let streak = self.bump(&self.structural_streaks, site.id);
            self.pixel_streaks.remove(&site.id);
            if streak >= STRUCTURAL_STREAK {
                self.raise(
                    site,
                    AlertCategory::Defaced,
                    Severity::Critical,
                    format!(
                        "{} page structure changed (structural score {:.1})",
                        site.name,
                        verdict.structural_score.unwrap_or(0.0)
                    ),
                )
                .await;
            }
        } else {
            let streak = self.bump(&self.pixel_streaks, site.id);
            self.structural_streaks.remove(&site.id);
            if streak >= PIXEL_ONLY_STREAK {
                self.raise(
                    site,
                    AlertCategory::Defaced,
                    Severity::Warning,
                    format!(
                        "{} looks visually different (pixel score {:.1})",
                        site.name, verdict.pixel_score
                    ),
                )
                .await;
            }
        }
    }

    fn bump(&self, streaks: &DashMap<i64, u32>, site_id: i64) -> u32 {
        let mut entry = streaks.entry(site_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Create the alert unless an equivalent one exists inside the dedup
    /// window, then fan out and publish.
    async fn raise(
        &self,
        site: &Site,
        category: AlertCategory,
        severity: Severity,
        message: String,
    ) -> Option<Alert> {
        let since = Utc::now() - ChronoDuration::minutes(DEDUP_WINDOW_MINS);
        match self.store.recent_alert(site.id, category, since) {
            Ok(Some(existing)) => {
                tracing::debug!(
                    "Suppressing duplicate {} alert for {}",
                    category.as_str(),
                    site.name
                );
                return Some(existing);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Alert dedup lookup failed for {}: {}", site.name, e);
                return None;
            }
        }

        let alert = match self
            .store
            .insert_alert(site.id, category, severity, &message, Utc::now())
        {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("Failed to persist alert for {}: {}", site.name, e);
                return None;
            }
        };

        tracing::info!(
            "Alert [{}] {} for {}: {}",
            severity.as_str(),
            category.as_str(),
            site.name,
            message
        );

        self.publisher.publish(Event::NewAlert {
            site_id: site.id,
            site_name: site.name.clone(),
            category: category.as_str(),
            severity: severity.as_str(),
            message,
        });

        self.fanout(site, &alert).await;
        Some(alert)
    }

    /// Deliver through every active channel; one failure never blocks the rest.
    async fn fanout(&self, site: &Site, alert: &Alert) {
        let channels = match self.store.active_channels() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Could not load alert channels: {}", e);
                return;
            }
        };

        for channel in channels {
            if let Err(e) = channels::dispatch(&self.http, &channel, site, alert).await {
                tracing::error!(
                    "Channel {} ({}) delivery failed: {}",
                    channel.id,
                    channel.kind,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn engine() -> (NamedTempFile, AlertEngine, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let engine = AlertEngine::new(store.clone(), Publisher::new(16));
        (tmp, engine, store)
    }

    fn site(id: i64) -> Site {
        Site {
            id,
            name: format!("site-{}", id),
            url: "https://example.com".to_string(),
            ..Site::default()
        }
    }

    fn verdict(site_id: i64, is_defaced: bool, structural: Option<f64>, pixel: f64) -> Verdict {
        Verdict {
            id: 0,
            site_id,
            baseline_id: 1,
            snapshot_id: 1,
            pixel_score: pixel,
            structural_score: structural,
            domain_score: Some(100.0),
            hybrid_score: pixel,
            is_defaced,
            diff_blob_key: None,
            detection_mode: "hybrid".to_string(),
            compared_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_down_transition_raises_critical_once() {
        let (_tmp, engine, store) = engine();
        let s = site(1);

        engine.on_status(&s, SiteStatus::Down, None).await;
        // Same state again does not re-alert, and dedup would catch it anyway.
        engine.on_status(&s, SiteStatus::Down, None).await;

        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Down);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_recovery_after_down() {
        let (_tmp, engine, store) = engine();
        let s = site(1);

        engine.on_status(&s, SiteStatus::Down, None).await;
        engine.on_status(&s, SiteStatus::Up, Some(100)).await;

        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].category, AlertCategory::Recovered);
        assert_eq!(alerts[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_up_without_prior_down_is_silent() {
        let (_tmp, engine, store) = engine();
        let s = site(1);

        engine.on_status(&s, SiteStatus::Up, Some(100)).await;
        engine.on_status(&s, SiteStatus::Up, Some(110)).await;

        assert!(store.alerts_page(1, 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_domain_alerts_on_first_verdict() {
        let (_tmp, engine, store) = engine();
        let s = site(1);

        let v = verdict(1, true, Some(100.0), 95.0);
        engine.on_verdict(&s, &v, &["evil.example".to_string()]).await;

        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].message.contains("evil.example"));
    }

    #[tokio::test]
    async fn test_single_domain_injection_alerts_despite_passing_score() {
        let (_tmp, engine, store) = engine();
        let s = site(1);

        // One injected domain with intact structure scores 90 at default
        // weights, above the threshold, but must still alert.
        let mut v = verdict(1, false, Some(100.0), 100.0);
        v.domain_score = Some(75.0);
        v.hybrid_score = 90.0;
        engine.on_verdict(&s, &v, &["evil.example".to_string()]).await;

        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Defaced);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].message.contains("evil.example"));
    }

    #[tokio::test]
    async fn test_structural_damage_needs_two_consecutive() {
        let (_tmp, engine, store) = engine();
        let s = site(1);
        let v = verdict(1, true, Some(60.0), 90.0);

        engine.on_verdict(&s, &v, &[]).await;
        assert!(store.alerts_page(1, 10, 0).unwrap().is_empty());

        engine.on_verdict(&s, &v, &[]).await;
        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_clean_verdict_resets_streak() {
        let (_tmp, engine, store) = engine();
        let s = site(1);
        let bad = verdict(1, true, Some(60.0), 90.0);
        let clean = verdict(1, false, Some(100.0), 100.0);

        engine.on_verdict(&s, &bad, &[]).await;
        engine.on_verdict(&s, &clean, &[]).await;
        engine.on_verdict(&s, &bad, &[]).await;

        assert!(store.alerts_page(1, 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pixel_only_needs_three_and_is_warning() {
        let (_tmp, engine, store) = engine();
        let s = site(1);
        // Structural intact, so this counts as a pixel-only change.
        let v = verdict(1, true, Some(95.0), 70.0);

        engine.on_verdict(&s, &v, &[]).await;
        engine.on_verdict(&s, &v, &[]).await;
        assert!(store.alerts_page(1, 10, 0).unwrap().is_empty());

        engine.on_verdict(&s, &v, &[]).await;
        let alerts = store.alerts_page(1, 10, 0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_dedup_returns_existing_row() {
        let (_tmp, engine, store) = engine();
        let s = site(1);
        let v = verdict(1, true, Some(100.0), 95.0);

        engine.on_verdict(&s, &v, &["evil.example".to_string()]).await;
        engine.on_verdict(&s, &v, &["evil.example".to_string()]).await;

        assert_eq!(store.alerts_page(1, 10, 0).unwrap().len(), 1);
    }
}
