//! Scheduler module: per-site timers, the durable job queue, worker pools
//! and retention.
//!
//! The scheduler owns one lightweight timer task per active site. Timers do
//! no work themselves; each tick enqueues a health-check job, and the worker
//! pools drain the queue. Stopping a site is a broadcast send to its timer.

mod queue;
mod retention;
mod workers;

pub use queue::*;
pub use retention::*;
pub use workers::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::db::{Site, Store};
use crate::events::{Event, Publisher, SiteStatusSummary};
use crate::probe::evaluate_status;

/// How often the bulk status sweep re-publishes every site's status.
const STATUS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Site lifecycle notifications from the management layer.
#[derive(Debug, Clone)]
pub enum SiteChange {
    Created(Site),
    Updated(Site),
    Removed(i64),
}

/// The main scheduler that feeds the job queue.
pub struct Scheduler {
    store: Store,
    queue: JobQueue,
    publisher: Publisher,
    cfg: Config,
    stop_chans: Arc<RwLock<HashMap<i64, tokio::sync::broadcast::Sender<()>>>>,
    sweep_stop: tokio::sync::broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(store: Store, queue: JobQueue, publisher: Publisher, cfg: Config) -> Self {
        let (sweep_stop, _) = tokio::sync::broadcast::channel(1);
        Self {
            store,
            queue,
            publisher,
            cfg,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            sweep_stop,
        }
    }

    /// Start a timer for every active site, spreading first runs across the
    /// stagger window so a restart does not probe the whole fleet at once.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sites = self.store.get_active_sites()?;

        tracing::info!("Starting scheduler with {} sites", sites.len());

        let count = sites.len();
        for (idx, site) in sites.into_iter().enumerate() {
            let delay = stagger_delay(idx, count, self.cfg.stagger_window_secs);
            self.add_site(site, delay).await;
        }

        self.start_status_sweep();
        Ok(())
    }

    /// Register a per-site timer. No-op if the site already has one.
    pub async fn add_site(&self, site: Site, initial_delay: Duration) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&site.id) {
            return;
        }

        // Subscribe before spawning: a remove_site racing the task's first
        // poll still lands its stop signal in the receiver's buffer.
        let (stop_tx, stop_rx) = tokio::sync::broadcast::channel(1);
        stop_chans.insert(site.id, stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: adding site {}", site.name);

        let queue = self.queue.clone();
        let interval_secs = self.cfg.clamp_interval(site.check_interval_secs);
        let timeout_secs = probe_timeout(&site, &self.cfg);
        let site_id = site.id;
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            run_site_loop(site, queue, interval_secs, timeout_secs, initial_delay, stop_rx).await;

            // Only unregister our own channel. After a remove+re-add the map
            // already holds the replacement timer's sender.
            let mut chans = stop_chans.write().await;
            if chans
                .get(&site_id)
                .is_some_and(|tx| tx.same_channel(&stop_tx))
            {
                chans.remove(&site_id);
            }
        });
    }

    /// Stop a site's timer.
    pub async fn remove_site(&self, id: i64) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(&id) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: removed site {}", id);
        }
    }

    /// Apply a site lifecycle change. An update restarts the timer so a new
    /// interval takes effect immediately; a deactivated site is just removed.
    pub async fn apply_change(&self, change: SiteChange) {
        match change {
            SiteChange::Created(site) => {
                if site.active {
                    self.add_site(site, Duration::ZERO).await;
                }
            }
            SiteChange::Updated(site) => {
                self.remove_site(site.id).await;
                if site.active {
                    self.add_site(site, Duration::ZERO).await;
                }
            }
            SiteChange::Removed(id) => self.remove_site(id).await,
        }
    }

    /// Operator-requested immediate health check. Jumps the queue.
    pub fn force_recheck(&self, site: &Site) -> Result<i64, QueueError> {
        self.queue.enqueue(
            &JobPayload::HealthCheck {
                site_id: site.id,
                url: site.url.clone(),
                timeout_secs: probe_timeout(site, &self.cfg),
            },
            PRIORITY_MANUAL,
        )
    }

    /// Operator-requested immediate capture. Jumps the queue and is exempt
    /// from the screenshot suppression window downstream.
    pub fn force_refresh(&self, site: &Site) -> Result<i64, QueueError> {
        self.queue.enqueue(
            &JobPayload::Screenshot {
                site_id: site.id,
                url: site.url.clone(),
            },
            PRIORITY_MANUAL,
        )
    }

    /// Periodically re-publish every active site's debounced status so
    /// late-joining dashboard clients converge without a query.
    fn start_status_sweep(&self) {
        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let warning_ms = self.cfg.warning_response_ms;
        let mut rx = self.sweep_stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match bulk_status(&store, warning_ms) {
                            Ok(sites) => publisher.publish(Event::BulkStatusUpdate { sites }),
                            Err(e) => tracing::error!("Status sweep failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Stop every timer and the sweep task.
    pub async fn shutdown(&self) {
        let _ = self.sweep_stop.send(());
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
    }
}

/// Effective probe timeout for a site.
pub fn probe_timeout(site: &Site, cfg: &Config) -> u64 {
    if site.timeout_secs > 0 {
        site.timeout_secs as u64
    } else {
        cfg.probe_timeout_secs
    }
}

/// Initial delay for the `index`-th of `count` sites within the window.
fn stagger_delay(index: usize, count: usize, window_secs: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(window_secs * 1000 * index as u64 / count as u64)
}

fn bulk_status(
    store: &Store,
    warning_ms: i64,
) -> Result<Vec<SiteStatusSummary>, crate::db::DbError> {
    let mut out = Vec::new();
    for site in store.get_active_sites()? {
        let recent = store.recent_probe_results(site.id, 10)?;
        let status = evaluate_status(&recent, warning_ms);
        out.push(SiteStatusSummary {
            site_id: site.id,
            site_name: site.name,
            status: status.as_str(),
        });
    }
    Ok(out)
}

/// Timer loop for one site: wait out the stagger delay, then enqueue a
/// health check per interval tick until stopped.
async fn run_site_loop(
    site: Site,
    queue: JobQueue,
    interval_secs: i64,
    timeout_secs: u64,
    initial_delay: Duration,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    // Biased: a buffered stop must win over an already elapsed delay or
    // tick, or a removed site could still enqueue work.
    tokio::select! {
        biased;
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1) as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let payload = JobPayload::HealthCheck {
                    site_id: site.id,
                    url: site.url.clone(),
                    timeout_secs,
                };
                if let Err(e) = queue.enqueue(&payload, PRIORITY_NORMAL) {
                    tracing::error!("Failed to enqueue health check for {}: {}", site.name, e);
                }
            }
        }
    }
}
