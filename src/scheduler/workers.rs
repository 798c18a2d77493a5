//! Worker pools draining the job queue.
//!
//! One pool per job kind, each bounded by its own semaphore. A pool polls
//! the queue, claims due jobs and runs each on its own task while holding a
//! permit. Handler failures are recorded on the job and retried by the queue
//! layer; a worker task itself never dies to a job error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::{JobKind, JobPayload, JobQueue, QueueError, PRIORITY_MANUAL, PRIORITY_NORMAL};
use crate::alert::AlertEngine;
use crate::blob::{BlobError, BlobStore, Bucket};
use crate::capture::{make_thumbnail, CaptureError, Capturer};
use crate::config::Config;
use crate::db::{Baseline, DbError, JobRow, ProbeResult, Site, Snapshot, Store, Verdict};
use crate::detect::{
    extract_external_domains, fingerprint, BaselineData, CompareInput, DetectError, DetectionMode,
    Engine, Weights,
};
use crate::events::{Event, Publisher};
use crate::probe::{evaluate_status, run_health_probe};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Per-site screenshot suppression: frequent health checks must not force
/// frequent captures. Entry semantics make check-and-set atomic.
pub struct ScreenshotGate {
    last_capture: DashMap<i64, Instant>,
    window: Duration,
}

impl ScreenshotGate {
    pub fn new(window: Duration) -> Self {
        Self {
            last_capture: DashMap::new(),
            window,
        }
    }

    /// True when no capture happened inside the window; claims the slot.
    pub fn try_claim(&self, site_id: i64) -> bool {
        match self.last_capture.entry(site_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().elapsed() >= self.window {
                    occupied.insert(Instant::now());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                true
            }
        }
    }

    /// Claim the slot unconditionally (manual refresh).
    pub fn force(&self, site_id: i64) {
        self.last_capture.insert(site_id, Instant::now());
    }

    pub fn forget(&self, site_id: i64) {
        self.last_capture.remove(&site_id);
    }
}

struct WorkerCtx {
    store: Store,
    queue: JobQueue,
    blobs: BlobStore,
    publisher: Publisher,
    capturer: Arc<Capturer>,
    alerts: Arc<AlertEngine>,
    detector: Engine,
    gate: ScreenshotGate,
    cfg: Config,
}

/// The three worker pools.
pub struct Workers {
    ctx: Arc<WorkerCtx>,
    stop: tokio::sync::broadcast::Sender<()>,
}

impl Workers {
    pub fn new(
        store: Store,
        queue: JobQueue,
        blobs: BlobStore,
        publisher: Publisher,
        capturer: Arc<Capturer>,
        alerts: Arc<AlertEngine>,
        cfg: Config,
    ) -> Result<Self, DetectError> {
        let detector = Engine::new(
            cfg.weights,
            cfg.defacement_threshold,
            cfg.trusted_domains.clone(),
        )?;
        let gate = ScreenshotGate::new(Duration::from_secs(cfg.screenshot_interval_secs));
        let (stop, _) = tokio::sync::broadcast::channel(1);
        Ok(Self {
            ctx: Arc::new(WorkerCtx {
                store,
                queue,
                blobs,
                publisher,
                capturer,
                alerts,
                detector,
                gate,
                cfg,
            }),
            stop,
        })
    }

    /// Start the three pools.
    pub fn start(&self) {
        self.spawn_pool(JobKind::HealthCheck, self.ctx.cfg.health_concurrency);
        self.spawn_pool(JobKind::Screenshot, self.ctx.cfg.screenshot_concurrency);
        self.spawn_pool(JobKind::DefacementCheck, self.ctx.cfg.defacement_concurrency);
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    fn spawn_pool(&self, kind: JobKind, limit: usize) {
        let ctx = self.ctx.clone();
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(limit));
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        drain(&ctx, kind, &semaphore);
                    }
                }
            }
        });
    }

    /// Promote a fresh capture to the site's active baseline. Fingerprints
    /// and the domain allowlist are computed from the same render pass.
    pub async fn promote_baseline(&self, site: &Site) -> Result<i64, WorkerError> {
        let ctx = &self.ctx;
        let capture = ctx.capturer.capture(&site.url).await?;
        let now = Utc::now();

        let key = BlobStore::key_for(Bucket::Baselines, site.id, now);
        let byte_size = ctx.blobs.put(&key, &capture.image)? as i64;
        let snapshot_id = ctx.store.add_snapshot(&Snapshot {
            id: 0,
            site_id: site.id,
            blob_key: key,
            byte_size,
            captured_at: now,
        })?;

        let (structural_hash, tag_paths, content_hash, allowlist) = match &capture.html {
            Some(html) => {
                let ignore = ignore_selectors(site);
                let fp = fingerprint(html, &ignore);
                let domains = extract_external_domains(html, &site.url);
                (
                    Some(fp.structural_hash),
                    fp.tag_paths,
                    Some(fp.content_hash),
                    domains,
                )
            }
            None => (None, Vec::new(), None, Vec::new()),
        };

        let baseline_id = ctx.store.create_baseline(&Baseline {
            id: 0,
            site_id: site.id,
            snapshot_id,
            structural_hash,
            tag_paths: serde_json::to_string(&tag_paths).unwrap_or_else(|_| "[]".to_string()),
            domain_allowlist: serde_json::to_string(&allowlist)
                .unwrap_or_else(|_| "[]".to_string()),
            content_hash,
            active: true,
            created_at: now,
        })?;

        tracing::info!("Promoted new baseline {} for {}", baseline_id, site.name);
        Ok(baseline_id)
    }
}

/// Claim and dispatch due jobs until the queue is empty or permits run out.
fn drain(ctx: &Arc<WorkerCtx>, kind: JobKind, semaphore: &Arc<Semaphore>) {
    loop {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => break,
        };
        match ctx.queue.claim(kind) {
            Ok(Some((row, payload))) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job(&ctx, kind, row, payload).await;
                });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Claiming {} job failed: {}", kind.as_str(), e);
                break;
            }
        }
    }
}

async fn run_job(ctx: &WorkerCtx, kind: JobKind, row: JobRow, payload: JobPayload) {
    let result = match payload {
        JobPayload::HealthCheck {
            site_id,
            url,
            timeout_secs,
        } => handle_health(ctx, &row, site_id, &url, timeout_secs).await,
        JobPayload::Screenshot { site_id, url } => handle_screenshot(ctx, site_id, &url).await,
        JobPayload::DefacementCheck {
            site_id,
            snapshot_id,
            baseline_id,
            html,
        } => handle_defacement(ctx, site_id, snapshot_id, baseline_id, html.as_deref()).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(row.id) {
                tracing::error!("Completing job {} failed: {}", row.id, e);
            }
        }
        Err(e) => {
            tracing::error!("{} job {} failed: {}", kind.as_str(), row.id, e);
            match ctx.queue.retry_or_fail(&row, kind) {
                Ok(true) => tracing::debug!("Job {} rescheduled", row.id),
                Ok(false) => tracing::warn!("Job {} exhausted its attempts", row.id),
                Err(e2) => tracing::error!("Retry bookkeeping for job {} failed: {}", row.id, e2),
            }
        }
    }
}

/// Run a probe, persist the result, re-evaluate the debounced status and
/// decide whether a capture is due.
async fn handle_health(
    ctx: &WorkerCtx,
    row: &JobRow,
    site_id: i64,
    url: &str,
    timeout_secs: u64,
) -> Result<(), WorkerError> {
    let site = match load_site(ctx, site_id)? {
        Some(s) => s,
        None => return Ok(()), // deleted since enqueue
    };

    let outcome = run_health_probe(url, Duration::from_secs(timeout_secs)).await;
    ctx.store.add_probe_result(&ProbeResult {
        id: 0,
        site_id,
        status_code: outcome.status_code,
        response_time_ms: outcome.response_time_ms,
        is_up: outcome.is_up,
        error: outcome.error.clone(),
        final_url: outcome.final_url.clone(),
        checked_at: Utc::now(),
    })?;

    let recent = ctx.store.recent_probe_results(site_id, 10)?;
    let status = evaluate_status(&recent, ctx.cfg.warning_response_ms);

    ctx.publisher.publish(Event::StatusUpdate {
        site_id,
        site_name: site.name.clone(),
        status: status.as_str(),
        response_time_ms: Some(outcome.response_time_ms),
    });
    ctx.alerts
        .on_status(&site, status, Some(outcome.response_time_ms))
        .await;

    // Captures only make sense for a site that served something.
    if outcome.is_up {
        let manual = row.priority >= PRIORITY_MANUAL;
        let due = if manual {
            ctx.gate.force(site_id);
            true
        } else {
            ctx.gate.try_claim(site_id)
        };
        if due {
            let priority = if manual { PRIORITY_MANUAL } else { PRIORITY_NORMAL };
            ctx.queue.enqueue(
                &JobPayload::Screenshot {
                    site_id,
                    url: site.url.clone(),
                },
                priority,
            )?;
        }
    }

    Ok(())
}

/// Capture the page, persist blob + thumbnail + snapshot row, and chain a
/// defacement check when the site has an active baseline.
async fn handle_screenshot(ctx: &WorkerCtx, site_id: i64, url: &str) -> Result<(), WorkerError> {
    let site = match load_site(ctx, site_id)? {
        Some(s) => s,
        None => return Ok(()),
    };

    let capture = ctx.capturer.capture(url).await?;
    let now = Utc::now();

    let key = BlobStore::key_for(Bucket::Current, site_id, now);
    let byte_size = ctx.blobs.put(&key, &capture.image)? as i64;

    let (tw, th) = ctx.capturer.thumbnail_size();
    match make_thumbnail(&capture.image, tw, th) {
        Ok(thumb) => {
            ctx.blobs.put(&BlobStore::thumbnail_key(&key), &thumb)?;
        }
        Err(e) => tracing::warn!("Thumbnail for {} failed: {}", site.name, e),
    }

    let snapshot_id = ctx.store.add_snapshot(&Snapshot {
        id: 0,
        site_id,
        blob_key: key,
        byte_size,
        captured_at: now,
    })?;

    if let Some(baseline) = ctx.store.active_baseline(site_id)? {
        ctx.queue.enqueue(
            &JobPayload::DefacementCheck {
                site_id,
                snapshot_id,
                baseline_id: baseline.id,
                html: capture.html,
            },
            PRIORITY_NORMAL,
        )?;
    } else {
        tracing::debug!("No baseline for {}, skipping comparison", site.name);
    }

    Ok(())
}

/// Compare a snapshot against its baseline and persist the verdict.
async fn handle_defacement(
    ctx: &WorkerCtx,
    site_id: i64,
    snapshot_id: i64,
    baseline_id: i64,
    html: Option<&str>,
) -> Result<(), WorkerError> {
    let site = match load_site(ctx, site_id)? {
        Some(s) => s,
        None => return Ok(()),
    };

    let baseline = ctx.store.get_baseline(baseline_id)?;
    let snapshot = ctx.store.get_snapshot(snapshot_id)?;
    let baseline_snapshot = ctx.store.get_snapshot(baseline.snapshot_id)?;

    let baseline_png = ctx.blobs.get(&baseline_snapshot.blob_key)?;
    let current_png = ctx.blobs.get(&snapshot.blob_key)?;

    let mode = DetectionMode::parse(&site.detection_mode).unwrap_or(DetectionMode::Hybrid);
    let weights: Option<Weights> = site
        .hybrid_weights
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());
    let ignore = ignore_selectors(&site);
    let tag_paths = baseline.tag_paths_vec();
    let allowlist = baseline.allowlist_vec();

    let cmp = ctx.detector.compare(CompareInput {
        baseline_png: &baseline_png,
        current_png: &current_png,
        baseline: BaselineData {
            structural_hash: baseline.structural_hash.as_deref(),
            tag_paths: &tag_paths,
            allowlist: &allowlist,
        },
        current_html: html,
        site_url: &site.url,
        mode,
        weights,
        ignore_selectors: &ignore,
    })?;

    let now = Utc::now();
    let diff_blob_key = match &cmp.overlay_png {
        Some(overlay) => {
            let key = BlobStore::key_for(Bucket::Diffs, site_id, now);
            ctx.blobs.put(&key, overlay)?;
            Some(key)
        }
        None => None,
    };

    let mut verdict = Verdict {
        id: 0,
        site_id,
        baseline_id,
        snapshot_id,
        pixel_score: cmp.pixel_score,
        structural_score: cmp.structural_score,
        domain_score: cmp.domain_score,
        hybrid_score: cmp.hybrid_score,
        is_defaced: cmp.is_defaced,
        diff_blob_key,
        detection_mode: cmp.mode_used.as_str().to_string(),
        compared_at: now,
    };
    verdict.id = ctx.store.add_verdict(&verdict)?;

    if cmp.is_defaced {
        tracing::warn!(
            "Possible defacement of {}: hybrid score {:.1}",
            site.name,
            cmp.hybrid_score
        );
        ctx.publisher.publish(Event::DefacementDetected {
            site_id,
            site_name: site.name.clone(),
            hybrid_score: cmp.hybrid_score,
            snapshot_key: snapshot.blob_key.clone(),
            diff_key: verdict.diff_blob_key.clone(),
        });
    }

    ctx.alerts.on_verdict(&site, &verdict, &cmp.new_domains).await;
    Ok(())
}

fn load_site(ctx: &WorkerCtx, site_id: i64) -> Result<Option<Site>, DbError> {
    match ctx.store.get_site(site_id) {
        Ok(site) => Ok(Some(site)),
        Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn ignore_selectors(site: &Site) -> Vec<String> {
    serde_json::from_str(&site.ignore_selectors).unwrap_or_default()
}
