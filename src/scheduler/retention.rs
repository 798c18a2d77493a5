//! Retention manager for sweeping old event-log data.
//!
//! Probe results, verdicts and snapshots older than the configured horizon
//! are deleted periodically. Snapshots referenced by an active baseline are
//! never touched, and blob files are removed together with their rows.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::blob::BlobStore;
use crate::db::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Finished queue rows are kept briefly for inspection, then swept.
const FINISHED_JOB_RETENTION_HOURS: i64 = 24;

/// Manager for deleting data past the retention horizon.
pub struct RetentionManager {
    store: Store,
    blobs: BlobStore,
    retention_days: i64,
    stop: tokio::sync::broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Store, blobs: BlobStore, retention_days: i64) -> Self {
        let (stop, _) = tokio::sync::broadcast::channel(1);
        Self {
            store,
            blobs,
            retention_days,
            stop,
        }
    }

    /// Start the periodic sweep task.
    pub fn start(&self) {
        let store = self.store.clone();
        let blobs = self.blobs.clone();
        let retention_days = self.retention_days;
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        sweep(&store, &blobs, retention_days);
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// One sweep pass. Failures are logged and retried next interval.
pub fn sweep(store: &Store, blobs: &BlobStore, retention_days: i64) {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);

    match store.delete_probe_results_before(cutoff) {
        Ok(n) if n > 0 => tracing::info!("Retention: deleted {} probe results", n),
        Ok(_) => {}
        Err(e) => tracing::error!("Retention: probe result sweep failed: {}", e),
    }

    match store.delete_verdicts_before(cutoff) {
        Ok(n) if n > 0 => tracing::info!("Retention: deleted {} verdicts", n),
        Ok(_) => {}
        Err(e) => tracing::error!("Retention: verdict sweep failed: {}", e),
    }

    match store.stale_snapshots(cutoff) {
        Ok(snapshots) => {
            for snap in snapshots {
                if let Err(e) = blobs.delete(&snap.blob_key) {
                    tracing::error!("Retention: blob delete {} failed: {}", snap.blob_key, e);
                    continue;
                }
                let thumb = BlobStore::thumbnail_key(&snap.blob_key);
                if let Err(e) = blobs.delete(&thumb) {
                    tracing::error!("Retention: thumbnail delete {} failed: {}", thumb, e);
                }
                if let Err(e) = store.delete_snapshot(snap.id) {
                    tracing::error!("Retention: snapshot row delete {} failed: {}", snap.id, e);
                }
            }
        }
        Err(e) => tracing::error!("Retention: snapshot sweep failed: {}", e),
    }

    let job_cutoff = Utc::now() - ChronoDuration::hours(FINISHED_JOB_RETENTION_HOURS);
    if let Err(e) = store.delete_finished_jobs_before(job_cutoff) {
        tracing::error!("Retention: job sweep failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Baseline, Snapshot};
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_sweep_preserves_baseline_snapshot() {
        let tmp_db = NamedTempFile::new().unwrap();
        let tmp_blobs = TempDir::new().unwrap();
        let store = Store::new(tmp_db.path()).unwrap();
        let blobs = BlobStore::open(tmp_blobs.path()).unwrap();

        let old = Utc::now() - ChronoDuration::days(90);
        let kept_key = "current/1_1.png".to_string();
        let swept_key = "current/1_2.png".to_string();
        blobs.put(&kept_key, b"kept").unwrap();
        blobs.put(&swept_key, b"swept").unwrap();

        let kept_id = store
            .add_snapshot(&Snapshot {
                id: 0,
                site_id: 1,
                blob_key: kept_key.clone(),
                byte_size: 4,
                captured_at: old,
            })
            .unwrap();
        let swept_id = store
            .add_snapshot(&Snapshot {
                id: 0,
                site_id: 1,
                blob_key: swept_key.clone(),
                byte_size: 5,
                captured_at: old,
            })
            .unwrap();

        store
            .create_baseline(&Baseline {
                id: 0,
                site_id: 1,
                snapshot_id: kept_id,
                structural_hash: None,
                tag_paths: "[]".into(),
                domain_allowlist: "[]".into(),
                content_hash: None,
                active: true,
                created_at: Utc::now(),
            })
            .unwrap();

        sweep(&store, &blobs, 30);

        assert!(store.get_snapshot(kept_id).is_ok());
        assert!(blobs.get(&kept_key).is_ok());
        assert!(store.get_snapshot(swept_id).is_err());
        assert!(blobs.get(&swept_key).is_err());
    }
}
