//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Sites (written by the management layer, read by the pipeline) ---

    /// Add a new site and return its ID.
    pub fn add_site(&self, site: &mut Site) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sites (name, url, check_interval_secs, timeout_secs, detection_mode, hybrid_weights, ignore_selectors, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                site.name,
                site.url,
                site.check_interval_secs,
                site.timeout_secs,
                site.detection_mode,
                site.hybrid_weights,
                site.ignore_selectors,
                site.active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        site.id = id;
        Ok(id)
    }

    /// Update an existing site.
    pub fn update_site(&self, site: &Site) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sites SET name=?1, url=?2, check_interval_secs=?3, timeout_secs=?4,
             detection_mode=?5, hybrid_weights=?6, ignore_selectors=?7, active=?8 WHERE id=?9",
            params![
                site.name,
                site.url,
                site.check_interval_secs,
                site.timeout_secs,
                site.detection_mode,
                site.hybrid_weights,
                site.ignore_selectors,
                site.active,
                site.id,
            ],
        )?;
        Ok(())
    }

    /// Get a site by ID.
    pub fn get_site(&self, id: i64) -> Result<Site, DbError> {
        let conn = self.conn.lock().unwrap();
        let site = conn.query_row(
            "SELECT id, name, url, check_interval_secs, timeout_secs, detection_mode, hybrid_weights, ignore_selectors, active
             FROM sites WHERE id = ?1",
            params![id],
            row_to_site,
        )?;
        Ok(site)
    }

    /// Get all active sites, ordered by ID for stable stagger indexing.
    pub fn get_active_sites(&self) -> Result<Vec<Site>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, url, check_interval_secs, timeout_secs, detection_mode, hybrid_weights, ignore_selectors, active
             FROM sites WHERE active = 1 ORDER BY id ASC",
        )?;
        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Delete a site. Its event logs are removed by the retention sweep.
    pub fn delete_site(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Probe results ---

    /// Append a probe result and return its ID.
    pub fn add_probe_result(&self, r: &ProbeResult) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO probe_results (site_id, status_code, response_time_ms, is_up, error, final_url, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                r.site_id,
                r.status_code,
                r.response_time_ms,
                r.is_up,
                r.error,
                r.final_url,
                fmt_time(r.checked_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent probe results for a site, newest first.
    pub fn recent_probe_results(&self, site_id: i64, limit: i64) -> Result<Vec<ProbeResult>, DbError> {
        self.probe_results_page(site_id, limit, 0)
    }

    /// Paginated probe results, newest first.
    pub fn probe_results_page(
        &self,
        site_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, site_id, status_code, response_time_ms, is_up, error, final_url, checked_at
             FROM probe_results WHERE site_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let results = stmt
            .query_map(params![site_id, limit, offset], row_to_probe_result)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Delete probe results before a cutoff time.
    pub fn delete_probe_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM probe_results WHERE checked_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Snapshots ---

    /// Append a snapshot record and return its ID.
    pub fn add_snapshot(&self, s: &Snapshot) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshots (site_id, blob_key, byte_size, captured_at) VALUES (?1, ?2, ?3, ?4)",
            params![s.site_id, s.blob_key, s.byte_size, fmt_time(s.captured_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a snapshot by ID.
    pub fn get_snapshot(&self, id: i64) -> Result<Snapshot, DbError> {
        let conn = self.conn.lock().unwrap();
        let snap = conn.query_row(
            "SELECT id, site_id, blob_key, byte_size, captured_at FROM snapshots WHERE id = ?1",
            params![id],
            row_to_snapshot,
        )?;
        Ok(snap)
    }

    /// Paginated snapshots for a site, newest first.
    pub fn snapshots_page(&self, site_id: i64, limit: i64, offset: i64) -> Result<Vec<Snapshot>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, site_id, blob_key, byte_size, captured_at
             FROM snapshots WHERE site_id = ?1 ORDER BY captured_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let snaps = stmt
            .query_map(params![site_id, limit, offset], row_to_snapshot)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(snaps)
    }

    /// Snapshots older than the cutoff that no active baseline references.
    /// These are safe for the retention sweep to delete along with their blobs.
    pub fn stale_snapshots(&self, cutoff: DateTime<Utc>) -> Result<Vec<Snapshot>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, site_id, blob_key, byte_size, captured_at FROM snapshots
             WHERE captured_at < ?1
             AND id NOT IN (SELECT snapshot_id FROM baselines WHERE active = 1)",
        )?;
        let snaps = stmt
            .query_map(params![fmt_time(cutoff)], row_to_snapshot)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(snaps)
    }

    /// Delete a snapshot row.
    pub fn delete_snapshot(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Baselines ---

    /// Create a new active baseline, deactivating any previous one for the
    /// site in the same transaction. History rows are kept, not deleted.
    pub fn create_baseline(&self, b: &Baseline) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE baselines SET active = 0 WHERE site_id = ?1 AND active = 1",
            params![b.site_id],
        )?;
        tx.execute(
            "INSERT INTO baselines (site_id, snapshot_id, structural_hash, tag_paths, domain_allowlist, content_hash, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                b.site_id,
                b.snapshot_id,
                b.structural_hash,
                b.tag_paths,
                b.domain_allowlist,
                b.content_hash,
                fmt_time(b.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Get the active baseline for a site, if any.
    pub fn active_baseline(&self, site_id: i64) -> Result<Option<Baseline>, DbError> {
        let conn = self.conn.lock().unwrap();
        let baseline = conn
            .query_row(
                "SELECT id, site_id, snapshot_id, structural_hash, tag_paths, domain_allowlist, content_hash, active, created_at
                 FROM baselines WHERE site_id = ?1 AND active = 1",
                params![site_id],
                row_to_baseline,
            )
            .optional()?;
        Ok(baseline)
    }

    /// Get a baseline by ID.
    pub fn get_baseline(&self, id: i64) -> Result<Baseline, DbError> {
        let conn = self.conn.lock().unwrap();
        let baseline = conn.query_row(
            "SELECT id, site_id, snapshot_id, structural_hash, tag_paths, domain_allowlist, content_hash, active, created_at
             FROM baselines WHERE id = ?1",
            params![id],
            row_to_baseline,
        )?;
        Ok(baseline)
    }

    // --- Verdicts ---

    /// Append a defacement verdict and return its ID.
    pub fn add_verdict(&self, v: &Verdict) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO verdicts (site_id, baseline_id, snapshot_id, pixel_score, structural_score, domain_score, hybrid_score, is_defaced, diff_blob_key, detection_mode, compared_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                v.site_id,
                v.baseline_id,
                v.snapshot_id,
                v.pixel_score,
                v.structural_score,
                v.domain_score,
                v.hybrid_score,
                v.is_defaced,
                v.diff_blob_key,
                v.detection_mode,
                fmt_time(v.compared_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent verdicts for a site, newest first.
    pub fn recent_verdicts(&self, site_id: i64, limit: i64) -> Result<Vec<Verdict>, DbError> {
        self.verdicts_page(site_id, limit, 0)
    }

    /// Paginated verdicts, newest first.
    pub fn verdicts_page(&self, site_id: i64, limit: i64, offset: i64) -> Result<Vec<Verdict>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, site_id, baseline_id, snapshot_id, pixel_score, structural_score, domain_score, hybrid_score, is_defaced, diff_blob_key, detection_mode, compared_at
             FROM verdicts WHERE site_id = ?1 ORDER BY compared_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let verdicts = stmt
            .query_map(params![site_id, limit, offset], row_to_verdict)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(verdicts)
    }

    /// Delete verdicts before a cutoff time.
    pub fn delete_verdicts_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM verdicts WHERE compared_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Alerts ---

    /// Insert a new alert and return it with its assigned ID.
    pub fn insert_alert(
        &self,
        site_id: i64,
        category: AlertCategory,
        severity: Severity,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Alert, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (site_id, category, severity, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![site_id, category.as_str(), severity.as_str(), message, fmt_time(created_at)],
        )?;
        Ok(Alert {
            id: conn.last_insert_rowid(),
            site_id,
            category,
            severity,
            message: message.to_string(),
            acknowledged_by: None,
            acknowledged_at: None,
            created_at,
        })
    }

    /// Find the most recent alert for a (site, category) pair at or after
    /// `since`. Used for deduplication.
    pub fn recent_alert(
        &self,
        site_id: i64,
        category: AlertCategory,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, DbError> {
        let conn = self.conn.lock().unwrap();
        let alert = conn
            .query_row(
                "SELECT id, site_id, category, severity, message, acknowledged_by, acknowledged_at, created_at
                 FROM alerts WHERE site_id = ?1 AND category = ?2 AND created_at >= ?3
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![site_id, category.as_str(), fmt_time(since)],
                row_to_alert,
            )
            .optional()?;
        Ok(alert)
    }

    /// Mark an alert acknowledged. The only permitted mutation.
    pub fn acknowledge_alert(&self, id: i64, who: &str, when: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE alerts SET acknowledged_by = ?1, acknowledged_at = ?2
             WHERE id = ?3 AND acknowledged_by IS NULL",
            params![who, fmt_time(when), id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Paginated alerts for a site, newest first.
    pub fn alerts_page(&self, site_id: i64, limit: i64, offset: i64) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, site_id, category, severity, message, acknowledged_by, acknowledged_at, created_at
             FROM alerts WHERE site_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let alerts = stmt
            .query_map(params![site_id, limit, offset], row_to_alert)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    // --- Alert channels ---

    /// Add a notification channel and return its ID.
    pub fn add_channel(&self, kind: &str, settings: &str, active: bool) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_channels (kind, settings, active) VALUES (?1, ?2, ?3)",
            params![kind, settings, active],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get all active notification channels.
    pub fn active_channels(&self) -> Result<Vec<AlertChannel>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, kind, settings, active FROM alert_channels WHERE active = 1")?;
        let channels = stmt
            .query_map([], |row| {
                Ok(AlertChannel {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    settings: row.get(2)?,
                    active: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    // --- Job queue ---

    /// Enqueue a job. Payload validation happens in the queue layer.
    pub fn enqueue_job(
        &self,
        kind: &str,
        payload: &str,
        priority: i64,
        run_at: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (kind, payload, priority, run_at, attempts, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 'queued', ?5)",
            params![kind, payload, priority, fmt_time(run_at), fmt_time(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim the next due job of the given kind, moving it to
    /// the running state. Returns None when nothing is due.
    pub fn claim_job(&self, kind: &str, now: DateTime<Utc>) -> Result<Option<JobRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let job = tx
            .query_row(
                "SELECT id, kind, payload, priority, attempts FROM jobs
                 WHERE state = 'queued' AND kind = ?1 AND run_at <= ?2
                 ORDER BY priority DESC, run_at ASC, id ASC LIMIT 1",
                params![kind, fmt_time(now)],
                |row| {
                    Ok(JobRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        payload: row.get(2)?,
                        priority: row.get(3)?,
                        attempts: row.get(4)?,
                    })
                },
            )
            .optional()?;
        if let Some(ref j) = job {
            tx.execute(
                "UPDATE jobs SET state = 'running', attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
                params![fmt_time(now), j.id],
            )?;
        }
        tx.commit()?;
        Ok(job.map(|mut j| {
            j.attempts += 1;
            j
        }))
    }

    /// Mark a job done.
    pub fn complete_job(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET state = 'done', updated_at = ?1 WHERE id = ?2",
            params![fmt_time(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Requeue a failed job for a later attempt.
    pub fn reschedule_job(&self, id: i64, run_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET state = 'queued', run_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![fmt_time(run_at), fmt_time(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Mark a job permanently failed.
    pub fn fail_job(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET state = 'failed', updated_at = ?1 WHERE id = ?2",
            params![fmt_time(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Requeue running jobs whose lease expired (crashed or restarted worker).
    pub fn requeue_stale_running(&self, older_than: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = 'queued', updated_at = ?1
             WHERE state = 'running' AND updated_at < ?2",
            params![fmt_time(Utc::now()), fmt_time(older_than)],
        )?;
        Ok(n)
    }

    /// Delete finished jobs before a cutoff time.
    pub fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM jobs WHERE state IN ('done', 'failed') AND updated_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }
}

// --- Row mappers ---

fn row_to_site(row: &Row<'_>) -> SqlResult<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        check_interval_secs: row.get(3)?,
        timeout_secs: row.get(4)?,
        detection_mode: row.get(5)?,
        hybrid_weights: row.get(6)?,
        ignore_selectors: row.get(7)?,
        active: row.get(8)?,
    })
}

fn row_to_probe_result(row: &Row<'_>) -> SqlResult<ProbeResult> {
    let time_str: String = row.get(7)?;
    Ok(ProbeResult {
        id: row.get(0)?,
        site_id: row.get(1)?,
        status_code: row.get(2)?,
        response_time_ms: row.get(3)?,
        is_up: row.get(4)?,
        error: row.get(5)?,
        final_url: row.get(6)?,
        checked_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_snapshot(row: &Row<'_>) -> SqlResult<Snapshot> {
    let time_str: String = row.get(4)?;
    Ok(Snapshot {
        id: row.get(0)?,
        site_id: row.get(1)?,
        blob_key: row.get(2)?,
        byte_size: row.get(3)?,
        captured_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_baseline(row: &Row<'_>) -> SqlResult<Baseline> {
    let time_str: String = row.get(8)?;
    Ok(Baseline {
        id: row.get(0)?,
        site_id: row.get(1)?,
        snapshot_id: row.get(2)?,
        structural_hash: row.get(3)?,
        tag_paths: row.get(4)?,
        domain_allowlist: row.get(5)?,
        content_hash: row.get(6)?,
        active: row.get(7)?,
        created_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_verdict(row: &Row<'_>) -> SqlResult<Verdict> {
    let time_str: String = row.get(11)?;
    Ok(Verdict {
        id: row.get(0)?,
        site_id: row.get(1)?,
        baseline_id: row.get(2)?,
        snapshot_id: row.get(3)?,
        pixel_score: row.get(4)?,
        structural_score: row.get(5)?,
        domain_score: row.get(6)?,
        hybrid_score: row.get(7)?,
        is_defaced: row.get(8)?,
        diff_blob_key: row.get(9)?,
        detection_mode: row.get(10)?,
        compared_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_alert(row: &Row<'_>) -> SqlResult<Alert> {
    let category: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let ack_at: Option<String> = row.get(6)?;
    let created: String = row.get(7)?;
    Ok(Alert {
        id: row.get(0)?,
        site_id: row.get(1)?,
        category: AlertCategory::parse(&category).unwrap_or(AlertCategory::Down),
        severity: Severity::parse(&severity).unwrap_or(Severity::Info),
        message: row.get(4)?,
        acknowledged_by: row.get(5)?,
        acknowledged_at: ack_at.as_deref().and_then(parse_db_time),
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

/// Format a datetime for storage.
pub fn fmt_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn probe_result(site_id: i64, is_up: bool, at: DateTime<Utc>) -> ProbeResult {
        ProbeResult {
            id: 0,
            site_id,
            status_code: if is_up { Some(200) } else { None },
            response_time_ms: 120,
            is_up,
            error: if is_up { None } else { Some("connection refused".into()) },
            final_url: None,
            checked_at: at,
        }
    }

    #[test]
    fn test_site_crud() {
        let (_tmp, store) = test_store();

        let mut site = Site {
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_site(&mut site).unwrap();
        assert!(id > 0);

        let fetched = store.get_site(id).unwrap();
        assert_eq!(fetched.name, "Example");
        assert_eq!(fetched.detection_mode, "hybrid");

        let mut updated = fetched;
        updated.active = false;
        store.update_site(&updated).unwrap();
        assert!(store.get_active_sites().unwrap().is_empty());

        store.delete_site(id).unwrap();
        assert!(store.get_site(id).is_err());
    }

    #[test]
    fn test_probe_results_ordered_newest_first() {
        let (_tmp, store) = test_store();
        let base = Utc::now();

        for i in 0..3 {
            let r = probe_result(1, true, base + ChronoDuration::seconds(i));
            store.add_probe_result(&r).unwrap();
        }

        let results = store.recent_probe_results(1, 10).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].checked_at > results[2].checked_at);
    }

    #[test]
    fn test_baseline_replacement_deactivates_previous() {
        let (_tmp, store) = test_store();
        let now = Utc::now();

        let b1 = Baseline {
            id: 0,
            site_id: 1,
            snapshot_id: 10,
            structural_hash: Some("aaa".into()),
            tag_paths: "[]".into(),
            domain_allowlist: "[]".into(),
            content_hash: None,
            active: true,
            created_at: now,
        };
        let id1 = store.create_baseline(&b1).unwrap();

        let mut b2 = b1.clone();
        b2.snapshot_id = 11;
        let id2 = store.create_baseline(&b2).unwrap();

        let active = store.active_baseline(1).unwrap().unwrap();
        assert_eq!(active.id, id2);

        // Previous row is kept as soft history.
        let old = store.get_baseline(id1).unwrap();
        assert!(!old.active);
    }

    #[test]
    fn test_stale_snapshots_skip_active_baseline() {
        let (_tmp, store) = test_store();
        let old = Utc::now() - ChronoDuration::days(60);

        let ref_id = store
            .add_snapshot(&Snapshot {
                id: 0,
                site_id: 1,
                blob_key: "current/1_a.png".into(),
                byte_size: 1000,
                captured_at: old,
            })
            .unwrap();
        let stale_id = store
            .add_snapshot(&Snapshot {
                id: 0,
                site_id: 1,
                blob_key: "current/1_b.png".into(),
                byte_size: 1000,
                captured_at: old,
            })
            .unwrap();

        store
            .create_baseline(&Baseline {
                id: 0,
                site_id: 1,
                snapshot_id: ref_id,
                structural_hash: None,
                tag_paths: "[]".into(),
                domain_allowlist: "[]".into(),
                content_hash: None,
                active: true,
                created_at: Utc::now(),
            })
            .unwrap();

        let stale = store.stale_snapshots(Utc::now() - ChronoDuration::days(30)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, stale_id);
    }

    #[test]
    fn test_alert_acknowledge_once() {
        let (_tmp, store) = test_store();
        let alert = store
            .insert_alert(1, AlertCategory::Down, Severity::Critical, "site down", Utc::now())
            .unwrap();

        store.acknowledge_alert(alert.id, "operator", Utc::now()).unwrap();
        // Second acknowledgement is rejected.
        assert!(store.acknowledge_alert(alert.id, "other", Utc::now()).is_err());
    }

    #[test]
    fn test_job_claim_order_and_lifecycle() {
        let (_tmp, store) = test_store();
        let now = Utc::now();

        store.enqueue_job("health-check", "{}", 0, now).unwrap();
        let urgent = store.enqueue_job("health-check", "{}", 100, now).unwrap();
        store.enqueue_job("screenshot", "{}", 0, now).unwrap();

        // Highest priority first, kinds isolated.
        let job = store.claim_job("health-check", now).unwrap().unwrap();
        assert_eq!(job.id, urgent);
        assert_eq!(job.attempts, 1);

        store.complete_job(job.id).unwrap();

        let second = store.claim_job("health-check", now).unwrap().unwrap();
        store.fail_job(second.id).unwrap();

        // Nothing queued for this kind anymore.
        assert!(store.claim_job("health-check", now).unwrap().is_none());
        // Other kind untouched.
        assert!(store.claim_job("screenshot", now).unwrap().is_some());
    }

    #[test]
    fn test_requeue_stale_running() {
        let (_tmp, store) = test_store();
        let now = Utc::now();

        store.enqueue_job("health-check", "{}", 0, now).unwrap();
        let job = store.claim_job("health-check", now).unwrap().unwrap();

        // Lease not yet expired.
        assert_eq!(store.requeue_stale_running(now - ChronoDuration::minutes(10)).unwrap(), 0);
        // Expired lease requeues the job.
        assert_eq!(store.requeue_stale_running(now + ChronoDuration::minutes(10)).unwrap(), 1);

        let reclaimed = store.claim_job("health-check", now).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }
}
