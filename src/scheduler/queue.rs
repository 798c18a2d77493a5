//! Durable multi-stage job queue backed by the SQLite store.
//!
//! Three job kinds, one explicit tagged payload each. Malformed payloads are
//! rejected at enqueue time, not at consumption time. Every payload is
//! idempotent-safe to re-run: re-running a health check just appends another
//! probe result.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{DbError, JobRow, Store};

/// Priority for manual operator actions; beats every scheduled job.
pub const PRIORITY_MANUAL: i64 = 100;
pub const PRIORITY_NORMAL: i64 = 0;

/// Base delay for exponential backoff retries.
const BACKOFF_BASE_SECS: i64 = 30;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    HealthCheck,
    Screenshot,
    DefacementCheck,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheck => "health-check",
            Self::Screenshot => "screenshot",
            Self::DefacementCheck => "defacement-check",
        }
    }

    /// Bounded attempt counts. Screenshots never auto-retry; the next
    /// natural cycle serves as the retry.
    pub fn max_attempts(&self) -> i64 {
        match self {
            Self::HealthCheck => 4,
            Self::Screenshot => 1,
            Self::DefacementCheck => 4,
        }
    }
}

/// Tagged job payloads, one per stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    HealthCheck {
        site_id: i64,
        url: String,
        timeout_secs: u64,
    },
    Screenshot {
        site_id: i64,
        url: String,
    },
    DefacementCheck {
        site_id: i64,
        snapshot_id: i64,
        baseline_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        html: Option<String>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::HealthCheck { .. } => JobKind::HealthCheck,
            Self::Screenshot { .. } => JobKind::Screenshot,
            Self::DefacementCheck { .. } => JobKind::DefacementCheck,
        }
    }

    pub fn site_id(&self) -> i64 {
        match self {
            Self::HealthCheck { site_id, .. }
            | Self::Screenshot { site_id, .. }
            | Self::DefacementCheck { site_id, .. } => *site_id,
        }
    }

    fn validate(&self) -> Result<(), QueueError> {
        let err = |msg: &str| Err(QueueError::InvalidPayload(msg.to_string()));
        match self {
            Self::HealthCheck {
                site_id,
                url,
                timeout_secs,
            } => {
                if *site_id <= 0 {
                    return err("health-check requires a positive site_id");
                }
                if url.is_empty() {
                    return err("health-check requires a url");
                }
                if *timeout_secs == 0 {
                    return err("health-check requires a positive timeout");
                }
            }
            Self::Screenshot { site_id, url } => {
                if *site_id <= 0 {
                    return err("screenshot requires a positive site_id");
                }
                if url.is_empty() {
                    return err("screenshot requires a url");
                }
            }
            Self::DefacementCheck {
                site_id,
                snapshot_id,
                baseline_id,
                ..
            } => {
                if *site_id <= 0 || *snapshot_id <= 0 || *baseline_id <= 0 {
                    return err("defacement-check requires positive ids");
                }
            }
        }
        Ok(())
    }
}

/// Queue facade over the store's jobs table.
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Validate and enqueue a job.
    pub fn enqueue(&self, payload: &JobPayload, priority: i64) -> Result<i64, QueueError> {
        payload.validate()?;
        let json = serde_json::to_string(payload)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let id = self
            .store
            .enqueue_job(payload.kind().as_str(), &json, priority, Utc::now())?;
        Ok(id)
    }

    /// Claim the next due job of a kind. Rows whose payload no longer
    /// deserializes are marked failed and skipped.
    pub fn claim(&self, kind: JobKind) -> Result<Option<(JobRow, JobPayload)>, QueueError> {
        loop {
            let row = match self.store.claim_job(kind.as_str(), Utc::now())? {
                Some(r) => r,
                None => return Ok(None),
            };
            match serde_json::from_str::<JobPayload>(&row.payload) {
                Ok(payload) => return Ok(Some((row, payload))),
                Err(e) => {
                    tracing::error!("Dropping malformed {} job {}: {}", row.kind, row.id, e);
                    self.store.fail_job(row.id)?;
                }
            }
        }
    }

    pub fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        self.store.complete_job(job_id)?;
        Ok(())
    }

    /// Reschedule a failed job with exponential backoff, or mark it failed
    /// once its attempts are exhausted. Returns true when rescheduled.
    pub fn retry_or_fail(&self, job: &JobRow, kind: JobKind) -> Result<bool, QueueError> {
        if job.attempts >= kind.max_attempts() {
            self.store.fail_job(job.id)?;
            return Ok(false);
        }
        // attempts can be 0 when a recovered row never recorded its claim.
        let delay = BACKOFF_BASE_SECS << (job.attempts - 1).clamp(0, 6);
        self.store
            .reschedule_job(job.id, Utc::now() + ChronoDuration::seconds(delay))?;
        Ok(true)
    }

    /// Requeue running jobs whose worker lease expired. Called at startup so
    /// a restart never strands work.
    pub fn recover(&self, lease: ChronoDuration) -> Result<usize, QueueError> {
        let n = self.store.requeue_stale_running(Utc::now() - lease)?;
        if n > 0 {
            tracing::info!("Requeued {} stale running jobs", n);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn queue() -> (NamedTempFile, JobQueue) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, JobQueue::new(store))
    }

    #[test]
    fn test_enqueue_claim_roundtrip() {
        let (_tmp, q) = queue();
        let payload = JobPayload::HealthCheck {
            site_id: 1,
            url: "https://example.com".into(),
            timeout_secs: 10,
        };
        q.enqueue(&payload, PRIORITY_NORMAL).unwrap();

        let (row, claimed) = q.claim(JobKind::HealthCheck).unwrap().unwrap();
        assert_eq!(claimed, payload);
        assert_eq!(row.attempts, 1);
        // Kinds are isolated queues.
        assert!(q.claim(JobKind::Screenshot).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_rejected_at_enqueue() {
        let (_tmp, q) = queue();
        let bad = JobPayload::HealthCheck {
            site_id: 0,
            url: String::new(),
            timeout_secs: 0,
        };
        assert!(matches!(
            q.enqueue(&bad, PRIORITY_NORMAL),
            Err(QueueError::InvalidPayload(_))
        ));

        let bad_ids = JobPayload::DefacementCheck {
            site_id: 1,
            snapshot_id: -2,
            baseline_id: 3,
            html: None,
        };
        assert!(q.enqueue(&bad_ids, PRIORITY_NORMAL).is_err());
    }

    #[test]
    fn test_manual_priority_claimed_first() {
        let (_tmp, q) = queue();
        let scheduled = JobPayload::Screenshot {
            site_id: 1,
            url: "https://a.example".into(),
        };
        let manual = JobPayload::Screenshot {
            site_id: 2,
            url: "https://b.example".into(),
        };
        q.enqueue(&scheduled, PRIORITY_NORMAL).unwrap();
        q.enqueue(&manual, PRIORITY_MANUAL).unwrap();

        let (_, first) = q.claim(JobKind::Screenshot).unwrap().unwrap();
        assert_eq!(first.site_id(), 2);
    }

    #[test]
    fn test_retry_backoff_then_exhaustion() {
        let (_tmp, q) = queue();
        let payload = JobPayload::HealthCheck {
            site_id: 1,
            url: "https://example.com".into(),
            timeout_secs: 10,
        };
        q.enqueue(&payload, PRIORITY_NORMAL).unwrap();

        let (row, _) = q.claim(JobKind::HealthCheck).unwrap().unwrap();
        assert!(q.retry_or_fail(&row, JobKind::HealthCheck).unwrap());
        // Rescheduled into the future; not immediately claimable.
        assert!(q.claim(JobKind::HealthCheck).unwrap().is_none());
    }

    #[test]
    fn test_retry_with_zero_attempts_reschedules() {
        let (_tmp, q) = queue();
        let payload = JobPayload::HealthCheck {
            site_id: 1,
            url: "https://example.com".into(),
            timeout_secs: 10,
        };
        let id = q.enqueue(&payload, PRIORITY_NORMAL).unwrap();

        // A recovered row can come back with no recorded attempt.
        let row = JobRow {
            id,
            kind: "health-check".into(),
            payload: serde_json::to_string(&payload).unwrap(),
            priority: PRIORITY_NORMAL,
            attempts: 0,
        };
        assert!(q.retry_or_fail(&row, JobKind::HealthCheck).unwrap());
    }

    #[test]
    fn test_screenshot_never_retries() {
        let (_tmp, q) = queue();
        let payload = JobPayload::Screenshot {
            site_id: 1,
            url: "https://example.com".into(),
        };
        q.enqueue(&payload, PRIORITY_NORMAL).unwrap();

        let (row, _) = q.claim(JobKind::Screenshot).unwrap().unwrap();
        assert!(!q.retry_or_fail(&row, JobKind::Screenshot).unwrap());
        assert!(q.claim(JobKind::Screenshot).unwrap().is_none());
    }

    #[test]
    fn test_payload_serialization_tagged() {
        let payload = JobPayload::DefacementCheck {
            site_id: 3,
            snapshot_id: 9,
            baseline_id: 4,
            html: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""kind":"defacement-check""#));
        assert!(!json.contains("html"));
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
