//! Status debounce over the trailing window of probe results.
//!
//! Raw per-check results are noisy. The reported status flips to down only
//! after a full streak of consecutive failures, and is recomputed from the
//! trailing window on every read rather than cached.

use crate::db::ProbeResult;
use serde::Serialize;

/// Consecutive failures required before a site is reported down.
pub const DOWN_STREAK: usize = 5;

/// Externally visible site status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Up,
    /// Up, but the latest response time exceeds the warning threshold.
    Warning,
    Down,
    /// No probe results yet.
    Unknown,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Warning => "warning",
            Self::Down => "down",
            Self::Unknown => "unknown",
        }
    }
}

/// Evaluate the debounced status from recent results, newest first.
///
/// Down requires the most recent `DOWN_STREAK` results to all be failures;
/// a single success anywhere in that window resets the streak. Warning is
/// only possible when the latest result is up, so a slow timeout on a down
/// check never double-counts as slow.
pub fn evaluate_status(recent: &[ProbeResult], warning_response_ms: i64) -> SiteStatus {
    let latest = match recent.first() {
        Some(r) => r,
        None => return SiteStatus::Unknown,
    };

    if recent.len() >= DOWN_STREAK && recent[..DOWN_STREAK].iter().all(|r| !r.is_up) {
        return SiteStatus::Down;
    }

    if latest.is_up && latest.response_time_ms > warning_response_ms {
        return SiteStatus::Warning;
    }

    SiteStatus::Up
}
