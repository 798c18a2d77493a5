//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored site, owned by the management layer. The pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub check_interval_secs: i64,
    pub timeout_secs: i64,
    /// "hybrid" or "pixel".
    pub detection_mode: String,
    /// Optional JSON object `{"pixel":..,"structural":..,"domain":..}`.
    pub hybrid_weights: Option<String>,
    /// JSON array of CSS selectors stripped before structural comparison.
    pub ignore_selectors: String,
    pub active: bool,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            check_interval_secs: 60,
            timeout_secs: 10,
            detection_mode: "hybrid".to_string(),
            hybrid_weights: None,
            ignore_selectors: "[]".to_string(),
            active: true,
        }
    }
}

/// One HTTP check outcome. Append-only, time-ordered per site.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub id: i64,
    pub site_id: i64,
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub is_up: bool,
    pub error: Option<String>,
    pub final_url: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// One captured raster image. The raw HTML from the same render pass is
/// ephemeral and never stored here.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: i64,
    pub site_id: i64,
    pub blob_key: String,
    pub byte_size: i64,
    pub captured_at: DateTime<Utc>,
}

/// The active reference snapshot for a site plus its derived fingerprints.
/// At most one active row per site; replacement deactivates the previous one.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub id: i64,
    pub site_id: i64,
    pub snapshot_id: i64,
    pub structural_hash: Option<String>,
    /// JSON array of root-to-leaf tag paths.
    pub tag_paths: String,
    /// JSON array of allowed external domains.
    pub domain_allowlist: String,
    pub content_hash: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Baseline {
    pub fn tag_paths_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.tag_paths).unwrap_or_default()
    }

    pub fn allowlist_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.domain_allowlist).unwrap_or_default()
    }
}

/// One defacement comparison outcome with its full component breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub id: i64,
    pub site_id: i64,
    pub baseline_id: i64,
    pub snapshot_id: i64,
    pub pixel_score: f64,
    pub structural_score: Option<f64>,
    pub domain_score: Option<f64>,
    pub hybrid_score: f64,
    pub is_defaced: bool,
    pub diff_blob_key: Option<String>,
    pub detection_mode: String,
    pub compared_at: DateTime<Utc>,
}

/// Alert categories, one per notification-worthy condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertCategory {
    Down,
    Slow,
    Defaced,
    SslExpiry,
    Recovered,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Slow => "slow",
            Self::Defaced => "defaced",
            Self::SslExpiry => "ssl-expiry",
            Self::Recovered => "recovered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "down" => Some(Self::Down),
            "slow" => Some(Self::Slow),
            "defaced" => Some(Self::Defaced),
            "ssl-expiry" => Some(Self::SslExpiry),
            "recovered" => Some(Self::Recovered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One notification-worthy event. Only acknowledgement mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub site_id: i64,
    pub category: AlertCategory,
    pub severity: Severity,
    pub message: String,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A configured notification target.
#[derive(Debug, Clone, Serialize)]
pub struct AlertChannel {
    pub id: i64,
    /// "email", "webhook" or "bot".
    pub kind: String,
    /// Channel-specific settings as JSON.
    pub settings: String,
    pub active: bool,
}

/// A claimed row from the durable job queue.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub priority: i64,
    pub attempts: i64,
}
