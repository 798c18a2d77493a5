//! Configuration module for PageWarden.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Invalid values (bad weights, out-of-range thresholds) are rejected at
//! load time so a partially applied configuration can never run.

use std::env;
use thiserror::Error;

use crate::detect::Weights;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "pagewarden.db")
    pub db_path: String,
    /// Root directory for snapshot/thumbnail/baseline/diff blobs
    pub blob_root: String,

    /// Default HTTP probe timeout in seconds
    pub probe_timeout_secs: u64,
    /// Lower bound on per-site check intervals
    pub min_check_interval_secs: i64,
    /// Upper bound on per-site check intervals
    pub max_check_interval_secs: i64,
    /// Response time above which an up site is reported as slow (ms)
    pub warning_response_ms: i64,

    /// Minimum gap between screenshot captures for one site (seconds)
    pub screenshot_interval_secs: u64,
    /// Window over which initial site timers are spread (seconds)
    pub stagger_window_secs: u64,

    /// Worker pool ceilings per job kind
    pub health_concurrency: usize,
    pub screenshot_concurrency: usize,
    pub defacement_concurrency: usize,

    /// Default hybrid channel weights
    pub weights: Weights,
    /// Hybrid score below this is a defacement
    pub defacement_threshold: f64,
    /// Operator additions to the built-in trusted domain list
    pub trusted_domains: Vec<String>,

    /// Viewport for captures
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Captures smaller than this many bytes are treated as blank
    pub min_capture_bytes: usize,
    /// Navigation timeout for captures (seconds)
    pub capture_timeout_secs: u64,

    /// Event-log retention horizon in days
    pub retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "pagewarden.db".to_string(),
            blob_root: "blobs".to_string(),
            probe_timeout_secs: 10,
            min_check_interval_secs: 10,
            max_check_interval_secs: 86_400,
            warning_response_ms: 10_000,
            screenshot_interval_secs: 300,
            stagger_window_secs: 60,
            health_concurrency: 20,
            screenshot_concurrency: 5,
            defacement_concurrency: 8,
            weights: Weights::default(),
            defacement_threshold: 85.0,
            trusted_domains: Vec::new(),
            viewport_width: 1366,
            viewport_height: 768,
            min_capture_bytes: 5_000,
            capture_timeout_secs: 30,
            retention_days: 30,
        }
    }
}

impl Config {
    /// Load configuration from `PAGEWARDEN_*` environment variables and
    /// validate it. Returns an error instead of running with bad values.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("PAGEWARDEN_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("PAGEWARDEN_BLOB_ROOT") {
            cfg.blob_root = v;
        }

        read_parsed(&mut cfg.probe_timeout_secs, "PAGEWARDEN_PROBE_TIMEOUT_SECS")?;
        read_parsed(&mut cfg.min_check_interval_secs, "PAGEWARDEN_MIN_CHECK_INTERVAL_SECS")?;
        read_parsed(&mut cfg.max_check_interval_secs, "PAGEWARDEN_MAX_CHECK_INTERVAL_SECS")?;
        read_parsed(&mut cfg.warning_response_ms, "PAGEWARDEN_WARNING_RESPONSE_MS")?;
        read_parsed(&mut cfg.screenshot_interval_secs, "PAGEWARDEN_SCREENSHOT_INTERVAL_SECS")?;
        read_parsed(&mut cfg.stagger_window_secs, "PAGEWARDEN_STAGGER_WINDOW_SECS")?;
        read_parsed(&mut cfg.health_concurrency, "PAGEWARDEN_HEALTH_CONCURRENCY")?;
        read_parsed(&mut cfg.screenshot_concurrency, "PAGEWARDEN_SCREENSHOT_CONCURRENCY")?;
        read_parsed(&mut cfg.defacement_concurrency, "PAGEWARDEN_DEFACEMENT_CONCURRENCY")?;
        read_parsed(&mut cfg.defacement_threshold, "PAGEWARDEN_DEFACEMENT_THRESHOLD")?;
        read_parsed(&mut cfg.viewport_width, "PAGEWARDEN_VIEWPORT_WIDTH")?;
        read_parsed(&mut cfg.viewport_height, "PAGEWARDEN_VIEWPORT_HEIGHT")?;
        read_parsed(&mut cfg.min_capture_bytes, "PAGEWARDEN_MIN_CAPTURE_BYTES")?;
        read_parsed(&mut cfg.capture_timeout_secs, "PAGEWARDEN_CAPTURE_TIMEOUT_SECS")?;
        read_parsed(&mut cfg.retention_days, "PAGEWARDEN_RETENTION_DAYS")?;

        if let Ok(v) = env::var("PAGEWARDEN_TRUSTED_DOMAINS") {
            cfg.trusted_domains = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(v) = env::var("PAGEWARDEN_HYBRID_WEIGHTS") {
            cfg.weights = serde_json::from_str(&v).map_err(|e| ConfigError::Invalid {
                name: "PAGEWARDEN_HYBRID_WEIGHTS",
                reason: e.to_string(),
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate().map_err(|reason| ConfigError::Invalid {
            name: "hybrid weights",
            reason,
        })?;

        if !(0.0 < self.defacement_threshold && self.defacement_threshold <= 100.0) {
            return Err(ConfigError::Invalid {
                name: "defacement threshold",
                reason: format!("{} is outside (0, 100]", self.defacement_threshold),
            });
        }
        if self.min_check_interval_secs <= 0
            || self.max_check_interval_secs < self.min_check_interval_secs
        {
            return Err(ConfigError::Invalid {
                name: "check interval bounds",
                reason: format!(
                    "min {} / max {}",
                    self.min_check_interval_secs, self.max_check_interval_secs
                ),
            });
        }
        if self.health_concurrency == 0
            || self.screenshot_concurrency == 0
            || self.defacement_concurrency == 0
        {
            return Err(ConfigError::Invalid {
                name: "worker concurrency",
                reason: "pool size must be at least 1".to_string(),
            });
        }
        if self.warning_response_ms <= 0 {
            return Err(ConfigError::Invalid {
                name: "warning response threshold",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Clamp a per-site interval into the configured bounds.
    pub fn clamp_interval(&self, secs: i64) -> i64 {
        secs.clamp(self.min_check_interval_secs, self.max_check_interval_secs)
    }
}

/// A set but unparseable value is a configuration error, not a silent
/// fallback to the default.
fn read_parsed<T>(slot: &mut T, name: &'static str) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(s) = env::var(name) {
        *slot = s.parse().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("{:?}: {}", s, e),
        })?;
    }
    Ok(())
}
