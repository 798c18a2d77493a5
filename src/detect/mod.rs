//! Defacement detection engine.
//!
//! Combines three evidence channels against a stored baseline: a perceptual
//! pixel diff, an HTML structural fingerprint, and an external-domain audit.

mod domains;
mod engine;
mod pixel;
mod structure;

pub use domains::*;
pub use engine::*;
pub use pixel::*;
pub use structure::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Detection error types.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid weights: {0}")]
    Weights(String),
}

/// Per-channel weights for the hybrid score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub pixel: f64,
    pub structural: f64,
    pub domain: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            pixel: 0.3,
            structural: 0.3,
            domain: 0.4,
        }
    }
}

impl Weights {
    /// Weights must each be in [0, 1] and sum to 1.
    pub fn validate(&self) -> Result<(), String> {
        for (name, w) in [
            ("pixel", self.pixel),
            ("structural", self.structural),
            ("domain", self.domain),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(format!("{} weight {} is outside [0, 1]", name, w));
            }
        }
        let sum = self.pixel + self.structural + self.domain;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("weights sum to {}, expected 1.0", sum));
        }
        Ok(())
    }
}

/// How a site is compared against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// Pixel + structural + domain channels.
    Hybrid,
    /// Pixel channel only.
    Pixel,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Pixel => "pixel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hybrid" => Some(Self::Hybrid),
            "pixel" => Some(Self::Pixel),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_valid() {
        assert!(Weights::default().validate().is_ok());
    }

    #[test]
    fn test_weights_sum_enforced() {
        let w = Weights {
            pixel: 0.5,
            structural: 0.5,
            domain: 0.5,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_weight_range_enforced() {
        let w = Weights {
            pixel: -0.2,
            structural: 0.6,
            domain: 0.6,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_mode_roundtrip() {
        assert_eq!(DetectionMode::parse("hybrid"), Some(DetectionMode::Hybrid));
        assert_eq!(DetectionMode::parse("pixel"), Some(DetectionMode::Pixel));
        assert_eq!(DetectionMode::parse("other"), None);
        assert_eq!(DetectionMode::Hybrid.as_str(), "hybrid");
    }
}
