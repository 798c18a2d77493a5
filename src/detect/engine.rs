//! Hybrid verdict combination.

use super::{
    audit_domains, compare_images, extract_external_domains, fingerprint, structural_similarity,
    DetectError, DetectionMode, Weights,
};

/// Baseline fingerprint data handed to a comparison.
#[derive(Debug, Clone, Copy)]
pub struct BaselineData<'a> {
    pub structural_hash: Option<&'a str>,
    pub tag_paths: &'a [String],
    pub allowlist: &'a [String],
}

/// Everything one comparison needs, already loaded by the caller.
pub struct CompareInput<'a> {
    pub baseline_png: &'a [u8],
    pub current_png: &'a [u8],
    pub baseline: BaselineData<'a>,
    /// Raw HTML from the same render pass as `current_png`, when available.
    pub current_html: Option<&'a str>,
    pub site_url: &'a str,
    pub mode: DetectionMode,
    /// Per-site weight override; falls back to the engine defaults.
    pub weights: Option<Weights>,
    pub ignore_selectors: &'a [String],
}

/// One comparison outcome with its full component breakdown.
#[derive(Debug)]
pub struct Comparison {
    pub pixel_score: f64,
    pub structural_score: Option<f64>,
    pub domain_score: Option<f64>,
    pub hybrid_score: f64,
    pub is_defaced: bool,
    /// The mode actually applied; hybrid degrades to pixel when HTML is
    /// missing on either side.
    pub mode_used: DetectionMode,
    pub overlay_png: Option<Vec<u8>>,
    pub new_domains: Vec<String>,
    pub removed_domains: Vec<String>,
}

/// Defacement engine: combines the pixel, structural and domain channels
/// into one verdict against a stored baseline.
pub struct Engine {
    weights: Weights,
    threshold: f64,
    trusted: Vec<String>,
}

impl Engine {
    pub fn new(weights: Weights, threshold: f64, trusted: Vec<String>) -> Result<Self, DetectError> {
        weights.validate().map_err(DetectError::Weights)?;
        if !(0.0 < threshold && threshold <= 100.0) {
            return Err(DetectError::Weights(format!(
                "threshold {} is outside (0, 100]",
                threshold
            )));
        }
        Ok(Self {
            weights,
            threshold,
            trusted,
        })
    }

    pub fn compare(&self, input: CompareInput<'_>) -> Result<Comparison, DetectError> {
        let pixel = compare_images(input.baseline_png, input.current_png)?;

        let hybrid_ready = input.mode == DetectionMode::Hybrid
            && input.current_html.is_some()
            && input.baseline.structural_hash.is_some();

        if !hybrid_ready {
            return Ok(Comparison {
                pixel_score: pixel.score,
                structural_score: None,
                domain_score: None,
                hybrid_score: pixel.score,
                is_defaced: pixel.score < self.threshold,
                mode_used: DetectionMode::Pixel,
                overlay_png: pixel.overlay_png,
                new_domains: Vec::new(),
                removed_domains: Vec::new(),
            });
        }

        let html = input.current_html.unwrap_or_default();
        let baseline_hash = input.baseline.structural_hash.unwrap_or_default();

        let current_fp = fingerprint(html, input.ignore_selectors);
        let structural = if current_fp.structural_hash == baseline_hash {
            100.0
        } else {
            structural_similarity(&current_fp.tag_paths, input.baseline.tag_paths)
        };

        let current_domains = extract_external_domains(html, input.site_url);
        let audit = audit_domains(&current_domains, input.baseline.allowlist, &self.trusted);

        let weights = match input.weights {
            Some(w) => match w.validate() {
                Ok(()) => w,
                Err(e) => {
                    tracing::warn!("Ignoring invalid per-site weights: {}", e);
                    self.weights
                }
            },
            None => self.weights,
        };

        let hybrid =
            weights.pixel * pixel.score + weights.structural * structural + weights.domain * audit.score;

        Ok(Comparison {
            pixel_score: pixel.score,
            structural_score: Some(structural),
            domain_score: Some(audit.score),
            hybrid_score: hybrid,
            is_defaced: hybrid < self.threshold,
            mode_used: DetectionMode::Hybrid,
            overlay_png: pixel.overlay_png,
            new_domains: audit.new_domains,
            removed_domains: audit.removed_domains,
        })
    }
}
