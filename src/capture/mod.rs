//! Screenshot capturer.
//!
//! Drives one long-lived headless Chromium process shared across all sites.
//! Process startup is expensive; pages are cheap and disposed per capture so
//! no state leaks between sites.

mod dismiss;

pub use dismiss::{DISMISS_SCRIPT, INIT_SCRIPT};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, EventLifecycleEvent,
    SetLifecycleEventsEnabledParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use image::GenericImageView;
use image::ImageFormat;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("browser error: {0}")]
    Browser(#[from] CdpError),
    #[error("browser setup failed: {0}")]
    Setup(String),
    #[error("navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    #[error("capture below quality threshold: {0} bytes")]
    TooSmall(usize),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub nav_timeout: Duration,
    /// Post-load wait before the first screenshot.
    pub settle_wait: Duration,
    /// Extra wait used by the quality-gate retries.
    pub retry_wait: Duration,
    /// Captures smaller than this are treated as blank.
    pub min_bytes: usize,
    pub thumb_width: u32,
    pub thumb_height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            viewport_width: 1366,
            viewport_height: 768,
            nav_timeout: Duration::from_secs(30),
            settle_wait: Duration::from_secs(2),
            retry_wait: Duration::from_secs(3),
            min_bytes: 5_000,
            thumb_width: 320,
            thumb_height: 200,
        }
    }
}

/// One successful capture: the raster plus the raw HTML from the same
/// render pass. HTML is best-effort; its absence degrades detection to
/// pixel-only downstream.
pub struct Capture {
    pub image: Vec<u8>,
    pub html: Option<String>,
}

/// Long-lived browser wrapper. Failure to launch is fatal at startup.
pub struct Capturer {
    browser: tokio::sync::Mutex<Browser>,
    handler: JoinHandle<()>,
    cfg: CaptureConfig,
}

impl Capturer {
    /// Launch the shared browser process.
    pub async fn launch(cfg: CaptureConfig) -> Result<Self, CaptureError> {
        let browser_cfg = BrowserConfig::builder()
            .no_sandbox()
            .window_size(cfg.viewport_width, cfg.viewport_height)
            .args(vec![
                "--ignore-certificate-errors",
                "--disable-gpu",
                "--hide-scrollbars",
                "--mute-audio",
                "--disable-notifications",
            ])
            .build()
            .map_err(CaptureError::Setup)?;

        let (browser, mut handler) = Browser::launch(browser_cfg).await?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    // Without its event loop the browser is unusable; every
                    // later capture will fail until a restart.
                    tracing::error!("Browser event loop failed: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            handler: handle,
            cfg,
        })
    }

    /// Render a page and screenshot it, enforcing the quality gate.
    ///
    /// A result below the minimum byte size retries twice (extra wait, then
    /// a full reload with a longer wait), keeping the largest capture seen.
    /// If it is still too small the capture fails rather than persisting a
    /// blank page.
    pub async fn capture(&self, url: &str) -> Result<Capture, CaptureError> {
        // The lock only covers page creation; captures run concurrently.
        let page = self.browser.lock().await.new_page("about:blank").await?;
        let result = self.capture_on_page(&page, url).await;
        if let Err(e) = page.close().await {
            tracing::debug!("Failed to close page for {}: {}", url, e);
        }
        result
    }

    async fn capture_on_page(&self, page: &Page, url: &str) -> Result<Capture, CaptureError> {
        let init = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(INIT_SCRIPT)
            .build()
            .map_err(CaptureError::Setup)?;
        page.evaluate_on_new_document(init).await?;

        self.navigate(page, url).await?;
        tokio::time::sleep(self.cfg.settle_wait).await;

        // Best-effort; a broken page must not abort the capture.
        if let Err(e) = page.evaluate(DISMISS_SCRIPT).await {
            tracing::debug!("Popup dismissal failed for {}: {}", url, e);
        }

        let mut best = self.screenshot(page).await?;

        if best.len() < self.cfg.min_bytes {
            tracing::debug!("Capture of {} too small ({} bytes), waiting longer", url, best.len());
            tokio::time::sleep(self.cfg.retry_wait).await;
            if let Ok(again) = self.screenshot(page).await {
                if again.len() > best.len() {
                    best = again;
                }
            }
        }

        if best.len() < self.cfg.min_bytes {
            tracing::debug!("Capture of {} still too small, reloading", url);
            // Stricter than the first pass: wait until the network has gone
            // idle, not just for the navigation to commit.
            let reload = tokio::time::timeout(self.cfg.nav_timeout, async {
                let params = SetLifecycleEventsEnabledParams::builder()
                    .enabled(true)
                    .build()
                    .map_err(CaptureError::Setup)?;
                page.execute(params).await?;
                // Listener attaches before the reload so the event is not missed.
                let mut lifecycle = page.event_listener::<EventLifecycleEvent>().await?;
                page.reload().await?;
                while let Some(event) = lifecycle.next().await {
                    if event.name == "networkIdle" {
                        break;
                    }
                }
                Ok::<(), CaptureError>(())
            })
            .await;
            match reload {
                Ok(Ok(())) => {
                    tokio::time::sleep(self.cfg.settle_wait + self.cfg.retry_wait).await;
                    if let Err(e) = page.evaluate(DISMISS_SCRIPT).await {
                        tracing::debug!("Popup dismissal failed after reload: {}", e);
                    }
                    if let Ok(again) = self.screenshot(page).await {
                        if again.len() > best.len() {
                            best = again;
                        }
                    }
                }
                Ok(Err(e)) => tracing::debug!("Reload of {} failed: {}", url, e),
                Err(_) => tracing::debug!("Reload of {} never reached network idle", url),
            }
        }

        if best.len() < self.cfg.min_bytes {
            return Err(CaptureError::TooSmall(best.len()));
        }

        // Same render pass, zero extra navigation cost.
        let html = match page.content().await {
            Ok(html) => Some(html),
            Err(e) => {
                tracing::warn!("Could not read HTML for {}: {}", url, e);
                None
            }
        };

        Ok(Capture { image: best, html })
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), CaptureError> {
        tokio::time::timeout(self.cfg.nav_timeout, async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<(), CdpError>(())
        })
        .await
        .map_err(|_| CaptureError::NavigationTimeout(self.cfg.nav_timeout))??;
        Ok(())
    }

    async fn screenshot(&self, page: &Page) -> Result<Vec<u8>, CaptureError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        Ok(page.screenshot(params).await?)
    }

    /// Close the shared browser process. Only called on shutdown.
    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::warn!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
    }

    pub fn thumbnail_size(&self) -> (u32, u32) {
        (self.cfg.thumb_width, self.cfg.thumb_height)
    }
}

/// Derive a fixed-aspect thumbnail from a capture: crop the top of the page
/// to the target aspect ratio, then shrink.
pub fn make_thumbnail(png: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let img = image::load_from_memory(png)?;
    let (w, h) = img.dimensions();

    let crop_h = ((u64::from(w) * u64::from(height) / u64::from(width.max(1))) as u32).min(h);
    let cropped = img.crop_imm(0, 0, w, crop_h.max(1));
    let thumb = cropped.thumbnail_exact(width, height);

    let mut buf = Vec::new();
    thumb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_thumbnail_has_requested_dimensions() {
        let img = RgbaImage::from_pixel(1366, 768, Rgba([120, 130, 140, 255]));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let thumb = make_thumbnail(&png, 320, 200).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (320, 200));
    }

    #[test]
    fn test_thumbnail_of_short_page() {
        // Page shorter than the crop window still produces the target size.
        let img = RgbaImage::from_pixel(1366, 100, Rgba([0, 0, 0, 255]));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let thumb = make_thumbnail(&png, 320, 200).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (320, 200));
    }

    #[test]
    fn test_default_config_quality_gate() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.min_bytes, 5_000);
        assert!(cfg.retry_wait > Duration::ZERO);
    }
}
