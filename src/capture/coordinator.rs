use chrono::{Local, Utc};
use image::{DynamicImage, GenericImageView};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::downscale::{fit_pixel_budget, has_content};
use super::screen::ScreenGrabber;
use super::{CaptureOutcome, CapturedImage};
use crate::events::{EventSink, PipelineEvent};
use crate::state::PipelineState;

/// Hook for whatever window sits on top of the captured area.
pub trait OverlayWindow: Send {
    fn hide(&self);
    fn show(&self);
}

/// No window to hide (headless use).
pub struct NoOverlay;

impl OverlayWindow for NoOverlay {
    fn hide(&self) {}
    fn show(&self) {}
}

/// Shows the overlay again however the capture ends.
struct HiddenOverlay<'a> {
    overlay: &'a dyn OverlayWindow,
    hidden: bool,
}

impl<'a> HiddenOverlay<'a> {
    fn new(overlay: &'a dyn OverlayWindow, hide: bool) -> Self {
        if hide {
            overlay.hide();
        }
        Self {
            overlay,
            hidden: hide,
        }
    }
}

impl Drop for HiddenOverlay<'_> {
    fn drop(&mut self) {
        if self.hidden {
            self.overlay.show();
        }
    }
}

/// Holds the single capture slot on `PipelineState`.
struct CaptureSlot<'a>(&'a PipelineState);

impl Drop for CaptureSlot<'_> {
    fn drop(&mut self) {
        self.0.end_capture();
    }
}

/// Runs one capture on the display-owning thread.
pub struct CaptureCoordinator {
    state: Arc<PipelineState>,
    grabber: Box<dyn ScreenGrabber>,
    overlay: Box<dyn OverlayWindow>,
    events: Arc<dyn EventSink>,
    screenshot_dir: PathBuf,
    max_pixels: u64,
}

impl CaptureCoordinator {
    pub fn new(
        state: Arc<PipelineState>,
        grabber: Box<dyn ScreenGrabber>,
        events: Arc<dyn EventSink>,
        screenshot_dir: PathBuf,
        max_pixels: u64,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&screenshot_dir) {
            log::warn!(
                "[CAPTURE] Could not create screenshot dir {}: {}",
                screenshot_dir.display(),
                e
            );
        }
        Self {
            state,
            grabber,
            overlay: Box::new(NoOverlay),
            events,
            screenshot_dir,
            max_pixels,
        }
    }

    pub fn with_overlay(mut self, overlay: Box<dyn OverlayWindow>) -> Self {
        self.overlay = overlay;
        self
    }

    /// Captures the configured region (or the full screen), saves the raw
    /// frame for audit, and downscales it to the pixel budget.
    ///
    /// Always emits `CaptureCompleted` unless the request was refused.
    pub fn capture(&self) -> CaptureOutcome {
        if self.state.is_selecting_region() {
            log::info!("[CAPTURE] Region selection in progress, skipping screenshot");
            return CaptureOutcome::Refused("region selection in progress".to_string());
        }
        if !self.state.try_begin_capture() {
            log::warn!("[CAPTURE] Another capture is already running");
            return CaptureOutcome::Refused("capture already in progress".to_string());
        }
        let _slot = CaptureSlot(&self.state);

        let outcome = self.capture_inner();
        self.events.emit(PipelineEvent::CaptureCompleted {
            valid: outcome.is_valid(),
        });
        outcome
    }

    fn capture_inner(&self) -> CaptureOutcome {
        let start = Instant::now();
        let region = self.state.capture_region();

        let raw = {
            let _hidden = HiddenOverlay::new(self.overlay.as_ref(), self.state.hide_during_capture());
            self.grabber.grab(region)
        };

        let raw = match raw {
            Ok(img) => img,
            Err(e) => {
                log::error!("[CAPTURE] Error taking screenshot: {}", e);
                return CaptureOutcome::NoImage(e.to_string());
            }
        };

        let artifact = self.save_artifact(&raw);
        let original_size = raw.dimensions();
        let image = fit_pixel_budget(&raw, self.max_pixels);
        let has_content = has_content(&image);

        if has_content {
            log::info!(
                "[CAPTURE] Captured {}x{} (sent as {}x{}) in {}ms",
                original_size.0,
                original_size.1,
                image.width(),
                image.height(),
                start.elapsed().as_millis()
            );
        } else {
            log::warn!("[CAPTURE] Captured image is empty");
        }

        CaptureOutcome::Captured(CapturedImage {
            image,
            has_content,
            captured_at: Utc::now(),
            original_size,
            artifact,
        })
    }

    fn save_artifact(&self, image: &DynamicImage) -> Option<PathBuf> {
        let filename = Local::now()
            .format("screenshot_%Y%m%d_%H%M%S_%3f.png")
            .to_string();
        let path = self.screenshot_dir.join(filename);
        match image.save(&path) {
            Ok(()) => {
                log::info!("[CAPTURE] Screenshot saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                log::warn!("[CAPTURE] Could not save {}: {}", path.display(), e);
                None
            }
        }
    }
}
