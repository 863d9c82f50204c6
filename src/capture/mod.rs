pub mod coordinator;
pub mod downscale;
pub mod screen;

pub use coordinator::{CaptureCoordinator, NoOverlay, OverlayWindow};
pub use screen::{CaptureError, ScreenGrabber, XcapGrabber};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// One cycle's image, already downscaled for transmission.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub image: DynamicImage,
    /// False for an all-black or fully transparent frame.
    pub has_content: bool,
    pub captured_at: DateTime<Utc>,
    pub original_size: (u32, u32),
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Captured(CapturedImage),
    /// The grab itself failed.
    NoImage(String),
    /// Not attempted: region selection or another capture was under way.
    Refused(String),
}

impl CaptureOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, CaptureOutcome::Captured(c) if c.has_content)
    }

    pub fn into_valid(self) -> Option<CapturedImage> {
        match self {
            CaptureOutcome::Captured(c) if c.has_content => Some(c),
            _ => None,
        }
    }
}

/// A capture request sent from the scheduler to the display-owning thread.
#[derive(Debug)]
pub struct CaptureRequest {
    reply: oneshot::Sender<CaptureOutcome>,
}

impl CaptureRequest {
    pub fn new() -> (Self, oneshot::Receiver<CaptureOutcome>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }

    /// The scheduler stopped waiting (timeout or shutdown).
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn respond(self, outcome: CaptureOutcome) {
        if self.reply.send(outcome).is_err() {
            log::debug!("[CAPTURE] Requester gave up before the capture finished");
        }
    }
}

/// The display-owning end of the capture channel. Lives on the UI thread.
pub struct CaptureHost {
    requests: mpsc::UnboundedReceiver<CaptureRequest>,
    coordinator: CaptureCoordinator,
}

impl CaptureHost {
    pub fn new(
        requests: mpsc::UnboundedReceiver<CaptureRequest>,
        coordinator: CaptureCoordinator,
    ) -> Self {
        Self {
            requests,
            coordinator,
        }
    }

    fn serve(&self, request: CaptureRequest) -> bool {
        if request.is_abandoned() {
            log::debug!("[CAPTURE] Dropping request the scheduler no longer waits for");
            return false;
        }
        request.respond(self.coordinator.capture());
        true
    }

    /// Serves every pending request without blocking. Call from the UI
    /// event loop. Returns how many captures ran.
    pub fn pump(&mut self) -> usize {
        let mut served = 0;
        while let Ok(request) = self.requests.try_recv() {
            if self.serve(request) {
                served += 1;
            }
        }
        served
    }

    /// Serves requests until the scheduler drops its sender.
    /// Must not be called from inside an async runtime.
    pub fn run_blocking(mut self) {
        while let Some(request) = self.requests.blocking_recv() {
            self.serve(request);
        }
        log::info!("[CAPTURE] Capture host stopped");
    }
}
