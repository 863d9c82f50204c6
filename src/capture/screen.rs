//! Screen grabbing through `xcap`. This is the only file that talks to the OS.

use image::{DynamicImage, RgbaImage};
use xcap::Monitor;

use crate::state::CaptureRegion;

/// Produces one raw screenshot. Implementations must be called from the
/// context that owns display access.
pub trait ScreenGrabber: Send {
    fn grab(&self, region: Option<CaptureRegion>) -> Result<DynamicImage, CaptureError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to list monitors: {0}")]
    MonitorEnumeration(String),

    #[error("No monitors found")]
    NoMonitor,

    #[error("Failed to capture screen: {0}")]
    CaptureFailed(String),

    #[error("Capture region {region} lies outside the screen ({screen_width}x{screen_height} at {origin_x},{origin_y})")]
    RegionOutsideScreen {
        region: CaptureRegion,
        origin_x: i32,
        origin_y: i32,
        screen_width: u32,
        screen_height: u32,
    },
}

/// Captures the primary monitor (or the first one if none reports primary).
#[derive(Debug, Default, Clone, Copy)]
pub struct XcapGrabber;

impl ScreenGrabber for XcapGrabber {
    fn grab(&self, region: Option<CaptureRegion>) -> Result<DynamicImage, CaptureError> {
        let monitors =
            Monitor::all().map_err(|e| CaptureError::MonitorEnumeration(e.to_string()))?;

        let primary_idx = monitors
            .iter()
            .position(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(0);
        let monitor = monitors
            .into_iter()
            .nth(primary_idx)
            .ok_or(CaptureError::NoMonitor)?;

        let image = monitor
            .capture_image()
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        match region {
            None => {
                log::info!("[CAPTURE] Full screen {}x{}", image.width(), image.height());
                Ok(DynamicImage::ImageRgba8(image))
            }
            Some(region) => {
                let origin = (
                    monitor.x().unwrap_or(0),
                    monitor.y().unwrap_or(0),
                );
                let cropped = crop_to_region(&image, origin, region)?;
                log::info!("[CAPTURE] Region {}", region);
                Ok(DynamicImage::ImageRgba8(cropped))
            }
        }
    }
}

/// Crops a monitor image to an absolute-coordinate region, clipping to the
/// monitor bounds. `origin` is the monitor's top-left in screen coordinates.
pub fn crop_to_region(
    image: &RgbaImage,
    origin: (i32, i32),
    region: CaptureRegion,
) -> Result<RgbaImage, CaptureError> {
    let (img_w, img_h) = image.dimensions();
    let left = i64::from(region.x) - i64::from(origin.0);
    let top = i64::from(region.y) - i64::from(origin.1);
    let right = left + i64::from(region.width);
    let bottom = top + i64::from(region.height);

    let x0 = left.clamp(0, i64::from(img_w));
    let y0 = top.clamp(0, i64::from(img_h));
    let x1 = right.clamp(0, i64::from(img_w));
    let y1 = bottom.clamp(0, i64::from(img_h));

    if x1 <= x0 || y1 <= y0 {
        return Err(CaptureError::RegionOutsideScreen {
            region,
            origin_x: origin.0,
            origin_y: origin.1,
            screen_width: img_w,
            screen_height: img_h,
        });
    }

    // Bounds were clamped into u32 range above.
    let view = image::imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    Ok(view.to_image())
}
