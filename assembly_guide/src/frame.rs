// THEORY:
// A `Frame` is the unit everything in the engine passes around. Its pixel buffer
// is shared, never copied, so handing one frame to the marker slot, the
// calibration slot and back to the capture loop costs three reference counts.

use image::RgbaImage;
use std::sync::Arc;
use std::time::Instant;

const RGBA_CHANNELS: usize = 4;

/// A single captured camera frame in RGBA8 layout.
///
/// The pixel buffer is reference counted: cloning a `Frame` hands the same capture
/// buffer to another holder instead of copying it, and the buffer is released when
/// the last holder drops it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(frame_id: u64, width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            frame_id,
            width,
            height,
            timestamp: Instant::now(),
            data: data.into(),
        }
    }

    /// Copies the frame into an owned image, or `None` if the buffer does not hold
    /// `width * height` RGBA pixels.
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.to_vec())
    }

    /// True when the buffer holds exactly `width * height` RGBA pixels.
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * RGBA_CHANNELS
    }
}
