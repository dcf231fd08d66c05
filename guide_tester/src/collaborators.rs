// THEORY:
// OpenCV-backed implementations of the capabilities the guide engine drives. They
// stand in for the production decoders and scorers so the engine can be exercised
// end to end on recorded video.
//
// Key architectural principles:
// 1.  **Capture thread owns the device**: `VideoCapture` is not shared. Camera
//     property changes requested from the calibration task are queued and applied
//     between reads.
// 2.  **Failures stay local**: A missing table or a bad scan region yields an
//     invalid calibration result and a log line, never an error for the loop.

use anyhow::Context;
use assembly_guide::{
    CalibrationCompute, CalibrationResult, CameraControls, DecodeError, Frame, FrameAnalyzer,
    MarkerDecoder, ScanRegion,
};
use image::DynamicImage;
use opencv::{
    core::{self, Mat, Scalar},
    objdetect::QRCodeDetector,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Decodes QR markers from the luma plane of a frame.
pub struct QrDecoder {
    detector: Mutex<QRCodeDetector>,
}

impl QrDecoder {
    pub fn new() -> opencv::Result<Self> {
        Ok(Self {
            detector: Mutex::new(QRCodeDetector::default()?),
        })
    }
}

fn backend(err: opencv::Error) -> DecodeError {
    DecodeError::Backend(err.to_string())
}

impl MarkerDecoder for QrDecoder {
    fn decode(&self, frame: &Frame) -> Result<Option<String>, DecodeError> {
        let rgba = frame.to_image().ok_or(DecodeError::Format)?;
        let luma = DynamicImage::ImageRgba8(rgba).into_luma8();

        let mut gray = Mat::new_rows_cols_with_default(
            frame.height as i32,
            frame.width as i32,
            core::CV_8UC1,
            Scalar::all(0.0),
        )
        .map_err(backend)?;
        gray.data_bytes_mut()
            .map_err(backend)?
            .copy_from_slice(luma.as_raw());

        let mut points = Mat::default();
        let mut straight = Mat::default();
        let payload = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect_and_decode(&gray, &mut points, &mut straight)
            .map_err(backend)?;

        if payload.is_empty() {
            return Ok(None);
        }
        String::from_utf8(payload)
            .map(Some)
            .map_err(|_| DecodeError::Format)
    }
}

/// Camera property changes requested by the calibration worker.
///
/// `VideoCapture` lives on the capture thread, so requests are queued here and
/// applied between reads.
#[derive(Default)]
pub struct DeviceControls {
    pending: Mutex<Vec<(i32, f64)>>,
}

impl DeviceControls {
    fn request(&self, property: i32, value: f64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((property, value));
    }

    pub fn apply(&self, cap: &mut VideoCapture) {
        let requests = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for (property, value) in requests {
            match cap.set(property, value) {
                Ok(true) => debug!(property, value, "camera property set"),
                Ok(false) => debug!(property, value, "camera ignored property"),
                Err(err) => warn!(property, value, %err, "failed to set camera property"),
            }
        }
    }
}

impl CameraControls for DeviceControls {
    fn set_auto_exposure_lock(&self, locked: bool) {
        // V4L2 convention: 0.25 selects manual exposure, 0.75 aperture priority.
        self.request(videoio::CAP_PROP_AUTO_EXPOSURE, if locked { 0.25 } else { 0.75 });
    }

    fn set_auto_white_balance_lock(&self, locked: bool) {
        self.request(videoio::CAP_PROP_AUTO_WB, if locked { 0.0 } else { 1.0 });
    }
}

/// Reads the calibration table from the configured path once the scan region
/// has been checked against the frame.
pub struct TableCompute;

impl CalibrationCompute for TableCompute {
    fn compute(&self, frame: &Frame, region: &ScanRegion, config_path: &Path) -> CalibrationResult {
        if !region.fits_within(frame.width, frame.height) {
            warn!(
                ?region,
                frame_width = frame.width,
                frame_height = frame.height,
                "scan region does not fit the frame"
            );
            return CalibrationResult::invalid();
        }

        match read_table(config_path) {
            Ok(rows) => CalibrationResult::from_table(&rows),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "calibration table unavailable");
                CalibrationResult::invalid()
            }
        }
    }
}

fn read_table(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("malformed table in {}", path.display()))
}

/// Stand-in for per-component scoring: reports which frames were analyzed.
pub struct LoggingAnalyzer;

impl FrameAnalyzer for LoggingAnalyzer {
    fn analyze_withdraw(&self, frame: &Frame, index: usize) {
        debug!(frame_id = frame.frame_id, index, "withdraw analysis");
    }

    fn analyze_implement(&self, frame: &Frame, index: usize) {
        debug!(frame_id = frame.frame_id, index, "implement analysis");
    }
}
