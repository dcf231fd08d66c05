// THEORY:
// Calibration has two halves that share one lifecycle. The exposure-lock loop
// releases the camera's automatic exposure and white balance, gives them a fixed
// number of short steps to settle while reporting progress, and then locks them
// again. Frames captured while the loop runs are parked in a `FrameSlot`; once the
// loop is over, the controller takes the newest one and hands it to the
// `CalibrationCompute` capability, which turns it into a board name and checklist.
//
// The worker never computes anything itself and the controller never sleeps. The
// only thing they share is the published `CalibrationStatus` and the frame slot.

use crate::component::{Checklist, ComponentRecord};
use crate::error::GuideError;
use crate::frame::Frame;
use crate::slot::FrameSlot;
use crate::ui::{UiIntent, UiSender};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Camera settings the exposure-lock loop needs to toggle.
pub trait CameraControls: Send + Sync + 'static {
    fn set_auto_exposure_lock(&self, locked: bool);
    fn set_auto_white_balance_lock(&self, locked: bool);
}

/// Capability that derives the checklist from a calibration frame.
pub trait CalibrationCompute: Send + Sync + 'static {
    fn compute(&self, frame: &Frame, region: &ScanRegion, config_path: &Path) -> CalibrationResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    NotStarted,
    Running,
    Finished,
}

/// Rectangle of the frame used for color measurement, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl ScanRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        let right = i64::from(self.x) + i64::from(self.width);
        let bottom = i64::from(self.y) + i64::from(self.height);
        self.x >= 0
            && self.y >= 0
            && self.width > 0
            && self.height > 0
            && right <= i64::from(frame_width)
            && bottom <= i64::from(frame_height)
    }
}

/// Outcome of one calibration compute.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub board_name: String,
    pub checklist: Checklist,
    pub valid: bool,
}

const TABLE_BOARD_ROW: usize = 0;
const TABLE_NAME_ROW: usize = 1;
const TABLE_OCCURRENCE_ROW: usize = 2;
const TABLE_POLARITY_ROW: usize = 3;

impl CalibrationResult {
    pub fn valid(board_name: impl Into<String>, components: Vec<ComponentRecord>) -> Self {
        Self {
            board_name: board_name.into(),
            checklist: components.into(),
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            board_name: String::new(),
            checklist: Vec::<ComponentRecord>::new().into(),
            valid: false,
        }
    }

    /// Builds a result from the row-oriented table calibration backends report:
    /// board name, component names, occurrence counts, and polarity flags
    /// (`0` for none, anything else for polarized). An empty table is the
    /// backend's way of saying calibration failed.
    pub fn from_table(rows: &[Vec<String>]) -> Self {
        match parse_table(rows) {
            Ok((board_name, components)) => Self::valid(board_name, components),
            Err(err) => {
                warn!(%err, "discarding calibration table");
                Self::invalid()
            }
        }
    }
}

fn parse_table(rows: &[Vec<String>]) -> Result<(String, Vec<ComponentRecord>), GuideError> {
    if rows.is_empty() {
        return Err(GuideError::invalid_calibration("calibration produced no data"));
    }
    if rows.len() <= TABLE_POLARITY_ROW {
        return Err(GuideError::invalid_calibration(format!(
            "expected {} rows, got {}",
            TABLE_POLARITY_ROW + 1,
            rows.len()
        )));
    }

    let board_name = rows[TABLE_BOARD_ROW]
        .first()
        .cloned()
        .ok_or_else(|| GuideError::invalid_calibration("missing board name"))?;

    let names = &rows[TABLE_NAME_ROW];
    let occurrences = &rows[TABLE_OCCURRENCE_ROW];
    let polarities = &rows[TABLE_POLARITY_ROW];
    if names.is_empty() {
        return Err(GuideError::invalid_calibration("no components listed"));
    }
    if occurrences.len() != names.len() || polarities.len() != names.len() {
        return Err(GuideError::invalid_calibration("component rows differ in length"));
    }

    names
        .iter()
        .zip(occurrences)
        .zip(polarities)
        .map(|((name, count), polarity)| {
            let count = count.trim().parse::<u32>().map_err(|_| {
                GuideError::invalid_calibration(format!("bad occurrence count {count:?} for {name}"))
            })?;
            let polarity = polarity.trim().parse::<i64>().map_err(|_| {
                GuideError::invalid_calibration(format!("bad polarity flag {polarity:?} for {name}"))
            })?;
            Ok(ComponentRecord::new(name.clone(), count, polarity != 0))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|components| (board_name, components))
}

/// Handle to one running (or finished) exposure-lock loop plus the frames parked
/// for its compute step.
pub struct CalibrationWorker {
    frames: FrameSlot<Frame>,
    status: watch::Receiver<CalibrationStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CalibrationWorker {
    /// Unlocks exposure and white balance and starts the progress loop. The worker
    /// is `Running` as soon as this returns.
    pub fn spawn(
        runtime: &Handle,
        camera: Arc<dyn CameraControls>,
        ui: UiSender,
        iterations: u32,
        step: Duration,
    ) -> Self {
        camera.set_auto_exposure_lock(false);
        camera.set_auto_white_balance_lock(false);

        let (status_tx, status) = watch::channel(CalibrationStatus::Running);
        let cancel = CancellationToken::new();
        let task = runtime.spawn(exposure_lock_loop(
            camera,
            ui,
            iterations,
            step,
            status_tx,
            cancel.clone(),
        ));

        Self {
            frames: FrameSlot::new(),
            status,
            cancel,
            task,
        }
    }

    pub fn status(&self) -> CalibrationStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == CalibrationStatus::Running
    }

    /// Parks a frame for the compute step; only the newest one is kept.
    pub fn submit(&self, frame: Frame) {
        self.frames.put(frame);
    }

    pub fn take_frame(&self) -> Option<Frame> {
        self.frames.try_take()
    }

    /// Interrupts the loop, waits for it to relock the camera, and drops any
    /// parked frame.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "calibration task ended abnormally");
        }
        self.frames.clear();
    }
}

fn progress_percent(step: u32, iterations: u32) -> u8 {
    let pct = u64::from(step) * 100 / u64::from(iterations.max(1));
    pct.min(100) as u8
}

async fn exposure_lock_loop(
    camera: Arc<dyn CameraControls>,
    ui: UiSender,
    iterations: u32,
    step: Duration,
    status: watch::Sender<CalibrationStatus>,
    cancel: CancellationToken,
) {
    info!(iterations, step_ms = step.as_millis() as u64, "white balance calibration running");
    for i in 1..=iterations {
        ui.send(UiIntent::SetCalibrationProgress(progress_percent(i, iterations)));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(step = i, iterations, "calibration loop interrupted");
                break;
            }
            _ = tokio::time::sleep(step) => {}
        }
    }

    camera.set_auto_exposure_lock(true);
    camera.set_auto_white_balance_lock(true);
    status.send_replace(CalibrationStatus::Finished);
    debug!("exposure and white balance locked");
}
