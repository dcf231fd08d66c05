// THEORY:
// One error enum for the library. Almost nothing in the per-frame path is allowed
// to fail outward; the variants here cover setup (configuration, runtime) and the
// single fatal invariant of the workflow.

use thiserror::Error;

/// Errors surfaced by the guide engine.
///
/// Per-frame problems (failed decodes, empty slots, rejected calibration data) are
/// contained inside the tick that hit them and never reach the capture loop. The
/// only error `WorkflowController::on_frame` returns is `IndexInvariant`.
#[derive(Debug, Error)]
pub enum GuideError {
    #[error("calibration result rejected: {reason}")]
    InvalidCalibration { reason: String },

    #[error("checklist index {index} is out of range for {len} components")]
    IndexInvariant { index: usize, len: usize },

    #[error("no tokio runtime is available to host the background workers")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration")]
    ConfigFormat(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GuideError {
    pub(crate) fn invalid_calibration(reason: impl Into<String>) -> Self {
        GuideError::InvalidCalibration {
            reason: reason.into(),
        }
    }
}
