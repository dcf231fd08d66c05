// THEORY:
// Every tunable of the engine in one plain struct, loadable from JSON. Missing
// fields fall back to defaults, and `validate` rejects values the workers cannot
// run with before any task is spawned.

use crate::calibration::ScanRegion;
use crate::error::GuideError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker payloads that select a workflow mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerTokens {
    pub calibrate: String,
    pub withdraw: String,
    pub implement: String,
}

impl Default for MarkerTokens {
    fn default() -> Self {
        Self {
            calibrate: "calibrate".to_string(),
            withdraw: "withdraw".to_string(),
            implement: "implement".to_string(),
        }
    }
}

/// Configuration for the `WorkflowController`, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    pub tokens: MarkerTokens,
    /// How long the marker watcher waits on its slot before checking again.
    pub marker_poll_timeout_ms: u64,
    /// After a withdraw or implement marker is acted on, decoding stays off for this
    /// long so the same marker held in view does not advance the checklist twice.
    pub marker_holdoff_ms: u64,
    /// Number of progress steps in the exposure-lock loop.
    pub calibration_iterations: u32,
    pub calibration_step_ms: u64,
    /// Area of the frame the calibration compute measures, in frame pixels.
    pub scan_region: ScanRegion,
    /// Handed to the calibration compute untouched.
    pub config_path: PathBuf,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            tokens: MarkerTokens::default(),
            marker_poll_timeout_ms: 150,
            marker_holdoff_ms: 1_500,
            calibration_iterations: 100,
            calibration_step_ms: 20,
            scan_region: ScanRegion::new(0, 0, 100, 100),
            config_path: PathBuf::from("assembly.json"),
        }
    }
}

impl GuideConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GuideError> {
        let text = std::fs::read_to_string(path)?;
        let config: GuideConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GuideError> {
        if self.calibration_iterations == 0 {
            return Err(GuideError::Config(
                "calibration_iterations must be at least 1".to_string(),
            ));
        }
        if self.marker_poll_timeout_ms == 0 {
            return Err(GuideError::Config(
                "marker_poll_timeout_ms must be positive".to_string(),
            ));
        }
        let MarkerTokens {
            calibrate,
            withdraw,
            implement,
        } = &self.tokens;
        if calibrate.is_empty() || withdraw.is_empty() || implement.is_empty() {
            return Err(GuideError::Config("marker tokens must not be empty".to_string()));
        }
        if calibrate == withdraw || calibrate == implement || withdraw == implement {
            return Err(GuideError::Config("marker tokens must be distinct".to_string()));
        }
        if self.scan_region.width <= 0 || self.scan_region.height <= 0 {
            return Err(GuideError::Config("scan_region must have a positive size".to_string()));
        }
        Ok(())
    }

    pub fn marker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_poll_timeout_ms)
    }

    pub fn marker_holdoff(&self) -> Duration {
        Duration::from_millis(self.marker_holdoff_ms)
    }

    pub fn calibration_step(&self) -> Duration {
        Duration::from_millis(self.calibration_step_ms)
    }
}
