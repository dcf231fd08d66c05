// THEORY:
// This file is the main entry point for the `assembly_guide` library crate.
// It exposes the frame hand-off and workflow sequencing engine that sits between
// a live camera feed and a guided manual-assembly checklist.
//
// The primary export is the `WorkflowController`, which is fed one frame at a time
// by the capture loop and emits `UiIntent`s for a presentation layer to draw. The
// marker watcher and calibration worker run as background tasks behind it and are
// only reachable through single-slot hand-off cells, never through shared flags.

pub mod calibration;
pub mod component;
pub mod config;
pub mod error;
pub mod frame;
pub mod marker;
pub mod slot;
pub mod ui;
pub mod workflow;

pub use calibration::{
    CalibrationCompute, CalibrationResult, CalibrationStatus, CalibrationWorker, CameraControls,
    ScanRegion,
};
pub use component::{Checklist, ComponentRecord};
pub use config::{GuideConfig, MarkerTokens};
pub use error::GuideError;
pub use frame::Frame;
pub use marker::{DecodeError, MarkerBoard, MarkerDecoder, MarkerToken, MarkerWatcher};
pub use slot::FrameSlot;
pub use ui::{Mode, TextSlot, UiIntent, UiReceiver, UiSender, ui_channel};
pub use workflow::{Capabilities, FrameAnalyzer, WorkflowController, WorkflowState};
