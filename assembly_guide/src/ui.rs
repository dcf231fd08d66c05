// THEORY:
// Intent-level events for the presentation layer. The core never touches widgets.
// It pushes `UiIntent`s into an unbounded queue, and whatever renders the camera
// view drains that queue on its own thread.
//
// Key architectural principles:
// 1.  **Fire and forget**: Sending never blocks the capture path and never fails
//     it. A presentation layer that went away only means intents go nowhere.
// 2.  **Intents, not formatting**: The core says what changed (a corner text, the
//     checklist position, calibration progress). Layout and styling stay with the
//     renderer.

use crate::component::ComponentRecord;
use tokio::sync::mpsc;
use tracing::trace;

pub const STATUS_CALIBRATING: &str = "Calibrating";
pub const STATUS_CALIBRATED: &str = "Calibration successful";
pub const STATUS_CALIBRATION_FAILED: &str = "Calibration failed";
pub const STATUS_WITHDRAWING: &str = "Withdrawing";
pub const STATUS_IMPLEMENTING: &str = "Implementing";

/// Corner text fields of the camera overlay. The fourth corner, top right, shows
/// the checklist position from `UiIntent::SetProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextSlot {
    /// Bottom right: current activity.
    Status,
    /// Top left: board name.
    Board,
    /// Bottom left: details of the active component.
    Component,
}

/// Modes announced by a toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Calibrate,
    Withdraw,
    Implement,
    Completion,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Calibrate => "Calibration",
            Mode::Withdraw => "Withdraw",
            Mode::Implement => "Implement",
            Mode::Completion => "All components withdrawn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiIntent {
    ShowRegion(bool),
    SetCornerText { slot: TextSlot, text: String },
    SetProgress { current: usize, max: usize },
    SetCalibrationProgress(u8),
    Toast { mode: Mode, detail: String },
}

pub type UiReceiver = mpsc::UnboundedReceiver<UiIntent>;

/// Cloneable sending half of the UI queue. Sending never blocks and never fails
/// the caller; a dropped presentation layer just means intents go nowhere.
#[derive(Debug, Clone)]
pub struct UiSender {
    tx: mpsc::UnboundedSender<UiIntent>,
}

pub fn ui_channel() -> (UiSender, UiReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UiSender { tx }, rx)
}

impl UiSender {
    pub fn send(&self, intent: UiIntent) {
        if self.tx.send(intent).is_err() {
            trace!("ui intent dropped, presentation layer is gone");
        }
    }

    pub fn status(&self, text: &str) {
        self.corner(TextSlot::Status, text);
    }

    pub fn corner(&self, slot: TextSlot, text: impl Into<String>) {
        self.send(UiIntent::SetCornerText {
            slot,
            text: text.into(),
        });
    }

    pub fn toast(&self, mode: Mode, detail: impl Into<String>) {
        self.send(UiIntent::Toast {
            mode,
            detail: detail.into(),
        });
    }

    pub fn component(&self, record: &ComponentRecord) {
        self.corner(TextSlot::Component, record.to_string());
    }
}

/// Pulls every intent queued so far without waiting.
pub fn drain(rx: &mut UiReceiver) -> Vec<UiIntent> {
    let mut intents = Vec::new();
    while let Ok(intent) = rx.try_recv() {
        intents.push(intent);
    }
    intents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_send_order() {
        let (ui, mut rx) = ui_channel();
        ui.send(UiIntent::ShowRegion(true));
        ui.status(STATUS_CALIBRATING);
        ui.toast(Mode::Calibrate, "");

        assert_eq!(
            drain(&mut rx),
            vec![
                UiIntent::ShowRegion(true),
                UiIntent::SetCornerText {
                    slot: TextSlot::Status,
                    text: STATUS_CALIBRATING.to_string()
                },
                UiIntent::Toast {
                    mode: Mode::Calibrate,
                    detail: String::new()
                },
            ]
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn sending_after_receiver_drop_is_silent() {
        let (ui, rx) = ui_channel();
        drop(rx);

        ui.send(UiIntent::SetCalibrationProgress(50));
    }
}
