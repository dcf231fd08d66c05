// THEORY:
// The `WorkflowController` is the state machine at the heart of the guide. It is
// driven by the capture loop, one call to `on_frame` per captured frame, and on
// every call it decides which of three things the frame is for: calibration,
// withdrawing the active component, or implementing it.
//
// Key architectural principles:
// 1.  **Never block capture**: Every interaction with the background workers is a
//     non-blocking put into a slot or a read of a published status. The only
//     synchronous work is the analysis capability of the current mode.
// 2.  **One tagged state**: Where the checklist stands is a single
//     `WorkflowState`. "Which component", "are we withdrawing" and "is there an
//     active component at all" can never disagree with each other.
// 3.  **Markers are edges, not levels**: A decoded token is consumed on the tick it
//     arrives. Between decodes the controller keeps acting on the last directive
//     it followed, which lets the workflow continue while the marker is only
//     readable now and then. A marker left in view is published once; it has to
//     leave the view before the same marker can advance the checklist again.
// 4.  **Calibration is fenced**: While the exposure loop runs, marker decoding is
//     off and no token is consumed, so nothing scanned during calibration can leak
//     into the directive that applies afterwards.

use crate::calibration::{
    CalibrationCompute, CalibrationResult, CalibrationStatus, CalibrationWorker, CameraControls,
};
use crate::component::{Checklist, ComponentRecord};
use crate::config::GuideConfig;
use crate::error::GuideError;
use crate::frame::Frame;
use crate::marker::{MarkerBoard, MarkerDecoder, MarkerToken, MarkerWatcher};
use crate::ui::{
    Mode, STATUS_CALIBRATED, STATUS_CALIBRATING, STATUS_CALIBRATION_FAILED, STATUS_IMPLEMENTING,
    STATUS_WITHDRAWING, TextSlot, UiIntent, UiSender,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn};

/// Per-component analysis run on frames while a component is active. Results are
/// reported out of band by the implementation.
pub trait FrameAnalyzer: Send + Sync + 'static {
    fn analyze_withdraw(&self, frame: &Frame, index: usize);
    fn analyze_implement(&self, frame: &Frame, index: usize);
}

/// The external collaborators the controller drives.
#[derive(Clone)]
pub struct Capabilities {
    pub decoder: Arc<dyn MarkerDecoder>,
    pub calibration: Arc<dyn CalibrationCompute>,
    pub analyzer: Arc<dyn FrameAnalyzer>,
    pub camera: Arc<dyn CameraControls>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Calibrating,
    Withdrawing(usize),
    Implementing(usize),
}

impl WorkflowState {
    /// The active checklist position; `None` means no component is active yet.
    pub fn index(&self) -> Option<usize> {
        match self {
            WorkflowState::Withdrawing(index) | WorkflowState::Implementing(index) => Some(*index),
            WorkflowState::Idle | WorkflowState::Calibrating => None,
        }
    }
}

/// The mode-selecting marker the controller last acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Withdraw,
    Implement,
}

pub struct WorkflowController {
    config: GuideConfig,
    runtime: Handle,
    ui: UiSender,
    capabilities: Capabilities,
    watcher: MarkerWatcher,
    calibration: Option<CalibrationWorker>,
    calibration_collected: bool,
    calibration_runs: u64,
    state: WorkflowState,
    /// Restored when a calibration run produces nothing usable.
    resume_state: WorkflowState,
    checklist: Checklist,
    board_name: Option<String>,
    white_balanced: bool,
    last_directive: Option<Directive>,
    marker_hold_until: Option<Instant>,
    faulted: bool,
}

impl WorkflowController {
    /// Starts a session: validates the configuration and spawns the marker watcher
    /// on the current tokio runtime.
    pub fn new(
        config: GuideConfig,
        capabilities: Capabilities,
        ui: UiSender,
    ) -> Result<Self, GuideError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| GuideError::NoRuntime)?;
        let watcher = MarkerWatcher::spawn(
            &runtime,
            Arc::new(MarkerBoard::new()),
            Arc::clone(&capabilities.decoder),
            config.marker_poll_timeout(),
        );
        info!("workflow session started");

        Ok(Self {
            config,
            runtime,
            ui,
            capabilities,
            watcher,
            calibration: None,
            calibration_collected: false,
            calibration_runs: 0,
            state: WorkflowState::Idle,
            resume_state: WorkflowState::Idle,
            checklist: Vec::<ComponentRecord>::new().into(),
            board_name: None,
            white_balanced: false,
            last_directive: None,
            marker_hold_until: None,
            faulted: false,
        })
    }

    /// Processes one captured frame and hands it back for rendering.
    ///
    /// Fails only when the checklist position is out of range. The controller is
    /// then faulted and passes every later frame through untouched.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Frame, GuideError> {
        if self.faulted {
            return Ok(frame);
        }
        self.markers().submit(frame.clone());

        let token = if self.calibration_running() {
            MarkerToken::None
        } else {
            self.markers().take_token()
        };

        if token.is(&self.config.tokens.calibrate) && !self.calibration_running() {
            self.begin_calibration();
        }

        if let Some(worker) = self.calibration.as_ref().filter(|w| w.is_running()) {
            worker.submit(frame.clone());
        } else if self.calibration_ready_to_collect() {
            self.finish_calibration();
        } else if self.is_calibrated() {
            if let Err(err) = self.dispatch(&token, &frame) {
                error!(%err, state = ?self.state, "workflow aborted");
                self.faulted = true;
                return Err(err);
            }
        }

        self.release_marker_hold();
        Ok(frame)
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn checklist(&self) -> &Checklist {
        &self.checklist
    }

    pub fn board_name(&self) -> Option<&str> {
        self.board_name.as_deref()
    }

    /// True once white balance has been locked at least once and a checklist is
    /// loaded.
    pub fn is_calibrated(&self) -> bool {
        self.white_balanced && !self.checklist.is_empty()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibration
            .as_ref()
            .map_or(CalibrationStatus::NotStarted, CalibrationWorker::status)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn markers(&self) -> &Arc<MarkerBoard> {
        self.watcher.board()
    }

    /// Stops both background workers and releases every frame they still hold.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.calibration.take() {
            worker.shutdown().await;
        }
        self.watcher.shutdown().await;
        info!(calibration_runs = self.calibration_runs, "workflow session closed");
    }

    fn calibration_running(&self) -> bool {
        self.calibration
            .as_ref()
            .is_some_and(CalibrationWorker::is_running)
    }

    fn calibration_ready_to_collect(&self) -> bool {
        !self.calibration_collected
            && self
                .calibration
                .as_ref()
                .is_some_and(|w| w.status() == CalibrationStatus::Finished)
    }

    fn begin_calibration(&mut self) {
        self.calibration_runs += 1;
        self.markers().disable();
        self.marker_hold_until = None;

        let worker = CalibrationWorker::spawn(
            &self.runtime,
            Arc::clone(&self.capabilities.camera),
            self.ui.clone(),
            self.config.calibration_iterations,
            self.config.calibration_step(),
        );
        if self.calibration.replace(worker).is_some() {
            debug!("previous calibration worker released");
        }
        self.calibration_collected = false;

        if self.state != WorkflowState::Calibrating {
            self.resume_state = self.state;
        }
        self.state = WorkflowState::Calibrating;
        self.last_directive = None;

        self.ui.send(UiIntent::ShowRegion(true));
        self.ui.status(STATUS_CALIBRATING);
        self.ui.toast(Mode::Calibrate, "");
        info!(run = self.calibration_runs, "calibration started");
    }

    fn finish_calibration(&mut self) {
        self.calibration_collected = true;
        let span = info_span!("calibration", run = self.calibration_runs);
        let _entered = span.enter();

        let frame = self
            .calibration
            .as_ref()
            .and_then(CalibrationWorker::take_frame);
        let result = match frame {
            Some(frame) => self.capabilities.calibration.compute(
                &frame,
                &self.config.scan_region,
                &self.config.config_path,
            ),
            None => {
                warn!("no frame was captured while calibrating");
                CalibrationResult::invalid()
            }
        };

        self.ui.send(UiIntent::ShowRegion(false));
        if result.valid && !result.checklist.is_empty() {
            info!(
                board = %result.board_name,
                components = result.checklist.len(),
                "calibration applied"
            );
            self.ui.corner(TextSlot::Board, result.board_name.clone());
            self.ui.send(UiIntent::SetProgress {
                current: 0,
                max: result.checklist.len(),
            });
            self.ui.status(STATUS_CALIBRATED);
            self.board_name = Some(result.board_name);
            self.checklist = result.checklist;
            self.state = WorkflowState::Idle;
        } else {
            warn!(
                components = self.checklist.len(),
                "calibration result rejected, previous checklist kept"
            );
            self.ui.status(STATUS_CALIBRATION_FAILED);
            self.ui.toast(Mode::Calibrate, STATUS_CALIBRATION_FAILED);
            self.state = self.resume_state;
        }

        self.resume_state = WorkflowState::Idle;
        self.white_balanced = true;
        self.last_directive = None;
        self.markers().enable();
    }

    fn dispatch(&mut self, token: &MarkerToken, frame: &Frame) -> Result<(), GuideError> {
        match self.resolve(token) {
            Some((Directive::Withdraw, fresh)) => self.withdraw(frame, fresh),
            Some((Directive::Implement, fresh)) => self.implement(frame, fresh),
            None => Ok(()),
        }
    }

    /// Maps this tick's token to a directive and whether it was freshly scanned.
    /// Blank and unrecognised tokens continue the last directive.
    fn resolve(&self, token: &MarkerToken) -> Option<(Directive, bool)> {
        let tokens = &self.config.tokens;
        if token.is(&tokens.withdraw) {
            return Some((Directive::Withdraw, true));
        }
        if token.is(&tokens.implement) {
            return Some((Directive::Implement, true));
        }
        if !token.is_blank() {
            debug!(?token, "ignoring unrecognised marker");
        }
        self.last_directive.map(|directive| (directive, false))
    }

    fn withdraw(&mut self, frame: &Frame, fresh: bool) -> Result<(), GuideError> {
        let checklist = Arc::clone(&self.checklist);
        let index = match self.state {
            WorkflowState::Withdrawing(index) if !fresh => index,
            state => {
                let index = match state.index() {
                    Some(last) if last + 1 >= checklist.len() => {
                        info!("all components withdrawn, starting over");
                        self.ui.toast(Mode::Completion, "");
                        0
                    }
                    Some(last) => last + 1,
                    None => 0,
                };
                let component = record(&checklist, index)?;
                info!(index, component = component.name(), "withdrawing");
                self.ui.toast(Mode::Withdraw, component.name());
                self.ui.status(STATUS_WITHDRAWING);
                self.ui.component(component);
                self.ui.send(UiIntent::SetProgress {
                    current: index + 1,
                    max: checklist.len(),
                });
                index
            }
        };

        record(&checklist, index)?;
        self.state = WorkflowState::Withdrawing(index);
        self.last_directive = Some(Directive::Withdraw);
        if fresh {
            self.hold_markers();
        }
        self.capabilities.analyzer.analyze_withdraw(frame, index);
        Ok(())
    }

    fn implement(&mut self, frame: &Frame, fresh: bool) -> Result<(), GuideError> {
        let Some(index) = self.state.index() else {
            debug!("implement ignored, no component has been withdrawn");
            return Ok(());
        };
        let checklist = Arc::clone(&self.checklist);
        let component = record(&checklist, index)?;

        if matches!(self.state, WorkflowState::Withdrawing(_)) {
            info!(index, component = component.name(), "implementing");
            self.ui.toast(Mode::Implement, component.name());
            self.ui.status(STATUS_IMPLEMENTING);
        }

        self.state = WorkflowState::Implementing(index);
        self.last_directive = Some(Directive::Implement);
        if fresh {
            self.hold_markers();
        }
        self.capabilities.analyzer.analyze_implement(frame, index);
        Ok(())
    }

    /// Pauses decoding for the configured holdoff after a directive was acted on.
    fn hold_markers(&mut self) {
        self.markers().disable();
        self.marker_hold_until = Some(Instant::now() + self.config.marker_holdoff());
    }

    fn release_marker_hold(&mut self) {
        let Some(until) = self.marker_hold_until else {
            return;
        };
        if Instant::now() >= until {
            self.marker_hold_until = None;
            self.markers().enable();
        }
    }
}

fn record(checklist: &Checklist, index: usize) -> Result<&ComponentRecord, GuideError> {
    checklist.get(index).ok_or(GuideError::IndexInvariant {
        index,
        len: checklist.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ScanRegion;
    use crate::marker::DecodeError;
    use crate::ui::ui_channel;
    use std::path::Path;
    use std::sync::Mutex;

    struct Blind;

    impl MarkerDecoder for Blind {
        fn decode(&self, _frame: &Frame) -> Result<Option<String>, DecodeError> {
            Ok(None)
        }
    }

    impl CameraControls for Blind {
        fn set_auto_exposure_lock(&self, _locked: bool) {}
        fn set_auto_white_balance_lock(&self, _locked: bool) {}
    }

    impl CalibrationCompute for Blind {
        fn compute(&self, _frame: &Frame, _region: &ScanRegion, _path: &Path) -> CalibrationResult {
            CalibrationResult::invalid()
        }
    }

    #[derive(Default)]
    struct CountingAnalyzer {
        calls: Mutex<usize>,
    }

    impl FrameAnalyzer for CountingAnalyzer {
        fn analyze_withdraw(&self, _frame: &Frame, _index: usize) {
            *self.calls.lock().unwrap() += 1;
        }

        fn analyze_implement(&self, _frame: &Frame, _index: usize) {
            *self.calls.lock().unwrap() += 1;
        }
    }

    fn capabilities(analyzer: Arc<CountingAnalyzer>) -> Capabilities {
        Capabilities {
            decoder: Arc::new(Blind),
            calibration: Arc::new(Blind),
            analyzer,
            camera: Arc::new(Blind),
        }
    }

    fn frame() -> Frame {
        Frame::new(0, 1, 1, vec![0u8; 4])
    }

    #[test]
    fn state_index_maps_no_component_to_none() {
        assert_eq!(WorkflowState::Idle.index(), None);
        assert_eq!(WorkflowState::Calibrating.index(), None);
        assert_eq!(WorkflowState::Withdrawing(2).index(), Some(2));
        assert_eq!(WorkflowState::Implementing(0).index(), Some(0));
    }

    #[test]
    fn requires_a_runtime() {
        let (ui, _rx) = ui_channel();
        let result = WorkflowController::new(
            GuideConfig::default(),
            capabilities(Arc::default()),
            ui,
        );

        assert!(matches!(result, Err(GuideError::NoRuntime)));
    }

    #[tokio::test]
    async fn out_of_range_index_faults_the_workflow() {
        let analyzer = Arc::new(CountingAnalyzer::default());
        let (ui, _rx) = ui_channel();
        let mut controller = WorkflowController::new(
            GuideConfig::default(),
            capabilities(Arc::clone(&analyzer)),
            ui,
        )
        .unwrap();

        controller.checklist = vec![
            ComponentRecord::new("R1", 2, true),
            ComponentRecord::new("C1", 1, false),
        ]
        .into();
        controller.white_balanced = true;
        controller.state = WorkflowState::Withdrawing(5);
        controller.last_directive = Some(Directive::Withdraw);

        let err = controller.on_frame(frame()).unwrap_err();
        assert!(matches!(err, GuideError::IndexInvariant { index: 5, len: 2 }));
        assert!(controller.is_faulted());

        assert!(controller.on_frame(frame()).is_ok());
        assert_eq!(*analyzer.calls.lock().unwrap(), 0);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unrecognised_marker_continues_the_last_directive() {
        let (ui, _rx) = ui_channel();
        let mut controller = WorkflowController::new(
            GuideConfig::default(),
            capabilities(Arc::default()),
            ui,
        )
        .unwrap();
        controller.last_directive = Some(Directive::Implement);

        assert_eq!(
            controller.resolve(&MarkerToken::Text("banana".into())),
            Some((Directive::Implement, false))
        );
        assert_eq!(
            controller.resolve(&MarkerToken::Text("withdraw".into())),
            Some((Directive::Withdraw, true))
        );
        assert_eq!(
            controller.resolve(&MarkerToken::None),
            Some((Directive::Implement, false))
        );

        controller.shutdown().await;
    }
}
