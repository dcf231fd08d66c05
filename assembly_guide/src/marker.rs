// THEORY:
// The marker module owns everything between "a frame was captured" and "the
// controller learned that a marker was scanned". Decoding is far slower than the
// capture rate, so it runs on its own task and only ever looks at the newest frame.
//
// Key architectural principles:
// 1.  **Board, not callbacks**: The `MarkerBoard` is the shared meeting point. The
//     capture side submits frames into its slot, the watcher task publishes decoded
//     tokens into it, and the controller consumes them. Nobody calls anybody else.
// 2.  **Consume once**: A published token stays pending until the controller takes
//     it. Taking it clears the pending flag, so one successful decode is acted on
//     exactly once no matter how many controller ticks follow.
// 3.  **Gating**: While the board is disabled the watcher skips decoding and any
//     late result is refused. Enabling and disabling happen under the same lock as
//     publishing, so a decode racing a `disable` cannot slip through.
// 4.  **Edge-triggered**: A marker held in front of the camera decodes on every
//     frame, but it is published only when it comes into view. The board re-arms
//     once the watcher decodes a frame with no marker, or sees a different one.

use crate::frame::Frame;
use crate::slot::FrameSlot;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a frame that was handed to a decoder produced no token.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("marker found but its format could not be read")]
    Format,
    #[error("marker checksum mismatch")]
    Checksum,
    #[error("decoder backend failed: {0}")]
    Backend(String),
}

/// Capability that looks for a scannable marker in a frame.
pub trait MarkerDecoder: Send + Sync + 'static {
    /// `Ok(None)` when no marker is visible.
    fn decode(&self, frame: &Frame) -> Result<Option<String>, DecodeError>;
}

/// The controller's view of the marker stream on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerToken {
    /// Nothing new was decoded since the last tick.
    None,
    Text(String),
}

impl MarkerToken {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MarkerToken::None => None,
            MarkerToken::Text(text) => Some(text),
        }
    }

    pub fn is(&self, expected: &str) -> bool {
        self.as_text() == Some(expected)
    }

    /// True for both the sentinel and a decoded empty payload.
    pub fn is_blank(&self) -> bool {
        self.as_text().is_none_or(str::is_empty)
    }
}

#[derive(Debug)]
struct BoardState {
    pending: Option<String>,
    enabled: bool,
    /// The marker the watcher last saw in view; repeats of it are not published.
    in_view: Option<String>,
}

/// Shared state between the capture path, the watcher task and the controller.
#[derive(Debug)]
pub struct MarkerBoard {
    frames: FrameSlot<Frame>,
    state: Mutex<BoardState>,
}

impl Default for MarkerBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerBoard {
    /// A new board starts enabled with nothing pending.
    pub fn new() -> Self {
        Self {
            frames: FrameSlot::new(),
            state: Mutex::new(BoardState {
                pending: None,
                enabled: true,
                in_view: None,
            }),
        }
    }

    /// Offers a frame to the watcher. Never blocks.
    pub fn submit(&self, frame: Frame) {
        self.frames.put(frame);
    }

    /// Records a token directly, without the in-view check the watcher goes
    /// through. Refused while the board is disabled.
    pub fn publish(&self, token: impl Into<String>) -> bool {
        let mut state = self.lock();
        if !state.enabled {
            return false;
        }
        state.pending = Some(token.into());
        drop(state);
        self.frames.clear();
        true
    }

    /// Feeds one decode outcome from the watcher. Publishes only a marker that was
    /// not already in view; `None` (or an empty payload) means the view is clear.
    pub fn observe(&self, decoded: Option<&str>) -> bool {
        let mut state = self.lock();
        if !state.enabled {
            return false;
        }
        let Some(token) = decoded.filter(|token| !token.is_empty()) else {
            if let Some(left) = state.in_view.take() {
                debug!(token = %left, "marker left view");
            }
            return false;
        };
        if state.in_view.as_deref() == Some(token) {
            return false;
        }
        state.in_view = Some(token.to_string());
        state.pending = Some(token.to_string());
        drop(state);
        self.frames.clear();
        true
    }

    /// Consumes the pending token, if any.
    pub fn take_token(&self) -> MarkerToken {
        match self.lock().pending.take() {
            Some(text) => MarkerToken::Text(text),
            None => MarkerToken::None,
        }
    }

    pub fn has_token(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    /// Stops decoding and discards anything decoded but not yet consumed.
    pub fn disable(&self) {
        let mut state = self.lock();
        state.enabled = false;
        state.pending = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Drops the pending token, the marker in view and any frame still waiting in
    /// the slot.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.pending = None;
        state.in_view = None;
        drop(state);
        self.frames.clear();
    }

    pub(crate) fn frames(&self) -> &FrameSlot<Frame> {
        &self.frames
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the background task that decodes markers from a `MarkerBoard`.
pub struct MarkerWatcher {
    board: Arc<MarkerBoard>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MarkerWatcher {
    pub fn spawn(
        runtime: &Handle,
        board: Arc<MarkerBoard>,
        decoder: Arc<dyn MarkerDecoder>,
        poll_timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = runtime.spawn(watch_markers(
            Arc::clone(&board),
            decoder,
            poll_timeout,
            cancel.clone(),
        ));
        Self {
            board,
            cancel,
            task,
        }
    }

    pub fn board(&self) -> &Arc<MarkerBoard> {
        &self.board
    }

    /// Stops the task, waits for it, and leaves the board with no pending token
    /// and no held frame.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.board.frames().close();
        if let Err(err) = self.task.await {
            warn!(%err, "marker watcher task ended abnormally");
        }
        self.board.reset();
    }
}

async fn watch_markers(
    board: Arc<MarkerBoard>,
    decoder: Arc<dyn MarkerDecoder>,
    poll_timeout: Duration,
    cancel: CancellationToken,
) {
    debug!("marker watcher started");
    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = board.frames().poll(poll_timeout) => polled,
        };
        let Some(frame) = polled else {
            continue;
        };
        if !board.is_enabled() {
            continue;
        }
        if !frame.is_complete() {
            debug!(frame_id = frame.frame_id, "skipping incomplete frame");
            continue;
        }

        let decoder = Arc::clone(&decoder);
        let frame_id = frame.frame_id;
        match tokio::task::spawn_blocking(move || decoder.decode(&frame)).await {
            Ok(Ok(decoded)) => {
                if board.observe(decoded.as_deref()) {
                    debug!(frame_id, token = decoded.as_deref(), "marker decoded");
                }
            }
            Ok(Err(err)) => debug!(frame_id, %err, "marker decode failed"),
            Err(err) => warn!(frame_id, %err, "marker decoder panicked"),
        }
    }
    debug!("marker watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Instant, sleep};

    struct ScriptedDecoder {
        calls: AtomicUsize,
        fail_first: usize,
        token: &'static str,
    }

    impl ScriptedDecoder {
        fn new(token: &'static str, fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                token,
            }
        }
    }

    impl MarkerDecoder for ScriptedDecoder {
        fn decode(&self, _frame: &Frame) -> Result<Option<String>, DecodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(DecodeError::Checksum)
            } else {
                Ok(Some(self.token.to_string()))
            }
        }
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, 2, 2, vec![0u8; 16])
    }

    async fn wait_for_token(board: &MarkerBoard) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if board.has_token() {
                return true;
            }
            sleep(Duration::from_millis(2)).await;
        }
        false
    }

    fn spawn_watcher(board: &Arc<MarkerBoard>, decoder: Arc<ScriptedDecoder>) -> MarkerWatcher {
        MarkerWatcher::spawn(
            &Handle::current(),
            Arc::clone(board),
            decoder,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn blank_tokens() {
        assert!(MarkerToken::None.is_blank());
        assert!(MarkerToken::Text(String::new()).is_blank());
        assert!(!MarkerToken::Text("withdraw".into()).is_blank());
        assert!(MarkerToken::Text("withdraw".into()).is("withdraw"));
    }

    #[test]
    fn token_is_consumed_once() {
        let board = MarkerBoard::new();
        assert!(board.publish("implement"));

        assert_eq!(board.take_token(), MarkerToken::Text("implement".into()));
        assert_eq!(board.take_token(), MarkerToken::None);
    }

    #[test]
    fn disabled_board_refuses_and_forgets() {
        let board = MarkerBoard::new();
        board.publish("withdraw");
        board.disable();

        assert!(!board.has_token());
        assert!(!board.publish("calibrate"));

        board.enable();
        assert_eq!(board.take_token(), MarkerToken::None);
    }

    #[test]
    fn publishing_clears_stale_frames() {
        let board = MarkerBoard::new();
        board.submit(frame(1));
        board.publish("withdraw");

        assert!(board.frames().is_empty());
    }

    #[test]
    fn held_marker_is_published_on_entry_only() {
        let board = MarkerBoard::new();

        assert!(board.observe(Some("withdraw")));
        assert_eq!(board.take_token(), MarkerToken::Text("withdraw".into()));
        assert!(!board.observe(Some("withdraw")));
        assert!(!board.has_token());

        assert!(!board.observe(None));
        assert!(board.observe(Some("withdraw")));
    }

    #[test]
    fn a_different_marker_or_blank_payload_rearms() {
        let board = MarkerBoard::new();

        assert!(board.observe(Some("withdraw")));
        assert!(board.observe(Some("implement")));
        assert_eq!(board.take_token(), MarkerToken::Text("implement".into()));

        assert!(!board.observe(Some("")));
        assert!(board.observe(Some("implement")));
    }

    #[test]
    fn disabled_board_keeps_the_marker_in_view() {
        let board = MarkerBoard::new();
        assert!(board.observe(Some("calibrate")));
        board.disable();

        assert!(!board.observe(None));
        board.enable();
        assert!(!board.observe(Some("calibrate")));

        board.reset();
        assert!(board.observe(Some("calibrate")));
    }

    #[tokio::test]
    async fn watcher_reports_a_decode_once() {
        let board = Arc::new(MarkerBoard::new());
        let decoder = Arc::new(ScriptedDecoder::new("withdraw", 0));
        let watcher = spawn_watcher(&board, Arc::clone(&decoder));

        board.submit(frame(1));
        assert!(wait_for_token(&board).await);

        assert_eq!(board.take_token(), MarkerToken::Text("withdraw".into()));
        sleep(Duration::from_millis(30)).await;
        assert_eq!(board.take_token(), MarkerToken::None);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn decode_failures_are_swallowed() {
        let board = Arc::new(MarkerBoard::new());
        let decoder = Arc::new(ScriptedDecoder::new("implement", 2));
        let watcher = spawn_watcher(&board, Arc::clone(&decoder));

        for id in 0..100 {
            if board.has_token() {
                break;
            }
            board.submit(frame(id));
            sleep(Duration::from_millis(15)).await;
        }

        assert!(wait_for_token(&board).await);
        assert_eq!(board.take_token(), MarkerToken::Text("implement".into()));
        assert!(decoder.calls.load(Ordering::SeqCst) >= 3);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_watcher_does_not_decode() {
        let board = Arc::new(MarkerBoard::new());
        let decoder = Arc::new(ScriptedDecoder::new("withdraw", 0));
        let watcher = spawn_watcher(&board, Arc::clone(&decoder));

        board.disable();
        board.submit(frame(1));
        sleep(Duration::from_millis(40)).await;

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
        assert!(!board.has_token());

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn watcher_publishes_a_held_marker_once() {
        let board = Arc::new(MarkerBoard::new());
        let decoder = Arc::new(ScriptedDecoder::new("withdraw", 0));
        let watcher = spawn_watcher(&board, Arc::clone(&decoder));

        let mut published = 0;
        for id in 0..20 {
            board.submit(frame(id));
            sleep(Duration::from_millis(15)).await;
            if board.take_token() != MarkerToken::None {
                published += 1;
            }
        }

        assert_eq!(published, 1);
        assert!(decoder.calls.load(Ordering::SeqCst) > 1);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn incomplete_frames_are_not_decoded() {
        let board = Arc::new(MarkerBoard::new());
        let decoder = Arc::new(ScriptedDecoder::new("withdraw", 0));
        let watcher = spawn_watcher(&board, Arc::clone(&decoder));

        board.submit(Frame::new(1, 4, 4, vec![0u8; 3]));
        sleep(Duration::from_millis(40)).await;

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
        assert!(!board.has_token());

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_no_result_behind() {
        let board = Arc::new(MarkerBoard::new());
        let watcher = spawn_watcher(&board, Arc::new(ScriptedDecoder::new("withdraw", 0)));

        board.publish("withdraw");
        board.submit(frame(9));
        watcher.shutdown().await;

        assert!(!board.has_token());
        assert!(board.frames().is_empty());
    }
}
