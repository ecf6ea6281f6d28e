//! Drives one generation stream from request to final state.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use postgen_core::error::{PostgenError, Result};
use postgen_core::event::parse_event;
use postgen_core::frame::FrameDecoder;
use postgen_core::progress::{AggregateState, end_stream, fold, truncate_chars};

use crate::client::Transport;
use crate::source::ChunkSource;

const LOG_PREVIEW_CHARS: usize = 100;

/// What the presentation layer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Snapshot after an event was folded (or after the stream ended).
    State(AggregateState),
    /// Terminal transport failure, as a message for the user.
    Failed(String),
}

/// How a call to [`StreamController::start`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The sentinel was received.
    Completed(AggregateState),
    /// The body ended without a sentinel.
    Ended(AggregateState),
    /// Torn down before the stream finished.
    Cancelled,
    /// This controller already started a stream.
    AlreadyStarted,
}

/// Owns one stream for one topic.
///
/// A controller starts at most once; submit a new topic with a new
/// controller. State snapshots go out over an unbounded channel so
/// publishing never waits on the reader.
pub struct StreamController<T> {
    transport: T,
    updates: mpsc::UnboundedSender<StreamUpdate>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl<T: Transport> StreamController<T> {
    pub fn new(transport: T) -> (Self, mpsc::UnboundedReceiver<StreamUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            transport,
            updates: tx,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        (controller, rx)
    }

    /// Handle for tearing the stream down from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Request the stream for `topic` and fold it until it finishes.
    ///
    /// Only the first call does anything; later calls return
    /// [`StreamOutcome::AlreadyStarted`]. A blank topic is rejected without
    /// consuming the guard.
    pub async fn start(&self, topic: &str) -> Result<StreamOutcome> {
        if topic.trim().is_empty() {
            return Err(PostgenError::EmptyTopic);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(topic, "Stream already started, ignoring");
            return Ok(StreamOutcome::AlreadyStarted);
        }

        info!(topic, "Starting generation stream");
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            opened = self.transport.open(topic) => opened,
        };

        match opened {
            Ok(source) => self.read_loop(source).await,
            Err(err) => {
                warn!(error = %err, "Could not open generation stream");
                self.publish(StreamUpdate::Failed(err.user_message()));
                Err(err)
            }
        }
    }

    async fn read_loop(&self, mut source: Box<dyn ChunkSource>) -> Result<StreamOutcome> {
        let mut decoder = FrameDecoder::new();
        let mut state = AggregateState::streaming();
        if !self.publish(StreamUpdate::State(state.clone())) {
            return Ok(StreamOutcome::Cancelled);
        }

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Stream cancelled");
                    return Ok(StreamOutcome::Cancelled);
                }
                read = source.next_chunk() => read,
            };
            if self.cancel.is_cancelled() {
                debug!("Discarding read that resolved after teardown");
                return Ok(StreamOutcome::Cancelled);
            }

            let chunk = match read {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    decoder.finish();
                    state = end_stream(state);
                    info!(steps = state.steps.len(), "Stream ended without sentinel");
                    if !self.publish(StreamUpdate::State(state.clone())) {
                        return Ok(StreamOutcome::Cancelled);
                    }
                    return Ok(StreamOutcome::Ended(state));
                }
                Err(err) => {
                    warn!(error = %err, "Stream read failed");
                    self.publish(StreamUpdate::State(end_stream(state)));
                    self.publish(StreamUpdate::Failed(err.user_message()));
                    return Err(err);
                }
            };

            for payload in decoder.push(&chunk) {
                let event = match parse_event(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(
                            error = %err,
                            payload = truncate_chars(&payload, LOG_PREVIEW_CHARS),
                            "Dropping unparseable frame"
                        );
                        continue;
                    }
                };

                debug!(kind = event.kind(), "Folding event");
                state = fold(state, &event);
                if !self.publish(StreamUpdate::State(state.clone())) {
                    return Ok(StreamOutcome::Cancelled);
                }

                if event.is_sentinel() {
                    info!(steps = state.steps.len(), "Stream complete");
                    return Ok(StreamOutcome::Completed(state));
                }
            }
        }
    }

    /// False once the stream has been torn down, either by cancellation or
    /// because the receiver is gone.
    fn publish(&self, update: StreamUpdate) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.updates.send(update).is_err() {
            debug!("Update receiver dropped, tearing down");
            self.cancel.cancel();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use postgen_core::error::TransportError;
    use postgen_core::progress::Stage;

    use crate::source::MemorySource;

    /// Hands out one prepared source and counts requests.
    struct ScriptedTransport {
        source: Mutex<Option<MemorySource>>,
        status: Option<u16>,
        opens: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn serving(source: MemorySource) -> Self {
            Self {
                source: Mutex::new(Some(source)),
                status: None,
                opens: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                source: Mutex::new(None),
                status: Some(status),
                opens: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _topic: &str) -> Result<Box<dyn ChunkSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.status {
                return Err(TransportError::Status {
                    status,
                    body: String::new(),
                }
                .into());
            }
            let source = self.source.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(source))
        }
    }

    /// Never yields a fragment.
    struct PendingSource;

    #[async_trait]
    impl ChunkSource for PendingSource {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            std::future::pending::<Result<Option<Bytes>>>().await
        }
    }

    struct PendingTransport;

    #[async_trait]
    impl Transport for PendingTransport {
        async fn open(&self, _topic: &str) -> Result<Box<dyn ChunkSource>> {
            Ok(Box::new(PendingSource))
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamUpdate>) -> Vec<StreamUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    const BODY: &str = concat!(
        "data: {\"type\":\"action\",\"tool\":\"search\",\"tool_input\":\"ai\"}\n\n",
        "data: {\"type\":\"observation\",\"observation\":\"found things\"}\n\n",
        "data: {\"type\":\"output\",\"output\":\"Final post text\"}\n\n",
        "data: [DONE]\n\n",
    );

    #[tokio::test]
    async fn publishes_once_per_event() {
        let transport = ScriptedTransport::serving(MemorySource::from_body(BODY, 7));
        let (controller, mut rx) = StreamController::new(transport);

        let outcome = controller.start("ai").await.unwrap();
        let updates = drain(&mut rx);

        assert_eq!(updates.len(), 5);
        assert_eq!(
            updates[0],
            StreamUpdate::State(AggregateState::streaming())
        );
        let StreamOutcome::Completed(state) = outcome else {
            panic!("Expected Completed, got {outcome:?}");
        };
        assert_eq!(updates.last(), Some(&StreamUpdate::State(state.clone())));
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.final_answer, "Final post text");
        assert_eq!(state.stage, Stage::Complete);
        assert!(!state.is_streaming);
    }

    #[tokio::test]
    async fn snapshots_grow_incrementally() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let (controller, mut rx) = StreamController::new(transport);
        controller.start("ai").await.unwrap();

        let steps: Vec<usize> = drain(&mut rx)
            .into_iter()
            .map(|u| match u {
                StreamUpdate::State(s) => s.steps.len(),
                StreamUpdate::Failed(msg) => panic!("unexpected failure: {msg}"),
            })
            .collect();
        assert_eq!(steps, vec![0, 1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let opens = Arc::clone(&transport.opens);
        let (controller, _rx) = StreamController::new(transport);

        assert!(matches!(
            controller.start("ai").await.unwrap(),
            StreamOutcome::Completed(_)
        ));
        assert_eq!(
            controller.start("ai").await.unwrap(),
            StreamOutcome::AlreadyStarted
        );
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_issue_one_request() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let opens = Arc::clone(&transport.opens);
        let (controller, _rx) = StreamController::new(transport);

        let (a, b) = tokio::join!(controller.start("ai"), controller.start("ai"));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == StreamOutcome::AlreadyStarted)
                .count(),
            1
        );
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_topic_does_not_consume_guard() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let opens = Arc::clone(&transport.opens);
        let (controller, _rx) = StreamController::new(transport);

        let err = controller.start("  ").await.unwrap_err();
        assert!(matches!(err, PostgenError::EmptyTopic));
        assert!(!controller.is_started());
        assert_eq!(opens.load(Ordering::SeqCst), 0);

        assert!(matches!(
            controller.start("ai").await.unwrap(),
            StreamOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn error_status_publishes_failure_only() {
        let (controller, mut rx) = StreamController::new(ScriptedTransport::failing(500));

        let err = controller.start("ai").await.unwrap_err();
        assert!(matches!(
            err,
            PostgenError::Transport(TransportError::Status { status: 500, .. })
        ));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            StreamUpdate::Failed(msg) => assert!(msg.contains("500")),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_error_keeps_accumulated_state() {
        let first = "data: {\"type\":\"action\",\"tool\":\"search\",\"tool_input\":\"ai\"}\n\n";
        let source = MemorySource::new(vec![first]).then_fail("connection reset");
        let (controller, mut rx) = StreamController::new(ScriptedTransport::serving(source));

        let err = controller.start("ai").await.unwrap_err();
        assert!(matches!(
            err,
            PostgenError::Transport(TransportError::Read(_))
        ));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 4);
        match &updates[2] {
            StreamUpdate::State(state) => {
                assert_eq!(state.steps.len(), 1);
                assert!(!state.is_streaming);
            }
            other => panic!("Expected State, got {other:?}"),
        }
        assert!(matches!(&updates[3], StreamUpdate::Failed(msg) if msg.contains("connection reset")));
    }

    #[tokio::test]
    async fn end_without_sentinel_is_implicit_completion() {
        let body = "data: {\"type\":\"output\",\"output\":\"post\"}\n\ndata: {\"type\":\"act";
        let (controller, mut rx) =
            StreamController::new(ScriptedTransport::serving(MemorySource::new(vec![body])));

        let outcome = controller.start("ai").await.unwrap();
        let StreamOutcome::Ended(state) = outcome else {
            panic!("Expected Ended, got {outcome:?}");
        };
        assert!(!state.is_streaming);
        assert_eq!(state.final_answer, "post");
        assert_eq!(state.stage, Stage::Writing);

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2], StreamUpdate::State(state));
    }

    #[tokio::test]
    async fn nothing_is_read_after_sentinel() {
        let source = MemorySource::new(vec![
            "data: [DONE]\n\n",
            "data: {\"type\":\"output\",\"output\":\"late\"}\n\n",
        ]);
        let reads = source.read_counter();
        let (controller, mut rx) = StreamController::new(ScriptedTransport::serving(source));

        let outcome = controller.start("ai").await.unwrap();
        let StreamOutcome::Completed(state) = outcome else {
            panic!("Expected Completed, got {outcome:?}");
        };
        assert!(state.final_answer.is_empty());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn frames_after_sentinel_in_same_chunk_are_ignored() {
        let body = "data: [DONE]\n\ndata: {\"type\":\"action\",\"tool\":\"x\",\"tool_input\":\"y\"}\n\n";
        let (controller, mut rx) =
            StreamController::new(ScriptedTransport::serving(MemorySource::new(vec![body])));

        let StreamOutcome::Completed(state) = controller.start("ai").await.unwrap() else {
            panic!("Expected Completed");
        };
        assert!(state.steps.is_empty());
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let body = concat!(
            "data: {not valid json\n\n",
            "data: {\"type\":\"output\",\"output\":\"Final post text\"}\n\n",
            "data: [DONE]\n\n",
        );
        let (controller, mut rx) =
            StreamController::new(ScriptedTransport::serving(MemorySource::new(vec![body])));

        let StreamOutcome::Completed(state) = controller.start("ai").await.unwrap() else {
            panic!("Expected Completed");
        };
        assert!(state.steps.is_empty());
        assert_eq!(state.final_answer, "Final post text");
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn streaming_snapshot_precedes_first_event() {
        let (controller, mut rx) = StreamController::new(PendingTransport);
        let token = controller.cancellation_token();

        let watcher = async {
            let first = rx.recv().await;
            token.cancel();
            first
        };
        let (outcome, first) = tokio::join!(controller.start("ai"), watcher);

        assert_eq!(outcome.unwrap(), StreamOutcome::Cancelled);
        match first {
            Some(StreamUpdate::State(state)) => {
                assert!(state.is_streaming);
                assert!(state.steps.is_empty());
                assert_eq!(state.stage, Stage::Searching);
            }
            other => panic!("Expected streaming State, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_string_observation_adds_no_step() {
        let body = concat!(
            "data: {\"type\":\"observation\",\"observation\":null}\n\n",
            "data: {\"type\":\"observation\",\"observation\":42}\n\n",
            "data: [DONE]\n\n",
        );
        let (controller, mut rx) =
            StreamController::new(ScriptedTransport::serving(MemorySource::new(vec![body])));

        let StreamOutcome::Completed(state) = controller.start("ai").await.unwrap() else {
            panic!("Expected Completed");
        };
        assert!(state.steps.is_empty());
        assert_eq!(state.stage, Stage::Complete);
        // Streaming snapshot plus the sentinel.
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_a_hung_read() {
        let (controller, mut rx) = StreamController::new(PendingTransport);
        let token = controller.cancellation_token();

        let canceller = async {
            tokio::task::yield_now().await;
            token.cancel();
        };
        let (outcome, ()) = tokio::join!(controller.start("ai"), canceller);

        assert_eq!(outcome.unwrap(), StreamOutcome::Cancelled);
        // Only the snapshot published when the response opened.
        assert_eq!(
            drain(&mut rx),
            vec![StreamUpdate::State(AggregateState::streaming())]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_never_opens() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let opens = Arc::clone(&transport.opens);
        let (controller, mut rx) = StreamController::new(transport);
        controller.cancel();

        assert_eq!(controller.start("ai").await.unwrap(), StreamOutcome::Cancelled);
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_tears_down() {
        let transport = ScriptedTransport::serving(MemorySource::new(vec![BODY]));
        let (controller, rx) = StreamController::new(transport);
        drop(rx);

        assert_eq!(controller.start("ai").await.unwrap(), StreamOutcome::Cancelled);
        assert!(controller.cancellation_token().is_cancelled());
    }
}
