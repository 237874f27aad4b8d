//! Session manager: owns the lifecycle of one streaming session.
//!
//! `start()` validates configuration, acquires the output sink and the
//! capture stream, then walks the endpoint candidate list in order until
//! one signals readiness. On success the capture pipeline feeds the
//! transport through a gated best-effort send, and a single pump task
//! dispatches inbound events to the playback scheduler until stop, a
//! graceful close, or a fatal transport error.
//!
//! Teardown always runs in the same order: stop producing (capture),
//! stop consuming (playback), close the transport, and let the device
//! handles release with their owners.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::CaptureControl;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::{AudioBackend, CpalBackend};
use crate::config::SessionConfig;
use crate::error::{Error, Result, TransportError};
use crate::session::state::{OutboundSlot, SendHandle, SessionState};
use crate::transport::ws::{Connect, Connection, TransportEvent, WsConnector};

/// Everything owned by one open session.
struct ActiveSession {
    capture: Box<dyn CaptureControl>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    transport_close: Option<oneshot::Sender<()>>,
    _pump: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connect>,
    audio: Arc<dyn AudioBackend>,
    state_tx: watch::Sender<SessionState>,
    message_tx: watch::Sender<Option<String>>,
    outbound: OutboundSlot,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

/// Owns the session state machine and the transport handle.
///
/// The UI layer calls [`start`](SessionManager::start) and
/// [`stop`](SessionManager::stop) and observes
/// [`watch_state`](SessionManager::watch_state); it never touches PCM
/// data directly.
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Manager with the production WebSocket connector and cpal backend.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_parts(config, Arc::new(WsConnector), Arc::new(CpalBackend))
    }

    /// Manager with injected transport and audio seams.
    pub fn with_parts(
        config: SessionConfig,
        connector: Arc<dyn Connect>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (message_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                audio,
                state_tx,
                message_tx,
                outbound: Arc::new(Mutex::new(None)),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Whether a session is open and audio is flowing.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// State observable for the UI.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Latest user-facing failure message, if any.
    pub fn watch_message(&self) -> watch::Receiver<Option<String>> {
        self.inner.message_tx.subscribe()
    }

    /// Start a session, or stop the current one when already open.
    ///
    /// Validation and device acquisition failures are fatal and surfaced
    /// before any connection attempt; endpoint candidates are then tried
    /// in order and only the last candidate's failure is surfaced when
    /// the whole list is exhausted.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut active = inner.active.lock().await;

        if self.state() == SessionState::Open {
            inner.teardown_locked(&mut active, SessionState::Closing, None);
            return Ok(());
        }

        if let Err(e) = inner.config.validate() {
            inner.message_tx.send_replace(Some(e.user_message()));
            return Err(e);
        }

        inner.set_state(SessionState::Connecting);

        let mut sink = match inner.audio.open_sink(inner.config.playback_sample_rate) {
            Ok(sink) => sink,
            Err(e) => return Err(inner.fail_before_open(e.into())),
        };

        let send_handle = SendHandle::new(inner.state_tx.subscribe(), inner.outbound.clone());
        let mut capture = match inner.audio.start_capture(
            inner.config.capture_sample_rate,
            inner.config.capture_frame_samples,
            Box::new(send_handle),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                sink.close();
                return Err(inner.fail_before_open(e.into()));
            }
        };

        let connection = match connect_with_fallback(inner.connector.as_ref(), &inner.config).await
        {
            Ok(connection) => connection,
            Err(e) => {
                capture.stop();
                sink.close();
                return Err(inner.fail_before_open(Error::Transport(e)));
            }
        };

        let (outbound, events, transport_close) = connection.into_parts();
        *inner.outbound.lock() = Some(outbound);
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(
            sink,
            inner.config.playback_sample_rate,
        )));
        inner.set_state(SessionState::Open);

        let pump = tokio::spawn(pump_events(inner.clone(), events, scheduler.clone()));
        *active = Some(ActiveSession {
            capture,
            scheduler,
            transport_close,
            _pump: pump,
        });

        Ok(())
    }

    /// Tear the session down. Idempotent; always ends in `Closed`.
    pub async fn stop(&self) {
        let mut active = self.inner.active.lock().await;
        self.inner
            .teardown_locked(&mut active, SessionState::Closing, None);
    }
}

impl Inner {
    fn set_state(&self, next: SessionState) {
        let prev = *self.state_tx.borrow();
        if prev == next {
            return;
        }
        if !prev.can_transition(next) {
            tracing::warn!(
                from = prev.label(),
                to = next.label(),
                "unexpected session state transition"
            );
        }
        tracing::info!(state = next.label(), "session state");
        self.state_tx.send_replace(next);
    }

    /// Fatal failure before the session opened: surface, classify, close.
    fn fail_before_open(&self, err: Error) -> Error {
        tracing::error!("session failed before open: {err}");
        self.message_tx.send_replace(Some(err.user_message()));
        self.set_state(SessionState::Error);
        self.set_state(SessionState::Closed);
        err
    }

    /// Unconditional teardown: capture, then playback, then transport.
    fn teardown_locked(
        &self,
        active: &mut Option<ActiveSession>,
        via: SessionState,
        message: Option<String>,
    ) {
        if let Some(mut session) = active.take() {
            self.set_state(via);
            session.capture.stop();
            session.scheduler.lock().teardown();
            self.outbound.lock().take();
            if let Some(close) = session.transport_close.take() {
                let _ = close.send(());
            }
        } else if via == SessionState::Error {
            self.set_state(SessionState::Error);
        }
        if let Some(message) = message {
            self.message_tx.send_replace(Some(message));
        }
        self.set_state(SessionState::Closed);
    }
}

/// Try each endpoint candidate in order; the first to reach a ready
/// signal wins and the rest are never attempted. Intermediate failures
/// are logged, not surfaced; only the last failure is returned when the
/// list is exhausted.
pub(crate) async fn connect_with_fallback(
    connector: &dyn Connect,
    config: &SessionConfig,
) -> std::result::Result<Connection, TransportError> {
    let mut last_error = None;

    for candidate in config.candidates() {
        tracing::info!(endpoint = %candidate, "trying endpoint candidate");
        match connector.connect(&candidate, config).await {
            Ok(connection) => {
                tracing::info!(endpoint = %candidate, "session ready");
                return Ok(connection);
            }
            Err(e) => {
                tracing::warn!(endpoint = %candidate, "candidate failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TransportError::ConnectionFailed("no endpoint candidates configured".to_string())
    }))
}

/// What one dispatched event means for the session's continued life.
pub(crate) enum Flow {
    Continue,
    Fatal(TransportError),
    Ended,
}

/// Single dispatch point for inbound transport events.
///
/// Undecodable audio drops the chunk and keeps the session alive; text
/// belongs to the chat surface and is ignored here.
pub(crate) fn dispatch(event: TransportEvent, scheduler: &Mutex<PlaybackScheduler>) -> Flow {
    match event {
        TransportEvent::Audio(chunk) => {
            if let Err(e) = scheduler.lock().enqueue(&chunk) {
                tracing::warn!("dropping undecodable inbound chunk: {e}");
            }
            Flow::Continue
        }
        TransportEvent::Interrupted => {
            tracing::debug!("barge-in: stopping playback");
            scheduler.lock().interrupt();
            Flow::Continue
        }
        TransportEvent::Text(text) => {
            tracing::debug!(chars = text.len(), "ignoring text fragment");
            Flow::Continue
        }
        TransportEvent::Error(err) => Flow::Fatal(err),
        TransportEvent::Closed => Flow::Ended,
    }
}

/// Drains transport events for one session until it ends.
async fn pump_events(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
) {
    while let Some(event) = events.recv().await {
        match dispatch(event, &scheduler) {
            Flow::Continue => {}
            Flow::Fatal(err) => {
                let err = Error::Transport(err);
                tracing::error!("session transport failed: {err}");
                let mut active = inner.active.lock().await;
                inner.teardown_locked(&mut active, SessionState::Error, Some(err.user_message()));
                break;
            }
            Flow::Ended => {
                tracing::info!("endpoint closed the session");
                let mut active = inner.active.lock().await;
                inner.teardown_locked(&mut active, SessionState::Closing, None);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::audio::capture::FrameSink;
    use crate::audio::playback::testing::ManualSink;
    use crate::audio::playback::OutputSink;
    use crate::error::AudioError;
    use crate::pcm;

    /// Connector that fails every attempt before `succeed_at` (1-based);
    /// `0` never succeeds.
    struct ScriptedConnector {
        succeed_at: usize,
        attempts: Arc<Mutex<Vec<String>>>,
        event_senders: Arc<Mutex<Vec<mpsc::Sender<TransportEvent>>>>,
    }

    #[async_trait]
    impl Connect for ScriptedConnector {
        async fn connect(
            &self,
            endpoint: &str,
            _config: &SessionConfig,
        ) -> std::result::Result<Connection, TransportError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                attempts.push(endpoint.to_string());
                attempts.len()
            };
            if self.succeed_at == 0 || attempt < self.succeed_at {
                return Err(TransportError::EndpointRejected(format!(
                    "{endpoint} refused"
                )));
            }

            let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(8);
            self.event_senders.lock().push(event_tx);
            Ok(Connection::new(outbound_tx, event_rx, None))
        }
    }

    struct NullCapture(Arc<AtomicBool>);

    impl CaptureControl for NullCapture {
        fn stop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct NullAudio {
        capture_stopped: Arc<AtomicBool>,
    }

    impl AudioBackend for NullAudio {
        fn open_sink(
            &self,
            sample_rate: u32,
        ) -> std::result::Result<Box<dyn OutputSink>, AudioError> {
            Ok(Box::new(ManualSink::new(sample_rate).0))
        }

        fn start_capture(
            &self,
            _sample_rate: u32,
            _frame_samples: usize,
            _sink: Box<dyn FrameSink>,
        ) -> std::result::Result<Box<dyn CaptureControl>, AudioError> {
            Ok(Box::new(NullCapture(self.capture_stopped.clone())))
        }
    }

    struct NoOutputAudio;

    impl AudioBackend for NoOutputAudio {
        fn open_sink(
            &self,
            _sample_rate: u32,
        ) -> std::result::Result<Box<dyn OutputSink>, AudioError> {
            Err(AudioError::OutputUnavailable("unplugged".to_string()))
        }

        fn start_capture(
            &self,
            _sample_rate: u32,
            _frame_samples: usize,
            _sink: Box<dyn FrameSink>,
        ) -> std::result::Result<Box<dyn CaptureControl>, AudioError> {
            unreachable!("capture must not start without an output sink")
        }
    }

    fn test_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.api_key = "test-key".to_string();
        config.endpoint = "model-a".to_string();
        config.fallback_endpoints = vec!["model-b".to_string(), "model-c".to_string()];
        config
    }

    struct Harness {
        manager: SessionManager,
        attempts: Arc<Mutex<Vec<String>>>,
        event_senders: Arc<Mutex<Vec<mpsc::Sender<TransportEvent>>>>,
        capture_stopped: Arc<AtomicBool>,
    }

    fn harness(succeed_at: usize) -> Harness {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let event_senders = Arc::new(Mutex::new(Vec::new()));
        let capture_stopped = Arc::new(AtomicBool::new(false));

        let manager = SessionManager::with_parts(
            test_config(),
            Arc::new(ScriptedConnector {
                succeed_at,
                attempts: attempts.clone(),
                event_senders: event_senders.clone(),
            }),
            Arc::new(NullAudio {
                capture_stopped: capture_stopped.clone(),
            }),
        );

        Harness {
            manager,
            attempts,
            event_senders,
            capture_stopped,
        }
    }

    async fn wait_for_closed(manager: &SessionManager) {
        let mut state = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(1), async {
            while *state.borrow() != SessionState::Closed {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("session did not close in time");
    }

    #[tokio::test]
    async fn first_ready_candidate_opens_the_session() {
        let h = harness(1);
        h.manager.start().await.unwrap();

        assert_eq!(*h.attempts.lock(), vec!["model-a"]);
        assert!(h.manager.is_active());
    }

    #[tokio::test]
    async fn fallback_walks_candidates_in_order_until_ready() {
        let h = harness(3);
        h.manager.start().await.unwrap();

        assert_eq!(*h.attempts.lock(), vec!["model-a", "model-b", "model-c"]);
        assert_eq!(h.manager.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn exhausted_candidates_surface_the_last_failure() {
        let h = harness(0);
        let err = h.manager.start().await.unwrap_err();

        assert_eq!(h.attempts.lock().len(), 3);
        match err {
            Error::Transport(TransportError::EndpointRejected(reason)) => {
                assert!(reason.contains("model-c"));
            }
            other => panic!("expected endpoint rejection, got {other}"),
        }
        assert_eq!(h.manager.state(), SessionState::Closed);
        assert!(h.manager.watch_message().borrow().is_some());
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_attempt() {
        let mut config = test_config();
        config.api_key = String::new();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let manager = SessionManager::with_parts(
            config,
            Arc::new(ScriptedConnector {
                succeed_at: 1,
                attempts: attempts.clone(),
                event_senders: Arc::new(Mutex::new(Vec::new())),
            }),
            Arc::new(NullAudio {
                capture_stopped: Arc::new(AtomicBool::new(false)),
            }),
        );

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(attempts.lock().is_empty());
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.watch_message().borrow().is_some());
    }

    #[tokio::test]
    async fn missing_output_device_fails_before_any_attempt() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let manager = SessionManager::with_parts(
            test_config(),
            Arc::new(ScriptedConnector {
                succeed_at: 1,
                attempts: attempts.clone(),
                event_senders: Arc::new(Mutex::new(Vec::new())),
            }),
            Arc::new(NoOutputAudio),
        );

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::Audio(_)));
        assert!(attempts.lock().is_empty());
        assert_eq!(manager.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn start_while_open_behaves_like_stop() {
        let h = harness(1);
        h.manager.start().await.unwrap();
        assert!(h.manager.is_active());

        h.manager.start().await.unwrap();
        assert_eq!(h.manager.state(), SessionState::Closed);
        assert!(h.capture_stopped.load(Ordering::SeqCst));
        assert_eq!(h.attempts.lock().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness(1);
        h.manager.start().await.unwrap();

        h.manager.stop().await;
        assert_eq!(h.manager.state(), SessionState::Closed);
        h.manager.stop().await;
        assert_eq!(h.manager.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn stop_before_any_start_is_harmless() {
        let h = harness(1);
        h.manager.stop().await;
        assert_eq!(h.manager.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn session_can_restart_after_stop() {
        let h = harness(1);
        h.manager.start().await.unwrap();
        h.manager.stop().await;

        h.manager.start().await.unwrap();
        assert!(h.manager.is_active());
        assert_eq!(h.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn transport_error_mid_session_tears_down_without_reconnect() {
        let h = harness(1);
        h.manager.start().await.unwrap();

        let sender = h.event_senders.lock().last().unwrap().clone();
        sender
            .send(TransportEvent::Error(TransportError::ConnectionFailed(
                "reset".to_string(),
            )))
            .await
            .unwrap();

        wait_for_closed(&h.manager).await;
        assert!(h.capture_stopped.load(Ordering::SeqCst));
        let message = h.manager.watch_message().borrow().clone();
        assert!(message.unwrap().contains("text chat"));
        // No automatic reconnect
        assert_eq!(h.attempts.lock().len(), 1);
    }

    #[tokio::test]
    async fn graceful_close_from_the_endpoint_closes_the_session() {
        let h = harness(1);
        h.manager.start().await.unwrap();

        let sender = h.event_senders.lock().last().unwrap().clone();
        sender.send(TransportEvent::Closed).await.unwrap();

        wait_for_closed(&h.manager).await;
        assert!(h.capture_stopped.load(Ordering::SeqCst));
        assert!(h.manager.watch_message().borrow().is_none());
    }

    // ---- dispatch ----

    fn test_scheduler() -> (
        Mutex<PlaybackScheduler>,
        Arc<Mutex<crate::audio::playback::testing::SinkLog>>,
    ) {
        let (sink, log) = ManualSink::new(24_000);
        (
            Mutex::new(PlaybackScheduler::new(Box::new(sink), 24_000)),
            log,
        )
    }

    #[test]
    fn dispatch_schedules_inbound_audio() {
        let (scheduler, log) = test_scheduler();
        let chunk = pcm::samples_to_pcm16(&vec![0.1; 2400]);

        let flow = dispatch(TransportEvent::Audio(chunk), &scheduler);

        assert!(matches!(flow, Flow::Continue));
        assert_eq!(log.lock().scheduled.len(), 1);
    }

    #[test]
    fn dispatch_drops_undecodable_audio_and_continues() {
        let (scheduler, log) = test_scheduler();

        let flow = dispatch(TransportEvent::Audio(bytes::Bytes::from_static(&[1, 2, 3])), &scheduler);

        assert!(matches!(flow, Flow::Continue));
        assert!(log.lock().scheduled.is_empty());
    }

    #[test]
    fn dispatch_interruption_silences_playback() {
        let (scheduler, log) = test_scheduler();
        let chunk = pcm::samples_to_pcm16(&vec![0.1; 2400]);
        dispatch(TransportEvent::Audio(chunk), &scheduler);

        let flow = dispatch(TransportEvent::Interrupted, &scheduler);

        assert!(matches!(flow, Flow::Continue));
        assert_eq!(log.lock().stopped.len(), 1);
        assert!(log.lock().live.is_empty());
    }

    #[test]
    fn dispatch_ignores_text_fragments() {
        let (scheduler, log) = test_scheduler();
        let flow = dispatch(TransportEvent::Text("hello".to_string()), &scheduler);

        assert!(matches!(flow, Flow::Continue));
        assert!(log.lock().scheduled.is_empty());
    }

    #[test]
    fn dispatch_maps_terminal_events() {
        let (scheduler, _log) = test_scheduler();

        assert!(matches!(
            dispatch(
                TransportEvent::Error(TransportError::Closed),
                &scheduler
            ),
            Flow::Fatal(_)
        ));
        assert!(matches!(
            dispatch(TransportEvent::Closed, &scheduler),
            Flow::Ended
        ));
    }
}
