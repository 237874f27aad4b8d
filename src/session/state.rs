//! Session state machine and the gated outbound send path.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::audio::capture::FrameSink;
use crate::error::TransportError;
use crate::transport::wire::TransportEnvelope;

/// Lifecycle of one streaming session.
///
/// ```text
/// Idle ──start──▶ Connecting ──ready──▶ Open ──stop──▶ Closing ──▶ Closed
///                     │                   │                           │
///                     └───────▶ Error ◀───┘            start ◀────────┘
///                                 │
///                                 └──▶ Closed
/// ```
///
/// Fallback attempts across endpoint candidates happen inside
/// `Connecting`; the UI only ever sees `Connecting` until the session
/// opens, closes, or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been attempted yet.
    Idle,
    /// Devices are acquired and endpoint candidates are being tried.
    Connecting,
    /// The endpoint signalled readiness; audio is flowing.
    Open,
    /// Graceful teardown in progress.
    Closing,
    /// Terminal resting state; a new session may be started.
    Closed,
    /// A fatal failure; always followed by `Closed`.
    Error,
}

impl SessionState {
    /// The observable the UI binds its toggle button to.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    /// A short human-readable label for the UI status line.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Open => "Listening",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
            SessionState::Error => "Error",
        }
    }

    /// Whether `next` is a legal transition from this state.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Error)
                | (Open, Closing)
                | (Open, Error)
                | (Closing, Closed)
                | (Error, Closed)
                | (Closed, Connecting)
        )
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

/// Slot holding the outbound sender of the currently open transport.
pub(crate) type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEnvelope>>>>;

/// The capture pipeline's view of the session: a best-effort send
/// operation gated on the session being open.
///
/// While the session is anything but `Open`, frames are dropped without a
/// send being attempted. Delivery is at-most-once with no retry; the
/// capture callback is allowed to ignore the result.
pub struct SendHandle {
    state: watch::Receiver<SessionState>,
    outbound: OutboundSlot,
}

impl SendHandle {
    pub(crate) fn new(state: watch::Receiver<SessionState>, outbound: OutboundSlot) -> Self {
        Self { state, outbound }
    }
}

impl FrameSink for SendHandle {
    fn deliver(&self, envelope: TransportEnvelope) -> Result<(), TransportError> {
        if *self.state.borrow() != SessionState::Open {
            return Err(TransportError::NotOpen);
        }
        match self.outbound.lock().as_ref() {
            Some(sender) => sender
                .send(envelope)
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotOpen),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_is_active() {
        assert!(SessionState::Open.is_active());
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Closing,
            SessionState::Closed,
            SessionState::Error,
        ] {
            assert!(!state.is_active());
        }
    }

    #[test]
    fn error_is_reachable_from_connecting_and_open_only() {
        assert!(SessionState::Connecting.can_transition(SessionState::Error));
        assert!(SessionState::Open.can_transition(SessionState::Error));
        assert!(!SessionState::Idle.can_transition(SessionState::Error));
        assert!(!SessionState::Closing.can_transition(SessionState::Error));
        assert!(!SessionState::Closed.can_transition(SessionState::Error));
    }

    #[test]
    fn error_always_leads_to_closed() {
        assert!(SessionState::Error.can_transition(SessionState::Closed));
        assert!(!SessionState::Error.can_transition(SessionState::Connecting));
        assert!(!SessionState::Error.can_transition(SessionState::Open));
    }

    #[test]
    fn closed_sessions_can_reconnect() {
        assert!(SessionState::Closed.can_transition(SessionState::Connecting));
        assert!(!SessionState::Closed.can_transition(SessionState::Open));
    }

    #[test]
    fn open_requires_connecting() {
        assert!(SessionState::Connecting.can_transition(SessionState::Open));
        assert!(!SessionState::Idle.can_transition(SessionState::Open));
        assert!(!SessionState::Closing.can_transition(SessionState::Open));
    }

    #[test]
    fn frames_before_open_are_dropped_without_a_send_attempt() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot: OutboundSlot = Arc::new(Mutex::new(Some(tx)));
        let handle = SendHandle::new(state_rx, slot);

        // Three frames captured while still connecting: all dropped
        for _ in 0..3 {
            let result = handle.deliver(TransportEnvelope::outbound(&[0, 0]));
            assert!(matches!(result, Err(TransportError::NotOpen)));
        }
        assert!(rx.try_recv().is_err());

        // Once open, the next frame goes through as one envelope
        state_tx.send(SessionState::Open).unwrap();
        handle.deliver(TransportEnvelope::outbound(&[1, 2])).unwrap();

        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.format, "pcm;rate=16000");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn frames_after_transport_is_gone_are_dropped() {
        let (_state_tx, state_rx) = watch::channel(SessionState::Open);
        let slot: OutboundSlot = Arc::new(Mutex::new(None));
        let handle = SendHandle::new(state_rx, slot);

        let result = handle.deliver(TransportEnvelope::outbound(&[0, 0]));
        assert!(matches!(result, Err(TransportError::NotOpen)));
    }
}
