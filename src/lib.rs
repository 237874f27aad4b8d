//! # Voice Session
//!
//! Streaming voice-assistant session client: captures microphone audio,
//! ships it to a remote conversational-AI endpoint as PCM16 over a
//! bidirectional WebSocket session, and schedules the synthesized speech
//! that streams back for gap-free, order-preserving playback.
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌────────────┐  f32 frames   ┌──────────────┐  envelopes   ┌───────────────┐
//!  │ Microphone │──────────────▶│   Capture    │─────────────▶│               │
//!  │   (cpal)   │   (4096 @16k) │   Pipeline   │  best-effort │    Session    │
//!  └────────────┘               └──────────────┘              │    Manager    │
//!                                                             │               │
//!  ┌────────────┐  scheduled    ┌──────────────┐  PCM chunks  │  (endpoint    │
//!  │  Speaker   │◀──────────────│   Playback   │◀─────────────│   fallback,   │
//!  │   (cpal)   │  back-to-back │  Scheduler   │    (@24k)    │   barge-in,   │
//!  └────────────┘               └──────────────┘              │   teardown)   │
//!                                                             └───────┬───────┘
//!                                                                     │ WebSocket
//!                                                                     ▼
//!                                                          conversational endpoint
//! ```
//!
//! The session manager owns the lifecycle: it validates configuration,
//! acquires both audio devices, walks the endpoint candidate list until one
//! signals readiness, then wires capture frames into the transport and
//! transport audio into the scheduler until `stop()` or a fatal error.

pub mod audio;
pub mod config;
pub mod error;
pub mod pcm;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::{SessionManager, SessionState};

/// Application-wide constants
pub mod constants {
    /// Sample rate of captured microphone audio in Hz
    pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

    /// Sample rate of synthesized speech received from the endpoint in Hz
    pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

    /// Samples per outbound capture frame
    pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

    /// Format tag declared on every outbound envelope
    pub const OUTBOUND_FORMAT: &str = "pcm;rate=16000";

    /// Seconds to wait for an endpoint's ready signal before rejecting the candidate
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

    /// Inbound event queue depth between the transport and the session pump
    pub const EVENT_QUEUE_CAPACITY: usize = 256;

    /// Capacity of the finished-source queue drained by the playback scheduler
    pub const FINISHED_QUEUE_CAPACITY: usize = 64;

    /// Seconds to wait for an audio stream thread to report startup
    pub const STREAM_START_TIMEOUT_SECS: u64 = 5;
}
