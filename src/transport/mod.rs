//! Transport to the conversational-AI endpoint
//!
//! `wire` defines the envelope and message shapes exchanged with the
//! endpoint; `ws` carries them over a WebSocket session.

pub mod wire;
pub mod ws;

pub use wire::{SessionSignal, TransportEnvelope};
pub use ws::{Connect, Connection, TransportEvent, WsConnector};
