//! Linear PCM conversion and transport encoding
//!
//! Pure functions shared by the capture and playback paths. No state.

pub mod codec;

pub use codec::{
    decode_from_transport, encode_for_transport, pcm16_duration_secs, pcm16_to_samples,
    samples_to_pcm16,
};
