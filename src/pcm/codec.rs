//! Conversions between float samples, 16-bit PCM bytes and transport text.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::CodecError;

/// Scale factor between normalized float samples and 16-bit integers.
const PCM16_SCALE: f32 = 32768.0;

/// Convert float samples in `[-1.0, 1.0]` to 16-bit signed little-endian PCM.
///
/// Out-of-range input saturates at the 16-bit limits rather than wrapping;
/// a full-scale `1.0` maps to `32767`.
pub fn samples_to_pcm16(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * PCM16_SCALE) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(out)
}

/// Decode 16-bit signed little-endian PCM into per-channel float samples.
///
/// Bytes are read pairwise with [`i16::from_le_bytes`], so any byte window
/// is accepted regardless of its alignment in the underlying buffer.
/// Interleaved input is split round-robin into `channels` output vectors.
///
/// # Errors
///
/// [`CodecError::OddChunkLength`] when `data` is not a whole number of
/// samples, [`CodecError::InvalidChannelCount`] for zero channels, and
/// [`CodecError::RaggedChannelData`] when the sample count does not divide
/// evenly across the channels.
pub fn pcm16_to_samples(data: &[u8], channels: u16) -> Result<Vec<Vec<f32>>, CodecError> {
    if channels == 0 {
        return Err(CodecError::InvalidChannelCount(channels));
    }
    if data.len() % 2 != 0 {
        return Err(CodecError::OddChunkLength(data.len()));
    }

    let total_samples = data.len() / 2;
    if total_samples % channels as usize != 0 {
        return Err(CodecError::RaggedChannelData(total_samples, channels));
    }

    let per_channel = total_samples / channels as usize;
    let mut out: Vec<Vec<f32>> = (0..channels)
        .map(|_| Vec::with_capacity(per_channel))
        .collect();

    for (i, pair) in data.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels as usize].push(value as f32 / PCM16_SCALE);
    }

    Ok(out)
}

/// Encode a binary chunk as transport-safe text (standard base64).
///
/// No framing is applied; the caller sends one envelope per frame.
pub fn encode_for_transport(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode transport text back into a binary chunk.
pub fn decode_from_transport(text: &str) -> Result<Bytes, CodecError> {
    BASE64
        .decode(text)
        .map(Bytes::from)
        .map_err(|e| CodecError::TransportDecode(e.to_string()))
}

/// Duration in seconds of a mono PCM16 chunk at the given sample rate.
pub fn pcm16_duration_secs(byte_len: usize, sample_rate: u32) -> f64 {
    (byte_len / 2) as f64 / sample_rate as f64
}
