//! Error types for the voice session subsystem

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// One human-readable sentence for the UI layer.
    ///
    /// Device and configuration failures are reported before any audio
    /// flows; mid-session failures point the user at the text-chat
    /// fallback. The raw error stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(_) => {
                "Voice chat is not configured. Add an API key in settings to enable it."
            }
            Error::Audio(AudioError::InputUnavailable(_)) => {
                "Could not access the microphone. Check permissions and try again."
            }
            Error::Audio(AudioError::OutputUnavailable(_)) => {
                "Could not access the speaker. Check your audio output and try again."
            }
            Error::Audio(_) => "An audio device problem stopped the voice session.",
            Error::Transport(_) => {
                "The voice service is unavailable right now. Please try again, or continue in text chat."
            }
            Error::Codec(_) | Error::Io(_) => {
                "The voice session hit an unexpected problem and was stopped."
            }
        }
        .to_string()
    }
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Input device unavailable: {0}")]
    InputUnavailable(String),

    #[error("Output device unavailable: {0}")]
    OutputUnavailable(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// PCM codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Chunk length {0} is not a whole number of 16-bit samples")]
    OddChunkLength(usize),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(u16),

    #[error("{0} samples cannot be split across {1} channels")]
    RaggedChannelData(usize, u16),

    #[error("Transport decoding failed: {0}")]
    TransportDecode(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Endpoint rejected the session: {0}")]
    EndpointRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Session is not open")]
    NotOpen,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Connection closed")]
    Closed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_message_mentions_configuration() {
        let err = Error::Config("no API credential configured".into());
        assert!(err.user_message().contains("not configured"));
    }

    #[test]
    fn microphone_error_message_mentions_microphone() {
        let err = Error::Audio(AudioError::InputUnavailable("denied".into()));
        assert!(err.user_message().contains("microphone"));
    }

    #[test]
    fn transport_error_message_offers_text_fallback() {
        let err = Error::Transport(TransportError::Closed);
        assert!(err.user_message().contains("text chat"));
    }

    #[test]
    fn errors_convert_from_subsystem_errors() {
        let err: Error = CodecError::OddChunkLength(3).into();
        assert!(matches!(err, Error::Codec(_)));

        let err: Error = TransportError::NotOpen.into();
        assert!(matches!(err, Error::Transport(_)));
    }
}
