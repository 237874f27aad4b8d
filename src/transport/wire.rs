//! Wire format for the conversational endpoint.
//!
//! Outbound, every transmitted unit is a [`TransportEnvelope`]:
//! `{"data": "<base64 PCM16>", "format": "pcm;rate=16000"}` — one per
//! captured frame, no additional framing.
//!
//! Inbound messages are JSON with camelCase fields. Readiness is signalled
//! by a `setupComplete` message; synthesized audio arrives base64-encoded
//! under `serverContent.modelTurn.parts[].inlineData.data` at 24 kHz mono;
//! `serverContent.interrupted` reports barge-in. Text parts belong to the
//! chat surface and are passed through untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::pcm;

/// One outbound audio unit: a transport-encoded PCM chunk plus its
/// declared format tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportEnvelope {
    /// Base64-encoded PCM16 bytes
    pub data: String,
    /// Declared sample format, e.g. `pcm;rate=16000`
    pub format: String,
}

impl TransportEnvelope {
    /// Wrap one captured PCM16 frame for the outbound direction.
    pub fn outbound(pcm_bytes: &[u8]) -> Self {
        Self {
            data: pcm::encode_for_transport(pcm_bytes),
            format: crate::constants::OUTBOUND_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Setup<'a> {
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

/// Serialize the session-open handshake for one endpoint candidate.
pub fn setup_message(endpoint: &str) -> Result<String, TransportError> {
    serde_json::to_string(&SetupMessage {
        setup: Setup { model: endpoint },
    })
    .map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    interrupted: bool,
    turn_complete: bool,
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

/// What one inbound message means to the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The endpoint accepted the setup and the session may open.
    Ready,
    /// One decoded PCM16 chunk of synthesized speech.
    Audio(Bytes),
    /// The user started speaking over the assistant; stop playback now.
    Interrupted,
    /// A text fragment for the chat surface; ignored by this core.
    Text(String),
}

/// Parse one inbound message into the signals it carries.
///
/// A message may carry several signals (an interruption and trailing
/// parts, or a turn with multiple audio parts). Audio parts that fail
/// transport decoding are dropped with a warning; the rest of the message
/// still goes through.
///
/// # Errors
///
/// [`TransportError::MalformedMessage`] when the payload is not valid
/// JSON of the expected shape.
pub fn classify(text: &str) -> Result<Vec<SessionSignal>, TransportError> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| TransportError::MalformedMessage(e.to_string()))?;

    let mut signals = Vec::new();

    if message.setup_complete.is_some() {
        signals.push(SessionSignal::Ready);
    }

    if let Some(content) = message.server_content {
        if content.interrupted {
            signals.push(SessionSignal::Interrupted);
        }
        if content.turn_complete {
            tracing::trace!("endpoint reported turn complete");
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    match pcm::decode_from_transport(&inline.data) {
                        Ok(chunk) => signals.push(SessionSignal::Audio(chunk)),
                        Err(e) => {
                            tracing::warn!(
                                mime_type = inline.mime_type.as_deref().unwrap_or("unknown"),
                                "dropping undecodable audio part: {e}"
                            );
                        }
                    }
                }
                if let Some(text) = part.text {
                    signals.push(SessionSignal::Text(text));
                }
            }
        }
    }

    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_to_declared_wire_format() {
        let envelope = TransportEnvelope::outbound(&[0x01, 0x02, 0x03, 0x04]);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            value,
            json!({"data": "AQIDBA==", "format": "pcm;rate=16000"})
        );
    }

    #[test]
    fn setup_message_names_the_candidate() {
        let text = setup_message("model-a").unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"setup": {"model": "model-a"}}));
    }

    #[test]
    fn setup_complete_classifies_as_ready() {
        let signals = classify(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(signals, vec![SessionSignal::Ready]);
    }

    #[test]
    fn nested_audio_part_is_extracted_and_decoded() {
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQIDBA=="}}
                    ]
                }
            }
        });
        let signals = classify(&message.to_string()).unwrap();

        assert_eq!(signals.len(), 1);
        match &signals[0] {
            SessionSignal::Audio(chunk) => assert_eq!(&chunk[..], &[1, 2, 3, 4]),
            other => panic!("expected audio signal, got {other:?}"),
        }
    }

    #[test]
    fn interrupted_flag_classifies_as_interruption() {
        let signals = classify(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(signals, vec![SessionSignal::Interrupted]);
    }

    #[test]
    fn text_parts_pass_through_as_text() {
        let message = json!({
            "serverContent": {"modelTurn": {"parts": [{"text": "hello"}]}}
        });
        let signals = classify(&message.to_string()).unwrap();
        assert_eq!(signals, vec![SessionSignal::Text("hello".into())]);
    }

    #[test]
    fn undecodable_audio_part_is_dropped_but_rest_survives() {
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"data": "???not-base64???"}},
                        {"inlineData": {"data": "AQID"}}
                    ]
                }
            }
        });
        let signals = classify(&message.to_string()).unwrap();

        assert_eq!(signals.len(), 1);
        assert!(matches!(signals[0], SessionSignal::Audio(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            classify("{not json"),
            Err(TransportError::MalformedMessage(_))
        ));
    }

    #[test]
    fn unknown_message_carries_no_signals() {
        let signals = classify(r#"{"usageMetadata": {"tokens": 7}}"#).unwrap();
        assert!(signals.is_empty());
    }
}
