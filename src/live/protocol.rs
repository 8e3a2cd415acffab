//! # Live API Wire Protocol
//!
//! JSON messages exchanged with the bidirectional generate-content endpoint.
//! Only the subset the conversation loop needs is modelled: session setup,
//! realtime audio input, text turns, and audio output with its turn signals.

use crate::audio::AudioConfig;
use crate::error::BridgeResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};

/// Client → server message. Exactly one field is set.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_content: Option<ClientContent>,
}

#[derive(Debug, Clone, Serialize)]
struct Setup {
    model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Turn>,
    turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Turn {
    role: String,
    parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
struct TextPart {
    text: String,
}

impl ClientMessage {
    pub fn to_json(&self) -> BridgeResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// First message of every upstream session.
pub fn setup_message(model: &str) -> ClientMessage {
    ClientMessage {
        setup: Some(Setup {
            model: model.to_string(),
        }),
        ..Default::default()
    }
}

/// Wrap captured PCM as realtime input.
pub fn encode_audio_input(data: &[u8], config: &AudioConfig) -> ClientMessage {
    ClientMessage {
        realtime_input: Some(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: config.pcm_mime_type(),
                data: BASE64.encode(data),
            }],
        }),
        ..Default::default()
    }
}

/// A complete user text turn.
pub fn encode_text_input(text: &str) -> ClientMessage {
    ClientMessage {
        client_content: Some(ClientContent {
            turns: vec![Turn {
                role: "USER".to_string(),
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        }),
        ..Default::default()
    }
}

/// What a server message means for the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The server accepted the setup message.
    SetupComplete,
    /// Model speech, all inline-data parts of the message concatenated.
    Audio(Bytes),
    /// The user spoke over the model; queued playback must stop.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// `{"serverContent": {}}` keep-alive.
    Empty,
    Unhandled(Value),
}

/// Classify one server message.
///
/// Precedence: audio, then interruption, then turn completion. A message
/// carrying audio and `turnComplete` is reported as audio.
pub fn decode_server_message(message: &Value) -> BridgeResult<ServerEvent> {
    let audio = decode_audio_output(message)?;
    if !audio.is_empty() {
        return Ok(ServerEvent::Audio(audio));
    }

    let content = message.get("serverContent");
    if content.and_then(|c| c.get("interrupted")).is_some() {
        return Ok(ServerEvent::Interrupted);
    }
    if content.and_then(|c| c.get("turnComplete")).is_some() {
        return Ok(ServerEvent::TurnComplete);
    }
    if message.get("setupComplete").is_some() {
        return Ok(ServerEvent::SetupComplete);
    }
    if *message == json!({"serverContent": {}}) {
        return Ok(ServerEvent::Empty);
    }
    Ok(ServerEvent::Unhandled(message.clone()))
}

/// Model audio carried by `message`, empty if none.
pub fn decode_audio_output(message: &Value) -> BridgeResult<Bytes> {
    let parts = message
        .pointer("/serverContent/modelTurn/parts")
        .and_then(Value::as_array);

    let mut audio = Vec::new();
    for part in parts.into_iter().flatten() {
        let data = part
            .pointer("/inlineData/data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !data.is_empty() {
            audio.extend_from_slice(&BASE64.decode(data)?);
        }
    }
    Ok(Bytes::from(audio))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(
            setup_message("models/gemini-live-2.5-flash-preview").to_json().unwrap(),
            json!({"setup": {"model": "models/gemini-live-2.5-flash-preview"}})
        );

        let audio = encode_audio_input(&[0, 0, 1, 0], &AudioConfig::new(24000));
        assert_eq!(
            audio.to_json().unwrap(),
            json!({"realtimeInput": {"mediaChunks": [
                {"mimeType": "audio/pcm;rate=24000", "data": "AAABAA=="}
            ]}})
        );

        assert_eq!(
            encode_text_input("Shalom").to_json().unwrap(),
            json!({"clientContent": {
                "turns": [{"role": "USER", "parts": [{"text": "Shalom"}]}],
                "turnComplete": true
            }})
        );
    }

    #[test]
    fn test_decode_audio_concatenates_parts() {
        let message = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}},
            {"text": "thinking"},
            {"inlineData": {"data": "AwQ="}}
        ]}}});
        assert_eq!(
            decode_server_message(&message).unwrap(),
            ServerEvent::Audio(Bytes::from_static(&[1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_decode_signals() {
        let interrupted = json!({"serverContent": {"interrupted": true}});
        assert_eq!(decode_server_message(&interrupted).unwrap(), ServerEvent::Interrupted);

        let done = json!({"serverContent": {"turnComplete": true}});
        assert_eq!(decode_server_message(&done).unwrap(), ServerEvent::TurnComplete);

        let empty = json!({"serverContent": {}});
        assert_eq!(decode_server_message(&empty).unwrap(), ServerEvent::Empty);

        let setup = json!({"setupComplete": {}});
        assert_eq!(decode_server_message(&setup).unwrap(), ServerEvent::SetupComplete);

        let other = json!({"toolCall": {"functionCalls": []}});
        assert_eq!(
            decode_server_message(&other).unwrap(),
            ServerEvent::Unhandled(other.clone())
        );
    }

    #[test]
    fn test_bad_audio_is_an_error() {
        let message = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"data": "%%%"}}
        ]}}});
        assert!(decode_server_message(&message).is_err());
    }
}
