//! Protocol envelopes exchanged with the realtime gateway
//!
//! Everything on the wire is one JSON text message with a `type` tag that
//! determines handling. Client events serialize through serde so they are
//! always syntactically valid JSON; uplink audio frames are the one
//! exception, spliced into [`BUFFER_APPEND_PREFIX`]/[`BUFFER_APPEND_SUFFIX`]
//! by the frame encoder to avoid re-encoding the base64 payload.

use serde::{Deserialize, Serialize};

/// Template prefix for `input_audio_buffer.append` envelopes
pub const BUFFER_APPEND_PREFIX: &str = "{\"type\": \"input_audio_buffer.append\",\"audio\" : \"";

/// Template suffix closing the audio field and the envelope
pub const BUFFER_APPEND_SUFFIX: &str = "\"}";

/// Events sent from client to gateway
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.commit")]
    BufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "tts_session.update")]
    TtsSessionUpdate { session: TtsSessionConfig },

    #[serde(rename = "input_text.append")]
    InputTextAppend { event_id: String, delta: String },

    #[serde(rename = "input_text.done")]
    InputTextDone,
}

impl ClientEvent {
    /// Chat session configuration envelope
    pub fn session_update(voice: &str) -> Self {
        Self::SessionUpdate {
            session: SessionConfig {
                modalities: vec!["text".into(), "audio".into()],
                voice: voice.to_string(),
                input_audio_format: "pcm16".into(),
                output_audio_format: "pcm16".into(),
            },
        }
    }

    /// Response-create envelope requesting text and audio modalities
    pub fn response_create() -> Self {
        Self::ResponseCreate {
            response: ResponseConfig {
                modalities: vec!["text".into(), "audio".into()],
            },
        }
    }

    /// TTS session configuration envelope
    pub fn tts_session_update(voice: &str, model: &str, output_sample_rate: u32) -> Self {
        Self::TtsSessionUpdate {
            session: TtsSessionConfig {
                voice: voice.to_string(),
                output_audio_format: "mp3".into(),
                output_audio_sample_rate: output_sample_rate,
                text_to_speech: TextToSpeech {
                    model: model.to_string(),
                },
            },
        }
    }

    /// Text input envelope with a monotonically increasing event id
    pub fn input_text_append(event_id: u32, text: &str) -> Self {
        Self::InputTextAppend {
            event_id: format!("event_{event_id:08}"),
            delta: text.to_string(),
        }
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> String {
        // Serialization of these variants cannot fail.
        serde_json::to_string(self).expect("client event serializes")
    }
}

/// `session.update` payload
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
}

/// `response.create` payload
#[derive(Debug, Clone, Serialize)]
pub struct ResponseConfig {
    pub modalities: Vec<String>,
}

/// `tts_session.update` payload
#[derive(Debug, Clone, Serialize)]
pub struct TtsSessionConfig {
    pub voice: String,
    pub output_audio_format: String,
    pub output_audio_sample_rate: u32,
    pub text_to_speech: TextToSpeech,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextToSpeech {
    pub model: String,
}

/// Events received from the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// Informational, no state change
    #[serde(rename = "response.created")]
    ResponseCreated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "tts_session.updated")]
    TtsSessionUpdated {
        // The gateway spells this key "sesson".
        #[serde(alias = "sesson")]
        session: TtsSessionInfo,
    },

    /// Any tag this client does not consume
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one inbound text message
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// `tts_session.updated` payload
#[derive(Debug, Clone, Deserialize)]
pub struct TtsSessionInfo {
    #[serde(default)]
    output_audio_rate: Option<RateField>,
}

impl TtsSessionInfo {
    /// Negotiated output sample rate, if the gateway reported one
    pub fn output_audio_rate(&self) -> Option<u32> {
        match &self.output_audio_rate {
            Some(RateField::Num(n)) => Some(*n),
            Some(RateField::Text(s)) => s.trim().parse().ok(),
            None => None,
        }
    }
}

/// The gateway reports the rate as a JSON string; accept numbers too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RateField {
    Num(u32),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_wire_format() {
        let json = ClientEvent::session_update("zh_female_tianmeixiaoyuan_moon_bigtts").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["modalities"][0], "text");
        assert_eq!(value["session"]["modalities"][1], "audio");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["output_audio_format"], "pcm16");
    }

    #[test]
    fn test_response_cancel_is_valid_json() {
        let json = ClientEvent::ResponseCancel.to_json();
        assert_eq!(json, r#"{"type":"response.cancel"}"#);
        // Must parse back cleanly (no trailing comma).
        serde_json::from_str::<serde_json::Value>(&json).unwrap();
    }

    #[test]
    fn test_commit_and_response_create() {
        assert_eq!(
            ClientEvent::BufferCommit.to_json(),
            r#"{"type":"input_audio_buffer.commit"}"#
        );
        let value: serde_json::Value =
            serde_json::from_str(&ClientEvent::response_create().to_json()).unwrap();
        assert_eq!(value["type"], "response.create");
        assert_eq!(value["response"]["modalities"][1], "audio");
    }

    #[test]
    fn test_input_text_event_id_format() {
        let json = ClientEvent::input_text_append(7, "hello").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event_id"], "event_00000007");
        assert_eq!(value["delta"], "hello");
        assert_eq!(
            ClientEvent::InputTextDone.to_json(),
            r#"{"type":"input_text.done"}"#
        );
    }

    #[test]
    fn test_parse_lifecycle_events() {
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"session.created"}"#).unwrap(),
            ServerEvent::SessionCreated
        ));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"session.updated","session":{}}"#).unwrap(),
            ServerEvent::SessionUpdated
        ));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"response.done"}"#).unwrap(),
            ServerEvent::ResponseDone
        ));
    }

    #[test]
    fn test_parse_audio_delta() {
        let event = ServerEvent::parse(r#"{"type":"response.audio.delta","delta":"AAAA"}"#).unwrap();
        match event {
            ServerEvent::AudioDelta { delta } => assert_eq!(delta, "AAAA"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"rate_limits.updated","limits":[]}"#).unwrap(),
            ServerEvent::Unknown
        ));
    }

    #[test]
    fn test_parse_malformed_is_error() {
        assert!(ServerEvent::parse("not json").is_err());
        assert!(ServerEvent::parse(r#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn test_tts_session_updated_sesson_alias() {
        let event = ServerEvent::parse(
            r#"{"type":"tts_session.updated","sesson":{"output_audio_rate":"24000"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::TtsSessionUpdated { session } => {
                assert_eq!(session.output_audio_rate(), Some(24000));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Canonical spelling and numeric rate also accepted.
        let event = ServerEvent::parse(
            r#"{"type":"tts_session.updated","session":{"output_audio_rate":16000}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::TtsSessionUpdated { session } => {
                assert_eq!(session.output_audio_rate(), Some(16000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
