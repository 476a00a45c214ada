//! Live API message envelopes
//!
//! Client messages are `setup` (once) and `realtimeInput` (per frame); server
//! messages carry `setupComplete`, `serverContent` or `goAway`.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::voice::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Response modality requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    #[default]
    Audio,
    Text,
}

/// First message on the socket
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    /// Build the setup message for a session configuration
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        let system_instruction = (!config.system_instruction.trim().is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(config.system_instruction.clone())],
        });

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec![config.response_modality],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction,
            },
        }
    }
}

/// Content block shared by setup and server messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    #[must_use]
    pub const fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }
}

/// Base64 media payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Blob {
    /// Whether the payload is linear PCM audio
    #[must_use]
    pub fn is_pcm_audio(&self) -> bool {
        self.mime_type.starts_with("audio/pcm")
    }

    /// Sample rate announced in the MIME type, 24kHz when absent
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.mime_type
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.parse().ok())
            .unwrap_or(PLAYBACK_SAMPLE_RATE)
    }

    /// Decode into an audio frame
    ///
    /// # Errors
    ///
    /// Returns a decode error for invalid base64 or a partial sample
    pub fn to_frame(&self) -> Result<AudioFrame> {
        AudioFrame::from_base64(&self.data, self.sample_rate())
    }
}

/// One captured frame as realtime input
///
/// Equivalent of `{ media: { data, mimeType } }` on the client SDKs.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl RealtimeInputMessage {
    #[must_use]
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: frame.mime_type(),
                    data: frame.to_base64(),
                }],
            },
        }
    }
}

/// Message received from the service
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// Server notice that the connection will be dropped soon
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Parse a JSON payload from a text or binary frame
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed JSON
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Decode(format!("malformed server message: {e}")))
    }

    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// First PCM audio part of the model turn
    ///
    /// Later audio parts in the same message are not consumed.
    #[must_use]
    pub fn first_audio(&self) -> Option<&Blob> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .iter()
            .filter_map(|part| part.inline_data.as_ref())
            .find(|blob| blob.is_pcm_audio())
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    #[must_use]
    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            model: "gemini-live-test".to_string(),
            response_modality: Modality::Audio,
            voice: "Zephyr".to_string(),
            system_instruction: "Sois bref.".to_string(),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let json = serde_json::to_value(SetupMessage::new(&config())).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-live-test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Zephyr"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Sois bref."
        );
    }

    #[test]
    fn test_setup_keeps_qualified_model_and_skips_empty_instruction() {
        let mut config = config();
        config.model = "models/already".to_string();
        config.system_instruction = "  ".to_string();

        let json = serde_json::to_value(SetupMessage::new(&config)).unwrap();
        assert_eq!(json["setup"]["model"], "models/already");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_realtime_input_shape() {
        let frame = AudioFrame::from_samples(&[0.5, -0.5], 16_000);
        let json = serde_json::to_value(RealtimeInputMessage::from_frame(&frame)).unwrap();

        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AEAAwA==");
    }

    #[test]
    fn test_parse_setup_complete() {
        let msg = ServerMessage::parse(br#"{"setupComplete":{}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.first_audio().is_none());
    }

    #[test]
    fn test_first_audio_part_only() {
        let msg = ServerMessage::parse(
            br#"{"serverContent":{"modelTurn":{"parts":[
                {"text":"bonjour"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AEAAwA=="}},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}
            ]}}}"#,
        )
        .unwrap();

        let audio = msg.first_audio().unwrap();
        assert_eq!(audio.data, "AEAAwA==");
        let frame = audio.to_frame().unwrap();
        assert_eq!(frame.sample_rate(), 24_000);
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn test_flags_and_unknown_fields() {
        let msg = ServerMessage::parse(
            br#"{"serverContent":{"interrupted":true,"turnComplete":true},"usageMetadata":{"totalTokenCount":3}}"#,
        )
        .unwrap();
        assert!(msg.is_interrupted());
        assert!(msg.is_turn_complete());
        assert!(msg.first_audio().is_none());
    }

    #[test]
    fn test_blob_rate_defaults() {
        let blob = Blob {
            mime_type: "audio/pcm".to_string(),
            data: String::new(),
        };
        assert_eq!(blob.sample_rate(), 24_000);
    }

    #[test]
    fn test_malformed_message_is_decode_error() {
        let err = ServerMessage::parse(b"{not json").unwrap_err();
        assert!(err.is_recoverable());
    }
}
