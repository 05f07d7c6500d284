//! Gemini Live wire protocol for the conversational support agent.
//!
//! Implements the message shapes of Google's BidiGenerateContent
//! streaming API: the setup handshake, realtime audio input, text
//! injection, and the server-event parser.
//!
//! ## Important: Binary Frame Protocol
//!
//! Gemini Live sends **all** messages as WebSocket Binary frames,
//! including JSON control messages like `setupComplete`. The binding's
//! inbound loop detects JSON in Binary frames (content starting with
//! `{`) and routes them through [`parse_server_message`].

use base64::Engine;
use serde::Serialize;

/// Gemini Live WebSocket endpoint.
pub const LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Audio MIME type for customer input (16 kHz PCM mono).
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ── Setup message (first frame after connect) ──────────────────────

/// Top-level setup message for session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    pub system_instruction: SystemInstruction,
    /// Empty objects enable transcription of both audio directions —
    /// the transcript pipeline depends on both event streams.
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: serde_json::Value,
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// System prompt for the customer-support voice agent.
pub fn support_system_prompt() -> String {
    "You are a friendly, concise customer-support voice agent. \
     Listen to the caller, resolve their issue step by step, and ask one \
     clarifying question at a time. Keep every reply short enough to speak \
     aloud in a few seconds. Never describe what you are doing and never \
     produce stage directions — just speak to the caller directly."
        .to_string()
}

/// Wrap supervisor-provided context as a user-visible turn for the model.
pub fn context_prompt(context: &str) -> String {
    format!(
        "Context from a human supervisor observing this call: {context}\n\
         Weave this into the conversation naturally. Do not mention the \
         supervisor or read this note back to the caller."
    )
}

/// Build the setup message for a support session.
pub fn build_setup_message(model: &str) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{model}"),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: "Puck".to_string(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: support_system_prompt(),
                }],
            },
            input_audio_transcription: serde_json::json!({}),
            output_audio_transcription: serde_json::json!({}),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message using the current `realtimeInput.audio` format.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: AudioBlob,
}

/// Single audio blob with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct AudioBlob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Build a realtime audio input message from raw PCM bytes.
pub fn build_audio_message(pcm_data: &[u8]) -> RealtimeInputMessage {
    let b64 = base64::engine::general_purpose::STANDARD.encode(pcm_data);
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: AudioBlob {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: b64,
            },
        },
    }
}

/// Build a text-injection message (`clientContent` user turn).
pub fn build_text_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true,
        }
    })
}

// ── Server response events ─────────────────────────────────────────

/// Parsed event from the provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Setup handshake completed — ready to stream.
    SetupComplete,
    /// Synthesized audio chunk (24 kHz PCM mono).
    Audio { data: Vec<u8> },
    /// Partial transcription of the caller's speech.
    InputTranscript { text: String },
    /// Partial transcription of the model's speech.
    OutputTranscript { text: String },
    /// Model finished a response turn.
    TurnComplete,
    /// The model was interrupted mid-response.
    Interrupted,
    /// Provider-level failure.
    Error { message: String },
}

/// Parse a JSON frame from the provider into a list of events.
///
/// A single server message can contain several events (audio chunks plus
/// a transcription in the same frame).
pub fn parse_server_message(json_text: &str) -> Vec<ProviderEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(ProviderEvent::Error {
                message: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ProviderEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ProviderEvent::TurnComplete);
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ProviderEvent::Interrupted);
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(inline) = part.get("inlineData") {
                    if let Some(data_b64) = inline.get("data").and_then(|v| v.as_str()) {
                        if let Ok(audio_bytes) =
                            base64::engine::general_purpose::STANDARD.decode(data_b64)
                        {
                            events.push(ProviderEvent::Audio { data: audio_bytes });
                        }
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    events.push(ProviderEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }
        // Transcriptions can also ride inside serverContent.
        for (key, variant) in [
            ("inputTranscription", true),
            ("outputTranscription", false),
        ] {
            if let Some(text) = content
                .get(key)
                .and_then(|t| t.get("text"))
                .and_then(|v| v.as_str())
            {
                if !text.is_empty() {
                    events.push(if variant {
                        ProviderEvent::InputTranscript {
                            text: text.to_string(),
                        }
                    } else {
                        ProviderEvent::OutputTranscript {
                            text: text.to_string(),
                        }
                    });
                }
            }
        }
    }

    // Top-level transcription frames.
    if let Some(text) = value
        .pointer("/inputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(ProviderEvent::InputTranscript {
                text: text.to_string(),
            });
        }
    }
    if let Some(text) = value
        .pointer("/outputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(ProviderEvent::OutputTranscript {
                text: text.to_string(),
            });
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(ProviderEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

// ── Tests ──────────────────────────────────────────────────────────
