//! Wire message schema for customer and supervisor connections.
//!
//! Defines the JSON tagged unions exchanged over the two WebSocket
//! surfaces:
//!
//! ```text
//! Customer browser ──WebSocket──▸ switchboard ──WebSocket──▸ Gemini Live API
//!        ◂── audio / transcripts ──────◂── events ──────────────◂
//!
//! Supervisor dashboard ──WebSocket──▸ switchboard (commands)
//!        ◂──────── fan-out session events ────────◂
//! ```
//!
//! All frames are JSON text. Audio rides inside JSON as base64 PCM16LE
//! (16 kHz mono from the customer, 24 kHz mono back to the customer).
//! Unknown tags fail to decode and are treated as protocol violations by
//! the connection handlers.

use serde::{Deserialize, Serialize};

use crate::analytics::{CoachingAdvice, ConversationAnalysis};
use crate::session::{SessionMode, SessionSnapshot};

// ── Customer → server messages ────────────────────────────────────

/// Messages sent from the customer browser to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CustomerInbound {
    /// Microphone audio chunk, base64 PCM16LE 16 kHz mono.
    #[serde(rename = "audio")]
    Audio { data: String },

    /// Typed text from the customer UI (rare).
    #[serde(rename = "text")]
    Text { content: String },

    /// Client-side caption for diagnostics; never forwarded to the AI,
    /// which already hears the audio.
    #[serde(rename = "transcript")]
    Transcript { content: String },
}

// ── Server → customer messages ────────────────────────────────────

/// Payload of an `aiResponse` frame shown in the customer UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponseData {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

impl AiResponseData {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            content: content.into(),
        }
    }
}

/// Messages sent from the server to the customer browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CustomerOutbound {
    /// First frame after attach: assigned session id and current mode.
    #[serde(rename = "sessionInit")]
    SessionInit {
        #[serde(rename = "sessionId")]
        session_id: String,
        mode: SessionMode,
    },

    /// Synthesized audio chunk, base64 PCM16LE 24 kHz mono.
    #[serde(rename = "audio")]
    Audio { data: String },

    /// Finalized AI sentence, echoed for UI display.
    #[serde(rename = "aiResponse")]
    AiResponse { data: AiResponseData },

    /// Echo of the customer's own recognized speech.
    #[serde(rename = "customerTranscription")]
    CustomerTranscription { content: String },

    /// Text from the human controller while in HUMAN mode.
    #[serde(rename = "supervisorMessage")]
    SupervisorMessage { content: String },

    /// The audio path switched between AI and a human supervisor.
    #[serde(rename = "modeChange")]
    ModeChange { mode: SessionMode, message: String },

    /// Terminal notification; the connection closes after this.
    #[serde(rename = "sessionEnded")]
    SessionEnded { message: String },

    /// Per-connection error (protocol violation reply).
    #[serde(rename = "error")]
    Error { message: String },
}

// ── Supervisor → server commands ──────────────────────────────────

/// Commands sent from a supervisor dashboard to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SupervisorInbound {
    /// Take HUMAN control of a session. `supervisorId` defaults to the
    /// identity the connection registered with.
    #[serde(rename = "takeover")]
    Takeover {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(
            rename = "supervisorId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        supervisor_id: Option<String>,
    },

    /// Return control to the AI, optionally priming it with context.
    #[serde(rename = "handback")]
    Handback {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },

    /// Inject context into the AI stream without taking over.
    #[serde(rename = "injectContext")]
    InjectContext {
        #[serde(rename = "sessionId")]
        session_id: String,
        context: String,
    },

    /// Text to the customer; valid only while HUMAN.
    #[serde(rename = "supervisorMessage")]
    SupervisorMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
    },

    /// Microphone audio to the customer; valid only while HUMAN.
    #[serde(rename = "supervisorAudio")]
    SupervisorAudio {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },

    /// End the session.
    #[serde(rename = "endCall")]
    EndCall {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Request a fresh snapshot list of all sessions.
    #[serde(rename = "getSessions")]
    GetSessions,
}

// ── Server → supervisor events ────────────────────────────────────

/// Events fanned out to every attached supervisor.
///
/// Every session-scoped variant carries the session id and a per-session
/// monotonically increasing sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SupervisorEvent {
    /// Snapshot of all live sessions (sent on attach and on `getSessions`).
    #[serde(rename = "sessionsList")]
    SessionsList { sessions: Vec<SessionSnapshot> },

    /// Session state changed (mode, status, attach/detach).
    #[serde(rename = "sessionUpdate")]
    SessionUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        session: SessionSnapshot,
    },

    /// Finalized AI sentence.
    #[serde(rename = "aiResponse")]
    AiResponse {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        content: String,
    },

    /// Finalized customer utterance.
    #[serde(rename = "customerMessage")]
    CustomerMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        content: String,
    },

    /// Raw customer audio relayed to the controller while HUMAN.
    #[serde(rename = "customerAudio")]
    CustomerAudio {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        data: String,
    },

    /// Latest sentiment signal for the session.
    #[serde(rename = "frustrationUpdate")]
    FrustrationUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        score: u8,
        sentiment: String,
        reason: String,
    },

    /// Conversation-analysis result.
    #[serde(rename = "analyticsUpdate")]
    AnalyticsUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        analysis: ConversationAnalysis,
    },

    /// Coaching advice for whoever handles the session next.
    #[serde(rename = "coachingUpdate")]
    CoachingUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        coaching: CoachingAdvice,
    },

    /// The sentiment analytics crossed the escalation threshold.
    #[serde(rename = "escalationAlert")]
    EscalationAlert {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        score: u8,
        reason: String,
    },

    /// The session is over; no event for it carries a higher sequence.
    #[serde(rename = "sessionEnded")]
    SessionEnded {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u64,
        reason: String,
    },

    /// Direct acknowledgement of `injectContext`.
    #[serde(rename = "contextInjected")]
    ContextInjected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Per-session or global error.
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

impl SupervisorEvent {
    /// Wire tag of this event, used for the degraded fallback frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionsList { .. } => "sessionsList",
            Self::SessionUpdate { .. } => "sessionUpdate",
            Self::AiResponse { .. } => "aiResponse",
            Self::CustomerMessage { .. } => "customerMessage",
            Self::CustomerAudio { .. } => "customerAudio",
            Self::FrustrationUpdate { .. } => "frustrationUpdate",
            Self::AnalyticsUpdate { .. } => "analyticsUpdate",
            Self::CoachingUpdate { .. } => "coachingUpdate",
            Self::EscalationAlert { .. } => "escalationAlert",
            Self::SessionEnded { .. } => "sessionEnded",
            Self::ContextInjected { .. } => "contextInjected",
            Self::Error { .. } => "error",
        }
    }

    /// Session id of this event, when session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionsList { .. } => None,
            Self::SessionUpdate { session_id, .. }
            | Self::AiResponse { session_id, .. }
            | Self::CustomerMessage { session_id, .. }
            | Self::CustomerAudio { session_id, .. }
            | Self::FrustrationUpdate { session_id, .. }
            | Self::AnalyticsUpdate { session_id, .. }
            | Self::CoachingUpdate { session_id, .. }
            | Self::EscalationAlert { session_id, .. }
            | Self::SessionEnded { session_id, .. }
            | Self::ContextInjected { session_id } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_inbound_audio_roundtrip() {
        let json = r#"{"type":"audio","data":"AAAA"}"#;
        let msg: CustomerInbound = serde_json::from_str(json).unwrap();
        match &msg {
            CustomerInbound::Audio { data } => assert_eq!(data, "AAAA"),
            other => panic!("Wrong variant: {other:?}"),
        }
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"type\":\"audio\""));
    }

    #[test]
    fn customer_inbound_unknown_tag_rejected() {
        let json = r#"{"type":"selfdestruct"}"#;
        assert!(serde_json::from_str::<CustomerInbound>(json).is_err());
    }

    #[test]
    fn customer_outbound_session_init_uses_camel_case() {
        let msg = CustomerOutbound::SessionInit {
            session_id: "s1".into(),
            mode: SessionMode::Ai,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("sessionInit"));
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"mode\":\"ai\""));
    }

    #[test]
    fn ai_response_wraps_text_payload() {
        let msg = CustomerOutbound::AiResponse {
            data: AiResponseData::text("Hello."),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"data\":{\"type\":\"text\",\"content\":\"Hello.\"}"));
    }

    #[test]
    fn supervisor_takeover_parses() {
        let json = r#"{"type":"takeover","sessionId":"s1"}"#;
        let cmd: SupervisorInbound = serde_json::from_str(json).unwrap();
        assert!(matches!(
            cmd,
            SupervisorInbound::Takeover { session_id, supervisor_id: None } if session_id == "s1"
        ));
    }

    #[test]
    fn supervisor_takeover_accepts_explicit_id() {
        let json = r#"{"type":"takeover","sessionId":"s1","supervisorId":"sup42"}"#;
        let cmd: SupervisorInbound = serde_json::from_str(json).unwrap();
        assert!(matches!(
            cmd,
            SupervisorInbound::Takeover { supervisor_id: Some(id), .. } if id == "sup42"
        ));
    }

    #[test]
    fn supervisor_handback_context_optional() {
        let bare: SupervisorInbound =
            serde_json::from_str(r#"{"type":"handback","sessionId":"s1"}"#).unwrap();
        assert!(matches!(
            bare,
            SupervisorInbound::Handback { context: None, .. }
        ));

        let with: SupervisorInbound = serde_json::from_str(
            r#"{"type":"handback","sessionId":"s1","context":"customer wants a refund"}"#,
        )
        .unwrap();
        assert!(matches!(
            with,
            SupervisorInbound::Handback { context: Some(c), .. } if c.contains("refund")
        ));
    }

    #[test]
    fn supervisor_event_carries_session_and_seq() {
        let event = SupervisorEvent::AiResponse {
            session_id: "s1".into(),
            seq: 7,
            content: "Hello.".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"seq\":7"));
        assert_eq!(event.kind(), "aiResponse");
        assert_eq!(event.session_id(), Some("s1"));
    }

    #[test]
    fn sessions_list_has_no_session_id() {
        let event = SupervisorEvent::SessionsList { sessions: vec![] };
        assert_eq!(event.session_id(), None);
        assert_eq!(event.kind(), "sessionsList");
    }

    #[test]
    fn get_sessions_is_a_bare_tag() {
        let cmd: SupervisorInbound = serde_json::from_str(r#"{"type":"getSessions"}"#).unwrap();
        assert!(matches!(cmd, SupervisorInbound::GetSessions));
    }
}
