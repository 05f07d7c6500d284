//! Per-session state: the mutable record, transcript log, frustration
//! gauge, and the serializable snapshot view.
//!
//! The state is owned by exactly one session loop (see [`runner`]); no
//! other task holds a reference to it. External readers get a
//! [`SessionSnapshot`] or a transcript copy served by the loop, which by
//! construction never contain transport or binding handles.

pub mod manager;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::live::BindingState;

// ── Enums ──────────────────────────────────────────────────────────

/// Who is on the customer's audio path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Ai,
    Human,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, waiting for first media.
    Waiting,
    /// Media flowing.
    Active,
    /// Terminal; only the summary write follows.
    Ended,
}

/// Producer of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Ai,
    Supervisor,
}

// ── Transcript ─────────────────────────────────────────────────────

/// One appended transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Per-session sequence number assigned at append.
    pub seq: u64,
}

// ── Frustration gauge ──────────────────────────────────────────────

/// Aggregated sentiment signal for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrustrationGauge {
    /// Latest score, 0–100.
    pub score: u8,
    /// Latest sentiment label.
    pub sentiment: String,
    /// Latest reason from the analytics collaborator.
    pub reason: String,
    /// Running maximum.
    pub peak: u8,
    /// Number of samples recorded.
    pub samples: u32,
    /// Running minimum (0 until the first sample).
    #[serde(skip)]
    pub min: u8,
    /// Running sum for the average.
    #[serde(skip)]
    pub total: u64,
}

impl Default for FrustrationGauge {
    fn default() -> Self {
        Self {
            score: 0,
            sentiment: "neutral".into(),
            reason: String::new(),
            peak: 0,
            samples: 0,
            min: 0,
            total: 0,
        }
    }
}

impl FrustrationGauge {
    /// Record a new sentiment sample.
    pub fn record(&mut self, score: u8, sentiment: &str, reason: &str) {
        self.min = if self.samples == 0 {
            score
        } else {
            self.min.min(score)
        };
        self.score = score;
        self.sentiment = sentiment.to_string();
        self.reason = reason.to_string();
        self.peak = self.peak.max(score);
        self.samples += 1;
        self.total += u64::from(score);
    }

    /// Mean score across samples (0 when empty).
    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total as f64 / f64::from(self.samples)
        }
    }

    /// Coarse trend label for the summary row.
    pub fn trend(&self) -> &'static str {
        if self.samples < 2 {
            "stable"
        } else if u64::from(self.score) * u64::from(self.samples) > self.total {
            "rising"
        } else if u64::from(self.score) * u64::from(self.samples) < self.total {
            "falling"
        } else {
            "stable"
        }
    }
}

// ── Controller record ──────────────────────────────────────────────

/// The supervisor currently holding HUMAN control.
#[derive(Debug, Clone)]
pub struct Controller {
    pub supervisor_id: String,
    pub taken_over_at: DateTime<Utc>,
    pub taken_over_instant: Instant,
}

// ── Session state ──────────────────────────────────────────────────

/// The mutable per-session record, owned by the session loop.
pub struct SessionState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub created_instant: Instant,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub customer_connected: bool,
    pub controller: Option<Controller>,
    pub binding_state: BindingState,
    pub transcript: Vec<TranscriptEntry>,
    pub frustration: FrustrationGauge,
    /// Count of takeover events.
    pub interventions: u32,
    /// Accumulated time under HUMAN control.
    pub takeover_total: Duration,
    /// Last supervisor to hold control (for the summary row).
    pub last_controller_id: Option<String>,
    /// Escalation alert reasons raised during the call.
    pub escalations: Vec<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Per-session sequence counter shared by transcript appends and
    /// supervisor events.
    seq: u64,
}

impl SessionState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            ended_at: None,
            status: SessionStatus::Waiting,
            mode: SessionMode::Ai,
            customer_connected: true,
            controller: None,
            binding_state: BindingState::Connecting,
            transcript: Vec::new(),
            frustration: FrustrationGauge::default(),
            interventions: 0,
            takeover_total: Duration::ZERO,
            last_controller_id: None,
            escalations: Vec::new(),
            first_message_at: None,
            last_message_at: None,
            seq: 0,
        }
    }

    /// Next value of the per-session sequence counter.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Append a transcript entry, assigning it the next sequence number.
    pub fn append(&mut self, role: Role, content: impl AsRef<str>) -> TranscriptEntry {
        let now = Utc::now();
        let seq = self.next_seq();
        let entry = TranscriptEntry {
            role,
            content: content.as_ref().to_owned(),
            timestamp: now,
            seq,
        };
        self.first_message_at.get_or_insert(now);
        self.last_message_at = Some(now);
        self.transcript.push(entry.clone());
        entry
    }

    /// Last N transcript entries, oldest first.
    pub fn recent_transcript(&self, n: usize) -> Vec<TranscriptEntry> {
        let start = self.transcript.len().saturating_sub(n);
        self.transcript[start..].to_vec()
    }

    /// Ordered transcript copy for analytics and the end-of-call summary.
    pub fn full_transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.clone()
    }

    /// Serializable view. Deliberately omits every live handle.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            status: self.status,
            mode: self.mode,
            customer_connected: self.customer_connected,
            controller_id: self
                .controller
                .as_ref()
                .map(|c| c.supervisor_id.clone()),
            binding_state: self.binding_state,
            transcript_length: self.transcript.len(),
            last_message: self.transcript.last().map(|e| e.content.clone()),
            frustration: self.frustration.clone(),
            interventions: self.interventions,
        }
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Serializable session view for dashboards and the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    #[serde(rename = "customerConnected")]
    pub customer_connected: bool,
    #[serde(rename = "controllerId")]
    pub controller_id: Option<String>,
    #[serde(rename = "aiState")]
    pub binding_state: BindingState,
    #[serde(rename = "transcriptLength")]
    pub transcript_length: usize,
    #[serde(rename = "lastMessage")]
    pub last_message: Option<String>,
    pub frustration: FrustrationGauge,
    #[serde(rename = "supervisorInterventions")]
    pub interventions: u32,
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_increasing_seq() {
        let mut state = SessionState::new("s1".into());
        let a = state.append(Role::Customer, "hello");
        let b = state.append(Role::Ai, "Hi there.");
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(state.transcript.len(), 2);
    }

    #[test]
    fn append_and_events_share_one_counter() {
        let mut state = SessionState::new("s1".into());
        state.append(Role::Customer, "hello");
        let event_seq = state.next_seq();
        let entry = state.append(Role::Ai, "Hi.");
        assert!(event_seq > 1);
        assert!(entry.seq > event_seq);
    }

    #[test]
    fn timestamps_non_decreasing_per_producer() {
        let mut state = SessionState::new("s1".into());
        let a = state.append(Role::Customer, "one");
        let b = state.append(Role::Customer, "two");
        assert!(b.timestamp >= a.timestamp);
    }

    #[test]
    fn recent_transcript_takes_tail() {
        let mut state = SessionState::new("s1".into());
        for i in 0..8 {
            state.append(Role::Customer, format!("line {i}"));
        }
        let recent = state.recent_transcript(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].content, "line 3");
        assert_eq!(recent[4].content, "line 7");
    }

    #[test]
    fn snapshot_omits_handles_and_serializes() {
        let mut state = SessionState::new("s1".into());
        state.append(Role::Ai, "Hello.");
        let snap = state.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"customerConnected\":true"));
        assert!(json.contains("\"transcriptLength\":1"));
        assert!(json.contains("\"lastMessage\":\"Hello.\""));
        assert!(json.contains("\"mode\":\"ai\""));
        assert!(json.contains("\"status\":\"waiting\""));
    }

    #[test]
    fn frustration_gauge_tracks_extremes() {
        let mut gauge = FrustrationGauge::default();
        gauge.record(40, "annoyed", "slow response");
        gauge.record(85, "angry", "repeated complaints");
        gauge.record(60, "frustrated", "still unresolved");

        assert_eq!(gauge.score, 60);
        assert_eq!(gauge.peak, 85);
        assert_eq!(gauge.min, 40);
        assert_eq!(gauge.samples, 3);
        assert!((gauge.average() - (40.0 + 85.0 + 60.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn frustration_trend_labels() {
        let mut gauge = FrustrationGauge::default();
        assert_eq!(gauge.trend(), "stable");
        gauge.record(20, "neutral", "");
        gauge.record(80, "angry", "");
        assert_eq!(gauge.trend(), "rising");

        let mut falling = FrustrationGauge::default();
        falling.record(80, "angry", "");
        falling.record(20, "neutral", "");
        assert_eq!(falling.trend(), "falling");
    }

    #[test]
    fn new_session_starts_waiting_in_ai_mode() {
        let state = SessionState::new("s1".into());
        assert_eq!(state.status, SessionStatus::Waiting);
        assert_eq!(state.mode, SessionMode::Ai);
        assert!(state.controller.is_none());
        assert_eq!(state.binding_state, BindingState::Connecting);
    }
}
