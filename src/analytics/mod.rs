//! Best-effort analytics orchestration.
//!
//! The dispatcher launches sentiment / analysis / coaching tasks on
//! every finalized customer utterance (and injected context) without
//! ever blocking the voice path:
//!
//! - at most one task of each kind in flight per session;
//! - a new trigger while one is in flight replaces the pending request
//!   (latest wins — the older unstarted one is dropped, the in-flight
//!   one completes);
//! - failures are swallowed; conversation analysis falls back to the
//!   deterministic keyword classifier;
//! - results are posted back to the session loop as messages and may
//!   arrive after a mode switch — they still apply.

pub mod client;
pub mod intent;

pub use client::{
    AnalyticsBackend, CallSummary, CoachingAdvice, ConversationAnalysis, GeminiAnalytics,
    SentimentResult,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::session::TranscriptEntry;

// ── Task kinds and requests ────────────────────────────────────────

/// The three analytics task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsKind {
    Sentiment = 0,
    Analysis = 1,
    Coaching = 2,
}

/// A captured analytics request (inputs cloned at trigger time).
#[derive(Debug, Clone)]
pub enum AnalyticsRequest {
    Sentiment {
        latest: String,
        recent: Vec<TranscriptEntry>,
    },
    Analysis {
        transcript: Vec<TranscriptEntry>,
    },
    Coaching {
        latest: String,
        recent: Vec<TranscriptEntry>,
    },
}

impl AnalyticsRequest {
    pub fn kind(&self) -> AnalyticsKind {
        match self {
            Self::Sentiment { .. } => AnalyticsKind::Sentiment,
            Self::Analysis { .. } => AnalyticsKind::Analysis,
            Self::Coaching { .. } => AnalyticsKind::Coaching,
        }
    }
}

/// Result message posted back to the session loop.
#[derive(Debug, Clone)]
pub enum AnalyticsOutcome {
    Sentiment(SentimentResult),
    Analysis(ConversationAnalysis),
    Coaching(CoachingAdvice),
    /// The task failed with no usable fallback; bookkeeping only.
    Failed(AnalyticsKind),
}

impl AnalyticsOutcome {
    pub fn kind(&self) -> AnalyticsKind {
        match self {
            Self::Sentiment(_) => AnalyticsKind::Sentiment,
            Self::Analysis(_) => AnalyticsKind::Analysis,
            Self::Coaching(_) => AnalyticsKind::Coaching,
            Self::Failed(kind) => *kind,
        }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

/// Per-session analytics task launcher with latest-wins replacement.
pub struct Dispatcher {
    backend: Arc<dyn AnalyticsBackend>,
    timeout: Duration,
    session_id: String,
    results: mpsc::Sender<AnalyticsOutcome>,
    inflight: [bool; 3],
    pending: [Option<AnalyticsRequest>; 3],
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn AnalyticsBackend>,
        timeout: Duration,
        session_id: String,
        results: mpsc::Sender<AnalyticsOutcome>,
    ) -> Self {
        Self {
            backend,
            timeout,
            session_id,
            results,
            inflight: [false; 3],
            pending: [None, None, None],
        }
    }

    /// Launch a task, or park it as the pending request if one of the
    /// same kind is already in flight.
    pub fn trigger(&mut self, request: AnalyticsRequest) {
        let slot = request.kind() as usize;
        if self.inflight[slot] {
            if self.pending[slot].is_some() {
                tracing::debug!(
                    session_id = %self.session_id,
                    kind = ?request.kind(),
                    "Replacing pending analytics request (latest wins)"
                );
            }
            self.pending[slot] = Some(request);
        } else {
            self.inflight[slot] = true;
            self.launch(request);
        }
    }

    /// Called by the session loop for every outcome; releases the slot
    /// and launches the parked request, if any.
    pub fn on_complete(&mut self, kind: AnalyticsKind) {
        let slot = kind as usize;
        self.inflight[slot] = false;
        if let Some(request) = self.pending[slot].take() {
            self.inflight[slot] = true;
            self.launch(request);
        }
    }

    /// In-flight task count (bounded by one per kind).
    pub fn inflight_count(&self) -> usize {
        self.inflight.iter().filter(|b| **b).count()
    }

    fn launch(&self, request: AnalyticsRequest) {
        let backend = Arc::clone(&self.backend);
        let results = self.results.clone();
        let timeout = self.timeout;
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let kind = request.kind();
            let outcome = match request {
                AnalyticsRequest::Sentiment { latest, recent } => {
                    match tokio::time::timeout(timeout, backend.sentiment(&latest, &recent)).await
                    {
                        Ok(Ok(result)) => AnalyticsOutcome::Sentiment(result),
                        Ok(Err(e)) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Sentiment task failed");
                            AnalyticsOutcome::Failed(kind)
                        }
                        Err(_) => {
                            tracing::warn!(session_id = %session_id, "Sentiment task timed out");
                            AnalyticsOutcome::Failed(kind)
                        }
                    }
                }
                AnalyticsRequest::Analysis { transcript } => {
                    match tokio::time::timeout(timeout, backend.analyze(&transcript)).await {
                        Ok(Ok(result)) => AnalyticsOutcome::Analysis(result),
                        failure => {
                            match failure {
                                Ok(Err(e)) => tracing::warn!(
                                    session_id = %session_id,
                                    error = %e,
                                    "Analysis task failed, using keyword fallback"
                                ),
                                _ => tracing::warn!(
                                    session_id = %session_id,
                                    "Analysis task timed out, using keyword fallback"
                                ),
                            }
                            if transcript.is_empty() {
                                AnalyticsOutcome::Failed(kind)
                            } else {
                                let text = client::concat_content(&transcript);
                                AnalyticsOutcome::Analysis(ConversationAnalysis::fallback(&text))
                            }
                        }
                    }
                }
                AnalyticsRequest::Coaching { latest, recent } => {
                    match tokio::time::timeout(timeout, backend.coaching(&latest, &recent)).await {
                        Ok(Ok(result)) => AnalyticsOutcome::Coaching(result),
                        Ok(Err(e)) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Coaching task failed");
                            AnalyticsOutcome::Failed(kind)
                        }
                        Err(_) => {
                            tracing::warn!(session_id = %session_id, "Coaching task timed out");
                            AnalyticsOutcome::Failed(kind)
                        }
                    }
                }
            };

            // Session may already be gone; late results are discarded there.
            let _ = results.send(outcome).await;
        });
    }
}

// ── Ephemeral cache ────────────────────────────────────────────────

/// Latest analysis/coaching payloads per live session, for the control
/// surface. Entries vanish with the session.
#[derive(Default)]
pub struct AnalyticsCache {
    inner: Mutex<HashMap<String, CachedAnalytics>>,
}

#[derive(Debug, Clone, Default)]
pub struct CachedAnalytics {
    pub analysis: Option<ConversationAnalysis>,
    pub coaching: Option<CoachingAdvice>,
}

impl AnalyticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_analysis(&self, session_id: &str, analysis: ConversationAnalysis) {
        self.inner
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .analysis = Some(analysis);
    }

    pub fn put_coaching(&self, session_id: &str, coaching: CoachingAdvice) {
        self.inner
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .coaching = Some(coaching);
    }

    pub fn get(&self, session_id: &str) -> Option<CachedAnalytics> {
        self.inner.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
    }
}

// ── Tests ──────────────────────────────────────────────────────────
