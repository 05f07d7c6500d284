//! Process-wide session index and command dispatch.
//!
//! The manager owns the map of live sessions and nothing else: each
//! session's state lives inside its loop, reached only by messages.
//! Attachment records hold the session id, never a back-pointer; when a
//! loop terminates, a reaper task removes its entry so an ended session
//! is observationally `sessionNotFound`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::runner::{
    spawn, Command, CommandError, CommandResult, SessionDeps, SessionHandle, SessionInput,
};
use super::{SessionSnapshot, TranscriptEntry};
use crate::transport::Outbox;

/// Why a customer attach was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// The session already has a live customer transport.
    AlreadyActive,
}

pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    deps: SessionDeps,
}

impl SessionManager {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            deps,
        })
    }

    /// Create a session for an attaching customer and start its loop.
    ///
    /// An unknown (or absent) id creates a fresh session; a known id is
    /// refused — one live customer per session, and ended sessions do
    /// not resume.
    pub fn attach_customer(
        &self,
        requested_id: Option<String>,
        customer: Outbox,
    ) -> Result<SessionHandle, AttachError> {
        let id = requested_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(AttachError::AlreadyActive);
        }

        let (handle, join) = spawn(id.clone(), customer, self.deps.clone());
        sessions.insert(id.clone(), handle.clone());
        drop(sessions);

        // Reaper: drop the index entry the moment the loop is done.
        let sessions = Arc::clone(&self.sessions);
        let reaper_id = id;
        tokio::spawn(async move {
            let _ = join.await;
            sessions.lock().remove(&reaper_id);
            tracing::debug!(session_id = %reaper_id, "Session released");
        });

        Ok(handle)
    }

    fn handle_of(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Route a supervisor command to its session loop and wait for the
    /// direct reply.
    pub async fn command(&self, session_id: &str, command: Command) -> CommandResult {
        let Some(handle) = self.handle_of(session_id) else {
            return Err(CommandError::SessionNotFound);
        };

        let (reply, done) = oneshot::channel();
        if handle
            .input
            .send(SessionInput::Command { command, reply })
            .await
            .is_err()
        {
            // Loop already gone: the session ended under us.
            return Err(CommandError::SessionNotFound);
        }
        done.await.unwrap_or(Err(CommandError::SessionNotFound))
    }

    /// Snapshot of one session, served by its loop.
    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let handle = self.handle_of(session_id)?;
        let (reply, done) = oneshot::channel();
        handle.input.send(SessionInput::Snapshot(reply)).await.ok()?;
        done.await.ok()
    }

    /// Snapshots of every live session.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, done) = oneshot::channel();
            if handle.input.send(SessionInput::Snapshot(reply)).await.is_ok() {
                if let Ok(snapshot) = done.await {
                    out.push(snapshot);
                }
            }
        }
        out
    }

    /// Ordered transcript of one session.
    pub async fn transcript(&self, session_id: &str) -> Option<Vec<TranscriptEntry>> {
        let handle = self.handle_of(session_id)?;
        let (reply, done) = oneshot::channel();
        handle
            .input
            .send(SessionInput::FullTranscript(reply))
            .await
            .ok()?;
        done.await.ok()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// A supervisor transport dropped: any session it controls hands
    /// back to the AI so the customer is never stranded.
    pub fn supervisor_dropped(&self, supervisor_id: &str) {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            let supervisor_id = supervisor_id.to_owned();
            tokio::spawn(async move {
                let (reply, done) = oneshot::channel();
                let command = Command::Handback {
                    supervisor_id: supervisor_id.clone(),
                    context: None,
                };
                if handle
                    .input
                    .send(SessionInput::Command { command, reply })
                    .await
                    .is_ok()
                {
                    // WrongMode / NotController replies are the common,
                    // uninteresting case.
                    if let Ok(Ok(_)) = done.await {
                        tracing::info!(
                            session_id = %handle.id,
                            supervisor_id = %supervisor_id,
                            "Auto-handback after controller disconnect"
                        );
                    }
                }
            });
        }
    }

    /// End every session (process shutdown). Summaries are persisted
    /// best-effort before the loops stop.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            let _ = handle.input.send(SessionInput::Shutdown).await;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AnalyticsCache, CallSummary, CoachingAdvice, ConversationAnalysis,
        SentimentResult};
    use crate::config::Config;
    use crate::fanout::{self, SupervisorRegistry};
    use crate::session::TranscriptEntry;
    use crate::store::{start_writer, SummaryStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullBackend;

    #[async_trait]
    impl crate::analytics::AnalyticsBackend for NullBackend {
        async fn sentiment(&self, _: &str, _: &[TranscriptEntry]) -> Result<SentimentResult> {
            anyhow::bail!("unused")
        }
        async fn analyze(&self, _: &[TranscriptEntry]) -> Result<ConversationAnalysis> {
            anyhow::bail!("unused")
        }
        async fn coaching(&self, _: &str, _: &[TranscriptEntry]) -> Result<CoachingAdvice> {
            anyhow::bail!("unused")
        }
        async fn summarize(&self, _: &[TranscriptEntry]) -> Result<CallSummary> {
            Ok(CallSummary::placeholder("", "stable"))
        }
    }

    fn manager() -> (Arc<SessionManager>, Arc<SummaryStore>) {
        let registry = Arc::new(SupervisorRegistry::new());
        let (fanout_handle, _join) = fanout::start(registry);
        let store = Arc::new(SummaryStore::open_in_memory().unwrap());
        let (writer, _writer_join) = start_writer(Arc::clone(&store), 16);

        let deps = SessionDeps {
            config: Arc::new(Config::for_tests()),
            fanout: fanout_handle,
            backend: Arc::new(NullBackend),
            cache: Arc::new(AnalyticsCache::new()),
            writer,
            connect_ai: false,
        };
        (SessionManager::new(deps), store)
    }

    async fn wait_for_removal(manager: &Arc<SessionManager>) {
        for _ in 0..50 {
            if manager.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session was never released");
    }

    #[tokio::test]
    async fn attach_creates_session_with_requested_id() {
        let (manager, _store) = manager();
        let (outbox, _rx) = Outbox::new(8);
        let handle = manager
            .attach_customer(Some("call-7".into()), outbox)
            .unwrap();
        assert_eq!(handle.id, "call-7");
        assert_eq!(manager.active_count(), 1);

        let snapshot = manager.snapshot("call-7").await.unwrap();
        assert!(snapshot.customer_connected);
    }

    #[tokio::test]
    async fn attach_generates_id_when_absent() {
        let (manager, _store) = manager();
        let (outbox, _rx) = Outbox::new(8);
        let handle = manager.attach_customer(None, outbox).unwrap();
        assert!(!handle.id.is_empty());
        assert!(manager.snapshot(&handle.id).await.is_some());
    }

    #[tokio::test]
    async fn second_customer_on_same_session_is_refused() {
        let (manager, _store) = manager();
        let (a, _rx_a) = Outbox::new(8);
        manager.attach_customer(Some("s1".into()), a).unwrap();

        let (b, _rx_b) = Outbox::new(8);
        assert_eq!(
            manager.attach_customer(Some("s1".into()), b).unwrap_err(),
            AttachError::AlreadyActive
        );
    }

    #[tokio::test]
    async fn command_on_unknown_session_is_not_found() {
        let (manager, _store) = manager();
        let result = manager.command("ghost", Command::EndCall).await;
        assert_eq!(result, Err(CommandError::SessionNotFound));
    }

    #[tokio::test]
    async fn end_call_releases_the_session() {
        let (manager, store) = manager();
        let (outbox, _rx) = Outbox::new(8);
        manager.attach_customer(Some("s1".into()), outbox).unwrap();

        manager.command("s1", Command::EndCall).await.unwrap();
        wait_for_removal(&manager).await;

        // Re-applying endCall: the session is gone.
        let again = manager.command("s1", Command::EndCall).await;
        assert_eq!(again, Err(CommandError::SessionNotFound));

        // Exactly one summary row despite any retries.
        assert!(store.fetch("s1").unwrap().is_some());
    }

    #[tokio::test]
    async fn customer_close_releases_the_session() {
        let (manager, _store) = manager();
        let (outbox, _rx) = Outbox::new(8);
        let handle = manager.attach_customer(Some("s1".into()), outbox).unwrap();

        handle
            .input
            .send(SessionInput::CustomerClosed(
                crate::transport::CloseReason::PeerGone,
            ))
            .await
            .unwrap();
        wait_for_removal(&manager).await;

        // The id is reusable for a brand-new session afterwards.
        let (outbox, _rx) = Outbox::new(8);
        assert!(manager.attach_customer(Some("s1".into()), outbox).is_ok());
    }

    #[tokio::test]
    async fn snapshots_cover_all_live_sessions() {
        let (manager, _store) = manager();
        for i in 0..3 {
            let (outbox, _rx) = Outbox::new(8);
            manager
                .attach_customer(Some(format!("s{i}")), outbox)
                .unwrap();
        }
        let snapshots = manager.snapshots().await;
        assert_eq!(snapshots.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_ends_everything() {
        let (manager, _store) = manager();
        for i in 0..2 {
            let (outbox, _rx) = Outbox::new(8);
            manager
                .attach_customer(Some(format!("s{i}")), outbox)
                .unwrap();
        }
        manager.shutdown().await;
        wait_for_removal(&manager).await;
    }
}
