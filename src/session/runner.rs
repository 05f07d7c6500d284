//! The per-session loop: single owner and single mutator of
//! [`SessionState`].
//!
//! Every producer — the customer receive pump, the AI binding's inbound
//! pump, supervisor commands, analytics results — sends tagged events
//! into this loop through bounded channels. The loop never blocks on
//! outbound I/O: it enqueues frames on per-peer outboxes and returns.
//!
//! ```text
//! customer pump ──┐
//! AI pump ────────┤                      ┌─▸ customer outbox
//! commands ───────┼─▸ session loop ──────┼─▸ controller outbox
//! analytics ──────┘    (owns state)      └─▸ fan-out
//! ```
//!
//! Routing rules, mode switches, analytics triggering, and end-of-call
//! teardown all live here, so ordering claims (takeover drops AI audio
//! before the acknowledgement, the ended update carries the highest
//! sequence number) hold by construction.

use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::analytics::{
    AnalyticsBackend, AnalyticsCache, AnalyticsOutcome, AnalyticsRequest, CallSummary, Dispatcher,
};
use crate::config::Config;
use crate::events::{AiResponseData, CustomerInbound, CustomerOutbound, SupervisorEvent};
use crate::fanout::Fanout;
use crate::live::{BindingState, LiveBinding, LiveConfig, LiveEvent};
use crate::session::{Controller, Role, SessionMode, SessionSnapshot, SessionState, SessionStatus,
    TranscriptEntry};
use crate::store::{SummaryRecord, SummaryWriter};
use crate::transport::{CloseReason, Outbox, SendError};

/// Capacity of the session input channel.
const INPUT_QUEUE: usize = 256;

/// Capacity of the analytics results channel.
const ANALYTICS_QUEUE: usize = 16;

/// Transcript entries handed to sentiment/coaching tasks.
const RECENT_CONTEXT: usize = 5;

// ── Inputs ─────────────────────────────────────────────────────────

/// Everything that can happen to a session.
pub enum SessionInput {
    /// Parsed wire message from the customer pump.
    CustomerFrame(CustomerInbound),
    /// The customer transport closed.
    CustomerClosed(CloseReason),
    /// The AI binding connect task settled.
    BindingConnected(anyhow::Result<(LiveBinding, mpsc::Receiver<LiveEvent>)>),
    /// Event from the AI inbound pump.
    Live(LiveEvent),
    /// Supervisor command with a direct reply channel.
    Command {
        command: Command,
        reply: oneshot::Sender<CommandResult>,
    },
    /// Serializable state view request.
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Ordered transcript copy request.
    FullTranscript(oneshot::Sender<Vec<TranscriptEntry>>),
    /// Process shutdown: end the call now.
    Shutdown,
}

/// Supervisor commands routed to one session.
pub enum Command {
    Takeover {
        supervisor_id: String,
        outbox: Outbox,
    },
    Handback {
        supervisor_id: String,
        context: Option<String>,
    },
    InjectContext {
        context: String,
    },
    SupervisorMessage {
        supervisor_id: String,
        content: String,
    },
    SupervisorAudio {
        supervisor_id: String,
        data: String,
    },
    EndCall,
}

/// Successful command acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAck {
    Done,
    ContextInjected,
}

/// Command rejection, reported back to the calling supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    SessionNotFound,
    WrongMode,
    AiNotReady,
    NotController,
    ContextInjectionFailed(String),
}

impl CommandError {
    pub fn message(&self) -> String {
        match self {
            Self::SessionNotFound => "sessionNotFound".into(),
            Self::WrongMode => "wrongMode".into(),
            Self::AiNotReady => "aiNotReady".into(),
            Self::NotController => "notController".into(),
            Self::ContextInjectionFailed(reason) => {
                format!("contextInjectionFailed: {reason}")
            }
        }
    }
}

pub type CommandResult = Result<CommandAck, CommandError>;

// ── Dependencies ───────────────────────────────────────────────────

/// Process-wide collaborators handed to every session loop.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<Config>,
    pub fanout: Fanout,
    pub backend: Arc<dyn AnalyticsBackend>,
    pub cache: Arc<AnalyticsCache>,
    pub writer: SummaryWriter,
    /// When false (tests), no provider connection is attempted; the
    /// binding arrives via [`SessionInput::BindingConnected`] if at all.
    pub connect_ai: bool,
}

/// Cheap handle the manager keeps per live session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: String,
    pub input: mpsc::Sender<SessionInput>,
}

// ── Spawn ──────────────────────────────────────────────────────────

/// Spawn a session loop for a freshly attached customer.
pub fn spawn(
    id: String,
    customer: Outbox,
    deps: SessionDeps,
) -> (SessionHandle, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::channel::<SessionInput>(INPUT_QUEUE);
    let (analytics_tx, analytics_rx) = mpsc::channel::<AnalyticsOutcome>(ANALYTICS_QUEUE);

    let dispatcher = Dispatcher::new(
        Arc::clone(&deps.backend),
        Duration::from_millis(deps.config.analytics_timeout_ms),
        id.clone(),
        analytics_tx,
    );

    if deps.connect_ai {
        let live_config = LiveConfig::from_config(&deps.config);
        let connect_tx = input_tx.clone();
        let connect_id = id.clone();
        tokio::spawn(async move {
            let result = LiveBinding::connect(connect_id, &live_config).await;
            let _ = connect_tx.send(SessionInput::BindingConnected(result)).await;
        });
    }

    let runner = Runner {
        state: SessionState::new(id.clone()),
        customer,
        binding: None,
        controller_outbox: None,
        dispatcher,
        deps,
        input_tx: input_tx.clone(),
        ending: false,
    };

    let join = tokio::spawn(runner.run(input_rx, analytics_rx));

    (SessionHandle { id, input: input_tx }, join)
}

// ── Runner ─────────────────────────────────────────────────────────

enum Flow {
    Continue,
    Stop,
}

struct Runner {
    state: SessionState,
    customer: Outbox,
    binding: Option<LiveBinding>,
    controller_outbox: Option<Outbox>,
    dispatcher: Dispatcher,
    deps: SessionDeps,
    input_tx: mpsc::Sender<SessionInput>,
    ending: bool,
}

impl Runner {
    async fn run(
        mut self,
        mut input_rx: mpsc::Receiver<SessionInput>,
        mut analytics_rx: mpsc::Receiver<AnalyticsOutcome>,
    ) {
        tracing::info!(session_id = %self.state.id, "Session started");

        // First frame the customer sees, before any media.
        self.send_to_customer(&CustomerOutbound::SessionInit {
            session_id: self.state.id.clone(),
            mode: self.state.mode,
        });
        // Announce the new session to every dashboard.
        self.broadcast_update();

        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(input) => {
                            if matches!(self.handle(input).await, Flow::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(outcome) = analytics_rx.recv() => {
                    self.handle_analytics(outcome);
                }
            }
        }

        tracing::info!(session_id = %self.state.id, "Session loop terminated");
    }

    // ── Input dispatch ────────────────────────────────────────────

    async fn handle(&mut self, input: SessionInput) -> Flow {
        match input {
            SessionInput::CustomerFrame(frame) => {
                self.handle_customer_frame(frame);
                Flow::Continue
            }
            SessionInput::CustomerClosed(reason) => {
                tracing::info!(
                    session_id = %self.state.id,
                    reason = reason.as_str(),
                    "Customer transport closed"
                );
                self.state.customer_connected = false;
                self.end_session("customerDisconnected", "The call has ended.")
                    .await;
                Flow::Stop
            }
            SessionInput::BindingConnected(result) => self.handle_binding_connected(result).await,
            SessionInput::Live(event) => self.handle_live(event).await,
            SessionInput::Command { command, reply } => {
                self.handle_command(command, reply).await
            }
            SessionInput::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
                Flow::Continue
            }
            SessionInput::FullTranscript(reply) => {
                let _ = reply.send(self.state.full_transcript());
                Flow::Continue
            }
            SessionInput::Shutdown => {
                self.end_session("serverShutdown", "The service is shutting down.")
                    .await;
                Flow::Stop
            }
        }
    }

    // ── Customer traffic (router rules 1–3) ───────────────────────

    fn handle_customer_frame(&mut self, frame: CustomerInbound) {
        match frame {
            CustomerInbound::Audio { data } => {
                if self.state.status == SessionStatus::Waiting {
                    self.state.status = SessionStatus::Active;
                    self.broadcast_update();
                }

                // HUMAN: the controller hears the caller, the AI does not.
                if self.state.mode == SessionMode::Human {
                    if let Some(controller) = &self.controller_outbox {
                        let seq = self.state.next_seq();
                        let event = SupervisorEvent::CustomerAudio {
                            session_id: self.state.id.clone(),
                            seq,
                            data,
                        };
                        if let Ok(frame) = serde_json::to_string(&event) {
                            controller.send_or_drop(frame);
                        }
                    }
                    return;
                }

                // AI mode: decode and forward. Frames arriving while the
                // binding is still CONNECTING are dropped.
                let Some(binding) = &self.binding else { return };
                match base64::engine::general_purpose::STANDARD.decode(&data) {
                    Ok(pcm) => binding.send_audio(pcm),
                    Err(e) => {
                        tracing::debug!(
                            session_id = %self.state.id,
                            error = %e,
                            "Discarding undecodable customer audio frame"
                        );
                        self.send_to_customer(&CustomerOutbound::Error {
                            message: "Unreadable audio frame".into(),
                        });
                    }
                }
            }
            CustomerInbound::Text { content } => {
                let entry = self.state.append(Role::Customer, &content);
                self.deps.fanout.broadcast(SupervisorEvent::CustomerMessage {
                    session_id: self.state.id.clone(),
                    seq: entry.seq,
                    content: content.clone(),
                });
                if self.state.mode == SessionMode::Ai {
                    if let Some(binding) = &self.binding {
                        if let Err(e) = binding.send_text(&content) {
                            tracing::debug!(
                                session_id = %self.state.id,
                                error = %e,
                                "Dropped customer text toward AI"
                            );
                        }
                    }
                }
                // HUMAN: the controller sees it through the broadcast.
            }
            CustomerInbound::Transcript { content } => {
                // Client-side caption: log it, never forward to the AI —
                // the AI already hears the audio.
                let entry = self.state.append(Role::Customer, &content);
                self.deps.fanout.broadcast(SupervisorEvent::CustomerMessage {
                    session_id: self.state.id.clone(),
                    seq: entry.seq,
                    content,
                });
            }
        }
    }

    // ── AI traffic (router rules 4–6) ─────────────────────────────

    async fn handle_live(&mut self, event: LiveEvent) -> Flow {
        match event {
            LiveEvent::Audio { data } => {
                // HUMAN mode drops AI audio at the router even if a frame
                // slipped out before the pause gate closed.
                if self.state.mode == SessionMode::Human {
                    return Flow::Continue;
                }
                let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                self.send_to_customer(&CustomerOutbound::Audio { data: encoded });
            }
            LiveEvent::AiSentence { text } => {
                let entry = self.state.append(Role::Ai, &text);
                self.deps.fanout.broadcast(SupervisorEvent::AiResponse {
                    session_id: self.state.id.clone(),
                    seq: entry.seq,
                    content: text.clone(),
                });
                if self.state.mode == SessionMode::Ai {
                    self.send_to_customer(&CustomerOutbound::AiResponse {
                        data: AiResponseData::text(text),
                    });
                }
            }
            LiveEvent::CustomerUtterance { text } => {
                let entry = self.state.append(Role::Customer, &text);
                self.deps.fanout.broadcast(SupervisorEvent::CustomerMessage {
                    session_id: self.state.id.clone(),
                    seq: entry.seq,
                    content: text.clone(),
                });
                self.send_to_customer(&CustomerOutbound::CustomerTranscription {
                    content: text.clone(),
                });
                self.trigger_analytics(&text);
            }
            LiveEvent::TurnComplete => {
                tracing::trace!(session_id = %self.state.id, "AI turn complete");
            }
            LiveEvent::Interrupted => {
                tracing::debug!(session_id = %self.state.id, "AI interrupted by caller");
            }
            LiveEvent::Failed { message } => {
                return self.handle_binding_failure(&message).await;
            }
            LiveEvent::Closed => {
                if !self.ending && self.state.mode == SessionMode::Ai {
                    return self.handle_binding_failure("provider closed connection").await;
                }
                self.binding = None;
                self.state.binding_state = BindingState::Closed;
            }
        }
        Flow::Continue
    }

    async fn handle_binding_failure(&mut self, message: &str) -> Flow {
        tracing::error!(session_id = %self.state.id, error = %message, "AI binding failed");
        self.binding = None;
        self.state.binding_state = BindingState::Failed;

        if self.state.mode == SessionMode::Human {
            // The human has the call; tell them the AI is gone and carry on.
            if let Some(controller) = &self.state.controller {
                self.deps.fanout.registry().send_to(
                    &controller.supervisor_id,
                    &SupervisorEvent::Error {
                        session_id: Some(self.state.id.clone()),
                        message: format!("AI binding failed: {message}"),
                    },
                );
            }
            self.broadcast_update();
            Flow::Continue
        } else {
            self.end_session("aiUnavailable", "The assistant is unavailable. Please call back.")
                .await;
            Flow::Stop
        }
    }

    async fn handle_binding_connected(
        &mut self,
        result: anyhow::Result<(LiveBinding, mpsc::Receiver<LiveEvent>)>,
    ) -> Flow {
        match result {
            Ok((binding, mut events)) => {
                if self.ending {
                    binding.close().await;
                    return Flow::Continue;
                }
                // Takeover may have happened while we were connecting.
                if self.state.mode == SessionMode::Human {
                    binding.pause();
                    self.state.binding_state = BindingState::Paused;
                } else {
                    self.state.binding_state = BindingState::Ready;
                }

                // AI receive pump: provider events → session loop.
                let pump_tx = self.input_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if pump_tx.send(SessionInput::Live(event)).await.is_err() {
                            break;
                        }
                    }
                });

                self.binding = Some(binding);
                self.broadcast_update();
                Flow::Continue
            }
            Err(e) => self.handle_binding_failure(&e.to_string()).await,
        }
    }

    // ── Supervisor commands (§4.7, router rules 7–9) ──────────────

    async fn handle_command(
        &mut self,
        command: Command,
        reply: oneshot::Sender<CommandResult>,
    ) -> Flow {
        match command {
            Command::Takeover {
                supervisor_id,
                outbox,
            } => {
                if self.state.status != SessionStatus::Active
                    || self.state.mode == SessionMode::Human
                {
                    let _ = reply.send(Err(CommandError::WrongMode));
                    return Flow::Continue;
                }

                // From this point the router drops AI audio toward the
                // customer; the acknowledgement goes out afterwards.
                self.state.mode = SessionMode::Human;
                self.state.controller = Some(Controller {
                    supervisor_id: supervisor_id.clone(),
                    taken_over_at: Utc::now(),
                    taken_over_instant: Instant::now(),
                });
                self.state.last_controller_id = Some(supervisor_id.clone());
                self.controller_outbox = Some(outbox);
                self.state.interventions += 1;
                if let Some(binding) = &self.binding {
                    binding.pause();
                }
                if self.state.binding_state == BindingState::Ready {
                    self.state.binding_state = BindingState::Paused;
                }

                self.send_to_customer(&CustomerOutbound::ModeChange {
                    mode: SessionMode::Human,
                    message: "A support specialist has joined the call.".into(),
                });
                self.broadcast_update();
                let _ = reply.send(Ok(CommandAck::Done));

                tracing::info!(
                    session_id = %self.state.id,
                    supervisor_id = %supervisor_id,
                    "Supervisor took over"
                );
            }

            Command::Handback {
                supervisor_id,
                context,
            } => {
                if self.state.mode != SessionMode::Human {
                    let _ = reply.send(Err(CommandError::WrongMode));
                    return Flow::Continue;
                }
                if !self.is_controller(&supervisor_id) {
                    let _ = reply.send(Err(CommandError::NotController));
                    return Flow::Continue;
                }

                self.release_controller();
                self.state.mode = SessionMode::Ai;

                let Some(binding) = &self.binding else {
                    // Handing back onto a dead binding ends the call.
                    let _ = reply.send(Ok(CommandAck::Done));
                    self.end_session(
                        "aiUnavailable",
                        "The assistant is unavailable. Please call back.",
                    )
                    .await;
                    return Flow::Stop;
                };

                binding.resume();
                self.state.binding_state = BindingState::Ready;
                if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
                    if let Err(e) =
                        binding.send_text(&crate::live::gemini::context_prompt(&context))
                    {
                        tracing::warn!(
                            session_id = %self.state.id,
                            error = %e,
                            "Handback context dropped"
                        );
                    }
                }

                self.send_to_customer(&CustomerOutbound::ModeChange {
                    mode: SessionMode::Ai,
                    message: "You are back with the automated assistant.".into(),
                });
                self.broadcast_update();
                let _ = reply.send(Ok(CommandAck::Done));

                tracing::info!(
                    session_id = %self.state.id,
                    supervisor_id = %supervisor_id,
                    "Supervisor handed back to AI"
                );
            }

            Command::InjectContext { context } => {
                if self.state.mode != SessionMode::Ai {
                    let _ = reply.send(Err(CommandError::WrongMode));
                    return Flow::Continue;
                }
                let ready = self
                    .binding
                    .as_ref()
                    .is_some_and(|b| b.state() == BindingState::Ready);
                if !ready {
                    let _ = reply.send(Err(CommandError::AiNotReady));
                    return Flow::Continue;
                }

                // Treated as a user turn for transcript and analytics.
                let entry = self.state.append(Role::Customer, &context);
                self.deps.fanout.broadcast(SupervisorEvent::CustomerMessage {
                    session_id: self.state.id.clone(),
                    seq: entry.seq,
                    content: context.clone(),
                });

                let send = match self.binding.as_ref() {
                    Some(binding) => {
                        binding.send_text(&crate::live::gemini::context_prompt(&context))
                    }
                    None => Err(anyhow::anyhow!("binding is gone")),
                };
                match send {
                    Ok(()) => {
                        self.trigger_analytics(&context);
                        let _ = reply.send(Ok(CommandAck::ContextInjected));
                    }
                    Err(e) => {
                        let _ = reply
                            .send(Err(CommandError::ContextInjectionFailed(e.to_string())));
                    }
                }
            }

            Command::SupervisorMessage {
                supervisor_id,
                content,
            } => {
                if self.state.mode != SessionMode::Human {
                    let _ = reply.send(Err(CommandError::WrongMode));
                    return Flow::Continue;
                }
                if !self.is_controller(&supervisor_id) {
                    let _ = reply.send(Err(CommandError::NotController));
                    return Flow::Continue;
                }
                self.state.append(Role::Supervisor, &content);
                self.send_to_customer(&CustomerOutbound::SupervisorMessage { content });
                self.broadcast_update();
                let _ = reply.send(Ok(CommandAck::Done));
            }

            Command::SupervisorAudio {
                supervisor_id,
                data,
            } => {
                if self.state.mode != SessionMode::Human {
                    let _ = reply.send(Err(CommandError::WrongMode));
                    return Flow::Continue;
                }
                if !self.is_controller(&supervisor_id) {
                    let _ = reply.send(Err(CommandError::NotController));
                    return Flow::Continue;
                }
                self.send_to_customer(&CustomerOutbound::Audio { data });
                let _ = reply.send(Ok(CommandAck::Done));
            }

            Command::EndCall => {
                self.end_session("endedBySupervisor", "The call has been ended.")
                    .await;
                // Acknowledged only after status is ENDED and the summary
                // write settled.
                let _ = reply.send(Ok(CommandAck::Done));
                return Flow::Stop;
            }
        }

        if self.ending {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn is_controller(&self, supervisor_id: &str) -> bool {
        self.state
            .controller
            .as_ref()
            .is_some_and(|c| c.supervisor_id == supervisor_id)
    }

    /// Clear the controller, folding its hold time into the total.
    fn release_controller(&mut self) {
        if let Some(controller) = self.state.controller.take() {
            self.state.takeover_total += controller.taken_over_instant.elapsed();
        }
        self.controller_outbox = None;
    }

    // ── Analytics ─────────────────────────────────────────────────

    fn trigger_analytics(&mut self, latest: &str) {
        let recent = self.state.recent_transcript(RECENT_CONTEXT);
        self.dispatcher.trigger(AnalyticsRequest::Sentiment {
            latest: latest.to_owned(),
            recent: recent.clone(),
        });
        self.dispatcher.trigger(AnalyticsRequest::Analysis {
            transcript: self.state.full_transcript(),
        });
        self.dispatcher.trigger(AnalyticsRequest::Coaching {
            latest: latest.to_owned(),
            recent,
        });
    }

    fn handle_analytics(&mut self, outcome: AnalyticsOutcome) {
        self.dispatcher.on_complete(outcome.kind());

        // Results may land after a mode switch; they still apply.
        match outcome {
            AnalyticsOutcome::Sentiment(result) => {
                self.state
                    .frustration
                    .record(result.score, &result.sentiment, &result.reason);
                let seq = self.state.next_seq();
                self.deps.fanout.broadcast(SupervisorEvent::FrustrationUpdate {
                    session_id: self.state.id.clone(),
                    seq,
                    score: result.score,
                    sentiment: result.sentiment.clone(),
                    reason: result.reason.clone(),
                });

                if result.escalates(self.deps.config.escalation_threshold) {
                    self.state.escalations.push(result.reason.clone());
                    let seq = self.state.next_seq();
                    self.deps.fanout.broadcast(SupervisorEvent::EscalationAlert {
                        session_id: self.state.id.clone(),
                        seq,
                        score: result.score,
                        reason: result.reason,
                    });
                }
            }
            AnalyticsOutcome::Analysis(analysis) => {
                self.deps.cache.put_analysis(&self.state.id, analysis.clone());
                let seq = self.state.next_seq();
                self.deps.fanout.broadcast(SupervisorEvent::AnalyticsUpdate {
                    session_id: self.state.id.clone(),
                    seq,
                    analysis,
                });
            }
            AnalyticsOutcome::Coaching(coaching) => {
                self.deps.cache.put_coaching(&self.state.id, coaching.clone());
                let seq = self.state.next_seq();
                self.deps.fanout.broadcast(SupervisorEvent::CoachingUpdate {
                    session_id: self.state.id.clone(),
                    seq,
                    coaching,
                });
            }
            AnalyticsOutcome::Failed(kind) => {
                tracing::debug!(session_id = %self.state.id, kind = ?kind, "Analytics task yielded nothing");
            }
        }
    }

    // ── Outbound helpers ──────────────────────────────────────────

    /// Enqueue a frame for the customer. A full customer outbox ends the
    /// session (`customerCongested`).
    fn send_to_customer(&mut self, msg: &CustomerOutbound) {
        let frame = match serde_json::to_string(msg) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(session_id = %self.state.id, error = %e, "Customer frame serialization failed");
                return;
            }
        };
        match self.customer.send(frame) {
            Ok(()) => {}
            Err(SendError::Slow) => {
                tracing::warn!(session_id = %self.state.id, "Customer outbox full, ending session");
                self.ending_due_to_congestion();
            }
            Err(SendError::Gone) => {
                self.state.customer_connected = false;
            }
        }
    }

    /// Congestion is terminal: mark the session ending; the caller of
    /// the current handler finishes teardown via [`Self::end_session`].
    fn ending_due_to_congestion(&mut self) {
        if !self.ending {
            // end_session is async; flag it and let the loop's next
            // action be the teardown.
            let tx = self.input_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(SessionInput::CustomerClosed(CloseReason::Congested)).await;
            });
            self.customer.close();
        }
    }

    fn broadcast_update(&mut self) {
        let seq = self.state.next_seq();
        self.deps.fanout.broadcast(SupervisorEvent::SessionUpdate {
            session_id: self.state.id.clone(),
            seq,
            session: self.state.snapshot(),
        });
    }

    // ── Teardown ──────────────────────────────────────────────────

    async fn end_session(&mut self, reason: &str, customer_message: &str) {
        if self.ending {
            return;
        }
        self.ending = true;

        tracing::info!(session_id = %self.state.id, reason, "Ending session");

        self.release_controller();
        self.state.status = SessionStatus::Ended;
        self.state.ended_at = Some(Utc::now());

        // Customer first: terminal notification, then close the outbox
        // (queued frames drain within the pump's window).
        if self.state.customer_connected {
            let frame = serde_json::to_string(&CustomerOutbound::SessionEnded {
                message: customer_message.to_owned(),
            });
            if let Ok(frame) = frame {
                let _ = self.customer.send(frame);
            }
        }
        self.customer.close();

        if let Some(binding) = self.binding.take() {
            binding.close().await;
            if self.state.binding_state != BindingState::Failed {
                self.state.binding_state = BindingState::Closed;
            }
        }

        // Best-effort summary, then persist before the final broadcast.
        let summary = self.compute_summary().await;
        let record = self.build_record(summary);
        if let Err(e) = self.deps.writer.persist(record).await {
            tracing::error!(session_id = %self.state.id, error = %e, "Summary persistence failed");
        }

        self.deps.cache.remove(&self.state.id);

        let seq = self.state.next_seq();
        self.deps.fanout.broadcast(SupervisorEvent::SessionEnded {
            session_id: self.state.id.clone(),
            seq,
            reason: reason.to_owned(),
        });
        // The ended update is the last event for this session: nothing
        // may carry a higher sequence number.
        self.broadcast_update();
    }

    async fn compute_summary(&self) -> CallSummary {
        let transcript = self.state.full_transcript();
        if transcript.is_empty() {
            return CallSummary::placeholder("", self.state.frustration.trend());
        }
        let timeout = Duration::from_millis(self.deps.config.analytics_timeout_ms);
        match tokio::time::timeout(timeout, self.deps.backend.summarize(&transcript)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.state.id, error = %e, "Summary collaborator failed");
                CallSummary::placeholder(
                    &crate::analytics::client::concat_content(&transcript),
                    self.state.frustration.trend(),
                )
            }
            Err(_) => {
                tracing::warn!(session_id = %self.state.id, "Summary collaborator timed out");
                CallSummary::placeholder(
                    &crate::analytics::client::concat_content(&transcript),
                    self.state.frustration.trend(),
                )
            }
        }
    }

    fn build_record(&self, summary: CallSummary) -> SummaryRecord {
        let ended_at = self.state.ended_at.unwrap_or_else(Utc::now);
        SummaryRecord {
            session_id: self.state.id.clone(),
            created_at: self.state.created_at,
            ended_at,
            duration_ms: (ended_at - self.state.created_at).num_milliseconds(),
            sentiment: summary.sentiment,
            intent: summary.intent,
            resolution_status: summary.resolution_status,
            key_topics: summary.key_topics,
            action_items: summary.action_items,
            frustration_avg: self.state.frustration.average(),
            frustration_max: self.state.frustration.peak,
            frustration_trend: summary.frustration_trend,
            escalation_count: self.state.escalations.len() as u32,
            escalation_alerts: self.state.escalations.clone(),
            supervisor_interventions: self.state.interventions,
            supervisor_id: self.state.last_controller_id.clone(),
            supervisor_takeover_ms: self.state.takeover_total.as_millis() as i64,
            full_summary: summary.full_text,
            insights: summary.insights,
            transcript: self.state.full_transcript(),
            first_message_at: self.state.first_message_at,
            last_message_at: self.state.last_message_at,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
