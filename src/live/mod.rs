//! AI streaming binding: one duplex connection to the upstream
//! conversational provider per session.
//!
//! ## Architecture
//!
//! ```text
//! session loop ─▸ send_audio/send_text ─▸ outbound loop ─▸ provider WS
//!                                                              │
//! session loop ◂── LiveEvent channel ◂── inbound loop ◂────────┘
//!                        (sentence assembly, debounce, filters)
//! ```
//!
//! The binding owns the provider-specific handshake, a pause/resume gate
//! consulted on both directions, and the transcript pipeline that turns
//! partial transcription chunks into finalized sentences. State machine:
//! `CONNECTING → READY → (PAUSED ↔ READY) → CLOSED`, with any state
//! jumping to `FAILED` on provider error. Reopen is never automatic.

pub mod gemini;
pub mod pipeline;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gemini::ProviderEvent;
use pipeline::{FinalizedInput, TranscriptPipeline};

/// Capacity of the inbound event channel toward the session loop.
const EVENT_QUEUE: usize = 256;

/// State of the AI binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    Connecting,
    Ready,
    Paused,
    Closed,
    Failed,
}

/// Finalized events the session loop consumes.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Synthesized audio chunk (PCM16LE 24 kHz mono).
    Audio { data: Vec<u8> },
    /// Finalized, cleaned AI sentence.
    AiSentence { text: String },
    /// Finalized caller utterance that survived both filters.
    CustomerUtterance { text: String },
    /// The model finished a response turn.
    TurnComplete,
    /// The model was interrupted by the caller.
    Interrupted,
    /// Provider-level failure; the binding is dead.
    Failed { message: String },
    /// The provider closed the connection.
    Closed,
}

/// Outbound traffic toward the provider.
#[derive(Debug)]
pub(crate) enum Outbound {
    Audio(Vec<u8>),
    Text(String),
    Close,
}

/// Connection parameters for one binding.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub connect_timeout: Duration,
    pub debounce: Duration,
    pub echo_window: Duration,
    pub audio_capacity: usize,
}

impl LiveConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.voice_model.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            debounce: Duration::from_millis(config.transcription_debounce_ms),
            echo_window: Duration::from_millis(config.echo_window_ms),
            audio_capacity: config.ai_outbox,
        }
    }
}

/// Handle to a live provider binding.
pub struct LiveBinding {
    out_tx: mpsc::Sender<Outbound>,
    paused: Arc<AtomicBool>,
    state: Arc<Mutex<BindingState>>,
    dropped_audio: Arc<AtomicU64>,
    session_id: String,
}

impl LiveBinding {
    /// Open the provider connection, perform the setup handshake, and
    /// spawn the outbound/inbound pumps.
    ///
    /// Returns the binding handle and the event stream for the session's
    /// AI receive pump. The whole handshake is bounded by
    /// `connect_timeout`; on timeout or handshake failure the binding
    /// never existed (the caller records FAILED).
    pub async fn connect(
        session_id: String,
        config: &LiveConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<LiveEvent>)> {
        let url = format!("{}?key={}", gemini::LIVE_WS_URL, config.api_key);

        tracing::info!(
            session_id = %session_id,
            model = %config.model,
            "Connecting AI binding"
        );

        let handshake = async {
            let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to provider: {e}"))?;

            let setup = gemini::build_setup_message(&config.model);
            let setup_json = serde_json::to_string(&setup)?;
            ws_stream
                .send(WsMessage::Text(setup_json))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to send setup message: {e}"))?;

            // Wait for setupComplete before splitting the stream. The
            // provider sends all messages as Binary frames, JSON included.
            while let Some(msg_result) = ws_stream.next().await {
                match msg_result {
                    Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            if text.contains("setupComplete") {
                                return Ok(ws_stream);
                            }
                        }
                    }
                    Ok(WsMessage::Text(text)) if text.contains("setupComplete") => {
                        return Ok(ws_stream);
                    }
                    Ok(WsMessage::Close(frame)) => {
                        anyhow::bail!("Connection closed before setupComplete: {frame:?}");
                    }
                    Err(e) => {
                        anyhow::bail!("WebSocket error before setupComplete: {e}");
                    }
                    _ => {}
                }
            }
            anyhow::bail!("Stream ended before setupComplete")
        };

        let ws_stream = match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!(
                "Provider setup timeout ({} ms)",
                config.connect_timeout.as_millis()
            ),
        };

        tracing::info!(session_id = %session_id, "AI binding ready");

        let (ws_sink, ws_source) = ws_stream.split();
        let state = Arc::new(Mutex::new(BindingState::Ready));
        let paused = Arc::new(AtomicBool::new(false));

        let (out_tx, out_rx) = mpsc::channel::<Outbound>(config.audio_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(EVENT_QUEUE);

        let sid_out = session_id.clone();
        let state_out = Arc::clone(&state);
        tokio::spawn(async move {
            outbound_loop(out_rx, ws_sink, state_out, sid_out).await;
        });

        let sid_in = session_id.clone();
        let state_in = Arc::clone(&state);
        let paused_in = Arc::clone(&paused);
        let transcripts = TranscriptPipeline::new(config.debounce, config.echo_window);
        tokio::spawn(async move {
            inbound_loop(ws_source, event_tx, state_in, paused_in, transcripts, sid_in).await;
        });

        Ok((
            Self {
                out_tx,
                paused,
                state,
                dropped_audio: Arc::new(AtomicU64::new(0)),
                session_id,
            },
            event_rx,
        ))
    }

    /// Forward a caller audio frame. Dropped silently while paused or
    /// not READY; dropped with a counter bump when the outbound queue is
    /// full.
    pub fn send_audio(&self, pcm: Vec<u8>) {
        if pcm.is_empty() || self.paused.load(Ordering::Acquire) {
            return;
        }
        if *self.state.lock() != BindingState::Ready {
            return;
        }
        if self.out_tx.try_send(Outbound::Audio(pcm)).is_err() {
            let dropped = self.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 50 == 1 {
                tracing::warn!(
                    session_id = %self.session_id,
                    dropped,
                    "AI outbound audio queue full, dropping frames"
                );
            }
        }
    }

    /// Inject a text turn (context injection, typed customer text).
    pub fn send_text(&self, text: &str) -> anyhow::Result<()> {
        if self.paused.load(Ordering::Acquire) {
            anyhow::bail!("Binding is paused");
        }
        if *self.state.lock() != BindingState::Ready {
            anyhow::bail!("Binding is not ready");
        }
        self.out_tx
            .try_send(Outbound::Text(text.to_string()))
            .map_err(|_| anyhow::anyhow!("AI outbound queue full"))
    }

    /// Gate off both audio directions without closing the connection.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if *state == BindingState::Ready {
            *state = BindingState::Paused;
        }
        tracing::debug!(session_id = %self.session_id, "AI binding paused");
    }

    /// Re-open the gate.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        let mut state = self.state.lock();
        if *state == BindingState::Paused {
            *state = BindingState::Ready;
        }
        tracing::debug!(session_id = %self.session_id, "AI binding resumed");
    }

    /// Terminal close. Idempotent.
    pub async fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close).await;
    }

    pub fn state(&self) -> BindingState {
        *self.state.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Outbound audio frames dropped due to a full queue.
    pub fn dropped_audio_frames(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    /// Binding with no provider behind it, for exercising the gate and
    /// queue behavior in tests.
    #[cfg(test)]
    pub(crate) fn stub(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                out_tx,
                paused: Arc::new(AtomicBool::new(false)),
                state: Arc::new(Mutex::new(BindingState::Ready)),
                dropped_audio: Arc::new(AtomicU64::new(0)),
                session_id: "test".into(),
            },
            out_rx,
        )
    }
}

// ── Outbound pump ──────────────────────────────────────────────────

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: WsSink,
    state: Arc<Mutex<BindingState>>,
    session_id: String,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg {
            Outbound::Audio(pcm) => serde_json::to_string(&gemini::build_audio_message(&pcm)),
            Outbound::Text(text) => serde_json::to_string(&gemini::build_text_message(&text)),
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let mut state = state.lock();
                if *state != BindingState::Failed {
                    *state = BindingState::Closed;
                }
                break;
            }
        };
        match frame {
            Ok(json) => {
                if sink.send(WsMessage::Text(json)).await.is_err() {
                    tracing::warn!(
                        session_id = %session_id,
                        "Provider send failed, closing outbound loop"
                    );
                    break;
                }
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to serialize provider message"
                );
            }
        }
    }
    tracing::debug!(session_id = %session_id, "AI outbound loop terminated");
}

// ── Inbound pump ───────────────────────────────────────────────────

async fn inbound_loop(
    mut source: WsSource,
    event_tx: mpsc::Sender<LiveEvent>,
    state: Arc<Mutex<BindingState>>,
    paused: Arc<AtomicBool>,
    mut transcripts: TranscriptPipeline,
    session_id: String,
) {
    loop {
        let deadline = transcripts
            .input_deadline()
            .map(tokio::time::Instant::from_std);
        let frame = tokio::select! {
            frame = source.next() => frame,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            }, if deadline.is_some() => {
                if let Some(finalized) = transcripts.finalize_due_input(Instant::now()) {
                    if !deliver_input(&event_tx, finalized, &session_id).await {
                        return;
                    }
                }
                continue;
            }
        };

        let Some(msg_result) = frame else { break };

        let events = match msg_result {
            Ok(WsMessage::Text(text)) => gemini::parse_server_message(&text),
            Ok(WsMessage::Binary(data)) => {
                if data.first() == Some(&b'{') {
                    match std::str::from_utf8(&data) {
                        Ok(text) => gemini::parse_server_message(text),
                        Err(_) => continue,
                    }
                } else {
                    // The provider sends all responses as JSON-in-Binary;
                    // anything else is unexpected.
                    tracing::warn!(
                        session_id = %session_id,
                        len = data.len(),
                        "Unexpected non-JSON binary frame from provider, skipping"
                    );
                    continue;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "Provider closed");
                {
                    let mut state = state.lock();
                    if *state != BindingState::Failed {
                        *state = BindingState::Closed;
                    }
                }
                let _ = event_tx.send(LiveEvent::Closed).await;
                break;
            }
            Ok(_) => continue, // ping/pong handled by tungstenite
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Provider WebSocket error");
                *state.lock() = BindingState::Failed;
                let _ = event_tx
                    .send(LiveEvent::Failed {
                        message: format!("WebSocket error: {e}"),
                    })
                    .await;
                break;
            }
        };

        let now = Instant::now();
        let (live_events, failed) =
            translate_events(events, &mut transcripts, &paused, &session_id, now);

        if failed {
            *state.lock() = BindingState::Failed;
        }
        for event in live_events {
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Session gone, closing inbound loop");
                return;
            }
        }
        if failed {
            break;
        }
    }

    tracing::debug!(session_id = %session_id, "AI inbound loop terminated");
}

async fn deliver_input(
    event_tx: &mpsc::Sender<LiveEvent>,
    finalized: FinalizedInput,
    session_id: &str,
) -> bool {
    match finalized {
        FinalizedInput::Accepted(text) => event_tx
            .send(LiveEvent::CustomerUtterance { text })
            .await
            .is_ok(),
        FinalizedInput::Rejected { text, reason } => {
            tracing::debug!(
                session_id = %session_id,
                reason = ?reason,
                text = %text,
                "Input transcript rejected"
            );
            true
        }
    }
}

/// Map parsed provider events onto finalized [`LiveEvent`]s.
///
/// Pure of any socket so the routing rules are testable: audio is
/// gated by `paused`, transcription chunks feed the pipeline, and
/// `turnComplete` flushes both directions. Returns the events to emit
/// and whether a provider error made the binding FAILED.
fn translate_events(
    events: Vec<ProviderEvent>,
    transcripts: &mut TranscriptPipeline,
    paused: &AtomicBool,
    session_id: &str,
    now: Instant,
) -> (Vec<LiveEvent>, bool) {
    let mut out = Vec::new();
    let mut failed = false;

    for event in events {
        match event {
            ProviderEvent::SetupComplete => {}
            ProviderEvent::Audio { data } => {
                if paused.load(Ordering::Acquire) {
                    tracing::trace!(session_id, "Dropping provider audio while paused");
                } else {
                    out.push(LiveEvent::Audio { data });
                }
            }
            ProviderEvent::OutputTranscript { text } => {
                for sentence in transcripts.push_output_chunk(&text, now) {
                    out.push(LiveEvent::AiSentence { text: sentence });
                }
            }
            ProviderEvent::InputTranscript { text } => {
                transcripts.push_input_chunk(&text, now);
            }
            ProviderEvent::TurnComplete => {
                let (sentences, input) = transcripts.flush_turn(now);
                for sentence in sentences {
                    out.push(LiveEvent::AiSentence { text: sentence });
                }
                if let Some(finalized) = input {
                    match finalized {
                        FinalizedInput::Accepted(text) => {
                            out.push(LiveEvent::CustomerUtterance { text });
                        }
                        FinalizedInput::Rejected { text, reason } => {
                            tracing::debug!(
                                session_id,
                                reason = ?reason,
                                text = %text,
                                "Input transcript rejected"
                            );
                        }
                    }
                }
                out.push(LiveEvent::TurnComplete);
            }
            ProviderEvent::Interrupted => {
                transcripts.clear_output();
                out.push(LiveEvent::Interrupted);
            }
            ProviderEvent::Error { message } => {
                failed = true;
                out.push(LiveEvent::Failed { message });
            }
        }
    }

    (out, failed)
}

// ── Tests ──────────────────────────────────────────────────────────
