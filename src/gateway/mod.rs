//! Axum gateway: the WebSocket listener for customers and supervisors
//! plus the HTTP control surface the dashboards poll.
//!
//! The gateway owns sockets and nothing else. Each connection gets an
//! [`Outbox`] and a send pump; inbound frames are decoded into the wire
//! unions and forwarded as messages — to the session loop (customer) or
//! through the session manager (supervisor commands). Unparseable
//! frames draw an `error` reply; more than a handful in a short window
//! closes the peer.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::analytics::{AnalyticsBackend, AnalyticsCache, ConversationAnalysis};
use crate::config::Config;
use crate::events::{CustomerInbound, CustomerOutbound, SupervisorEvent, SupervisorInbound};
use crate::fanout::SupervisorRegistry;
use crate::session::manager::{AttachError, SessionManager};
use crate::session::runner::{Command, CommandAck, SessionInput};
use crate::store::{SummaryQuery, SummaryStore};
use crate::transport::{send_pump, CloseReason, Outbox};

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;

/// HTTP request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Protocol violations tolerated inside [`VIOLATION_WINDOW`] before the
/// peer is closed.
const MAX_VIOLATIONS: usize = 5;
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

// ── Shared state ───────────────────────────────────────────────────

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub registry: Arc<SupervisorRegistry>,
    pub store: Arc<SummaryStore>,
    pub backend: Arc<dyn AnalyticsBackend>,
    pub cache: Arc<AnalyticsCache>,
}

impl AppState {
    fn analytics_timeout(&self) -> Duration {
        Duration::from_millis(self.config.analytics_timeout_ms)
    }

    fn drain(&self) -> Duration {
        Duration::from_millis(self.config.drain_ms)
    }
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/customer", get(handle_customer_ws))
        .route("/ws/supervisor", get(handle_supervisor_ws))
        .route("/sessions", get(handle_sessions_list))
        .route("/sessions/{id}", get(handle_session_detail))
        .route("/summaries", get(handle_summaries))
        .route("/summary/{id}", get(handle_summary_detail))
        .route("/coaching", post(handle_coaching))
        .route("/analyze", post(handle_analyze))
        .route("/summary", post(handle_summary_generate))
        .route("/health", get(handle_health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind and serve until ctrl-c; sessions are ended (with summaries)
/// before the listener stops.
pub async fn run(state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let display_addr = listener.local_addr()?;

    println!("🎧 switchboard listening on http://{display_addr}");
    println!("  WS   /ws/customer    — customer audio stream");
    println!("  WS   /ws/supervisor  — supervisor dashboard");
    println!("  GET  /sessions       — live session snapshots");
    println!("  GET  /sessions/{{id}}  — snapshot + transcript");
    println!("  GET  /summaries      — historical summaries + stats");
    println!("  GET  /summary/{{id}}   — one historical summary");
    println!("  POST /coaching       — coaching advice for a live session");
    println!("  POST /analyze        — conversation analysis for a live session");
    println!("  POST /summary        — generate a summary on demand");
    println!("  GET  /health         — health check");

    let manager = Arc::clone(&state.manager);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received, ending sessions");
            manager.shutdown().await;
        })
        .await?;
    Ok(())
}

// ── Protocol-violation window ──────────────────────────────────────

/// Sliding window of recent unparseable frames from one peer.
struct ViolationWindow {
    times: VecDeque<Instant>,
}

impl ViolationWindow {
    fn new() -> Self {
        Self {
            times: VecDeque::new(),
        }
    }

    /// Record a violation; returns true when the peer should be closed.
    fn record(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) > VIOLATION_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.push_back(now);
        self.times.len() > MAX_VIOLATIONS
    }
}

// ── Customer WebSocket ─────────────────────────────────────────────

/// GET /ws/customer — WebSocket upgrade for the caller's audio stream.
///
/// ## Protocol
///
/// 1. Client connects, optionally with `?sessionId=<id>`
/// 2. Server sends `{"type":"sessionInit","sessionId":...,"mode":"ai"}`
/// 3. Client streams `{"type":"audio","data":<base64 pcm16@16k>}`
/// 4. Server streams audio/transcript/mode frames per the wire schema
async fn handle_customer_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let requested = params.get("sessionId").cloned();
    ws.on_upgrade(move |socket| customer_connection(state, socket, requested))
}

async fn customer_connection(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
    requested_id: Option<String>,
) {
    use axum::extract::ws::Message;

    let (sink, mut stream) = socket.split();
    let (outbox, outbox_rx) = Outbox::new(state.config.customer_outbox);
    let drain = state.drain();
    tokio::spawn(async move {
        send_pump(sink, outbox_rx, drain, "customer").await;
    });

    let handle = match state.manager.attach_customer(requested_id, outbox.clone()) {
        Ok(handle) => handle,
        Err(AttachError::AlreadyActive) => {
            let frame = serde_json::to_string(&CustomerOutbound::Error {
                message: "Session already has an active customer".into(),
            })
            .unwrap_or_default();
            let _ = outbox.send(frame);
            outbox.close();
            return;
        }
    };
    let session_id = handle.id.clone();
    tracing::info!(session_id = %session_id, "Customer connected");

    let mut violations = ViolationWindow::new();
    let mut close_reason = CloseReason::PeerGone;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<CustomerInbound>(&text) {
                Ok(frame) => {
                    if handle
                        .input
                        .send(SessionInput::CustomerFrame(frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Bad customer frame");
                    let _ = outbox.send(
                        serde_json::to_string(&CustomerOutbound::Error {
                            message: format!("Unrecognized message: {e}"),
                        })
                        .unwrap_or_default(),
                    );
                    if violations.record() {
                        close_reason = CloseReason::ProtocolViolation;
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = handle
        .input
        .send(SessionInput::CustomerClosed(close_reason))
        .await;
    tracing::info!(session_id = %session_id, reason = close_reason.as_str(), "Customer disconnected");
}

// ── Supervisor WebSocket ───────────────────────────────────────────

/// GET /ws/supervisor — WebSocket upgrade for a dashboard.
///
/// On attach the server sends a `sessionsList` snapshot; afterwards the
/// connection receives the session event fan-out and may issue the
/// commands of the wire schema.
async fn handle_supervisor_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let supervisor_id = params
        .get("supervisorId")
        .filter(|id| !id.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| format!("sup-{}", Uuid::new_v4()));
    ws.on_upgrade(move |socket| supervisor_connection(state, socket, supervisor_id))
}

async fn supervisor_connection(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
    supervisor_id: String,
) {
    use axum::extract::ws::Message;

    let (sink, mut stream) = socket.split();
    let (outbox, outbox_rx) = Outbox::new(state.config.supervisor_outbox);
    let drain = state.drain();
    tokio::spawn(async move {
        send_pump(sink, outbox_rx, drain, "supervisor").await;
    });

    state.registry.attach(&supervisor_id, outbox.clone());

    // Synchronous snapshot of everything currently live.
    let sessions = state.manager.snapshots().await;
    if let Ok(frame) = serde_json::to_string(&SupervisorEvent::SessionsList { sessions }) {
        let _ = outbox.send(frame);
    }

    let mut violations = ViolationWindow::new();

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<SupervisorInbound>(&text) {
                Ok(command) => {
                    dispatch_supervisor_command(&state, &supervisor_id, &outbox, command).await;
                }
                Err(e) => {
                    tracing::debug!(supervisor_id = %supervisor_id, error = %e, "Bad supervisor frame");
                    send_supervisor_event(
                        &outbox,
                        &SupervisorEvent::Error {
                            session_id: None,
                            message: format!("Unrecognized command: {e}"),
                        },
                    );
                    if violations.record() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.detach(&supervisor_id);
    // If this supervisor controlled a session, hand it back to the AI.
    state.manager.supervisor_dropped(&supervisor_id);
    tracing::info!(supervisor_id = %supervisor_id, "Supervisor disconnected");
}

fn send_supervisor_event(outbox: &Outbox, event: &SupervisorEvent) {
    if let Ok(frame) = serde_json::to_string(event) {
        outbox.send_or_drop(frame);
    }
}

/// Translate a wire command into a session command, routing the direct
/// reply (acknowledgement or error) back onto this supervisor's outbox.
async fn dispatch_supervisor_command(
    state: &AppState,
    supervisor_id: &str,
    outbox: &Outbox,
    command: SupervisorInbound,
) {
    let (session_id, result) = match command {
        SupervisorInbound::GetSessions => {
            let sessions = state.manager.snapshots().await;
            send_supervisor_event(outbox, &SupervisorEvent::SessionsList { sessions });
            return;
        }

        SupervisorInbound::Takeover {
            session_id,
            supervisor_id: explicit,
        } => {
            let sup = explicit.unwrap_or_else(|| supervisor_id.to_owned());
            let result = state
                .manager
                .command(
                    &session_id,
                    Command::Takeover {
                        supervisor_id: sup,
                        outbox: outbox.clone(),
                    },
                )
                .await;
            (session_id, result)
        }

        SupervisorInbound::Handback {
            session_id,
            context,
        } => {
            let result = state
                .manager
                .command(
                    &session_id,
                    Command::Handback {
                        supervisor_id: supervisor_id.to_owned(),
                        context,
                    },
                )
                .await;
            (session_id, result)
        }

        SupervisorInbound::InjectContext {
            session_id,
            context,
        } => {
            let result = state
                .manager
                .command(&session_id, Command::InjectContext { context })
                .await;
            (session_id, result)
        }

        SupervisorInbound::SupervisorMessage {
            session_id,
            content,
        } => {
            let result = state
                .manager
                .command(
                    &session_id,
                    Command::SupervisorMessage {
                        supervisor_id: supervisor_id.to_owned(),
                        content,
                    },
                )
                .await;
            (session_id, result)
        }

        SupervisorInbound::SupervisorAudio { session_id, data } => {
            let result = state
                .manager
                .command(
                    &session_id,
                    Command::SupervisorAudio {
                        supervisor_id: supervisor_id.to_owned(),
                        data,
                    },
                )
                .await;
            (session_id, result)
        }

        SupervisorInbound::EndCall { session_id } => {
            let result = state.manager.command(&session_id, Command::EndCall).await;
            (session_id, result)
        }
    };

    match result {
        Ok(CommandAck::ContextInjected) => {
            send_supervisor_event(outbox, &SupervisorEvent::ContextInjected { session_id });
        }
        Ok(CommandAck::Done) => {
            // Session broadcasts (sessionUpdate / sessionEnded) carry the
            // acknowledgement for everything else.
        }
        Err(e) => {
            send_supervisor_event(
                outbox,
                &SupervisorEvent::Error {
                    session_id: Some(session_id),
                    message: e.message(),
                },
            );
        }
    }
}

// ── HTTP control surface ───────────────────────────────────────────

/// GET /sessions — array of live session snapshots.
async fn handle_sessions_list(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.snapshots().await)
}

/// GET /sessions/{id} — snapshot including the ordered transcript.
async fn handle_session_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(snapshot) = state.manager.snapshot(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "sessionNotFound"})),
        );
    };
    let transcript = state.manager.transcript(&id).await.unwrap_or_default();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "session": snapshot,
            "transcript": transcript,
        })),
    )
}

/// GET /summaries — paged history plus aggregate stats.
async fn handle_summaries(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    match state.store.query(&query) {
        Ok(page) => (StatusCode::OK, Json(serde_json::json!(page))),
        Err(e) => {
            tracing::error!(error = %e, "Summary query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "queryFailed"})),
            )
        }
    }
}

/// GET /summary/{id} — one historical summary.
async fn handle_summary_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.fetch(&id) {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "summaryNotFound"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Summary fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "fetchFailed"})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct CoachingRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "customerMessage")]
    customer_message: String,
}

/// POST /coaching — invoke the coaching collaborator for a live session.
async fn handle_coaching(
    State(state): State<AppState>,
    Json(request): Json<CoachingRequest>,
) -> impl IntoResponse {
    let Some(transcript) = state.manager.transcript(&request.session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "sessionNotFound"})),
        );
    };
    let recent_start = transcript.len().saturating_sub(5);
    let recent = &transcript[recent_start..];

    match tokio::time::timeout(
        state.analytics_timeout(),
        state.backend.coaching(&request.customer_message, recent),
    )
    .await
    {
        Ok(Ok(advice)) => {
            state.cache.put_coaching(&request.session_id, advice.clone());
            (StatusCode::OK, Json(serde_json::json!(advice)))
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id = %request.session_id, error = %e, "Coaching call failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "coachingFailed"})),
            )
        }
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({"error": "coachingTimeout"})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// POST /analyze — invoke the analysis collaborator for a live session.
async fn handle_analyze(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    let Some(transcript) = state.manager.transcript(&request.session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "sessionNotFound"})),
        );
    };

    let analysis = match tokio::time::timeout(
        state.analytics_timeout(),
        state.backend.analyze(&transcript),
    )
    .await
    {
        Ok(Ok(analysis)) => analysis,
        failure => {
            if let Ok(Err(e)) = failure {
                tracing::warn!(session_id = %request.session_id, error = %e, "Analysis call failed");
            }
            if transcript.is_empty() {
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({"error": "analysisFailed"})),
                );
            }
            let text = crate::analytics::client::concat_content(&transcript);
            ConversationAnalysis::fallback(&text)
        }
    };

    state.cache.put_analysis(&request.session_id, analysis.clone());
    (StatusCode::OK, Json(serde_json::json!(analysis)))
}

/// POST /summary — generate a summary on demand for a live session.
async fn handle_summary_generate(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    let Some(transcript) = state.manager.transcript(&request.session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "sessionNotFound"})),
        );
    };

    match tokio::time::timeout(
        state.analytics_timeout(),
        state.backend.summarize(&transcript),
    )
    .await
    {
        Ok(Ok(summary)) => (StatusCode::OK, Json(serde_json::json!(summary))),
        _ => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": "summaryFailed"})),
        ),
    }
}

/// GET /health — liveness probe with the active session count.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "activeSessions": state.manager.active_count(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{CallSummary, CoachingAdvice, SentimentResult};
    use crate::fanout;
    use crate::session::runner::SessionDeps;
    use crate::session::TranscriptEntry;
    use crate::store::{start_writer, SummaryRecord};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    struct EchoBackend;

    #[async_trait]
    impl AnalyticsBackend for EchoBackend {
        async fn sentiment(
            &self,
            _: &str,
            _: &[TranscriptEntry],
        ) -> anyhow::Result<SentimentResult> {
            Ok(SentimentResult {
                score: 10,
                sentiment: "calm".into(),
                reason: String::new(),
                should_escalate: false,
            })
        }
        async fn analyze(&self, _: &[TranscriptEntry]) -> anyhow::Result<ConversationAnalysis> {
            Ok(ConversationAnalysis::fallback("need help"))
        }
        async fn coaching(
            &self,
            latest: &str,
            _: &[TranscriptEntry],
        ) -> anyhow::Result<CoachingAdvice> {
            Ok(CoachingAdvice {
                coaching_tip: format!("respond to: {latest}"),
                suggested_responses: vec![],
                tone: "calm".into(),
                priority: "low".into(),
            })
        }
        async fn summarize(&self, _: &[TranscriptEntry]) -> anyhow::Result<CallSummary> {
            Ok(CallSummary::placeholder("", "stable"))
        }
    }

    fn test_state() -> AppState {
        let registry = Arc::new(SupervisorRegistry::new());
        let (fanout_handle, _join) = fanout::start(Arc::clone(&registry));
        let store = Arc::new(SummaryStore::open_in_memory().unwrap());
        let (writer, _writer_join) = start_writer(Arc::clone(&store), 16);
        let config = Arc::new(Config::for_tests());

        let deps = SessionDeps {
            config: Arc::clone(&config),
            fanout: fanout_handle,
            backend: Arc::new(EchoBackend),
            cache: Arc::new(AnalyticsCache::new()),
            writer,
            connect_ai: false,
        };

        AppState {
            config,
            manager: SessionManager::new(deps.clone()),
            registry,
            store,
            backend: deps.backend,
            cache: deps.cache,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_active_sessions() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["activeSessions"], 0);
    }

    #[tokio::test]
    async fn sessions_list_is_empty_initially() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn session_detail_unknown_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summaries_endpoint_returns_page_and_stats() {
        let state = test_state();
        state
            .store
            .insert(&SummaryRecord {
                session_id: "s1".into(),
                created_at: Utc::now(),
                ended_at: Utc::now(),
                duration_ms: 1000,
                sentiment: "neutral".into(),
                intent: "support".into(),
                resolution_status: "resolved".into(),
                key_topics: vec![],
                action_items: vec![],
                frustration_avg: 0.0,
                frustration_max: 0,
                frustration_trend: "stable".into(),
                escalation_count: 0,
                escalation_alerts: vec![],
                supervisor_interventions: 0,
                supervisor_id: None,
                supervisor_takeover_ms: 0,
                full_summary: "ok".into(),
                insights: String::new(),
                transcript: vec![],
                first_message_at: None,
                last_message_at: None,
            })
            .unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::get("/summaries?limit=10&sentiment=neutral")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["stats"]["total"], 1);
        assert_eq!(json["summaries"][0]["sessionId"], "s1");
    }

    #[tokio::test]
    async fn summary_detail_unknown_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/summary/s9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn coaching_endpoint_404_without_session() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::post("/coaching")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"sessionId":"nope","customerMessage":"hi"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn coaching_endpoint_works_for_live_session() {
        let state = test_state();
        let (outbox, _rx) = Outbox::new(8);
        state
            .manager
            .attach_customer(Some("s1".into()), outbox)
            .unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::post("/coaching")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"sessionId":"s1","customerMessage":"my card was declined"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["coachingTip"]
            .as_str()
            .unwrap()
            .contains("my card was declined"));
    }

    #[tokio::test]
    async fn analyze_endpoint_returns_analysis() {
        let state = test_state();
        let (outbox, _rx) = Outbox::new(8);
        state
            .manager
            .attach_customer(Some("s1".into()), outbox)
            .unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::post("/analyze")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sessionId":"s1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["intent"], "support");
    }

    #[test]
    fn violation_window_tolerates_then_closes() {
        let mut window = ViolationWindow::new();
        for _ in 0..MAX_VIOLATIONS {
            assert!(!window.record());
        }
        assert!(window.record());
    }

    #[test]
    fn body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }
}
