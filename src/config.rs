//! Environment-driven configuration.
//!
//! Every tunable the server honors is an environment variable; nothing is
//! read from disk. `Config::from_env()` is called once at startup and the
//! resulting struct is shared behind an `Arc` for the life of the process.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Default control-surface port.
const DEFAULT_PORT: u16 = 8090;

/// Default quiet period before a partial input transcript is finalized.
const DEFAULT_DEBOUNCE_MS: u64 = 400;

/// Default lifetime of an AI sentence in the echo-suppression ring.
const DEFAULT_ECHO_WINDOW_MS: u64 = 10_000;

/// Default deadline for one analytics task.
const DEFAULT_ANALYTICS_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for the AI binding handshake.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default outbox drain window after a transport closes.
const DEFAULT_DRAIN_MS: u64 = 500;

/// Frustration score at or above which an escalation alert is raised.
const DEFAULT_ESCALATION_THRESHOLD: u8 = 70;

/// Runtime configuration for the mediation server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider API key (Gemini), used by both the live binding and the
    /// analytics collaborator.
    pub api_key: String,
    /// Bind host for the control surface and WebSocket listener.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Verbose diagnostics (`DEBUG=1` raises the log level to debug).
    pub debug: bool,
    /// Model identifier for the streaming voice provider.
    pub voice_model: String,
    /// Model identifier for the analytics collaborator.
    pub analysis_model: String,
    /// Path of the summary SQLite database.
    pub db_path: PathBuf,

    /// Δ_debounce — quiet period before input transcript finalization.
    pub transcription_debounce_ms: u64,
    /// Δ_echo — echo-suppression ring entry lifetime.
    pub echo_window_ms: u64,
    /// Δ_analytics — per-task analytics deadline.
    pub analytics_timeout_ms: u64,
    /// Δ_connect — AI binding handshake deadline.
    pub connect_timeout_ms: u64,
    /// Δ_drain — outbox drain window on transport close.
    pub drain_ms: u64,

    /// N_super — supervisor outbox capacity (overflow drops for that peer).
    pub supervisor_outbox: usize,
    /// N_cust — customer outbox capacity (overflow ends the session).
    pub customer_outbox: usize,
    /// N_ai — outbound AI audio capacity (overflow drops the frame).
    pub ai_outbox: usize,

    /// Frustration score threshold for escalation alerts.
    pub escalation_threshold: u8,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// `API_KEY` is mandatory; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .context("API_KEY is required (provider credential)")?;

        Ok(Self {
            api_key,
            host: env_or("HOST", "127.0.0.1"),
            port: env_parsed("PORT", DEFAULT_PORT)?,
            debug: env_flag("DEBUG"),
            voice_model: env_or("VOICE_MODEL", "gemini-2.5-flash-native-audio-preview-12-2025"),
            analysis_model: env_or("ANALYSIS_MODEL", "gemini-2.5-flash"),
            db_path: PathBuf::from(env_or("DB_PATH", "switchboard.db")),
            transcription_debounce_ms: env_parsed(
                "TRANSCRIPTION_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE_MS,
            )?,
            echo_window_ms: env_parsed("ECHO_WINDOW_MS", DEFAULT_ECHO_WINDOW_MS)?,
            analytics_timeout_ms: env_parsed("ANALYTICS_TIMEOUT_MS", DEFAULT_ANALYTICS_TIMEOUT_MS)?,
            connect_timeout_ms: env_parsed("CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?,
            drain_ms: env_parsed("DRAIN_MS", DEFAULT_DRAIN_MS)?,
            supervisor_outbox: env_parsed("SUPERVISOR_OUTBOX", 256)?,
            customer_outbox: env_parsed("CUSTOMER_OUTBOX", 64)?,
            ai_outbox: env_parsed("AI_OUTBOX", 128)?,
            escalation_threshold: env_parsed("ESCALATION_THRESHOLD", DEFAULT_ESCALATION_THRESHOLD)?,
        })
    }

    /// A config suitable for tests: no provider key required, temp paths.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            api_key: "test-key".into(),
            host: "127.0.0.1".into(),
            port: 0,
            debug: false,
            voice_model: "test-voice-model".into(),
            analysis_model: "test-analysis-model".into(),
            db_path: PathBuf::from(":memory:"),
            transcription_debounce_ms: DEFAULT_DEBOUNCE_MS,
            echo_window_ms: DEFAULT_ECHO_WINDOW_MS,
            analytics_timeout_ms: DEFAULT_ANALYTICS_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            drain_ms: DEFAULT_DRAIN_MS,
            supervisor_outbox: 256,
            customer_outbox: 64,
            ai_outbox: 128,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().trim(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}: {e}")),
        _ => Ok(default),
    }
}

// ── Tests ────────────────────────────────────────────────────────
