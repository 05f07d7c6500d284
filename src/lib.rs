//! switchboard — a real-time voice-support mediation server.
//!
//! Customers stream microphone audio from a browser; the server relays
//! it to a streaming conversational AI provider and returns synthesized
//! audio. Supervisors observe every active session, receive derived
//! signals (transcripts, frustration scores, coaching hints, escalation
//! alerts), and may intervene — injecting context into the AI stream or
//! taking over the audio path entirely. When a session ends, a post-call
//! summary is computed and persisted.
//!
//! ## Architecture
//!
//! ```text
//! customer WS ─▸ gateway ─▸ session loop ─▸ live binding ─▸ Gemini Live
//!                              │   ◂─ audio/transcripts ──────┘
//!                              ├─▸ analytics dispatcher ─▸ Gemini REST
//!                              ├─▸ supervisor fan-out ─▸ dashboards
//!                              └─▸ summary writer ─▸ SQLite
//! ```
//!
//! Each session has exactly one loop that owns its state; every other
//! party talks to it through bounded channels.

pub mod analytics;
pub mod config;
pub mod events;
pub mod fanout;
pub mod gateway;
pub mod live;
pub mod session;
pub mod store;
pub mod transport;
