//! Per-peer transport adapter.
//!
//! Each WebSocket connection (customer or supervisor) gets one [`Outbox`]
//! and one send pump. The session loop and the fan-out never touch the
//! socket: they enqueue serialized frames on the outbox and return
//! immediately. The pump owns the socket's write half and is the only
//! writer.
//!
//! Backpressure is per peer: a full outbox surfaces [`SendError::Slow`]
//! and the caller decides the policy (drop for supervisors, end the
//! session for customers). After close, every send fails with
//! [`SendError::Gone`].

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a transport was closed, carried in logs and close notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote peer disconnected.
    PeerGone,
    /// The customer outbox overflowed (`customerCongested`).
    Congested,
    /// The server ended the session.
    SessionEnded,
    /// Repeated protocol violations.
    ProtocolViolation,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerGone => "peerGone",
            Self::Congested => "customerCongested",
            Self::SessionEnded => "sessionEnded",
            Self::ProtocolViolation => "protocolViolation",
        }
    }
}

/// Error returned by [`Outbox::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The peer's outbox is full.
    Slow,
    /// The transport is closed.
    Gone,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slow => write!(f, "peer outbox full"),
            Self::Gone => write!(f, "peer transport closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Bounded outbound queue for one peer.
///
/// Cheap to clone; all clones share the close flag and drop counter.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    /// Create an outbox with the given capacity. Returns the outbox and
    /// the receiver the send pump drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue a serialized frame. Never blocks.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Gone);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Slow),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(SendError::Gone)
            }
        }
    }

    /// Enqueue with drop-on-slow semantics: a full outbox increments the
    /// drop counter instead of surfacing an error. Returns false when the
    /// frame was dropped or the peer is gone.
    pub fn send_or_drop(&self, frame: String) -> bool {
        match self.send(frame) {
            Ok(()) => true,
            Err(SendError::Slow) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(SendError::Gone) => false,
        }
    }

    /// Mark the transport closed. Idempotent; queued frames still drain
    /// within the pump's drain window.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Frames dropped for this peer because its outbox was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remaining queue slots. Used by the fan-out to shed audio frames
    /// before control events when a peer falls behind.
    pub fn remaining(&self) -> usize {
        self.tx.capacity()
    }

    /// Record an externally decided drop against this peer's counter.
    pub fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drive one peer's write half: drain the outbox onto the socket.
///
/// Runs until the outbox senders are dropped or the socket rejects a
/// write. On shutdown the remaining queue gets up to `drain` to flush,
/// then the socket is closed.
pub async fn send_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    drain: Duration,
    peer: &str,
) {
    let deadline = tokio::time::sleep(drain);
    tokio::pin!(deadline);
    let mut draining = false;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            tracing::debug!(peer, "Socket write failed, stopping send pump");
                            break;
                        }
                    }
                    // Senders gone: switch to the bounded drain window for
                    // anything the channel already buffered.
                    None if !draining => {
                        draining = true;
                        deadline.as_mut().reset(tokio::time::Instant::now() + drain);
                    }
                    None => break,
                }
            }
            () = &mut deadline, if draining => {
                break;
            }
        }
        if draining && rx.is_empty() {
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    tracing::debug!(peer, "Send pump terminated");
}

// ── Tests ──────────────────────────────────────────────────────────
