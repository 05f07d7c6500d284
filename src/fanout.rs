//! Supervisor fan-out: registry of attached dashboards plus the global
//! broadcast loop.
//!
//! Session loops never talk to supervisor sockets directly. They
//! `try_send` events into the fan-out channel and move on; a single
//! process-wide loop serializes each event once and distributes it to
//! every attached supervisor outbox. A slow supervisor loses events (its
//! drop counter increments); it never slows the voice path or its peers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::SupervisorEvent;
use crate::transport::Outbox;

/// Capacity of the broadcast request channel between session loops and
/// the fan-out loop.
const BROADCAST_QUEUE: usize = 1024;

/// Outbox slots kept free of audio so control events still get through
/// to a peer that is falling behind.
const AUDIO_RESERVE: usize = 8;

/// One attached supervisor dashboard.
struct SupervisorPeer {
    outbox: Outbox,
}

/// Process-wide registry of attached supervisors.
///
/// Guarded by a coarse lock; mutated only on attach/detach.
#[derive(Default)]
pub struct SupervisorRegistry {
    peers: Mutex<HashMap<String, SupervisorPeer>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a supervisor outbox under its id. Replaces any stale
    /// registration with the same id.
    pub fn attach(&self, supervisor_id: &str, outbox: Outbox) {
        let mut peers = self.peers.lock();
        if peers
            .insert(supervisor_id.to_owned(), SupervisorPeer { outbox })
            .is_some()
        {
            tracing::warn!(supervisor_id, "Replaced stale supervisor registration");
        }
        tracing::info!(supervisor_id, total = peers.len(), "Supervisor attached");
    }

    pub fn detach(&self, supervisor_id: &str) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.remove(supervisor_id) {
            peer.outbox.close();
            tracing::info!(
                supervisor_id,
                dropped = peer.outbox.dropped_frames(),
                remaining = peers.len(),
                "Supervisor detached"
            );
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Send an event to one supervisor only (command replies). Returns
    /// false when the supervisor is unknown or the frame was dropped.
    pub fn send_to(&self, supervisor_id: &str, event: &SupervisorEvent) -> bool {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(_) => degraded_frame(event),
        };
        let peers = self.peers.lock();
        match peers.get(supervisor_id) {
            Some(peer) => peer.outbox.send_or_drop(frame),
            None => false,
        }
    }

    /// Serialize once and enqueue on every attached supervisor.
    fn distribute(&self, event: &SupervisorEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(kind = event.kind(), error = %e, "Event serialization failed");
                degraded_frame(event)
            }
        };

        // Audio is the bulk of the volume and the first thing to shed:
        // once a peer's queue is nearly full, audio frames are dropped so
        // the remaining slots stay available for control events.
        let is_audio = matches!(event, SupervisorEvent::CustomerAudio { .. });

        let peers = self.peers.lock();
        for (id, peer) in peers.iter() {
            if is_audio && peer.outbox.remaining() <= AUDIO_RESERVE {
                peer.outbox.count_drop();
                continue;
            }
            if !peer.outbox.send_or_drop(frame.clone()) && !peer.outbox.is_closed() {
                tracing::debug!(
                    supervisor_id = %id,
                    kind = event.kind(),
                    dropped = peer.outbox.dropped_frames(),
                    "Supervisor outbox full, event dropped"
                );
            }
        }
    }
}

/// Minimal frame emitted when an event cannot be serialized.
fn degraded_frame(event: &SupervisorEvent) -> String {
    serde_json::json!({
        "type": event.kind(),
        "sessionId": event.session_id(),
        "error": "serialization",
    })
    .to_string()
}

/// Cloneable handle session loops use to publish events.
#[derive(Clone)]
pub struct Fanout {
    tx: mpsc::Sender<SupervisorEvent>,
    registry: Arc<SupervisorRegistry>,
}

impl Fanout {
    /// Publish an event to all supervisors. Never blocks; if the global
    /// queue itself is saturated the event is dropped and logged.
    pub fn broadcast(&self, event: SupervisorEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            tracing::warn!(kind = event.kind(), "Fan-out queue saturated, event dropped");
        }
    }

    pub fn registry(&self) -> &Arc<SupervisorRegistry> {
        &self.registry
    }
}

/// Spawn the global fan-out loop. Returns the publish handle and the
/// loop's join handle (for shutdown).
pub fn start(registry: Arc<SupervisorRegistry>) -> (Fanout, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SupervisorEvent>(BROADCAST_QUEUE);
    let loop_registry = Arc::clone(&registry);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            loop_registry.distribute(&event);
        }
        tracing::debug!("Fan-out loop terminated");
    });
    (Fanout { tx, registry }, handle)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbox;

    fn ended(seq: u64) -> SupervisorEvent {
        SupervisorEvent::SessionEnded {
            session_id: "s1".into(),
            seq,
            reason: "test".into(),
        }
    }

    #[test]
    fn attach_detach_counts() {
        let registry = SupervisorRegistry::new();
        let (a, _rx_a) = Outbox::new(4);
        let (b, _rx_b) = Outbox::new(4);

        registry.attach("sup-a", a);
        registry.attach("sup-b", b);
        assert_eq!(registry.count(), 2);

        registry.detach("sup-a");
        assert_eq!(registry.count(), 1);
        registry.detach("sup-a"); // idempotent
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn distribute_reaches_all_peers() {
        let registry = SupervisorRegistry::new();
        let (a, mut rx_a) = Outbox::new(4);
        let (b, mut rx_b) = Outbox::new(4);
        registry.attach("sup-a", a);
        registry.attach("sup-b", b);

        registry.distribute(&ended(1));

        let frame_a = rx_a.try_recv().unwrap();
        let frame_b = rx_b.try_recv().unwrap();
        assert_eq!(frame_a, frame_b);
        assert!(frame_a.contains("sessionEnded"));
    }

    #[test]
    fn slow_peer_drops_without_blocking_others() {
        let registry = SupervisorRegistry::new();
        let (slow, _slow_rx) = Outbox::new(1);
        let (healthy, mut healthy_rx) = Outbox::new(16);
        let slow_probe = slow.clone();
        registry.attach("slow", slow);
        registry.attach("healthy", healthy);

        for seq in 0..5 {
            registry.distribute(&ended(seq));
        }

        // Healthy peer got everything, slow peer kept one and dropped four.
        let mut healthy_count = 0;
        while healthy_rx.try_recv().is_ok() {
            healthy_count += 1;
        }
        assert_eq!(healthy_count, 5);
        assert_eq!(slow_probe.dropped_frames(), 4);
    }

    #[test]
    fn audio_is_shed_before_control_events() {
        let registry = SupervisorRegistry::new();
        let (outbox, _rx) = Outbox::new(16);
        let probe = outbox.clone();
        registry.attach("sup", outbox);

        // Fill until only the audio reserve is left.
        for seq in 0..8 {
            registry.distribute(&ended(seq));
        }
        assert_eq!(probe.remaining(), AUDIO_RESERVE);

        // Audio now sheds, control still lands.
        registry.distribute(&SupervisorEvent::CustomerAudio {
            session_id: "s1".into(),
            seq: 100,
            data: "AAAA".into(),
        });
        assert_eq!(probe.dropped_frames(), 1);
        assert_eq!(probe.remaining(), AUDIO_RESERVE);

        registry.distribute(&ended(8));
        assert_eq!(probe.remaining(), AUDIO_RESERVE - 1);
    }

    #[test]
    fn send_to_unknown_supervisor_is_false() {
        let registry = SupervisorRegistry::new();
        assert!(!registry.send_to("ghost", &ended(1)));
    }

    #[tokio::test]
    async fn broadcast_flows_through_the_loop() {
        let registry = Arc::new(SupervisorRegistry::new());
        let (fanout, handle) = start(Arc::clone(&registry));

        let (outbox, mut rx) = Outbox::new(8);
        registry.attach("sup-1", outbox);

        fanout.broadcast(ended(3));

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("\"seq\":3"));

        drop(fanout);
        let _ = handle.await;
    }
}
