//! Session-addressed progress fan-out
//!
//! The broadcaster owns a registry of subscriber connections and relays
//! loader lifecycle events to every connection watching the event's session.
//! Transport is deliberately abstract: a connection is just an unbounded
//! sender of serialized JSON frames, so the outer layer can back it with a
//! websocket, SSE, or a test channel.

use crate::batch::LifecycleEvent;
use crate::error::{ImportError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Seconds between liveness sweeps
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Sweep failure ratio at or above which the channel reports `Degraded`
const DEGRADED_FAILURE_RATIO: f64 = 0.5;

/// Message a subscriber may send upstream
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Re-target the connection's registration to another session
    Subscribe { session_id: String },
}

/// Coarse health classification for external monitoring
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHealth {
    Healthy,
    Degraded,
    Error,
}

struct Connection {
    session_id: String,
    principal: String,
    sender: mpsc::UnboundedSender<String>,
}

/// Fan-out registry of subscriber connections, keyed by connection id.
/// Many connections may watch the same session.
pub struct ProgressBroadcaster {
    connections: DashMap<String, Connection>,
    // Last-sweep delivery stats, feeding the health classification.
    last_delivered: AtomicUsize,
    last_pruned: AtomicUsize,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            last_delivered: AtomicUsize::new(0),
            last_pruned: AtomicUsize::new(0),
        }
    }

    /// Register a new subscriber for a session. The caller keeps the
    /// receiving half; the returned id addresses this connection until it
    /// is pruned or unregistered. A `connected` acknowledgment is sent
    /// immediately.
    pub fn register(
        &self,
        session_id: &str,
        principal: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        let connection_id = Uuid::new_v4().to_string();
        let ack = json!({
            "type": "connected",
            "session_id": session_id,
            "connection_id": connection_id,
        })
        .to_string();
        sender
            .send(ack)
            .map_err(|_| ImportError::Channel("connection closed before ack".to_string()))?;

        self.connections.insert(
            connection_id.clone(),
            Connection {
                session_id: session_id.to_string(),
                principal: principal.to_string(),
                sender,
            },
        );
        info!(
            connection = %connection_id,
            session = session_id,
            principal, "subscriber connected"
        );
        Ok(connection_id)
    }

    pub fn unregister(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            debug!(connection = connection_id, "subscriber disconnected");
        }
    }

    /// Handle an upstream message from a subscriber.
    pub fn handle_client_message(&self, connection_id: &str, message: ClientMessage) -> Result<()> {
        let mut entry = self.connections.get_mut(connection_id).ok_or_else(|| {
            ImportError::Channel(format!("unknown connection {}", connection_id))
        })?;

        match message {
            ClientMessage::Ping => {
                let pong = json!({"type": "pong"}).to_string();
                entry
                    .sender
                    .send(pong)
                    .map_err(|_| ImportError::Channel("connection closed".to_string()))?;
            }
            ClientMessage::Subscribe { session_id } => {
                debug!(
                    connection = connection_id,
                    from = %entry.session_id,
                    to = %session_id,
                    "subscriber re-targeted"
                );
                let ack = json!({"type": "subscribed", "session_id": session_id}).to_string();
                entry.session_id = session_id;
                entry
                    .sender
                    .send(ack)
                    .map_err(|_| ImportError::Channel("connection closed".to_string()))?;
            }
        }
        Ok(())
    }

    /// Deliver one lifecycle event to every connection watching its session.
    ///
    /// Zero subscribers is a no-op. A failed send prunes that connection and
    /// delivery to the rest proceeds. Returns the number of connections
    /// reached.
    pub fn broadcast(&self, event: &LifecycleEvent) -> Result<usize> {
        let session_id = event.session_id();
        let frame = serde_json::to_string(event)?;

        let mut delivered = 0usize;
        let mut dead: Vec<String> = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().session_id != session_id {
                continue;
            }
            if entry.value().sender.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }

        for connection_id in &dead {
            self.connections.remove(connection_id);
            warn!(
                connection = %connection_id,
                session = session_id,
                "pruned stale subscriber during broadcast"
            );
        }

        self.last_delivered.store(delivered, Ordering::Relaxed);
        self.last_pruned.store(dead.len(), Ordering::Relaxed);
        Ok(delivered)
    }

    /// Ping every open connection, pruning the ones that no longer accept
    /// frames. Returns how many were pruned.
    pub fn heartbeat(&self) -> usize {
        let frame = json!({"type": "heartbeat"}).to_string();
        let mut alive = 0usize;
        let mut dead: Vec<String> = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().sender.send(frame.clone()).is_ok() {
                alive += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }
        for connection_id in &dead {
            self.connections.remove(connection_id);
            debug!(connection = %connection_id, "pruned dead subscriber on heartbeat");
        }
        self.last_delivered.store(alive, Ordering::Relaxed);
        self.last_pruned.store(dead.len(), Ordering::Relaxed);
        dead.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Distinct sessions with at least one open connection.
    pub fn session_count(&self) -> usize {
        let mut sessions: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.value().session_id.clone())
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions.len()
    }

    /// Connected principals for one session, for the status query surface.
    pub fn subscribers_for(&self, session_id: &str) -> Vec<String> {
        self.connections
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.value().principal.clone())
            .collect()
    }

    /// Classify channel health from the most recent delivery sweep.
    pub fn health(&self) -> ChannelHealth {
        let delivered = self.last_delivered.load(Ordering::Relaxed);
        let pruned = self.last_pruned.load(Ordering::Relaxed);
        let total = delivered + pruned;
        if total == 0 || pruned == 0 {
            ChannelHealth::Healthy
        } else if delivered == 0 {
            ChannelHealth::Error
        } else if pruned as f64 / total as f64 >= DEGRADED_FAILURE_RATIO {
            ChannelHealth::Degraded
        } else {
            ChannelHealth::Healthy
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain loader lifecycle events into the broadcaster until the sending
/// side closes. Intended to run as its own task.
pub async fn pump(
    broadcaster: Arc<ProgressBroadcaster>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        if let Err(e) = broadcaster.broadcast(&event) {
            warn!("failed to broadcast lifecycle event: {}", e);
        }
    }
    debug!("lifecycle event channel closed, pump exiting");
}

/// Periodic liveness sweep over all open connections. Runs forever; spawn
/// it and drop the handle to stop caring, or abort the task on shutdown.
pub async fn heartbeat_loop(broadcaster: Arc<ProgressBroadcaster>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let pruned = broadcaster.heartbeat();
        if pruned > 0 {
            info!(pruned, "heartbeat pruned dead subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(session_id: &str) -> LifecycleEvent {
        LifecycleEvent::Progress {
            session_id: session_id.to_string(),
            processed: 100,
            successful: 98,
            failed: 2,
            total: 250,
            records_per_second: 40.0,
            eta_seconds: Some(3.75),
        }
    }

    #[test]
    fn test_register_sends_connected_ack() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register("s1", "user-1", tx).unwrap();

        let ack: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(ack["type"], "connected");
        assert_eq!(ack["session_id"], "s1");
        assert_eq!(ack["connection_id"], id);
        assert_eq!(broadcaster.connection_count(), 1);
        assert_eq!(broadcaster.session_count(), 1);
    }

    #[test]
    fn test_broadcast_reaches_only_matching_session() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broadcaster.register("s1", "user-a", tx_a).unwrap();
        broadcaster.register("s2", "user-b", tx_b).unwrap();
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        let delivered = broadcaster.broadcast(&progress_event("s1")).unwrap();
        assert_eq!(delivered, 1);

        let frame: serde_json::Value = serde_json::from_str(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "progress");
        assert_eq!(frame["processed"], 100);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_with_no_subscribers_is_noop() {
        let broadcaster = ProgressBroadcaster::new();
        let delivered = broadcaster.broadcast(&progress_event("nobody")).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(broadcaster.health(), ChannelHealth::Healthy);
    }

    #[test]
    fn test_stale_connection_pruned_and_rest_delivered() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        broadcaster.register("s1", "alive", tx_live).unwrap();
        broadcaster.register("s1", "gone", tx_dead).unwrap();
        rx_live.try_recv().unwrap();
        drop(rx_dead);

        let delivered = broadcaster.broadcast(&progress_event("s1")).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(broadcaster.connection_count(), 1);
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(broadcaster.health(), ChannelHealth::Degraded);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register("s1", "user-1", tx).unwrap();
        rx.try_recv().unwrap();

        broadcaster
            .handle_client_message(&id, ClientMessage::Ping)
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "pong");
    }

    #[test]
    fn test_subscribe_retargets_registration() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register("s1", "user-1", tx).unwrap();
        rx.try_recv().unwrap();

        broadcaster
            .handle_client_message(
                &id,
                ClientMessage::Subscribe {
                    session_id: "s2".to_string(),
                },
            )
            .unwrap();

        assert_eq!(broadcaster.broadcast(&progress_event("s1")).unwrap(), 0);
        assert_eq!(broadcaster.broadcast(&progress_event("s2")).unwrap(), 1);
        assert_eq!(broadcaster.subscribers_for("s2"), vec!["user-1".to_string()]);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let id_a = broadcaster.register("s1", "leaving", tx_a).unwrap();
        broadcaster.register("s1", "staying", tx_b).unwrap();
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        broadcaster.unregister(&id_a);
        assert_eq!(broadcaster.connection_count(), 1);

        let delivered = broadcaster.broadcast(&progress_event("s1")).unwrap();
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());

        // Unknown ids are a no-op.
        broadcaster.unregister("no-such-connection");
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[test]
    fn test_heartbeat_prunes_dead_connections() {
        let broadcaster = ProgressBroadcaster::new();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        broadcaster.register("s1", "alive", tx_live).unwrap();
        broadcaster.register("s1", "gone", tx_dead).unwrap();
        rx_live.try_recv().unwrap();
        drop(rx_dead);

        assert_eq!(broadcaster.heartbeat(), 1);
        assert_eq!(broadcaster.connection_count(), 1);
        let frame: serde_json::Value = serde_json::from_str(&rx_live.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "heartbeat");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_prunes_on_schedule() {
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        broadcaster.register("s1", "gone", tx_dead).unwrap();
        drop(rx_dead);

        let sweep = tokio::spawn(heartbeat_loop(broadcaster.clone()));
        tokio::time::advance(Duration::from_secs(HEARTBEAT_INTERVAL_SECS + 1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(broadcaster.connection_count(), 0);
        sweep.abort();
    }

    #[tokio::test]
    async fn test_pump_drains_loader_events() {
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        broadcaster.register("s1", "user-1", sub_tx).unwrap();
        sub_rx.try_recv().unwrap();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pump_task = tokio::spawn(pump(broadcaster.clone(), event_rx));

        event_tx.send(progress_event("s1")).unwrap();
        event_tx
            .send(LifecycleEvent::Completed {
                session_id: "s1".to_string(),
                successful: 250,
                failed: 0,
            })
            .unwrap();
        drop(event_tx);
        pump_task.await.unwrap();

        let first: serde_json::Value = serde_json::from_str(&sub_rx.try_recv().unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&sub_rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "progress");
        assert_eq!(second["type"], "completed");
    }
}
