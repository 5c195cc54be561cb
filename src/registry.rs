use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::server::ws::protocol::{Outbound, ServerEvent, CLOSE_NORMAL};

struct ConnectionEntry {
    user_id: i64,
    sender: mpsc::UnboundedSender<Outbound>,
    last_activity: Instant,
}

/// Tracks live WebSocket connections: per-user caps, activity timestamps,
/// heartbeat fan-out and stale sweeps. All I/O goes through each
/// connection's outbound channel, so the map lock is never held across an
/// await point.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, ConnectionEntry>>,
    max_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_per_user,
        }
    }

    /// Registers a connection. Returns false without registering when the
    /// user already holds the maximum number of live connections.
    pub fn connect(
        &self,
        conn_id: Uuid,
        user_id: i64,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        let Ok(mut connections) = self.connections.lock() else {
            return false;
        };
        let held = connections
            .values()
            .filter(|entry| entry.user_id == user_id)
            .count();
        if held >= self.max_per_user {
            tracing::warn!(user_id, held, "connection rejected: per-user cap reached");
            return false;
        }

        connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                sender,
                last_activity: Instant::now(),
            },
        );
        tracing::debug!(user_id, %conn_id, total = connections.len(), "connection registered");
        true
    }

    /// Removes a connection. Safe to call repeatedly or for ids that were
    /// already swept.
    pub fn disconnect(&self, conn_id: Uuid) -> bool {
        let Ok(mut connections) = self.connections.lock() else {
            return false;
        };
        let removed = connections.remove(&conn_id);
        if let Some(entry) = &removed {
            tracing::debug!(
                user_id = entry.user_id,
                %conn_id,
                total = connections.len(),
                "connection deregistered"
            );
        }
        removed.is_some()
    }

    /// Marks the connection active now. Last write wins.
    pub fn touch(&self, conn_id: Uuid) {
        if let Ok(mut connections) = self.connections.lock() {
            if let Some(entry) = connections.get_mut(&conn_id) {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Enqueues a ping to every live connection. A connection whose writer
    /// task is gone is treated as dead and removed; returns how many were
    /// dropped that way.
    pub fn send_heartbeats(&self) -> usize {
        let Ok(mut connections) = self.connections.lock() else {
            return 0;
        };
        let dead: Vec<Uuid> = connections
            .iter()
            .filter(|(_, entry)| entry.sender.send(Outbound::Event(ServerEvent::Ping)).is_err())
            .map(|(conn_id, _)| *conn_id)
            .collect();

        for conn_id in &dead {
            if let Some(entry) = connections.remove(conn_id) {
                tracing::info!(user_id = entry.user_id, %conn_id, "dropping dead connection");
            }
        }
        dead.len()
    }

    /// Closes and removes every connection idle longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> usize {
        let Ok(mut connections) = self.connections.lock() else {
            return 0;
        };
        let stale: Vec<Uuid> = connections
            .iter()
            .filter(|(_, entry)| entry.last_activity.elapsed() > timeout)
            .map(|(conn_id, _)| *conn_id)
            .collect();

        for conn_id in &stale {
            if let Some(entry) = connections.remove(conn_id) {
                let _ = entry.sender.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "idle timeout".to_string(),
                });
                tracing::info!(user_id = entry.user_id, %conn_id, "closed idle connection");
            }
        }
        stale.len()
    }

    /// Normal-closes every connection. Used on process shutdown.
    pub fn close_all(&self, reason: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            for (conn_id, entry) in connections.drain() {
                let _ = entry.sender.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: reason.to_string(),
                });
                tracing::debug!(user_id = entry.user_id, %conn_id, reason, "connection closed");
            }
        }
    }

    pub fn user_connections(&self, user_id: i64) -> usize {
        self.connections
            .lock()
            .map(|connections| {
                connections
                    .values()
                    .filter(|entry| entry.user_id == user_id)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections
            .lock()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }
}

/// Spawns the single process-wide maintenance loop: each tick sends
/// heartbeats, sweeps idle connections and logs the registry size.
pub fn spawn_maintenance(
    registry: Arc<ConnectionRegistry>,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let dropped = registry.send_heartbeats();
            let swept = registry.sweep_stale(idle_timeout);
            if dropped > 0 || swept > 0 {
                tracing::info!(dropped, swept, "registry maintenance pass");
            }
            tracing::debug!(total = registry.total_connections(), "live connections");
        }
    })
}
