//! Registry of live agent connections
//!
//! At most one connection per agent identity; the most recent handshake wins
//! and the superseded connection is closed. Disconnects are reported offline
//! only after a grace window, and only if the agent has not come back.

mod connection;
mod transport;

pub use connection::AgentConnection;
pub use transport::{ChannelSink, Frame, FrameSink};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::events::{EventBus, StatusEvent};

/// Per-connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub identity: String,
    pub conn_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub ping_pending: bool,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Arc<AgentConnection>>,
    /// Bumped on every register and unregister per identity
    generations: HashMap<String, u64>,
}

impl Inner {
    fn bump(&mut self, identity: &str) -> u64 {
        let generation = self.generations.entry(identity.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }
}

/// Concurrent map of agent identity to live connection
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    next_conn_id: AtomicU64,
    events: EventBus,
    offline_grace: Duration,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(events: EventBus, offline_grace: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_conn_id: AtomicU64::new(1),
            events,
            offline_grace,
        }
    }

    /// Register a freshly handshaken connection for `identity`
    ///
    /// Any existing connection for the identity is closed.
    pub async fn register(
        &self,
        identity: &str,
        sink: Box<dyn FrameSink>,
    ) -> Arc<AgentConnection> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(AgentConnection::new(identity, conn_id, sink));

        let superseded = {
            let mut inner = self.inner.write().await;
            inner.bump(identity);
            inner
                .connections
                .insert(identity.to_string(), Arc::clone(&conn))
        };

        if let Some(old) = superseded {
            tracing::info!(
                identity,
                old_conn = old.conn_id(),
                new_conn = conn_id,
                "superseding existing agent connection"
            );
            old.close().await;
        } else {
            tracing::info!(identity, conn_id, "agent connected");
        }

        self.events.publish(StatusEvent::AgentOnline {
            identity: identity.to_string(),
        });
        conn
    }

    /// Current connection for `identity`
    ///
    /// The handle may go stale at any time; a failed write on it means the
    /// agent is not connected.
    pub async fn lookup(&self, identity: &str) -> Option<Arc<AgentConnection>> {
        self.inner.read().await.connections.get(identity).cloned()
    }

    /// Remove `conn` if it is still the current connection, and close it
    ///
    /// Returns whether the registry entry was removed. An offline event is
    /// published after the grace window unless the identity re-registers.
    pub async fn unregister(self: &Arc<Self>, conn: &Arc<AgentConnection>) -> bool {
        let identity = conn.identity();
        let generation = {
            let mut inner = self.inner.write().await;
            let is_current = inner
                .connections
                .get(identity)
                .is_some_and(|current| Arc::ptr_eq(current, conn));
            if is_current {
                inner.connections.remove(identity);
                Some(inner.bump(identity))
            } else {
                None
            }
        };

        conn.close().await;

        let Some(generation) = generation else {
            tracing::debug!(
                identity,
                conn_id = conn.conn_id(),
                "stale connection closed, registry entry unchanged"
            );
            return false;
        };

        tracing::info!(identity, conn_id = conn.conn_id(), "agent disconnected");

        let registry = Arc::clone(self);
        let identity = identity.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(registry.offline_grace).await;
            if registry.still_gone(&identity, generation).await {
                tracing::info!(identity = %identity, "agent offline after grace window");
                registry
                    .events
                    .publish(StatusEvent::AgentOffline { identity });
            } else {
                tracing::debug!(identity = %identity, "agent reconnected within grace window");
            }
        });
        true
    }

    async fn still_gone(&self, identity: &str, generation: u64) -> bool {
        let inner = self.inner.read().await;
        !inner.connections.contains_key(identity)
            && inner.generations.get(identity) == Some(&generation)
    }

    /// Identities connected at call time
    pub async fn snapshot(&self) -> Vec<String> {
        let mut identities: Vec<String> =
            self.inner.read().await.connections.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Handles to every live connection
    pub async fn connections(&self) -> Vec<Arc<AgentConnection>> {
        self.inner
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Whether no agent is connected
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Per-connection statistics, sorted by identity
    pub async fn stats(&self) -> Vec<ConnectionStats> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut stats: Vec<ConnectionStats> = self
            .connections()
            .await
            .into_iter()
            .map(|conn| {
                let idle = conn.idle(now);
                let last_activity = chrono::Duration::from_std(idle)
                    .map_or(conn.connected_at(), |idle| wall_now - idle);
                ConnectionStats {
                    identity: conn.identity().to_string(),
                    conn_id: conn.conn_id(),
                    connected_at: conn.connected_at(),
                    last_activity,
                    age_secs: u64::try_from((wall_now - conn.connected_at()).num_seconds())
                        .unwrap_or(0),
                    idle_secs: idle.as_secs(),
                    ping_pending: conn.ping_pending(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.identity.cmp(&b.identity));
        stats
    }

    /// Close every connection without publishing offline events
    pub async fn close_all(&self) {
        let drained: Vec<Arc<AgentConnection>> = {
            let mut inner = self.inner.write().await;
            inner.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(grace: Duration) -> (Arc<ConnectionRegistry>, EventBus) {
        let bus = EventBus::new();
        (
            Arc::new(ConnectionRegistry::new(bus.clone(), grace)),
            bus,
        )
    }

    fn sink() -> Box<dyn FrameSink> {
        // Nothing reads these frames; close frames fail silently
        let (sink, _rx) = ChannelSink::pair(8);
        Box::new(sink)
    }

    #[tokio::test]
    async fn register_supersedes_and_closes_old() {
        let (registry, _bus) = registry(Duration::from_secs(30));

        let first = registry.register("h1", sink()).await;
        let second = registry.register("h1", sink()).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        let current = registry.lookup("h1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_unregister_leaves_current_entry() {
        let (registry, _bus) = registry(Duration::from_secs(30));

        let first = registry.register("h1", sink()).await;
        let second = registry.register("h1", sink()).await;

        assert!(!registry.unregister(&first).await);
        let current = registry.lookup("h1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_emitted_after_grace() {
        let (registry, bus) = registry(Duration::from_secs(30));
        let mut rx = bus.subscribe();

        let conn = registry.register("h1", sink()).await;
        assert!(matches!(rx.recv().await.unwrap(), StatusEvent::AgentOnline { .. }));

        assert!(registry.unregister(&conn).await);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            StatusEvent::AgentOffline {
                identity: "h1".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_suppresses_offline() {
        let (registry, bus) = registry(Duration::from_secs(30));

        let conn = registry.register("h1", sink()).await;
        let mut rx = bus.subscribe();
        registry.unregister(&conn).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        registry.register("h1", sink()).await;
        assert!(matches!(rx.recv().await.unwrap(), StatusEvent::AgentOnline { .. }));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_and_stats_list_connections() {
        let (registry, _bus) = registry(Duration::from_secs(30));
        registry.register("h2", sink()).await;
        registry.register("h1", sink()).await;

        assert_eq!(registry.snapshot().await, vec!["h1", "h2"]);
        let stats = registry.stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].identity, "h1");
        assert!(!stats[0].ping_pending);
    }
}
