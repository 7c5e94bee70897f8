//! Periodic liveness sweep over registered connections

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LivenessConfig;
use crate::registry::ConnectionRegistry;

/// Outcome of a single sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: Vec<String>,
    pub evicted: Vec<String>,
}

/// Pings idle connections and evicts those that never answer
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    config: LivenessConfig,
    write_timeout: Duration,
}

impl LivenessMonitor {
    #[must_use]
    pub const fn new(
        registry: Arc<ConnectionRegistry>,
        config: LivenessConfig,
        write_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            config,
            write_timeout,
        }
    }

    /// Inspect every connection once
    ///
    /// Idle time is read per connection at decision time, so activity that
    /// lands while the sweep runs still protects the connection.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for conn in self.registry.connections().await {
            let idle = conn.idle(Instant::now());

            if conn.ping_pending() && idle >= self.config.evict_after {
                tracing::warn!(
                    identity = %conn.identity(),
                    idle_secs = idle.as_secs(),
                    "evicting unresponsive agent connection"
                );
                self.registry.unregister(&conn).await;
                report.evicted.push(conn.identity().to_string());
                continue;
            }

            if conn.ping_pending() || idle < self.config.ping_after {
                continue;
            }

            match conn.send_ping(self.write_timeout).await {
                Ok(()) => {
                    tracing::debug!(identity = %conn.identity(), idle_secs = idle.as_secs(), "pinged idle agent");
                    report.pinged.push(conn.identity().to_string());
                }
                Err(e) => {
                    tracing::warn!(identity = %conn.identity(), error = %e, "ping failed, dropping connection");
                    self.registry.unregister(&conn).await;
                    report.evicted.push(conn.identity().to_string());
                }
            }
        }

        report
    }

    /// Sweep on every tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("liveness monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if !report.evicted.is_empty() {
                        tracing::info!(evicted = report.evicted.len(), "liveness sweep evicted connections");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::{ChannelSink, Frame};

    fn config() -> LivenessConfig {
        LivenessConfig {
            sweep_interval: Duration::from_secs(30),
            ping_after: Duration::from_secs(30),
            evict_after: Duration::from_secs(120),
            offline_grace: Duration::from_secs(30),
        }
    }

    fn monitor() -> (LivenessMonitor, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(
            EventBus::new(),
            Duration::from_secs(30),
        ));
        (
            LivenessMonitor::new(Arc::clone(&registry), config(), Duration::from_secs(5)),
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_pinged_then_evicted() {
        let (monitor, registry) = monitor();
        let (sink, mut rx) = ChannelSink::pair(8);
        registry.register("h1", Box::new(sink)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = monitor.sweep().await;
        assert_eq!(report.pinged, vec!["h1"]);
        assert_eq!(rx.recv().await, Some(Frame::Ping));

        // Pending ping is not repeated
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.sweep().await, SweepReport::default());

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = monitor.sweep().await;
        assert_eq!(report.evicted, vec!["h1"]);
        assert!(registry.lookup("h1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clears_pending_ping() {
        let (monitor, registry) = monitor();
        let (sink, _rx) = ChannelSink::pair(8);
        let conn = registry.register("h1", Box::new(sink)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        monitor.sweep().await;
        assert!(conn.ping_pending());

        tokio::time::advance(Duration::from_secs(100)).await;
        conn.touch();
        let report = monitor.sweep().await;
        assert!(report.evicted.is_empty());
        assert!(registry.lookup("h1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_unregisters() {
        let (monitor, registry) = monitor();
        let (sink, rx) = ChannelSink::pair(8);
        registry.register("h1", Box::new(sink)).await;
        drop(rx);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = monitor.sweep().await;
        assert_eq!(report.evicted, vec!["h1"]);
        assert!(registry.is_empty().await);
    }
}
