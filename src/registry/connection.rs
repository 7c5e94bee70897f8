//! A single live agent connection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::transport::{Frame, FrameSink};
use crate::{Error, Result};

/// Upper bound on the best-effort close frame
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Live duplex connection to one agent
///
/// Writes are serialized by the sink lock. Activity is tracked lock-free as
/// milliseconds since the connection opened.
pub struct AgentConnection {
    identity: String,
    conn_id: u64,
    connected_at: DateTime<Utc>,
    opened: Instant,
    /// Milliseconds after `opened` of the most recent activity
    last_activity_ms: AtomicU64,
    ping_pending: AtomicBool,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("identity", &self.identity)
            .field("conn_id", &self.conn_id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AgentConnection {
    /// Wrap a sink as a new connection
    #[must_use]
    pub fn new(identity: impl Into<String>, conn_id: u64, sink: Box<dyn FrameSink>) -> Self {
        Self {
            identity: identity.into(),
            conn_id,
            connected_at: Utc::now(),
            opened: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            ping_pending: AtomicBool::new(false),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Registry-assigned ID distinguishing successive connections of one agent
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }

    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Monotonic time of the most recent activity
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.opened + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Time since the most recent activity, measured at `now`
    #[must_use]
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Record activity and clear any outstanding ping
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.opened);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(ms, Ordering::AcqRel);
        self.ping_pending.store(false, Ordering::Release);
    }

    /// Whether a liveness ping is awaiting any response
    #[must_use]
    pub fn ping_pending(&self) -> bool {
        self.ping_pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Write a frame, bounded by `timeout`
    ///
    /// Text writes count as activity; pings do not.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the connection is closed, the write
    /// fails, or the write does not finish in time
    pub async fn send(&self, frame: Frame, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport(format!(
                "connection to {} is closed",
                self.identity
            )));
        }

        let counts_as_activity = matches!(frame, Frame::Text(_));
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                if counts_as_activity {
                    self.touch();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Transport(format!(
                "write to {} timed out after {timeout:?}",
                self.identity
            ))),
        }
    }

    /// Mark a liveness ping pending and send it
    ///
    /// The flag is raised before the write so a reply that lands while the
    /// write is still in progress clears it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the ping cannot be written
    pub async fn send_ping(&self, timeout: Duration) -> Result<()> {
        self.ping_pending.store(true, Ordering::Release);
        if let Err(e) = self.send(Frame::Ping, timeout).await {
            self.ping_pending.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection; only the first call has any effect
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        // Best-effort close frame; the peer may already be gone
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(Frame::Close).await
        };
        match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(identity = %self.identity, error = %e, "close frame not delivered");
            }
            Err(_) => {
                tracing::debug!(identity = %self.identity, "close frame timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, OnceLock, Weak};

    use async_trait::async_trait;

    use super::*;
    use crate::registry::ChannelSink;

    /// Sink that never completes a write
    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _frame: Frame) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_write_refreshes_activity_but_ping_does_not() {
        let (sink, mut rx) = ChannelSink::pair(8);
        let conn = AgentConnection::new("h1", 1, Box::new(sink));

        tokio::time::advance(Duration::from_secs(40)).await;
        conn.send_ping(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Ping));
        assert!(conn.ping_pending());
        assert!(conn.idle(Instant::now()) >= Duration::from_secs(40));

        conn.send(Frame::Text("{}".to_string()), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!conn.ping_pending());
        assert!(conn.idle(Instant::now()) < Duration::from_secs(1));
    }

    /// Sink that records activity on its own connection while a ping is in flight
    struct AnsweringSink {
        conn: Arc<OnceLock<Weak<AgentConnection>>>,
    }

    #[async_trait]
    impl FrameSink for AnsweringSink {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            if frame == Frame::Ping {
                if let Some(conn) = self.conn.get().and_then(Weak::upgrade) {
                    conn.touch();
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_during_ping_write_clears_pending() {
        let slot = Arc::new(OnceLock::new());
        let conn = Arc::new(AgentConnection::new(
            "h1",
            1,
            Box::new(AnsweringSink {
                conn: Arc::clone(&slot),
            }),
        ));
        slot.set(Arc::downgrade(&conn)).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        conn.send_ping(Duration::from_secs(1)).await.unwrap();

        assert!(!conn.ping_pending());
        assert!(conn.idle(Instant::now()) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_ping_does_not_stay_pending() {
        let (sink, rx) = ChannelSink::pair(8);
        let conn = AgentConnection::new("h1", 1, Box::new(sink));
        drop(rx);

        assert!(conn.send_ping(Duration::from_secs(1)).await.is_err());
        assert!(!conn.ping_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let conn = AgentConnection::new("h1", 1, Box::new(StalledSink));
        let err = conn
            .send(Frame::Text("{}".to_string()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (sink, mut rx) = ChannelSink::pair(8);
        let conn = AgentConnection::new("h1", 1, Box::new(sink));

        conn.close().await;
        conn.close().await;
        conn.closed().await;

        assert!(conn.is_closed());
        assert_eq!(rx.recv().await, Some(Frame::Close));
        assert!(rx.try_recv().is_err());
        assert!(
            conn.send(Frame::Text("{}".to_string()), Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
