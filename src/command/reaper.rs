//! Background sweep that times out unacknowledged commands

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::state::CommandStateStore;
use crate::collaborators::PendingStore;

/// Periodically moves stale `sent` commands to `timed-out` and purges old
/// finished states
///
/// Commands still `pending` after the retention window are expired too and
/// withdrawn from the poll store, so agents that never poll do not pin them.
pub struct AckReaper {
    states: Arc<CommandStateStore>,
    pending: Arc<dyn PendingStore>,
    interval: Duration,
    ack_timeout: Duration,
    retention: Duration,
}

impl AckReaper {
    #[must_use]
    pub fn new(
        states: Arc<CommandStateStore>,
        pending: Arc<dyn PendingStore>,
        interval: Duration,
        ack_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            states,
            pending,
            interval,
            ack_timeout,
            retention,
        }
    }

    /// Run one sweep; returns the IDs that timed out
    pub async fn sweep(&self) -> Vec<String> {
        let expired = self.states.sweep_timeouts(self.ack_timeout).await;

        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = chrono::Utc::now() - retention;

        for state in self.states.expire_pending_before(cutoff).await {
            let Some(identity) = &state.identity else {
                continue;
            };
            if let Err(e) = self.pending.withdraw(identity, &state.id).await {
                tracing::warn!(command_id = %state.id, identity, error = %e, "failed to withdraw expired command");
            }
        }

        let purged = self.states.purge_finished_before(cutoff).await;
        if purged > 0 {
            tracing::debug!(purged, "purged finished command states");
        }

        expired
    }

    /// Sweep on every tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("ack reaper stopped");
                    return;
                }
                _ = interval.tick() => {
                    let expired = self.sweep().await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "timed out unacknowledged commands");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandEnvelope, CommandKind, CommandStatus, Priority, Target};
    use crate::db::{self, PendingCommandRepo};
    use crate::events::EventBus;

    fn envelope(id: &str) -> CommandEnvelope {
        CommandEnvelope::new(
            id,
            CommandKind::GetSystemInfo,
            Priority::Normal,
            serde_json::Value::Null,
            Target::Node("h1".into()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_sent_commands() {
        let states = Arc::new(CommandStateStore::new(EventBus::new()));
        states.create(&envelope("cmd-1")).await.unwrap();
        states.mark_sent("cmd-1").await;

        let pending = Arc::new(PendingCommandRepo::new(db::init_memory().unwrap()));
        let cancel = CancellationToken::new();
        let reaper = AckReaper::new(
            Arc::clone(&states),
            pending,
            Duration::from_secs(5),
            Duration::from_secs(20),
            Duration::from_secs(3600),
        );
        let handle = tokio::spawn(reaper.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(
            states.get("cmd-1").await.unwrap().status,
            CommandStatus::TimedOut
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_expires_parked_commands_after_retention() {
        let states = Arc::new(CommandStateStore::new(EventBus::new()));
        let pending = Arc::new(PendingCommandRepo::new(db::init_memory().unwrap()));

        let parked = envelope("cmd-parked");
        states.create(&parked).await.unwrap();
        pending.enqueue_for_poll("h1", &parked).await.unwrap();

        let reaper = AckReaper::new(
            Arc::clone(&states),
            Arc::clone(&pending) as Arc<dyn PendingStore>,
            Duration::from_secs(5),
            Duration::from_secs(20),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        reaper.sweep().await;

        assert_eq!(
            states.get("cmd-parked").await.unwrap().status,
            CommandStatus::TimedOut
        );
        assert_eq!(pending.count("h1").unwrap(), 0);
    }
}
