//! Outbound command dispatch
//!
//! Accepted commands wait in a two-level priority queue. A single drain task
//! resolves each target, writes the command to the live connection when there
//! is one, and parks it in the pending store for the agent's next poll when
//! there is not.

mod queue;

pub use queue::PriorityQueue;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{Inventory, PendingStore};
use crate::command::{
    CommandEnvelope, CommandKind, CommandResult, CommandState, CommandStateStore, CommandStatus,
    MEMBER_SEPARATOR, OutboundCommand, Priority, Target, Transition,
};
use crate::registry::{ConnectionRegistry, Frame};
use crate::{Error, Result};

/// Where a command ended up after a delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Written to the agent's live connection
    DeliveredLive,
    /// Parked in the pending store until the agent polls
    QueuedForPoll,
}

/// Receipt for a command dispatched outside the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrgentReceipt {
    pub command_id: String,
    pub outcome: DeliveryOutcome,
}

/// Fan-out tally for a group command
#[derive(Debug, Default, Clone, Copy, Serialize)]
struct FanOut {
    members: usize,
    delivered_live: usize,
    queued_for_poll: usize,
    failed: usize,
}

/// Member instance IDs are derived with [`MEMBER_SEPARATOR`], so callers may not use it
fn reject_reserved_id(envelope: &CommandEnvelope) -> Result<()> {
    if envelope.id().contains(MEMBER_SEPARATOR) {
        return Err(Error::Rejected(format!(
            "command ID '{}' must not contain '{MEMBER_SEPARATOR}'",
            envelope.id()
        )));
    }
    Ok(())
}

/// Routes commands to agents with strict priority and a poll fallback
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    states: Arc<CommandStateStore>,
    inventory: Arc<dyn Inventory>,
    pending: Arc<dyn PendingStore>,
    queue: PriorityQueue,
    write_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        states: Arc<CommandStateStore>,
        inventory: Arc<dyn Inventory>,
        pending: Arc<dyn PendingStore>,
        queue_capacity: usize,
        write_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            states,
            inventory,
            pending,
            queue: PriorityQueue::new(queue_capacity),
            write_timeout,
        }
    }

    /// Command-state store shared with the router and reaper
    #[must_use]
    pub const fn states(&self) -> &Arc<CommandStateStore> {
        &self.states
    }

    /// Queue depth as `(critical, normal)`
    pub async fn queue_depth(&self) -> (usize, usize) {
        self.queue.depth().await
    }

    /// Accept a command for queued delivery
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` for a duplicate ID, an ID containing
    /// [`MEMBER_SEPARATOR`], or a full queue
    pub async fn submit(&self, envelope: CommandEnvelope) -> Result<CommandState> {
        reject_reserved_id(&envelope)?;
        let state = self.states.create(&envelope).await?;
        let id = envelope.id().to_string();

        if let Err(e) = self.queue.push(envelope).await {
            self.states.discard(&id).await;
            tracing::warn!(command_id = %id, error = %e, "command rejected");
            return Err(e);
        }

        tracing::info!(
            command_id = %id,
            kind = %state.kind,
            priority = state.priority.as_str(),
            target = %state.target,
            "command accepted"
        );
        Ok(state)
    }

    /// Deliver a single-agent command immediately, bypassing the queue
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` for a group target or duplicate ID, or the
    /// pending-store error if the fallback also fails
    pub async fn dispatch_urgent(&self, envelope: CommandEnvelope) -> Result<DeliveryOutcome> {
        if envelope.target().node().is_none() {
            return Err(Error::Rejected(
                "urgent dispatch requires a single-node target".to_string(),
            ));
        }
        reject_reserved_id(&envelope)?;
        self.states.create(&envelope).await?;
        self.deliver(&envelope).await
    }

    /// Network-isolate a host, live when possible
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownAgent` if the inventory does not know the host
    pub async fn isolate_host(&self, identity: &str, reason: &str) -> Result<UrgentReceipt> {
        let details = serde_json::json!({
            "reason": reason,
            "allow_portal_communication": true,
            "allow_dns": true,
        });
        self.urgent_for_host(identity, CommandKind::IsolateHost, details)
            .await
    }

    /// Lift network isolation from a host
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownAgent` if the inventory does not know the host
    pub async fn release_host(&self, identity: &str, reason: &str) -> Result<UrgentReceipt> {
        let details = serde_json::json!({ "reason": reason });
        self.urgent_for_host(identity, CommandKind::UnisolateHost, details)
            .await
    }

    async fn urgent_for_host(
        &self,
        identity: &str,
        kind: CommandKind,
        details: serde_json::Value,
    ) -> Result<UrgentReceipt> {
        if self.inventory.get_by_identity(identity).await?.is_none() {
            return Err(Error::UnknownAgent(identity.to_string()));
        }

        let command_id = format!("cmd-{}", uuid::Uuid::new_v4());
        let envelope = CommandEnvelope::new(
            command_id.clone(),
            kind,
            Priority::Critical,
            details,
            Target::Node(identity.to_string()),
        )?;

        let outcome = self.dispatch_urgent(envelope).await?;
        tracing::info!(identity, command_id = %command_id, kind = %kind, ?outcome, "urgent command dispatched");
        Ok(UrgentReceipt {
            command_id,
            outcome,
        })
    }

    /// Cancel a command that has not been sent
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown ID and `Error::NotCancelable`
    /// once the command has left `pending` or is mid-delivery
    pub async fn cancel(&self, id: &str) -> Result<CommandState> {
        let state = self
            .states
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("command {id}")))?;

        let not_cancelable = |status: CommandStatus| Error::NotCancelable {
            id: id.to_string(),
            status: status.to_string(),
        };

        if state.status != CommandStatus::Pending {
            return Err(not_cancelable(state.status));
        }

        let withdrawn = if self.queue.remove(id).await {
            true
        } else if let Some(identity) = &state.identity {
            self.pending.withdraw(identity, id).await?
        } else {
            false
        };

        if !withdrawn {
            // Popped by the drain task and not yet written
            return Err(not_cancelable(state.status));
        }

        match self.states.cancel(id).await {
            Transition::Applied(state) => {
                tracing::info!(command_id = %id, "command canceled");
                Ok(state)
            }
            Transition::Unchanged(status) => Err(not_cancelable(status)),
            Transition::Unknown => Err(Error::NotFound(format!("command {id}"))),
        }
    }

    /// Drain both lanes until `cancel` fires
    ///
    /// Each lane has its own drain so a stalled normal write never holds up
    /// critical work.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::join!(
            self.drain(Priority::Critical, &cancel),
            self.drain(Priority::Normal, &cancel),
        );
        tracing::debug!("dispatcher stopped");
    }

    async fn drain(&self, priority: Priority, cancel: &CancellationToken) {
        loop {
            let envelope = tokio::select! {
                () = cancel.cancelled() => return,
                envelope = self.queue.pop_lane(priority) => envelope,
            };
            self.process(&envelope).await;
        }
    }

    /// Resolve and deliver one dequeued command
    ///
    /// Commands that left `pending` while queued are skipped.
    pub async fn process(&self, envelope: &CommandEnvelope) {
        match self.states.get(envelope.id()).await {
            Some(state) if state.status == CommandStatus::Pending => {}
            Some(state) => {
                tracing::debug!(command_id = %envelope.id(), status = %state.status, "skipping command no longer pending");
                return;
            }
            None => {
                tracing::debug!(command_id = %envelope.id(), "skipping untracked command");
                return;
            }
        }

        match envelope.target() {
            Target::Node(_) => {
                if let Err(e) = self.deliver(envelope).await {
                    tracing::error!(command_id = %envelope.id(), error = %e, "command delivery failed");
                }
            }
            Target::Group(group) => self.fan_out(envelope, group).await,
        }
    }

    /// Deliver one instance per group member, using membership as of now
    async fn fan_out(&self, envelope: &CommandEnvelope, group: &str) {
        let members = match self.inventory.list_group_members(group).await {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(command_id = %envelope.id(), group, error = %e, "group lookup failed");
                self.finish(envelope.id(), false, format!("group lookup failed: {e}"), None)
                    .await;
                return;
            }
        };

        if members.is_empty() {
            tracing::warn!(command_id = %envelope.id(), group, "group has no members");
            self.finish(envelope.id(), false, format!("group {group} has no members"), None)
                .await;
            return;
        }

        let mut tally = FanOut {
            members: members.len(),
            ..FanOut::default()
        };

        for member in &members {
            let sub = envelope.for_member(member);
            if let Err(e) = self.states.create(&sub).await {
                tracing::error!(command_id = %sub.id(), error = %e, "group member instance could not be tracked");
                tally.failed += 1;
                continue;
            }
            match self.deliver(&sub).await {
                Ok(DeliveryOutcome::DeliveredLive) => tally.delivered_live += 1,
                Ok(DeliveryOutcome::QueuedForPoll) => tally.queued_for_poll += 1,
                Err(e) => {
                    tracing::error!(command_id = %sub.id(), error = %e, "group member delivery failed");
                    tally.failed += 1;
                }
            }
        }

        tracing::info!(
            command_id = %envelope.id(),
            group,
            members = tally.members,
            live = tally.delivered_live,
            queued = tally.queued_for_poll,
            failed = tally.failed,
            "group command fanned out"
        );
        let details = serde_json::to_value(tally).ok();
        // Any member left without a tracked, delivered instance fails the parent
        self.finish(
            envelope.id(),
            tally.failed == 0,
            format!("dispatched to {} of {} members", tally.members - tally.failed, tally.members),
            details,
        )
        .await;
    }

    async fn finish(
        &self,
        id: &str,
        success: bool,
        message: String,
        details: Option<serde_json::Value>,
    ) {
        let result = CommandResult {
            success,
            message,
            details,
        };
        self.states.complete(id, result, !success).await;
    }

    /// Single-agent delivery with poll fallback
    async fn deliver(&self, envelope: &CommandEnvelope) -> Result<DeliveryOutcome> {
        let Some(identity) = envelope.target().node() else {
            return Err(Error::Rejected(format!(
                "command {} has no single-node target",
                envelope.id()
            )));
        };

        if let Some(conn) = self.registry.lookup(identity).await {
            let frame = serde_json::to_string(&OutboundCommand::from(envelope))?;
            match conn.send(Frame::Text(frame), self.write_timeout).await {
                Ok(()) => {
                    self.states.mark_sent(envelope.id()).await;
                    tracing::debug!(command_id = %envelope.id(), identity, "command delivered live");
                    return Ok(DeliveryOutcome::DeliveredLive);
                }
                Err(e) => {
                    tracing::warn!(
                        command_id = %envelope.id(),
                        identity,
                        error = %e,
                        "live write failed, falling back to poll"
                    );
                    self.registry.unregister(&conn).await;
                }
            }
        }

        if let Err(e) = self.pending.enqueue_for_poll(identity, envelope).await {
            self.finish(
                envelope.id(),
                false,
                format!("agent unreachable and pending store failed: {e}"),
                None,
            )
            .await;
            return Err(e);
        }

        tracing::debug!(command_id = %envelope.id(), identity, "command queued for poll");
        Ok(DeliveryOutcome::QueuedForPoll)
    }
}
