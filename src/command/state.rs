//! Command-state store with monotonic transitions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::types::{CommandEnvelope, CommandResult, CommandState, CommandStatus};
use crate::collaborators::CommandJournal;
use crate::events::{EventBus, StatusEvent};
use crate::{Error, Result};

/// Outcome of a requested state transition
#[derive(Debug, Clone)]
pub enum Transition {
    /// The transition happened; carries the new state
    Applied(CommandState),
    /// The transition was not allowed from the current status
    Unchanged(CommandStatus),
    /// No command with this ID is tracked
    Unknown,
}

impl Transition {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Tracks the lifecycle of every accepted command
pub struct CommandStateStore {
    states: RwLock<HashMap<String, CommandState>>,
    journal: Option<Arc<dyn CommandJournal>>,
    events: EventBus,
}

impl CommandStateStore {
    /// Create a store that publishes finished commands on `events`
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            journal: None,
            events,
        }
    }

    /// Persist every transition through `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn CommandJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    fn journal(&self, state: &CommandState) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(state) {
                tracing::error!(command_id = %state.id, error = %e, "failed to journal command state");
            }
        }
    }

    /// Start tracking a newly accepted command as `pending`
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` if the ID is already tracked
    pub async fn create(&self, envelope: &CommandEnvelope) -> Result<CommandState> {
        let state = CommandState::pending(envelope);
        let mut states = self.states.write().await;
        if states.contains_key(envelope.id()) {
            return Err(Error::Rejected(format!(
                "duplicate command ID '{}'",
                envelope.id()
            )));
        }
        states.insert(state.id.clone(), state.clone());
        self.journal(&state);
        Ok(state)
    }

    /// Forget a command that was never handed to the dispatcher
    pub async fn discard(&self, id: &str) {
        let mut states = self.states.write().await;
        if states.get(id).is_some_and(|s| s.status == CommandStatus::Pending) {
            states.remove(id);
        }
    }

    /// Current state of a command
    pub async fn get(&self, id: &str) -> Option<CommandState> {
        self.states.read().await.get(id).cloned()
    }

    /// Number of tracked commands
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether no commands are tracked
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    /// Apply `update` if `allowed` accepts the current status
    ///
    /// The journal write happens under the same lock so history is recorded
    /// in transition order.
    async fn transition(
        &self,
        id: &str,
        allowed: impl FnOnce(CommandStatus) -> bool,
        update: impl FnOnce(&mut CommandState),
    ) -> Transition {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(id) else {
            return Transition::Unknown;
        };
        if !allowed(state.status) {
            return Transition::Unchanged(state.status);
        }
        update(state);
        let applied = state.clone();
        self.journal(&applied);
        Transition::Applied(applied)
    }

    /// `pending` → `sent` after a successful live write
    pub async fn mark_sent(&self, id: &str) -> Transition {
        self.transition(
            id,
            |status| status == CommandStatus::Pending,
            |state| {
                state.status = CommandStatus::Sent;
                state.sent_at = Some(Utc::now());
                state.sent_instant = Some(Instant::now());
            },
        )
        .await
    }

    /// `sent` → `acknowledged`
    ///
    /// An ack may overtake the writer's `mark_sent`, so `pending` is accepted
    /// too and implies the command was sent.
    pub async fn acknowledge(&self, id: &str) -> Transition {
        self.transition(
            id,
            |status| matches!(status, CommandStatus::Pending | CommandStatus::Sent),
            |state| {
                if state.sent_at.is_none() {
                    state.sent_at = Some(Utc::now());
                }
                state.status = CommandStatus::Acknowledged;
            },
        )
        .await
    }

    /// Any non-terminal status → `completed` / `failed`, exactly once
    pub async fn complete(&self, id: &str, result: CommandResult, failed: bool) -> Transition {
        let transition = self
            .transition(
                id,
                |status| !status.is_terminal(),
                |state| {
                    state.status = if failed {
                        CommandStatus::Failed
                    } else {
                        CommandStatus::Completed
                    };
                    state.result = Some(result);
                    state.completed_at = Some(Utc::now());
                },
            )
            .await;

        if let Transition::Applied(state) = &transition {
            if let Some(identity) = &state.identity {
                self.events.publish(StatusEvent::CommandFinished {
                    command_id: state.id.clone(),
                    identity: identity.clone(),
                    kind: state.kind,
                    success: state.status == CommandStatus::Completed
                        && state.result.as_ref().is_some_and(|r| r.success),
                });
            }
        }
        transition
    }

    /// `pending` → `canceled`
    pub async fn cancel(&self, id: &str) -> Transition {
        self.transition(
            id,
            |status| status == CommandStatus::Pending,
            |state| {
                state.status = CommandStatus::Canceled;
                state.completed_at = Some(Utc::now());
            },
        )
        .await
    }

    /// Move every `sent` command older than `grace` to `timed-out`
    ///
    /// Returns the IDs that timed out.
    pub async fn sweep_timeouts(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut states = self.states.write().await;
        let mut expired = Vec::new();
        for state in states.values_mut().filter(|state| {
            state.status == CommandStatus::Sent
                && state
                    .sent_instant
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= grace)
        }) {
            state.status = CommandStatus::TimedOut;
            state.completed_at = Some(Utc::now());
            tracing::warn!(
                command_id = %state.id,
                target = %state.target,
                "command not acknowledged within grace period, marking timed out"
            );
            self.journal(state);
            expired.push(state.id.clone());
        }
        expired
    }

    /// Move every `pending` command created before `cutoff` to `timed-out`
    ///
    /// Covers commands parked for agents that never poll. Returns the
    /// expired states so the caller can withdraw them from the poll store.
    pub async fn expire_pending_before(&self, cutoff: DateTime<Utc>) -> Vec<CommandState> {
        let mut states = self.states.write().await;
        let mut expired = Vec::new();
        for state in states
            .values_mut()
            .filter(|state| state.status == CommandStatus::Pending && state.created_at < cutoff)
        {
            state.status = CommandStatus::TimedOut;
            state.completed_at = Some(Utc::now());
            tracing::warn!(
                command_id = %state.id,
                target = %state.target,
                "command never collected by its agent, marking timed out"
            );
            self.journal(state);
            expired.push(state.clone());
        }
        expired
    }

    /// Drop terminal states that finished before `cutoff`
    ///
    /// Returns the number of states removed.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, state| {
            !(state.status.is_terminal() && state.completed_at.is_some_and(|at| at < cutoff))
        });
        before - states.len()
    }
}
