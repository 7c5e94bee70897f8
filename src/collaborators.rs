//! Capabilities the dispatcher consumes but does not own
//!
//! The agent inventory, the fallback poll queue, and the command journal are
//! external services. [`crate::db`] provides SQLite-backed implementations.

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::command::{CommandEnvelope, CommandState};

/// Inventory record for a known agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRecord {
    pub identity: String,
    pub status: String,
    pub isolated: bool,
}

/// Agent inventory: identity lookup, group membership, and status flags
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Look up an agent by identity
    async fn get_by_identity(&self, identity: &str) -> Result<Option<AgentRecord>>;

    /// Current members of a group
    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>>;

    /// Mark an agent online
    async fn set_online(&self, identity: &str) -> Result<()>;

    /// Mark an agent offline
    async fn set_offline(&self, identity: &str) -> Result<()>;

    /// Record whether an agent is network-isolated
    async fn set_isolated(&self, identity: &str, isolated: bool) -> Result<()>;
}

/// Per-agent queue read by the fallback poll channel
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Park a command until the agent next polls
    async fn enqueue_for_poll(&self, identity: &str, envelope: &CommandEnvelope) -> Result<()>;

    /// Remove and return every parked command for an agent, oldest first
    async fn drain_for_poll(&self, identity: &str) -> Result<Vec<CommandEnvelope>>;

    /// Remove one parked command; returns whether it was still parked
    async fn withdraw(&self, identity: &str, command_id: &str) -> Result<bool>;
}

/// Durable record of command state transitions
pub trait CommandJournal: Send + Sync {
    /// Persist the latest state of a command
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn record(&self, state: &CommandState) -> Result<()>;
}
