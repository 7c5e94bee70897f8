//! Fleet Dispatch - agent connection registry and command dispatcher
//!
//! This library keeps live WebSocket connections to a fleet of endpoint
//! agents and delivers commands to them:
//! - Connection registry with last-handshake-wins semantics and debounced offline
//! - Liveness sweep that pings idle agents and evicts unresponsive ones
//! - Strict-priority dispatch with group fan-out and a poll-channel fallback
//! - Inbound routing of acknowledgements and completion reports
//! - Status reconciliation into the agent inventory
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │              HTTP API / WebSocket upgrade           │
//! └──────────┬─────────────────────────────┬───────────┘
//!            │ submit / isolate            │ frames
//! ┌──────────▼──────────┐        ┌─────────▼──────────┐
//! │     Dispatcher      │───────▶│ Connection Registry │◀── Liveness Monitor
//! │ critical │ normal   │ lookup └─────────┬──────────┘
//! └──────────┬──────────┘                  │ read loop
//!            │ fallback          ┌─────────▼──────────┐
//!            ▼                   │   Inbound Router    │
//!      Pending Store             └─────────┬──────────┘
//!                                          │ events
//!                                ┌─────────▼──────────┐
//!                                │  Status Reconciler  │──▶ Inventory
//!                                └────────────────────┘
//! ```

pub mod api;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod inbound;
pub mod liveness;
pub mod reconciler;
pub mod registry;

pub use collaborators::{AgentRecord, CommandJournal, Inventory, PendingStore};
pub use command::{
    CommandEnvelope, CommandKind, CommandResult, CommandState, CommandStateStore, CommandStatus,
    Priority, Target, Transition,
};
pub use config::Config;
pub use daemon::{Daemon, Services};
pub use db::{DbConn, DbPool};
pub use dispatch::{DeliveryOutcome, Dispatcher, UrgentReceipt};
pub use error::{Error, Result};
pub use events::{EventBus, StatusEvent};
pub use inbound::{InboundMessage, InboundRouter};
pub use liveness::LivenessMonitor;
pub use reconciler::StatusReconciler;
pub use registry::{AgentConnection, ChannelSink, ConnectionRegistry, Frame, FrameSink};
