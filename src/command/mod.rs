//! Command envelopes, wire frames, and command-state tracking
//!
//! An envelope is the immutable description of one unit of work for an agent.
//! Its mutable lifecycle lives in [`CommandStateStore`], keyed by command ID.

pub mod reaper;
pub mod state;
pub mod types;
pub mod wire;

pub use reaper::AckReaper;
pub use state::{CommandStateStore, Transition};
pub use types::{
    CommandEnvelope, CommandKind, CommandResult, CommandState, CommandStatus, MEMBER_SEPARATOR,
    Priority, Target,
};
pub use wire::{InboundFrame, OutboundCommand, classify_frame};
