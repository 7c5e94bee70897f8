//! Status events shared between the registry, router, and reconciler
//!
//! Publishing is best-effort: with no subscribers the event is dropped and a
//! slow subscriber sees `Lagged` rather than blocking publishers.

use tokio::sync::broadcast;

use crate::command::CommandKind;

/// Default capacity of the event bus
const BUS_CAPACITY: usize = 1024;

/// Externally visible change in agent or command status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Agent completed a handshake
    AgentOnline { identity: String },
    /// Agent stayed disconnected past the grace window
    AgentOffline { identity: String },
    /// A command reached `completed` or `failed`
    CommandFinished {
        command_id: String,
        identity: String,
        kind: CommandKind,
        success: bool,
    },
}

impl StatusEvent {
    /// Event type name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AgentOnline { .. } => "agent.online",
            Self::AgentOffline { .. } => "agent.offline",
            Self::CommandFinished { .. } => "command.finished",
        }
    }
}

/// Broadcast bus for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event (best-effort, never blocks)
    pub fn publish(&self, event: StatusEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "no status subscribers");
        }
    }

    /// Subscribe to events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(StatusEvent::AgentOnline {
            identity: "h1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "agent.online");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(StatusEvent::AgentOffline {
            identity: "h1".to_string(),
        });
    }
}
