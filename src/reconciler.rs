//! Mirrors connection and command outcomes into the agent inventory

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::collaborators::Inventory;
use crate::command::CommandKind;
use crate::events::StatusEvent;

/// Applies [`StatusEvent`]s to the inventory's online and isolation flags
pub struct StatusReconciler {
    inventory: Arc<dyn Inventory>,
}

impl StatusReconciler {
    #[must_use]
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// Apply a single event
    ///
    /// # Errors
    ///
    /// Returns the inventory error if the update fails
    pub async fn apply(&self, event: &StatusEvent) -> Result<()> {
        match event {
            StatusEvent::AgentOnline { identity } => self.inventory.set_online(identity).await,
            StatusEvent::AgentOffline { identity } => self.inventory.set_offline(identity).await,
            StatusEvent::CommandFinished {
                identity,
                kind,
                success: true,
                ..
            } => match kind {
                CommandKind::IsolateHost => self.inventory.set_isolated(identity, true).await,
                CommandKind::UnisolateHost => self.inventory.set_isolated(identity, false).await,
                _ => Ok(()),
            },
            StatusEvent::CommandFinished { .. } => Ok(()),
        }
    }

    /// Consume events from `rx` until `cancel` fires or the bus closes
    pub async fn run(self, mut rx: broadcast::Receiver<StatusEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => event,
            };

            match event {
                Ok(event) => {
                    if let Err(e) = self.apply(&event).await {
                        tracing::warn!(event = event.name(), error = %e, "failed to reconcile status");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status reconciler lagged behind event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("status reconciler stopped");
    }
}
