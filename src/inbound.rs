//! Per-connection inbound read loop
//!
//! Each connection has exactly one reader. Frames are classified by shape and
//! applied to the command-state store; the loop's only cleanup on exit is
//! [`ConnectionRegistry::unregister`].

use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::Result;
use crate::command::{CommandResult, CommandStateStore, InboundFrame, Transition, classify_frame};
use crate::registry::{AgentConnection, ConnectionRegistry};

/// Transport-neutral inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// What the read loop should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Malformed,
    Close,
}

/// Applies agent reports to command state
pub struct InboundRouter {
    registry: Arc<ConnectionRegistry>,
    states: Arc<CommandStateStore>,
    max_malformed: u32,
}

impl InboundRouter {
    #[must_use]
    pub const fn new(
        registry: Arc<ConnectionRegistry>,
        states: Arc<CommandStateStore>,
        max_malformed: u32,
    ) -> Self {
        Self {
            registry,
            states,
            max_malformed,
        }
    }

    /// Whether `identity` is the agent the command was addressed to
    async fn owned_by(&self, command_id: &str, identity: &str) -> bool {
        match self.states.get(command_id).await {
            Some(state) if state.identity.as_deref() == Some(identity) => true,
            Some(state) => {
                tracing::warn!(
                    command_id,
                    identity,
                    target = %state.target,
                    "ignoring report from agent the command was not sent to"
                );
                false
            }
            None => {
                tracing::debug!(command_id, identity, "report for unknown command dropped");
                false
            }
        }
    }

    /// Apply an acknowledgement from `identity`
    pub async fn apply_ack(&self, identity: &str, command_id: &str) -> Transition {
        if !self.owned_by(command_id, identity).await {
            return Transition::Unknown;
        }
        let transition = self.states.acknowledge(command_id).await;
        match &transition {
            Transition::Applied(_) => {
                tracing::debug!(command_id, identity, "command acknowledged");
            }
            Transition::Unchanged(status) => {
                tracing::debug!(command_id, identity, status = %status, "late acknowledgement ignored");
            }
            Transition::Unknown => {}
        }
        transition
    }

    /// Apply a completion report from `identity`
    ///
    /// Duplicates after the first terminal report are no-ops.
    pub async fn apply_completion(
        &self,
        identity: &str,
        command_id: &str,
        result: CommandResult,
        failed: bool,
    ) -> Transition {
        if !self.owned_by(command_id, identity).await {
            return Transition::Unknown;
        }
        let transition = self.states.complete(command_id, result, failed).await;
        match &transition {
            Transition::Applied(state) => {
                tracing::info!(command_id, identity, status = %state.status, "command finished");
            }
            Transition::Unchanged(status) => {
                tracing::debug!(command_id, identity, status = %status, "duplicate completion ignored");
            }
            Transition::Unknown => {}
        }
        transition
    }

    /// Handle one inbound message on `conn`
    pub async fn handle_message(&self, conn: &AgentConnection, message: InboundMessage) -> FrameOutcome {
        let text = match message {
            InboundMessage::Text(text) => text,
            InboundMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(identity = %conn.identity(), "non-UTF-8 binary frame");
                    return FrameOutcome::Malformed;
                }
            },
            InboundMessage::Ping | InboundMessage::Pong => return FrameOutcome::Continue,
            InboundMessage::Close => return FrameOutcome::Close,
        };

        match classify_frame(&text) {
            Ok(InboundFrame::Ack { command_id, .. }) => {
                self.apply_ack(conn.identity(), &command_id).await;
                FrameOutcome::Continue
            }
            Ok(InboundFrame::Completion {
                command_id,
                failed,
                result,
                ..
            }) => {
                self.apply_completion(conn.identity(), &command_id, result, failed)
                    .await;
                FrameOutcome::Continue
            }
            Ok(InboundFrame::Heartbeat) => FrameOutcome::Continue,
            Err(e) => {
                tracing::debug!(identity = %conn.identity(), error = %e, "malformed frame");
                FrameOutcome::Malformed
            }
        }
    }

    /// Read `stream` until it ends, errors, or the connection closes, then
    /// unregister the connection
    pub async fn run<S>(&self, conn: Arc<AgentConnection>, mut stream: S)
    where
        S: Stream<Item = Result<InboundMessage>> + Unpin + Send,
    {
        let mut malformed = 0u32;

        loop {
            let next = tokio::select! {
                () = conn.closed() => break,
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!(identity = %conn.identity(), error = %e, "read error");
                    break;
                }
                None => break,
            };

            conn.touch();
            match self.handle_message(&conn, message).await {
                FrameOutcome::Continue => malformed = 0,
                FrameOutcome::Malformed => {
                    malformed += 1;
                    if malformed > self.max_malformed {
                        tracing::warn!(
                            identity = %conn.identity(),
                            malformed,
                            "too many malformed frames, dropping connection"
                        );
                        break;
                    }
                }
                FrameOutcome::Close => break,
            }
        }

        self.registry.unregister(&conn).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::command::{CommandEnvelope, CommandKind, CommandStatus, Priority, Target};
    use crate::events::EventBus;
    use crate::registry::ChannelSink;

    async fn setup() -> (InboundRouter, Arc<ConnectionRegistry>, Arc<CommandStateStore>) {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(bus.clone(), Duration::from_secs(30)));
        let states = Arc::new(CommandStateStore::new(bus));
        let envelope = CommandEnvelope::new(
            "cmd-1",
            CommandKind::KillProcess,
            Priority::Normal,
            serde_json::json!({"pid": 4242}),
            Target::Node("h1".into()),
        )
        .unwrap();
        states.create(&envelope).await.unwrap();
        states.mark_sent("cmd-1").await;
        (
            InboundRouter::new(Arc::clone(&registry), Arc::clone(&states), 2),
            registry,
            states,
        )
    }

    fn text(s: &str) -> Result<InboundMessage> {
        Ok(InboundMessage::Text(s.to_string()))
    }

    #[tokio::test]
    async fn ack_then_completion_then_stream_end() {
        let (router, registry, states) = setup().await;
        let (sink, _rx) = ChannelSink::pair(8);
        let conn = registry.register("h1", Box::new(sink)).await;

        let frames = stream::iter(vec![
            text(r#"{"command_id":"cmd-1","status":"received","timestamp":"2024-05-01T10:00:00Z"}"#),
            text(r#"{"type":"heartbeat"}"#),
            text(r#"{"command_id":"cmd-1","status":"completed","success":true,"message":"killed","timestamp":"2024-05-01T10:00:01Z"}"#),
            text(r#"{"command_id":"cmd-1","status":"failed","success":false,"message":"dup","timestamp":"2024-05-01T10:00:02Z"}"#),
        ]);
        router.run(Arc::clone(&conn), frames).await;

        let state = states.get("cmd-1").await.unwrap();
        assert_eq!(state.status, CommandStatus::Completed);
        assert_eq!(state.result.unwrap().message, "killed");
        assert!(conn.is_closed());
        assert!(registry.lookup("h1").await.is_none());
    }

    #[tokio::test]
    async fn report_from_wrong_agent_is_ignored() {
        let (router, registry, states) = setup().await;
        let (sink, _rx) = ChannelSink::pair(8);
        let conn = registry.register("h2", Box::new(sink)).await;

        let outcome = router
            .handle_message(
                &conn,
                InboundMessage::Text(
                    r#"{"command_id":"cmd-1","status":"received"}"#.to_string(),
                ),
            )
            .await;
        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(states.get("cmd-1").await.unwrap().status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn malformed_frames_beyond_threshold_drop_connection() {
        let (router, registry, states) = setup().await;
        let (sink, _rx) = ChannelSink::pair(8);
        let conn = registry.register("h1", Box::new(sink)).await;

        let frames = stream::iter(vec![
            text("garbage"),
            text("garbage"),
            text("garbage"),
            // Never reached
            text(r#"{"command_id":"cmd-1","status":"received"}"#),
        ]);
        router.run(Arc::clone(&conn), frames).await;

        assert!(registry.lookup("h1").await.is_none());
        assert_eq!(states.get("cmd-1").await.unwrap().status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn valid_frame_resets_malformed_count() {
        let (router, registry, states) = setup().await;
        let (sink, _rx) = ChannelSink::pair(8);
        let conn = registry.register("h1", Box::new(sink)).await;

        let frames = stream::iter(vec![
            text("garbage"),
            text("garbage"),
            text(r#"{"type":"heartbeat"}"#),
            text("garbage"),
            text(r#"{"command_id":"cmd-1","status":"received"}"#),
            Ok(InboundMessage::Close),
        ]);
        router.run(Arc::clone(&conn), frames).await;

        assert_eq!(
            states.get("cmd-1").await.unwrap().status,
            CommandStatus::Acknowledged
        );
    }
}
