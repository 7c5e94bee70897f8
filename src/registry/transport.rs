//! Outbound frame sink abstraction
//!
//! The registry never touches a socket type directly. The WebSocket handler
//! wraps its split sink in a [`FrameSink`]; tests and in-process agents use
//! [`ChannelSink`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// A frame written to an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON text frame
    Text(String),
    /// Transport-level ping
    Ping,
    /// Close the stream
    Close,
}

/// Write half of an agent connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the underlying stream is broken
    async fn send(&mut self, frame: Frame) -> Result<()>;
}

/// [`FrameSink`] backed by an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes its frames
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("peer receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_frames() {
        let (mut sink, mut rx) = ChannelSink::pair(4);
        sink.send(Frame::Text("hello".to_string())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Text("hello".to_string())));
    }

    #[tokio::test]
    async fn dropped_receiver_is_transport_error() {
        let (mut sink, rx) = ChannelSink::pair(1);
        drop(rx);
        let err = sink.send(Frame::Ping).await.unwrap_err();
        assert!(err.is_transport());
    }
}
