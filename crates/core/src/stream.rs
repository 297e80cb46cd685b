//! The seam to the remote speech-to-speech transport.

use crate::frame::{InboundFrame, OutboundFrame};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Frames to be sent to the remote service, in order. Ends when the session
/// has nothing more to send.
pub type OutboundFrames = Pin<Box<dyn Stream<Item = OutboundFrame> + Send>>;

/// Frames received from the remote service.
pub type InboundFrames = Pin<Box<dyn Stream<Item = Result<InboundFrame, InferenceError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to open inference stream: {0}")]
    Connect(String),
    #[error("inference stream transport failed: {0}")]
    Transport(String),
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A bidirectional inference stream.
///
/// `open` takes ownership of the outbound sequence and returns the inbound
/// sequence. Dropping the inbound stream releases the remote session.
#[async_trait]
pub trait InferenceStreamClient: Send + Sync {
    async fn open(&self, outbound: OutboundFrames) -> Result<InboundFrames, InferenceError>;
}
