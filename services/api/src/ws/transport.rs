//! The client side of the bridge: something that can deliver `ServerMessage`s.

use super::protocol::ServerMessage;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info};

/// The client connection rejected an outbound message.
#[derive(Debug, thiserror::Error)]
#[error("client transport closed")]
pub struct TransportSendError;

/// A message-based connection to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn emit(&self, msg: ServerMessage) -> Result<(), TransportSendError>;
}

/// Hands messages to a writer task through a bounded channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ServerMessage>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn emit(&self, msg: ServerMessage) -> Result<(), TransportSendError> {
        self.tx.send(msg).await.map_err(|_| TransportSendError)
    }
}

/// Spawns the task that serializes queued messages onto the WebSocket.
///
/// The task ends when every `ChannelTransport` has been dropped or the
/// socket stops accepting writes.
pub fn spawn_socket_writer(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let serialized = match serde_json::to_string(&msg) {
                Ok(serialized) => serialized,
                Err(e) => {
                    error!("Failed to serialize outgoing message: {}", e);
                    continue;
                }
            };
            if let Err(e) = socket_tx.send(Message::Text(serialized.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = socket_tx.send(Message::Close(None)).await;
        info!("Client writer finished.");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = ChannelTransport::new(tx);

        transport.emit(ServerMessage::SessionReady).await.unwrap();
        transport
            .emit(ServerMessage::AudioResponse { data: "AAEC".into() })
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(ServerMessage::SessionReady));
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::AudioResponse { data: "AAEC".into() })
        );
    }

    #[tokio::test]
    async fn test_channel_transport_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        let transport = ChannelTransport::new(tx);
        drop(rx);

        assert!(transport.emit(ServerMessage::SessionReady).await.is_err());
    }
}
