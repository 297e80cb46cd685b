//! WebSocket transport for the bidirectional speech-to-speech stream.
//!
//! Each outbound frame is sent as one text message carrying its JSON event
//! envelope. Inbound text (or UTF-8 binary) messages are parsed into
//! [`InboundFrame`]s. A close frame from the server ends the inbound stream.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, future};
use sonic_bridge_core::{
    InboundFrame, InboundFrames, InferenceError, InferenceStreamClient, OutboundFrames,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, trace, warn};

/// Connects to a relay that speaks the event envelope over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketInferenceClient {
    url: String,
    model_id: String,
}

impl WebSocketInferenceClient {
    pub fn new(url: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model_id: model_id.into(),
        }
    }

    /// The endpoint URL with the model id appended as a query parameter.
    ///
    /// A URL without a path gets `/` so the handshake request target is valid.
    pub fn endpoint(&self) -> String {
        let (base, query) = match self.url.split_once('?') {
            Some((base, query)) => (base, query),
            None => (self.url.as_str(), ""),
        };
        let authority_start = base.find("://").map_or(0, |i| i + 3);
        let root = if base[authority_start..].contains('/') { "" } else { "/" };
        if query.is_empty() {
            format!("{base}{root}?modelId={}", self.model_id)
        } else {
            format!("{base}{root}?{query}&modelId={}", self.model_id)
        }
    }
}

#[async_trait]
impl InferenceStreamClient for WebSocketInferenceClient {
    async fn open(&self, mut outbound: OutboundFrames) -> Result<InboundFrames, InferenceError> {
        let (ws_stream, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| InferenceError::Connect(e.to_string()))?;
        info!(model_id = %self.model_id, "Connected to inference stream.");
        let (mut remote_tx, remote_rx) = ws_stream.split();

        tokio::spawn(async move {
            while let Some(frame) = outbound.next().await {
                let payload = match frame.to_json() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(event = frame.name(), "Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                trace!(event = frame.name(), "Sending frame to inference stream.");
                if let Err(e) = remote_tx.send(WsMessage::Text(payload.into())).await {
                    warn!("Inference stream rejected outbound frame: {}", e);
                    return;
                }
            }
            debug!("Outbound frame sequence finished. Closing inference stream.");
            let _ = remote_tx.send(WsMessage::Close(None)).await;
        });

        Ok(Box::pin(inbound_frames(remote_rx)))
    }
}

/// Maps raw WebSocket messages to inbound frames.
///
/// Malformed messages are logged and skipped; transport errors are surfaced.
pub fn inbound_frames<S>(source: S) -> impl Stream<Item = Result<InboundFrame, InferenceError>> + Send
where
    S: Stream<Item = Result<WsMessage, WsError>> + Send,
{
    source
        .take_while(|msg| future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
        .filter_map(|msg| async move {
            let text = match msg {
                Ok(WsMessage::Text(text)) => text.to_string(),
                Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary message from inference stream.");
                        return None;
                    }
                },
                Ok(_) => return None,
                Err(e) => return Some(Err(InferenceError::Transport(e.to_string()))),
            };
            match InboundFrame::from_json(&text) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    error!("Failed to parse inference stream message: {}. Raw text: {}", e, text);
                    None
                }
            }
        })
}
