//! Manages the WebSocket connection lifecycle for one call.

use super::{
    bridge::{BridgeConfig, CloseReason, DuplexStreamBridge},
    protocol::ClientMessage,
    transport::{ChannelTransport, spawn_socket_writer},
};
use crate::{audio_utils::decode_base64, state::AppState};
use anyhow::{Context, Result};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{StreamExt, stream::SplitStream};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

/// Buffered server messages per connection before emits start waiting.
const CLIENT_BUFFER: usize = 64;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Owns one client connection from upgrade to teardown.
#[instrument(name = "ws_connection", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", connection_id.to_string());
    info!("New WebSocket connection.");

    let (socket_tx, socket_rx) = socket.split();
    let (client_tx, client_rx) = mpsc::channel(CLIENT_BUFFER);
    // The writer sends a close frame once every handle to the bridge is gone.
    spawn_socket_writer(socket_tx, client_rx);

    let bridge = DuplexStreamBridge::new(
        BridgeConfig::from(state.config.as_ref()),
        state.inference.clone(),
        Arc::new(ChannelTransport::new(client_tx)),
        state.composer.clone(),
    );
    state.registry.register(connection_id, bridge.clone()).await;

    run_connection(&bridge, socket_rx).await;

    bridge.close(CloseReason::ClientDisconnect).await;
    state.registry.remove(&connection_id).await;
    info!("WebSocket connection closed.");
}

/// Reads client messages until the socket closes or the client ends the call.
async fn run_connection(bridge: &DuplexStreamBridge, mut socket_rx: SplitStream<WebSocket>) {
    loop {
        let msg_result = tokio::select! {
            _ = bridge.closed() => {
                info!("Bridge closed; ending connection.");
                return;
            }
            next = socket_rx.next() => match next {
                Some(msg_result) => msg_result,
                None => break,
            },
        };
        let ws_msg = match msg_result {
            Ok(ws_msg) => ws_msg,
            Err(e) => {
                warn!("Error receiving from client WebSocket: {:?}", e);
                return;
            }
        };
        if bridge.is_closing() {
            debug!("Ignoring client message after teardown.");
            if matches!(ws_msg, Message::Close(_)) {
                return;
            }
            continue;
        }
        match ws_msg {
            Message::Text(text) => match handle_text(bridge, &text).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => warn!("Ignoring client message: {:#}", e),
            },
            Message::Binary(data) => bridge.audio_input(data).await,
            Message::Close(_) => {
                info!("Client sent close frame.");
                return;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    info!("Client stream ended.");
}

/// Dispatches one JSON message. Returns `false` once the client ended the call.
async fn handle_text(bridge: &DuplexStreamBridge, text: &str) -> Result<bool> {
    let msg: ClientMessage =
        serde_json::from_str(text).context("Malformed client message")?;
    match msg {
        ClientMessage::StartSession(request) => {
            // Bootstrap runs beside the read loop so a disconnect is still seen.
            let bridge = bridge.clone();
            tokio::spawn(
                async move { bridge.start_session(request).await }.in_current_span(),
            );
        }
        ClientMessage::AudioInput { data } => {
            let bytes = decode_base64(&data).context("Audio chunk is not valid base64")?;
            bridge.audio_input(bytes).await;
        }
        ClientMessage::EndSession => {
            info!("Client ended the session.");
            bridge.close(CloseReason::ClientEnded).await;
            return Ok(false);
        }
    }
    Ok(true)
}
