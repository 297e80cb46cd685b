//! Defines the WebSocket message protocol between the caller's client and the API server.

use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser or phone gateway) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts the voice session. Everything else is ignored until this arrives.
    StartSession(StartSession),
    /// A chunk of caller audio (base64 encoded PCM16).
    AudioInput { data: String },
    /// The caller hung up.
    EndSession,
}

/// Payload of `start_session`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    /// Base instruction for the assistant. Falls back to the configured default.
    pub system_prompt: Option<String>,
    /// Opaque business context merged into the system instruction.
    pub business_info: Option<serde_json::Value>,
    /// Voice of the synthesized reply. Falls back to the configured default.
    pub voice_id: Option<String>,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The remote session has been bootstrapped; audio may now be sent.
    #[serde(rename = "session_ready")]
    SessionReady,
    /// A line of conversation text.
    #[serde(rename = "transcript")]
    Transcript {
        role: TranscriptRole,
        content: String,
    },
    /// A chunk of synthesized speech, forwarded exactly as received.
    #[serde(rename = "audioResponse")]
    AudioResponse { data: String },
    /// Reports a fatal error to the client. Sent at most once per connection.
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}
