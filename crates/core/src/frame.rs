//! Wire events exchanged with the remote speech-to-speech stream.
//!
//! Every event travels inside a `{"event": {"<name>": {...}}}` envelope.
//! Outbound frames are strongly typed and serialized with serde. Inbound
//! frames are parsed through an all-optional mirror of the envelope, so that
//! event kinds we do not care about still decode.

use crate::lifecycle::{ContentId, ContentKind, PromptId, Role};
use crate::media::{AudioMediaParams, AudioOutputParams, InferenceParams, TextMediaParams};
use serde::{Deserialize, Serialize};

/// A frame sent to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundFrame {
    SessionStart(SessionStart),
    PromptStart(PromptStart),
    ContentStart(ContentStart),
    TextInput(ContentPayload),
    AudioInput(ContentPayload),
    ContentEnd(ContentRef),
    PromptEnd(PromptRef),
    SessionEnd {},
}

impl OutboundFrame {
    /// Audio frames may be shed under backpressure; everything else is control.
    pub fn is_audio(&self) -> bool {
        matches!(self, OutboundFrame::AudioInput(_))
    }

    /// The wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundFrame::SessionStart(_) => "sessionStart",
            OutboundFrame::PromptStart(_) => "promptStart",
            OutboundFrame::ContentStart(_) => "contentStart",
            OutboundFrame::TextInput(_) => "textInput",
            OutboundFrame::AudioInput(_) => "audioInput",
            OutboundFrame::ContentEnd(_) => "contentEnd",
            OutboundFrame::PromptEnd(_) => "promptEnd",
            OutboundFrame::SessionEnd {} => "sessionEnd",
        }
    }

    /// Serializes the frame inside its `event` envelope.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            event: &'a OutboundFrame,
        }
        serde_json::to_string(&Envelope { event: self })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub inference_configuration: InferenceParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStart {
    pub prompt_name: PromptId,
    pub text_output_configuration: TextMediaParams,
    pub audio_output_configuration: AudioOutputParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: PromptId,
    pub content_name: ContentId,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub interactive: bool,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input_configuration: Option<TextMediaParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_input_configuration: Option<AudioMediaParams>,
}

/// Body of `textInput` and `audioInput`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    pub prompt_name: PromptId,
    pub content_name: ContentId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub prompt_name: PromptId,
    pub content_name: ContentId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRef {
    pub prompt_name: PromptId,
}

/// Generation stage reported on remote content blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Speculative,
    Final,
}

/// A frame received from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    TextOutput {
        content: String,
        role: Option<Role>,
    },
    /// Base64 audio exactly as received.
    AudioOutput {
        content: String,
    },
    ContentStartAck {
        content_id: Option<String>,
        kind: Option<ContentKind>,
        role: Option<Role>,
        stage: Option<GenerationStage>,
    },
    ContentEndAck {
        content_id: Option<String>,
        stop_reason: Option<String>,
    },
    CompletionEnd,
    StreamError {
        message: String,
    },
    /// Any other event, identified by its wire name.
    Other {
        name: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("inbound frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inbound frame carries no event")]
    Empty,
}

// --- Inbound wire mirror ---

#[derive(Deserialize, Debug)]
struct InboundEnvelope {
    event: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct TextOutputBody {
    #[serde(default)]
    content: String,
    #[serde(default, deserialize_with = "lenient_role")]
    role: Option<Role>,
}

#[derive(Deserialize, Debug)]
struct AudioOutputBody {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ContentStartBody {
    content_id: Option<String>,
    content_name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_kind")]
    kind: Option<ContentKind>,
    #[serde(default, deserialize_with = "lenient_role")]
    role: Option<Role>,
    additional_model_fields: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ContentEndBody {
    content_id: Option<String>,
    content_name: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AdditionalModelFields {
    generation_stage: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorBody {
    message: Option<String>,
}

const ERROR_EVENTS: [(&str, &str); 4] = [
    ("modelStreamErrorException", "Voice model error"),
    ("internalServerException", "Voice service error"),
    ("validationException", "Voice request rejected"),
    ("error", "Voice stream error"),
];

fn lenient_role<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|r| match r.to_ascii_uppercase().as_str() {
        "SYSTEM" => Some(Role::System),
        "USER" => Some(Role::User),
        "ASSISTANT" => Some(Role::Assistant),
        _ => None,
    }))
}

fn lenient_kind<'de, D>(deserializer: D) -> Result<Option<ContentKind>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|k| match k.to_ascii_uppercase().as_str() {
        "TEXT" => Some(ContentKind::Text),
        "AUDIO" => Some(ContentKind::Audio),
        _ => None,
    }))
}

fn generation_stage(fields: Option<&str>) -> Option<GenerationStage> {
    let fields: AdditionalModelFields = serde_json::from_str(fields?).ok()?;
    match fields.generation_stage?.as_str() {
        "SPECULATIVE" => Some(GenerationStage::Speculative),
        "FINAL" => Some(GenerationStage::Final),
        _ => None,
    }
}

fn stream_error(name: &str, body: serde_json::Value, fallback: &str) -> InboundFrame {
    let body: ErrorBody = serde_json::from_value(body).unwrap_or_default();
    InboundFrame::StreamError {
        message: body
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("{fallback} ({name})")),
    }
}

impl InboundFrame {
    /// Parses one inbound JSON message.
    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;

        // Exceptions may arrive beside the envelope rather than inside it.
        for (name, fallback) in ERROR_EVENTS {
            if let Some(body) = envelope.rest.get(name) {
                return Ok(stream_error(name, body.clone(), fallback));
            }
        }

        let (name, body) = envelope
            .event
            .and_then(|event| event.into_iter().next())
            .ok_or(FrameError::Empty)?;

        let frame = match name.as_str() {
            "textOutput" => {
                let body: TextOutputBody = serde_json::from_value(body)?;
                InboundFrame::TextOutput {
                    content: body.content,
                    role: body.role,
                }
            }
            "audioOutput" => {
                let body: AudioOutputBody = serde_json::from_value(body)?;
                InboundFrame::AudioOutput {
                    content: body.content,
                }
            }
            "contentStart" => {
                let body: ContentStartBody = serde_json::from_value(body)?;
                InboundFrame::ContentStartAck {
                    content_id: body.content_id.or(body.content_name),
                    kind: body.kind,
                    role: body.role,
                    stage: generation_stage(body.additional_model_fields.as_deref()),
                }
            }
            "contentEnd" => {
                let body: ContentEndBody = serde_json::from_value(body)?;
                InboundFrame::ContentEndAck {
                    content_id: body.content_id.or(body.content_name),
                    stop_reason: body.stop_reason,
                }
            }
            "completionEnd" => InboundFrame::CompletionEnd,
            other => match ERROR_EVENTS.iter().find(|(n, _)| *n == other) {
                Some((n, fallback)) => stream_error(n, body, fallback),
                None => InboundFrame::Other {
                    name: other.to_string(),
                },
            },
        };
        Ok(frame)
    }
}
