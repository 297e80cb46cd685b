//! Turns caller intents into the ordered frame sequence the remote service
//! expects, using the lifecycle manager for ids and ordering checks.

use crate::frame::{
    ContentPayload, ContentRef, ContentStart, OutboundFrame, PromptRef, PromptStart, SessionStart,
};
use crate::lifecycle::{
    ActiveContent, Closed, ContentId, ContentMedia, LifecycleError, PromptId, Role,
    SessionLifecycleManager,
};
use crate::media::{
    AudioChunk, AudioMediaParams, AudioOutputParams, InferenceParams, TextMediaParams,
};
use base64::Engine;

/// A frame could not be encoded because the lifecycle was in the wrong state.
///
/// This is an ordering bug on our side and always tears the session down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

impl From<LifecycleError> for ProtocolViolation {
    fn from(err: LifecycleError) -> Self {
        Self(err.to_string())
    }
}

/// Per-session encoder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrameEncoder {
    pub inference: InferenceParams,
    pub text_output: TextMediaParams,
    pub audio_output: AudioOutputParams,
}

impl EventFrameEncoder {
    pub fn new(inference: InferenceParams, audio_output: AudioOutputParams) -> Self {
        Self {
            inference,
            text_output: TextMediaParams::default(),
            audio_output,
        }
    }

    /// Builds the six bootstrap frames that install the system instruction:
    /// `SessionStart, PromptStart, ContentStart, TextInput, ContentEnd, PromptEnd`.
    ///
    /// The session must already be active; the prompt used here is closed again
    /// before returning.
    pub fn bootstrap(
        &self,
        lifecycle: &mut SessionLifecycleManager,
        system_prompt: &str,
    ) -> Result<Vec<OutboundFrame>, ProtocolViolation> {
        if !lifecycle.is_active() {
            return Err(LifecycleError::NoActiveSession.into());
        }
        let mut frames = Vec::with_capacity(6);
        frames.push(OutboundFrame::SessionStart(SessionStart {
            inference_configuration: self.inference,
        }));

        let prompt_name = lifecycle.start_prompt()?;
        frames.push(self.prompt_start(prompt_name));

        let media = ContentMedia::Text(self.text_output.clone());
        let content_name = lifecycle.start_content(Role::System, media.clone())?;
        frames.push(content_start(prompt_name, content_name, Role::System, &media));

        frames.push(OutboundFrame::TextInput(ContentPayload {
            prompt_name,
            content_name,
            content: system_prompt.to_string(),
        }));

        lifecycle
            .end_content()
            .ok_or_else(|| ProtocolViolation("system content closed early".into()))?;
        frames.push(OutboundFrame::ContentEnd(ContentRef {
            prompt_name,
            content_name,
        }));

        frames.extend(closed_frames(prompt_name, lifecycle.end_prompt()));
        Ok(frames)
    }

    /// Opens the interactive user audio block if it is not open yet.
    ///
    /// Returns the frames that opened it (`PromptStart` if a new prompt was
    /// needed, then `ContentStart`), or nothing when the block is already open
    /// with the same media parameters.
    pub fn ensure_audio_content_open(
        &self,
        lifecycle: &mut SessionLifecycleManager,
        params: &AudioMediaParams,
    ) -> Result<Vec<OutboundFrame>, ProtocolViolation> {
        if let Some(active) = lifecycle.active_content() {
            return match &active.media {
                ContentMedia::Audio(open) if active.role == Role::User && open == params => {
                    Ok(Vec::new())
                }
                ContentMedia::Audio(_) if active.role == Role::User => Err(ProtocolViolation(
                    "audio parameters changed inside an open content block".into(),
                )),
                _ => Err(LifecycleError::ContentAlreadyActive.into()),
            };
        }
        if let Some(field) = params.missing_field() {
            return Err(ProtocolViolation(format!("audio input {field} is missing")));
        }

        let mut frames = Vec::with_capacity(2);
        let prompt_name = match lifecycle.prompt_id() {
            Some(id) => id,
            None => {
                let id = lifecycle.start_prompt()?;
                frames.push(self.prompt_start(id));
                id
            }
        };
        let media = ContentMedia::Audio(params.clone());
        let content_name = lifecycle.start_content(Role::User, media.clone())?;
        frames.push(content_start(prompt_name, content_name, Role::User, &media));
        Ok(frames)
    }

    /// Encodes one chunk into the open user audio block.
    pub fn audio_input(
        &self,
        lifecycle: &SessionLifecycleManager,
        chunk: &AudioChunk,
    ) -> Result<OutboundFrame, ProtocolViolation> {
        let (prompt_name, active) = open_content(lifecycle)?;
        match &active.media {
            ContentMedia::Audio(open) if *open == chunk.params => {}
            ContentMedia::Audio(_) => {
                return Err(ProtocolViolation(
                    "audio chunk does not match the open content block".into(),
                ));
            }
            ContentMedia::Text(_) => {
                return Err(ProtocolViolation(
                    "audio chunk sent into a text content block".into(),
                ));
            }
        }
        Ok(OutboundFrame::AudioInput(ContentPayload {
            prompt_name,
            content_name: active.id,
            content: base64::engine::general_purpose::STANDARD.encode(&chunk.bytes),
        }))
    }

    /// Ends everything that is still open, returning the matching end frames
    /// (`ContentEnd`, `PromptEnd`, `SessionEnd`) in close order.
    pub fn close_all(&self, lifecycle: &mut SessionLifecycleManager) -> Vec<OutboundFrame> {
        let prompt_name = lifecycle.prompt_id();
        let closed = lifecycle.end_session();
        let mut frames = Vec::with_capacity(closed.len());
        for entry in closed {
            match (entry, prompt_name) {
                (Closed::Content(content_name), Some(prompt_name)) => {
                    frames.push(OutboundFrame::ContentEnd(ContentRef {
                        prompt_name,
                        content_name,
                    }))
                }
                (Closed::Prompt(prompt_name), _) => {
                    frames.push(OutboundFrame::PromptEnd(PromptRef { prompt_name }))
                }
                (Closed::Session(_), _) => frames.push(OutboundFrame::SessionEnd {}),
                (Closed::Content(_), None) => {}
            }
        }
        frames
    }

    /// End frames owed for blocks opened by a partially delivered sequence.
    ///
    /// `sent` is the prefix of a frame sequence that actually reached the
    /// remote. The result closes any content and prompt it left open, in
    /// close order, and never includes `SessionEnd`.
    pub fn pending_ends(sent: &[OutboundFrame]) -> Vec<OutboundFrame> {
        let mut prompt = None;
        let mut content = None;
        for frame in sent {
            match frame {
                OutboundFrame::PromptStart(start) => prompt = Some(start.prompt_name),
                OutboundFrame::ContentStart(start) => {
                    content = Some(ContentRef {
                        prompt_name: start.prompt_name,
                        content_name: start.content_name,
                    })
                }
                OutboundFrame::ContentEnd(_) => content = None,
                OutboundFrame::PromptEnd(_) => {
                    prompt = None;
                    content = None;
                }
                _ => {}
            }
        }
        content
            .map(OutboundFrame::ContentEnd)
            .into_iter()
            .chain(prompt.map(|prompt_name| OutboundFrame::PromptEnd(PromptRef { prompt_name })))
            .collect()
    }

    fn prompt_start(&self, prompt_name: PromptId) -> OutboundFrame {
        OutboundFrame::PromptStart(PromptStart {
            prompt_name,
            text_output_configuration: self.text_output.clone(),
            audio_output_configuration: self.audio_output.clone(),
        })
    }
}

fn open_content(
    lifecycle: &SessionLifecycleManager,
) -> Result<(PromptId, &ActiveContent), ProtocolViolation> {
    let prompt_name = lifecycle.prompt_id().ok_or(LifecycleError::NoActivePrompt)?;
    let active = lifecycle
        .active_content()
        .ok_or_else(|| ProtocolViolation("no active content".into()))?;
    Ok((prompt_name, active))
}

fn content_start(
    prompt_name: PromptId,
    content_name: ContentId,
    role: Role,
    media: &ContentMedia,
) -> OutboundFrame {
    let (text_input_configuration, audio_input_configuration) = match media {
        ContentMedia::Text(params) => (Some(params.clone()), None),
        ContentMedia::Audio(params) => (None, Some(params.clone())),
    };
    OutboundFrame::ContentStart(ContentStart {
        prompt_name,
        content_name,
        kind: media.kind(),
        interactive: true,
        role,
        text_input_configuration,
        audio_input_configuration,
    })
}

fn closed_frames(prompt_name: PromptId, closed: Vec<Closed>) -> impl Iterator<Item = OutboundFrame> {
    closed.into_iter().filter_map(move |entry| match entry {
        Closed::Content(content_name) => Some(OutboundFrame::ContentEnd(ContentRef {
            prompt_name,
            content_name,
        })),
        Closed::Prompt(prompt_name) => Some(OutboundFrame::PromptEnd(PromptRef { prompt_name })),
        Closed::Session(_) => None,
    })
}
