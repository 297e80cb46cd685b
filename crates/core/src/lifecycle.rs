//! Session → prompt → content state machine.
//!
//! The three levels are nested enums, so a content block cannot exist outside
//! an active prompt and a prompt cannot exist outside an active session. Every
//! operation validates the current state before mutating it. End operations are
//! idempotent and cascade downwards, returning what they closed in close order.

use crate::media::{AudioMediaParams, TextMediaParams};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(PromptId);
opaque_id!(ContentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentKind {
    Text,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Media parameters of a content block. The variant determines its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentMedia {
    Text(TextMediaParams),
    Audio(AudioMediaParams),
}

impl ContentMedia {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentMedia::Text(_) => ContentKind::Text,
            ContentMedia::Audio(_) => ContentKind::Audio,
        }
    }
}

/// The currently open content block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContent {
    pub id: ContentId,
    pub role: Role,
    pub media: ContentMedia,
}

impl ActiveContent {
    pub fn kind(&self) -> ContentKind {
        self.media.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Closed,
}

/// Status of a prompt or content block within its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    None,
    Active,
    Closed,
}

/// An entity closed by an end operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Content(ContentId),
    Prompt(PromptId),
    Session(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("a session has already been started")]
    AlreadyActive,
    #[error("no active session")]
    NoActiveSession,
    #[error("a prompt is already active")]
    PromptAlreadyActive,
    #[error("no active prompt")]
    NoActivePrompt,
    #[error("a content block is already active")]
    ContentAlreadyActive,
}

#[derive(Debug)]
enum SessionSlot {
    Idle,
    Active { id: SessionId, prompt: PromptSlot },
    Closed,
}

#[derive(Debug)]
enum PromptSlot {
    None,
    Active { id: PromptId, content: ContentSlot },
    Closed,
}

#[derive(Debug)]
enum ContentSlot {
    None,
    Active(ActiveContent),
    Closed,
}

/// Owns the nesting state of one remote session.
#[derive(Debug)]
pub struct SessionLifecycleManager {
    session: SessionSlot,
}

impl Default for SessionLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycleManager {
    pub fn new() -> Self {
        Self {
            session: SessionSlot::Idle,
        }
    }

    pub fn start_session(&mut self) -> Result<SessionId, LifecycleError> {
        if !matches!(self.session, SessionSlot::Idle) {
            return Err(LifecycleError::AlreadyActive);
        }
        let id = SessionId::generate();
        self.session = SessionSlot::Active {
            id,
            prompt: PromptSlot::None,
        };
        debug!(session_id = %id, "Session started");
        Ok(id)
    }

    pub fn start_prompt(&mut self) -> Result<PromptId, LifecycleError> {
        let SessionSlot::Active { prompt, .. } = &mut self.session else {
            return Err(LifecycleError::NoActiveSession);
        };
        if matches!(prompt, PromptSlot::Active { .. }) {
            return Err(LifecycleError::PromptAlreadyActive);
        }
        let id = PromptId::generate();
        *prompt = PromptSlot::Active {
            id,
            content: ContentSlot::None,
        };
        debug!(prompt_id = %id, "Prompt started");
        Ok(id)
    }

    pub fn start_content(
        &mut self,
        role: Role,
        media: ContentMedia,
    ) -> Result<ContentId, LifecycleError> {
        let Some(content) = self.content_slot_mut() else {
            return Err(LifecycleError::NoActivePrompt);
        };
        if matches!(content, ContentSlot::Active(_)) {
            return Err(LifecycleError::ContentAlreadyActive);
        }
        let id = ContentId::generate();
        debug!(content_id = %id, kind = ?media.kind(), ?role, "Content started");
        *content = ContentSlot::Active(ActiveContent { id, role, media });
        Ok(id)
    }

    /// Closes the active content block. No-op when none is active.
    pub fn end_content(&mut self) -> Option<ContentId> {
        let content = self.content_slot_mut()?;
        match std::mem::replace(content, ContentSlot::Closed) {
            ContentSlot::Active(active) => {
                debug!(content_id = %active.id, "Content ended");
                Some(active.id)
            }
            previous => {
                *content = previous;
                None
            }
        }
    }

    /// Closes the active prompt, closing its content block first.
    pub fn end_prompt(&mut self) -> Vec<Closed> {
        let mut closed = Vec::new();
        if let Some(content_id) = self.end_content() {
            closed.push(Closed::Content(content_id));
        }
        let SessionSlot::Active { prompt, .. } = &mut self.session else {
            return closed;
        };
        match std::mem::replace(prompt, PromptSlot::Closed) {
            PromptSlot::Active { id, .. } => {
                debug!(prompt_id = %id, "Prompt ended");
                closed.push(Closed::Prompt(id));
            }
            previous => *prompt = previous,
        }
        closed
    }

    /// Closes the session, cascading through any active prompt and content.
    /// The session is terminal afterwards.
    pub fn end_session(&mut self) -> Vec<Closed> {
        let mut closed = self.end_prompt();
        if let SessionSlot::Active { id, .. } = self.session {
            self.session = SessionSlot::Closed;
            debug!(session_id = %id, "Session ended");
            closed.push(Closed::Session(id));
        }
        closed
    }

    pub fn is_active(&self) -> bool {
        matches!(self.session, SessionSlot::Active { .. })
    }

    pub fn session_status(&self) -> SessionStatus {
        match self.session {
            SessionSlot::Idle => SessionStatus::Idle,
            SessionSlot::Active { .. } => SessionStatus::Active,
            SessionSlot::Closed => SessionStatus::Closed,
        }
    }

    pub fn prompt_status(&self) -> BlockStatus {
        match &self.session {
            SessionSlot::Active { prompt, .. } => match prompt {
                PromptSlot::None => BlockStatus::None,
                PromptSlot::Active { .. } => BlockStatus::Active,
                PromptSlot::Closed => BlockStatus::Closed,
            },
            _ => BlockStatus::None,
        }
    }

    pub fn content_status(&self) -> BlockStatus {
        match self.content_slot() {
            Some(ContentSlot::None) | None => BlockStatus::None,
            Some(ContentSlot::Active(_)) => BlockStatus::Active,
            Some(ContentSlot::Closed) => BlockStatus::Closed,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.session {
            SessionSlot::Active { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn prompt_id(&self) -> Option<PromptId> {
        match &self.session {
            SessionSlot::Active {
                prompt: PromptSlot::Active { id, .. },
                ..
            } => Some(*id),
            _ => None,
        }
    }

    pub fn active_content(&self) -> Option<&ActiveContent> {
        match self.content_slot() {
            Some(ContentSlot::Active(active)) => Some(active),
            _ => None,
        }
    }

    fn content_slot(&self) -> Option<&ContentSlot> {
        match &self.session {
            SessionSlot::Active {
                prompt: PromptSlot::Active { content, .. },
                ..
            } => Some(content),
            _ => None,
        }
    }

    fn content_slot_mut(&mut self) -> Option<&mut ContentSlot> {
        match &mut self.session {
            SessionSlot::Active {
                prompt: PromptSlot::Active { content, .. },
                ..
            } => Some(content),
            _ => None,
        }
    }
}
