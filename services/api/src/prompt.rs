//! Builds the system instruction sent during session bootstrap.

use crate::ws::protocol::StartSession;

/// Produces the system instruction for a new call.
///
/// The bridge treats the result as an opaque string.
#[cfg_attr(test, mockall::automock)]
pub trait SystemPromptComposer: Send + Sync {
    fn compose(&self, request: &StartSession) -> String;
}

/// Uses the caller's prompt (or a configured default) and appends any
/// business context verbatim.
#[derive(Debug, Clone)]
pub struct BasePromptComposer {
    default_prompt: String,
}

impl BasePromptComposer {
    pub fn new(default_prompt: impl Into<String>) -> Self {
        Self {
            default_prompt: default_prompt.into(),
        }
    }
}

impl SystemPromptComposer for BasePromptComposer {
    fn compose(&self, request: &StartSession) -> String {
        let base = request
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(self.default_prompt.as_str());

        match &request.business_info {
            None | Some(serde_json::Value::Null) => base.to_string(),
            Some(info) => format!("{base}\n\nBUSINESS CONTEXT:\n{info}"),
        }
    }
}
