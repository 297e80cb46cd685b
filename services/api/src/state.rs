//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the clonable
//! resources every connection needs.

use crate::{config::Config, prompt::SystemPromptComposer, ws::ConnectionRegistry};
use sonic_bridge_core::InferenceStreamClient;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub inference: Arc<dyn InferenceStreamClient>,
    pub composer: Arc<dyn SystemPromptComposer>,
    pub registry: Arc<ConnectionRegistry>,
}
