//! Sonic Bridge API Library Crate
//!
//! This library contains the logic of the call bridge service: configuration,
//! application state, HTTP handlers, routing, and the WebSocket bridge to the
//! inference stream. The `api` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod prompt;
pub mod router;
pub mod state;
pub mod ws;
