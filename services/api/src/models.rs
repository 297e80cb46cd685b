//! API Models
//!
//! Response bodies of the HTTP endpoints, documented with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "sonic-bridge")]
    pub service: String,
    /// Model id requested from the inference stream.
    #[schema(example = "amazon.nova-sonic-v1:0")]
    pub model: String,
    /// Number of live client connections.
    pub active_connections: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
