use sonic_bridge_core::media::{AudioMediaParams, InferenceParams};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_MODEL_ID: &str = "amazon.nova-sonic-v1:0";
pub const DEFAULT_VOICE_ID: &str = "tiffany";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI receptionist. Be professional, friendly, and concise in your responses.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub inference_url: String,
    pub model_id: String,
    pub log_level: Level,
    pub voice_id: String,
    pub inference: InferenceParams,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub outbound_queue_capacity: usize,
    pub session_end_timeout: Duration,
    pub default_system_prompt: String,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;

        let inference_url = std::env::var("INFERENCE_URL")
            .map_err(|_| ConfigError::MissingVar("INFERENCE_URL".to_string()))?;
        if !inference_url.starts_with("ws://") && !inference_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "INFERENCE_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", inference_url),
            ));
        }

        let model_id =
            std::env::var("INFERENCE_MODEL_ID").unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let voice_id = std::env::var("VOICE_ID").unwrap_or_else(|_| DEFAULT_VOICE_ID.to_string());
        if voice_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "VOICE_ID".to_string(),
                "voice id must not be empty".to_string(),
            ));
        }

        let defaults = InferenceParams::default();
        let inference = InferenceParams {
            max_tokens: parse_var("MAX_TOKENS", Some(defaults.max_tokens))?,
            top_p: parse_var("TOP_P", Some(defaults.top_p))?,
            temperature: parse_var("TEMPERATURE", Some(defaults.temperature))?,
        };
        if !(0.0..=1.0).contains(&inference.top_p) {
            return Err(ConfigError::InvalidValue(
                "TOP_P".to_string(),
                format!("{} is outside [0, 1]", inference.top_p),
            ));
        }
        if !inference.temperature.is_finite() || inference.temperature < 0.0 {
            return Err(ConfigError::InvalidValue(
                "TEMPERATURE".to_string(),
                format!("{} is not a non-negative number", inference.temperature),
            ));
        }

        let input_sample_rate = parse_var("INPUT_SAMPLE_RATE", Some(16000))?;
        let output_sample_rate = parse_var("OUTPUT_SAMPLE_RATE", Some(24000))?;

        let outbound_queue_capacity: usize = parse_var("OUTBOUND_QUEUE_CAPACITY", Some(256))?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "OUTBOUND_QUEUE_CAPACITY".to_string(),
                "capacity must be at least 1".to_string(),
            ));
        }

        let session_end_timeout =
            Duration::from_millis(parse_var("SESSION_END_TIMEOUT_MS", Some(500))?);

        let default_system_prompt = std::env::var("DEFAULT_SYSTEM_PROMPT")
            .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        Ok(Self {
            bind_address,
            inference_url,
            model_id,
            log_level,
            voice_id,
            inference,
            input_sample_rate,
            output_sample_rate,
            outbound_queue_capacity,
            session_end_timeout,
            default_system_prompt,
        })
    }

    /// Media parameters of caller audio forwarded to the remote stream.
    pub fn audio_input(&self) -> AudioMediaParams {
        AudioMediaParams::lpcm(self.input_sample_rate)
    }
}

/// Reads and parses an optional variable, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => default.ok_or_else(|| ConfigError::MissingVar(name.to_string())),
    }
}
