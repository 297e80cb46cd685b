//! Media and inference parameters carried by the session bootstrap frames.
//!
//! These values are configuration supplied by the caller. The core passes them
//! through verbatim and only checks that the required pieces are present.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const LPCM_MEDIA_TYPE: &str = "audio/lpcm";
pub const TEXT_MEDIA_TYPE: &str = "text/plain";
pub const BASE64_ENCODING: &str = "base64";
pub const SPEECH_AUDIO_TYPE: &str = "SPEECH";

/// Tuning values sent with `SessionStart`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceParams {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// Media type of a text block, used for both text input and text output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMediaParams {
    pub media_type: String,
}

impl Default for TextMediaParams {
    fn default() -> Self {
        Self {
            media_type: TEXT_MEDIA_TYPE.to_string(),
        }
    }
}

/// Shape of an audio stream. Must stay constant for the lifetime of one
/// audio content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMediaParams {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub encoding: String,
}

impl AudioMediaParams {
    /// 16-bit mono linear PCM at the given rate, base64 on the wire.
    pub fn lpcm(sample_rate_hertz: u32) -> Self {
        Self {
            media_type: LPCM_MEDIA_TYPE.to_string(),
            sample_rate_hertz,
            sample_size_bits: 16,
            channel_count: 1,
            encoding: BASE64_ENCODING.to_string(),
        }
    }

    /// Returns the name of the first missing field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.media_type.is_empty() {
            Some("mediaType")
        } else if self.sample_rate_hertz == 0 {
            Some("sampleRateHertz")
        } else if self.sample_size_bits == 0 {
            Some("sampleSizeBits")
        } else if self.channel_count == 0 {
            Some("channelCount")
        } else if self.encoding.is_empty() {
            Some("encoding")
        } else {
            None
        }
    }
}

/// Configuration of the synthesized reply, sent with `PromptStart`.
///
/// Independent of the audio *input* parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputParams {
    #[serde(flatten)]
    pub media: AudioMediaParams,
    pub voice_id: String,
    pub audio_type: String,
}

impl AudioOutputParams {
    pub fn speech(sample_rate_hertz: u32, voice_id: impl Into<String>) -> Self {
        Self {
            media: AudioMediaParams::lpcm(sample_rate_hertz),
            voice_id: voice_id.into(),
            audio_type: SPEECH_AUDIO_TYPE.to_string(),
        }
    }
}

/// One unit of caller audio, binary internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Bytes,
    pub params: AudioMediaParams,
}

impl AudioChunk {
    pub fn new(bytes: impl Into<Bytes>, params: AudioMediaParams) -> Self {
        Self {
            bytes: bytes.into(),
            params,
        }
    }
}
