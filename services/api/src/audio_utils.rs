use base64::Engine;
use bytes::Bytes;

/// Decodes a base64 audio payload from the client into raw bytes.
pub fn decode_base64(base64_fragment: &str) -> Result<Bytes, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(base64_fragment.trim())
        .map(Bytes::from)
}

/// Interprets little-endian PCM16 bytes as samples. A trailing odd byte is ignored.
pub fn pcm16_samples(pcm16_bytes: &[u8]) -> Vec<i16> {
    pcm16_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// RMS level of a PCM16 chunk as a percentage of full scale (0-100).
pub fn pcm16_level_percent(pcm16_bytes: &[u8]) -> u8 {
    let samples = convert_i16_to_f32(&pcm16_samples(pcm16_bytes));
    if samples.is_empty() {
        return 0;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    (mean_square.sqrt() * 100.0).round().clamp(0.0, 100.0) as u8
}
