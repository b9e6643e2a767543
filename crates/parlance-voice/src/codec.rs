//! Base64 helpers for transports that wrap audio in JSON envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::VoiceError;

/// Decodes a base64 media payload into raw audio bytes.
pub fn decode_base64_audio(payload: &str) -> Result<Vec<u8>, VoiceError> {
    Ok(STANDARD.decode(payload.trim())?)
}

/// Encodes raw audio bytes as a base64 media payload.
pub fn encode_base64_audio(audio: &[u8]) -> String {
    STANDARD.encode(audio)
}
