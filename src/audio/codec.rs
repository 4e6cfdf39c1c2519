//! Base64 framing for audio carried inside Twilio JSON events.
//!
//! Twilio wraps every 20 ms of μ-law audio in a JSON `media` event with a standard-alphabet,
//! padded base64 `payload`. The relay only ever unwraps and rewraps bytes, it never looks
//! at the samples.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{BridgeError, BridgeResult};

/// Decode a telephony media payload into raw audio bytes.
pub fn decode_payload(payload: &str) -> BridgeResult<Vec<u8>> {
    STANDARD
        .decode(payload)
        .map_err(|e| BridgeError::ProtocolViolation(format!("undecodable media payload: {}", e)))
}

/// Encode raw audio bytes for an outbound telephony media event.
pub fn encode_payload(audio: &[u8]) -> String {
    STANDARD.encode(audio)
}
