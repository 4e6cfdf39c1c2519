//! # Audio Handling
//!
//! The relay does not process audio; it reframes it. Both legs carry 8 kHz μ-law:
//!
//! - **Telephony leg**: 160-byte frames, base64-encoded inside JSON `media` events
//! - **Agent leg**: raw bytes in binary WebSocket frames, batched into larger blocks uplink
//!
//! ## Components:
//! - **codec**: base64 decode/encode of telephony payloads
//! - **buffer**: the inbound accumulator that cuts caller audio into fixed-size blocks

pub mod buffer; // Fixed-size block batching for the uplink
pub mod codec; // Base64 payload framing
