//! Twilio Media Streams: the wire events exchanged on the telephony leg.
//!
//! The WebSocket endpoint itself lives in `crate::websocket`.

pub mod events;
