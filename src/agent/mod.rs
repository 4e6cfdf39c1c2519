//! Voice-agent side of the relay: the message formats and the WebSocket client.

pub mod client;
pub mod protocol;
