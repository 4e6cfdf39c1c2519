//! # Call Bridge
//!
//! The core of the relay: everything that happens between a Twilio media stream and the
//! voice agent for the lifetime of one call.
//!
//! ## Components:
//! - **socket**: the `Frame` type and the stream/sink view of a WebSocket
//! - **handoff**: one-shot stream sid cell between the reader and the downlink
//! - **teardown**: the shared stop flag
//! - **reader**: Twilio events in, fixed-size audio blocks onto the queue
//! - **uplink**: audio blocks from the queue to the agent
//! - **downlink**: agent audio and barge-in signals back to Twilio
//! - **session**: connects the agent, runs the three duties, and tears them down together

pub mod downlink;
pub mod handoff;
pub mod reader;
pub mod session;
pub mod socket;
pub mod teardown;
pub mod uplink;

/// How a duty finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyExit {
    /// Ran to its natural end (Twilio `stop`, or the audio queue drained).
    Completed,
    /// Stopped because teardown was requested.
    Cancelled,
}
