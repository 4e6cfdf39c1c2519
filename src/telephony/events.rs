//! # Twilio Media Streams Wire Events
//!
//! Twilio talks to the relay over a WebSocket carrying JSON text frames, each with an
//! `event` discriminator.
//!
//! ## Inbound (Twilio → relay):
//! ```json
//! {"event": "connected", "protocol": "Call", "version": "1.0.0"}
//! {"event": "start", "start": {"streamSid": "MZ...", "callSid": "CA...", ...}, "streamSid": "MZ..."}
//! {"event": "media", "media": {"track": "inbound", "chunk": "2", "timestamp": "5", "payload": "..."}}
//! {"event": "stop", "stop": {"callSid": "CA..."}, "streamSid": "MZ..."}
//! ```
//! `mark` and `dtmf` events, and any kind Twilio adds later, parse as `Ignored`.
//!
//! ## Outbound (relay → Twilio):
//! ```json
//! {"event": "media", "streamSid": "MZ...", "media": {"payload": "..."}}
//! {"event": "clear", "streamSid": "MZ..."}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audio::codec;
use crate::error::{BridgeError, BridgeResult};

/// One inbound Twilio event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    /// Handshake; carries nothing the relay needs.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },

    /// Stream metadata, including the stream sid every outbound event must carry.
    Start { start: StartMetadata },

    /// One chunk of audio on one track.
    Media { media: MediaChunk },

    /// The call leg ended.
    Stop {
        #[serde(default)]
        stop: Option<StopMetadata>,
    },

    /// `mark`, `dtmf` and anything else the relay does not act on.
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMetadata {
    #[serde(default)]
    pub call_sid: Option<String>,
}

/// Which direction of the call a media chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// The caller's voice.
    Inbound,
    /// Audio played to the caller (only present on bidirectional track configs).
    Outbound,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaChunk {
    pub track: Track,
    pub payload: String,
}

impl MediaChunk {
    /// Decode the base64 payload into raw audio bytes.
    pub fn audio(&self) -> BridgeResult<Vec<u8>> {
        codec::decode_payload(&self.payload)
    }
}

impl InboundEvent {
    /// Parse one text frame from Twilio.
    ///
    /// Invalid JSON, an unknown shape for a known event (a `start` without `streamSid`, a
    /// `media` without `payload`) is a protocol violation.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::ProtocolViolation(format!("malformed telephony event: {}", e)))
    }
}

/// Events the relay sends back to Twilio.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent<'a> {
    /// Play this audio to the caller.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: OutboundMedia,
    },

    /// Discard all audio queued for playback (barge-in).
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl<'a> OutboundEvent<'a> {
    /// Wrap raw agent audio for playback on the call leg.
    pub fn media(stream_sid: &'a str, audio: &[u8]) -> Self {
        OutboundEvent::Media {
            stream_sid,
            media: OutboundMedia {
                payload: codec::encode_payload(audio),
            },
        }
    }

    pub fn clear(stream_sid: &'a str) -> Self {
        OutboundEvent::Clear { stream_sid }
    }

    pub fn to_json(&self) -> String {
        // Only strings and a nested struct of strings: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC123",
                "streamSid": "MZ123",
                "callSid": "CA123",
                "tracks": ["inbound"],
                "customParameters": {"caller": "+15550100"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ123"
        }"#;
        match InboundEvent::parse(text).unwrap() {
            InboundEvent::Start { start } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid.as_deref(), Some("CA123"));
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
                assert_eq!(start.custom_parameters["caller"], "+15550100");
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_minimal_start_and_media() {
        let start = InboundEvent::parse(r#"{"event":"start","start":{"streamSid":"S1"}}"#).unwrap();
        assert!(matches!(start, InboundEvent::Start { ref start } if start.stream_sid == "S1"));

        let media =
            InboundEvent::parse(r#"{"event":"media","media":{"track":"inbound","payload":"//8="}}"#)
                .unwrap();
        match media {
            InboundEvent::Media { media } => {
                assert_eq!(media.track, Track::Inbound);
                assert_eq!(media.audio().unwrap(), vec![0xFF, 0xFF]);
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_connected_stop_and_ignored_kinds() {
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap(),
            InboundEvent::Connected { .. }
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"stop","stop":{"callSid":"CA1"},"streamSid":"S1"}"#).unwrap(),
            InboundEvent::Stop { .. }
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"mark","streamSid":"S1","mark":{"name":"m"}}"#).unwrap(),
            InboundEvent::Ignored
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"dtmf","dtmf":{"track":"inbound_track","digit":"1"}}"#).unwrap(),
            InboundEvent::Ignored
        ));
    }

    #[test]
    fn test_unknown_track_is_not_inbound() {
        let event =
            InboundEvent::parse(r#"{"event":"media","media":{"track":"both","payload":""}}"#).unwrap();
        assert!(matches!(event, InboundEvent::Media { media } if media.track == Track::Other));
    }

    #[test]
    fn test_malformed_events_are_protocol_violations() {
        for text in [
            "not json",
            r#"{"no_event": true}"#,
            r#"{"event":"start","start":{}}"#,
            r#"{"event":"media","media":{"track":"inbound"}}"#,
        ] {
            assert!(
                matches!(InboundEvent::parse(text), Err(BridgeError::ProtocolViolation(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_outbound_wire_format() {
        let clear: serde_json::Value =
            serde_json::from_str(&OutboundEvent::clear("S1").to_json()).unwrap();
        assert_eq!(clear, serde_json::json!({"event": "clear", "streamSid": "S1"}));

        let media: serde_json::Value =
            serde_json::from_str(&OutboundEvent::media("S1", &[0xFF, 0xFF]).to_json()).unwrap();
        assert_eq!(
            media,
            serde_json::json!({"event": "media", "streamSid": "S1", "media": {"payload": "//8="}})
        );
    }
}
