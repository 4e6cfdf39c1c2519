//! # Voice Agent WebSocket Client
//!
//! Opens one outbound WebSocket per call with `tokio-tungstenite` and exposes it to the
//! bridge as a `SocketPair`.
//!
//! ## Authentication:
//! The agent expects the API key in the WebSocket subprotocol header:
//! `Sec-WebSocket-Protocol: token, <api key>`.
//!
//! ## Frame Mapping:
//! - Text and binary messages become `Frame`s in both directions
//! - Ping, pong and raw frames are handled by tungstenite and never reach the bridge
//! - A read error ends the reader with `PeerClosed(Agent)`

use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::bridge::session::AgentConnector;
use crate::bridge::socket::{Frame, SocketPair};
use crate::config::AgentConfig;
use crate::error::{BridgeError, BridgeResult, Peer};

/// Connects calls to the configured voice-agent endpoint.
#[derive(Debug, Clone)]
pub struct AgentClient {
    url: String,
    api_key: String,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// The handshake request, with the API key carried as a subprotocol.
    fn request(&self) -> BridgeResult<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("invalid agent url: {}", e)))?;

        let protocol = HeaderValue::from_str(&format!("token, {}", self.api_key)).map_err(|_| {
            BridgeError::UpstreamUnavailable("API key is not a valid header value".to_string())
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        Ok(request)
    }
}

impl AgentConnector for AgentClient {
    fn connect(&self) -> impl Future<Output = BridgeResult<SocketPair>> + Send {
        let request = self.request();
        let url = self.url.clone();

        async move {
            let (stream, response) = connect_async(request?).await.map_err(|e| {
                BridgeError::UpstreamUnavailable(format!("connecting to {} failed: {}", url, e))
            })?;
            info!(url = %url, status = %response.status(), "Connected to voice agent");

            let (write, read) = stream.split();

            let reader = read.filter_map(|message| {
                ready(match message {
                    Ok(message) => frame_from_message(message).map(Ok),
                    Err(err) => {
                        debug!(error = %err, "Agent socket read failed");
                        Some(Err(BridgeError::PeerClosed(Peer::Agent)))
                    }
                })
            });

            let writer = write
                .sink_map_err(|err| {
                    debug!(error = %err, "Agent socket write failed");
                    BridgeError::PeerClosed(Peer::Agent)
                })
                .with(|frame: Frame| ready(Ok::<_, BridgeError>(message_from_frame(frame))));

            Ok(SocketPair {
                reader: Box::pin(reader),
                writer: Box::pin(writer),
            })
        }
    }
}

fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Close(close) => {
            debug!(frame = ?close, "Agent sent close");
            None
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, key: &str) -> AgentConfig {
        AgentConfig {
            url: url.to_string(),
            api_key: key.to_string(),
            connect_timeout_ms: 1000,
        }
    }

    #[test]
    fn test_request_carries_token_subprotocol() {
        let client = AgentClient::new(&config("wss://agent.example.com/v1/agent/converse", "abc123"));
        let request = client.request().unwrap();

        assert_eq!(request.uri().host(), Some("agent.example.com"));
        assert_eq!(
            request.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "token, abc123"
        );
    }

    #[test]
    fn test_bad_url_is_upstream_unavailable() {
        let client = AgentClient::new(&config("not a url", "abc123"));
        assert!(matches!(
            client.request(),
            Err(BridgeError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn test_control_messages_are_filtered() {
        assert_eq!(
            frame_from_message(Message::Text("{}".to_string())),
            Some(Frame::Text("{}".to_string()))
        );
        assert_eq!(
            frame_from_message(Message::Binary(vec![1, 2])),
            Some(Frame::Binary(vec![1, 2]))
        );
        assert_eq!(frame_from_message(Message::Ping(vec![])), None);
        assert_eq!(frame_from_message(Message::Pong(vec![])), None);
        assert_eq!(frame_from_message(Message::Close(None)), None);

        assert_eq!(message_from_frame(Frame::Binary(vec![7])), Message::Binary(vec![7]));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_upstream_unavailable() {
        // Nothing listens on port 9 of the loopback interface
        let client = AgentClient::new(&config("ws://127.0.0.1:9/agent", "k"));
        let result = client.connect().await;
        assert!(matches!(result, Err(BridgeError::UpstreamUnavailable(_))));
    }
}
