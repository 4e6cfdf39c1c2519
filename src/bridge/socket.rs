//! # Duplex Socket Abstraction
//!
//! The duties of a call session do not know whether they talk to an actix WebSocket actor,
//! a `tokio-tungstenite` client or an in-memory test double. Each socket is seen as two
//! halves:
//!
//! - a **reader**: `Stream<Item = Result<Frame, BridgeError>>`, ending when the peer closes
//! - a **writer**: `Sink<Frame, Error = BridgeError>`, whose `close()` closes the socket
//!
//! Each half is owned by exactly one duty, so no half is ever shared or locked.

use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::{BridgeError, Peer};

/// One WebSocket data frame. Control frames (ping/pong/close) are handled by the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, BridgeError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = BridgeError> + Send>>;

/// Both halves of one socket.
pub struct SocketPair {
    pub reader: FrameStream,
    pub writer: FrameSink,
}

/// What a `ChannelSink` asks its socket owner to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(Frame),
    Close,
}

/// A writer half backed by an unbounded channel.
///
/// Used where the real socket is driven elsewhere (the actix actor drains the receiving end)
/// and by tests, which inspect the commands directly. `close()` emits `SocketCommand::Close`
/// at most once, no matter how often it is called.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SocketCommand>,
    peer: Peer,
    closed: bool,
}

impl ChannelSink {
    pub fn new(peer: Peer) -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                peer,
                closed: false,
            },
            rx,
        )
    }
}

impl Sink<Frame> for ChannelSink {
    type Error = BridgeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.closed || self.tx.is_closed() {
            Poll::Ready(Err(BridgeError::PeerClosed(self.peer)))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        if self.closed {
            return Err(BridgeError::PeerClosed(self.peer));
        }
        self.tx
            .send(SocketCommand::Send(frame))
            .map_err(|_| BridgeError::PeerClosed(self.peer))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if !self.closed {
            self.closed = true;
            // The owner may already be gone; the socket is closed either way
            let _ = self.tx.send(SocketCommand::Close);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;

    #[tokio::test]
    async fn test_channel_sink_forwards_frames_in_order() {
        let (mut sink, mut rx) = ChannelSink::new(Peer::Telephony);
        sink.send(Frame::Text("a".into())).await.unwrap();
        sink.send(Frame::Binary(vec![1])).await.unwrap();

        assert_eq!(rx.recv().await, Some(SocketCommand::Send(Frame::Text("a".into()))));
        assert_eq!(rx.recv().await, Some(SocketCommand::Send(Frame::Binary(vec![1]))));
    }

    #[tokio::test]
    async fn test_close_is_sent_once() {
        let (mut sink, mut rx) = ChannelSink::new(Peer::Agent);
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        drop(sink);

        assert_eq!(rx.recv().await, Some(SocketCommand::Close));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_is_peer_closed() {
        let (mut sink, rx) = ChannelSink::new(Peer::Agent);
        drop(rx);
        let err = sink.send(Frame::Binary(vec![0])).await.unwrap_err();
        assert_eq!(err, BridgeError::PeerClosed(Peer::Agent));
    }
}
