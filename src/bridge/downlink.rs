//! # Agent Downlink Receiver
//!
//! Relays the agent's output to the caller.
//!
//! ## Ordering:
//! Nothing is read from the agent until the stream sid is known, so no outbound event can be
//! built without a destination. Frames are then handled strictly one at a time, which is what
//! guarantees that a `clear` triggered by barge-in goes out before any audio the agent sends
//! afterwards.
//!
//! ## Frame Handling:
//! - **Binary**: synthesized speech, wrapped into a Twilio `media` event
//! - **Text `UserStartedSpeaking`**: a Twilio `clear` event, cutting off queued playback
//! - **Other text**: logged only

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use super::handoff::CorrelationReader;
use super::socket::Frame;
use super::teardown::TeardownListener;
use super::DutyExit;
use crate::agent::protocol::AgentEvent;
use crate::error::{BridgeError, BridgeResult, Peer};
use crate::telephony::events::OutboundEvent;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownlinkStats {
    pub media_sent: u64,
    pub audio_bytes: u64,
    pub clears_sent: u64,
    pub events_received: u64,
}

#[derive(Debug)]
pub struct DownlinkOutcome {
    pub result: BridgeResult<DutyExit>,
    pub stats: DownlinkStats,
}

pub struct AgentDownlink<R, W> {
    agent: R,
    telephony: W,
    stream_sid: CorrelationReader,
    teardown: TeardownListener,
    stats: DownlinkStats,
}

impl<R, W> AgentDownlink<R, W>
where
    R: Stream<Item = Result<Frame, BridgeError>> + Unpin,
    W: Sink<Frame, Error = BridgeError> + Unpin,
{
    pub fn new(
        agent: R,
        telephony: W,
        stream_sid: CorrelationReader,
        teardown: TeardownListener,
    ) -> Self {
        Self {
            agent,
            telephony,
            stream_sid,
            teardown,
            stats: DownlinkStats::default(),
        }
    }

    /// Relay until the agent closes, the caller hangs up, or teardown is requested.
    /// Closes the telephony write half on return.
    pub async fn run(mut self) -> DownlinkOutcome {
        let result = self.relay().await;

        if let Err(err) = self.telephony.close().await {
            debug!(error = %err, "Telephony socket already closed");
        }

        DownlinkOutcome {
            result,
            stats: self.stats,
        }
    }

    async fn relay(&mut self) -> BridgeResult<DutyExit> {
        let stream_sid = tokio::select! {
            biased;
            _ = self.teardown.requested() => return Ok(DutyExit::Cancelled),
            sid = self.stream_sid.wait() => match sid {
                Some(sid) => sid,
                // The reader ended before `start`: there is no call leg to talk to
                None => return Ok(DutyExit::Cancelled),
            },
        };
        debug!(stream_sid = %stream_sid, "Downlink ready");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.teardown.requested() => return Ok(DutyExit::Cancelled),
                next = self.agent.next() => next,
            };

            match next {
                None => return Err(BridgeError::PeerClosed(Peer::Agent)),
                Some(Err(err)) => return Err(err),
                Some(Ok(Frame::Binary(audio))) => {
                    let event = OutboundEvent::media(&stream_sid, &audio);
                    self.telephony.send(Frame::Text(event.to_json())).await?;
                    self.stats.media_sent += 1;
                    self.stats.audio_bytes += audio.len() as u64;
                }
                Some(Ok(Frame::Text(text))) => {
                    self.stats.events_received += 1;
                    self.handle_event(&stream_sid, &text).await?;
                }
            }
        }
    }

    async fn handle_event(&mut self, stream_sid: &str, text: &str) -> BridgeResult<()> {
        let event = match AgentEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, raw = %text, "Could not decode agent message");
                return Ok(());
            }
        };

        if event.is_barge_in() {
            let clear = OutboundEvent::clear(stream_sid);
            self.telephony.send(Frame::Text(clear.to_json())).await?;
            self.stats.clears_sent += 1;
            info!(stream_sid = %stream_sid, "Caller barged in, cleared playback");
            return Ok(());
        }

        match event {
            AgentEvent::Welcome { request_id } => {
                debug!(request_id = ?request_id, "Agent session opened");
            }
            AgentEvent::AgentThinking { content } => {
                debug!(content = content.as_deref().unwrap_or(""), "Agent thinking");
            }
            AgentEvent::ConversationText { role, content } => {
                info!(
                    role = role.as_deref().unwrap_or("unknown"),
                    content = content.as_deref().unwrap_or(""),
                    "Conversation text"
                );
            }
            AgentEvent::Error { description, code } => {
                warn!(code = ?code, description = ?description, "Agent reported an error");
            }
            AgentEvent::Warning { description, code } => {
                warn!(code = ?code, description = ?description, "Agent reported a warning");
            }
            other => {
                debug!(event = ?other, "Agent event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_payload;
    use crate::bridge::handoff::correlation_cell;
    use crate::bridge::socket::{ChannelSink, SocketCommand};
    use crate::bridge::teardown::teardown_signal;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn sent_json(cmd: Option<SocketCommand>) -> serde_json::Value {
        match cmd {
            Some(SocketCommand::Send(Frame::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_waits_for_stream_sid_before_reading_agent() {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (sink, mut telephony) = ChannelSink::new(Peer::Telephony);
        let (writer, reader) = correlation_cell();
        let (trigger, listener) = teardown_signal();

        let task = tokio::spawn(
            AgentDownlink::new(UnboundedReceiverStream::new(agent_rx), sink, reader, listener).run(),
        );

        // Audio arrives before `start`: nothing may be sent yet
        agent_tx.send(Ok(Frame::Binary(vec![1, 2, 3]))).unwrap();
        tokio::task::yield_now().await;
        assert!(telephony.try_recv().is_err());

        writer.set("S1".to_string()).unwrap();
        let media = sent_json(telephony.recv().await);
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "S1");
        assert_eq!(
            decode_payload(media["media"]["payload"].as_str().unwrap()).unwrap(),
            vec![1, 2, 3]
        );

        trigger.trigger();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.result, Ok(DutyExit::Cancelled));
        assert_eq!(outcome.stats.media_sent, 1);
        assert_eq!(telephony.recv().await, Some(SocketCommand::Close));
    }

    #[tokio::test]
    async fn test_barge_in_clear_precedes_later_audio() {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (sink, mut telephony) = ChannelSink::new(Peer::Telephony);
        let (writer, reader) = correlation_cell();
        let (_trigger, listener) = teardown_signal();
        writer.set("S1".to_string()).unwrap();

        agent_tx.send(Ok(Frame::Binary(vec![1]))).unwrap();
        agent_tx
            .send(Ok(Frame::Text(r#"{"type":"UserStartedSpeaking"}"#.to_string())))
            .unwrap();
        agent_tx
            .send(Ok(Frame::Text(r#"{"type":"ConversationText","role":"user","content":"wait"}"#.to_string())))
            .unwrap();
        agent_tx.send(Ok(Frame::Text("garbage".to_string()))).unwrap();
        agent_tx.send(Ok(Frame::Binary(vec![2]))).unwrap();
        drop(agent_tx);

        let outcome =
            AgentDownlink::new(UnboundedReceiverStream::new(agent_rx), sink, reader, listener)
                .run()
                .await;
        assert_eq!(outcome.result, Err(BridgeError::PeerClosed(Peer::Agent)));
        assert_eq!(outcome.stats.clears_sent, 1);
        assert_eq!(outcome.stats.media_sent, 2);
        assert_eq!(outcome.stats.events_received, 3);

        assert_eq!(sent_json(telephony.recv().await)["event"], "media");
        assert_eq!(
            sent_json(telephony.recv().await),
            serde_json::json!({"event": "clear", "streamSid": "S1"})
        );
        let later = sent_json(telephony.recv().await);
        assert_eq!(later["event"], "media");
        assert_eq!(later["media"]["payload"], "Ag==");
        assert_eq!(telephony.recv().await, Some(SocketCommand::Close));
        assert_eq!(telephony.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_dropped_before_start_cancels() {
        let (_agent_tx, agent_rx) = mpsc::unbounded_channel::<Result<Frame, BridgeError>>();
        let (sink, mut telephony) = ChannelSink::new(Peer::Telephony);
        let (writer, reader) = correlation_cell();
        let (_trigger, listener) = teardown_signal();
        drop(writer);

        let outcome =
            AgentDownlink::new(UnboundedReceiverStream::new(agent_rx), sink, reader, listener)
                .run()
                .await;
        assert_eq!(outcome.result, Ok(DutyExit::Cancelled));
        assert_eq!(telephony.recv().await, Some(SocketCommand::Close));
    }

    #[tokio::test]
    async fn test_caller_hangup_is_peer_closed() {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (sink, telephony) = ChannelSink::new(Peer::Telephony);
        let (writer, reader) = correlation_cell();
        let (_trigger, listener) = teardown_signal();
        writer.set("S1".to_string()).unwrap();
        drop(telephony);

        agent_tx.send(Ok(Frame::Binary(vec![1]))).unwrap();
        let outcome =
            AgentDownlink::new(UnboundedReceiverStream::new(agent_rx), sink, reader, listener)
                .run()
                .await;
        assert_eq!(outcome.result, Err(BridgeError::PeerClosed(Peer::Telephony)));
    }
}
