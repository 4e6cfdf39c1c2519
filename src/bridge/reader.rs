//! # Inbound Media Reader
//!
//! Consumes Twilio events from the telephony socket and turns the caller's audio into
//! fixed-size blocks on the audio queue.
//!
//! ## Event Handling:
//! - **connected**: logged, otherwise ignored
//! - **start**: publishes the stream sid to the downlink (a second `start` is a protocol violation)
//! - **media** on the inbound track: decoded, buffered, and drained into the queue in blocks
//! - **media** on any other track: ignored without decoding
//! - **stop**: ends the loop normally
//! - **mark / dtmf / unknown kinds**: logged, otherwise ignored
//!
//! Anything malformed ends the loop with `BridgeError::ProtocolViolation`.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::handoff::CorrelationWriter;
use super::socket::Frame;
use super::teardown::TeardownListener;
use super::DutyExit;
use crate::audio::buffer::InboundAudioBuffer;
use crate::error::{BridgeError, BridgeResult, Peer};
use crate::telephony::events::{InboundEvent, Track};

/// Counters reported when the reader exits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReaderStats {
    pub media_events: u64,
    pub bytes_received: u64,
    pub blocks_enqueued: u64,
    pub bytes_discarded: u64,
}

#[derive(Debug)]
pub struct ReaderOutcome {
    pub result: BridgeResult<DutyExit>,
    pub stats: ReaderStats,
}

pub struct InboundReader<S> {
    events: S,
    buffer: InboundAudioBuffer,
    queue: mpsc::Sender<Vec<u8>>,
    stream_sid: CorrelationWriter,
    teardown: TeardownListener,
    stats: ReaderStats,
}

impl<S> InboundReader<S>
where
    S: Stream<Item = Result<Frame, BridgeError>> + Unpin,
{
    pub fn new(
        events: S,
        block_size: usize,
        queue: mpsc::Sender<Vec<u8>>,
        stream_sid: CorrelationWriter,
        teardown: TeardownListener,
    ) -> Self {
        Self {
            events,
            buffer: InboundAudioBuffer::new(block_size),
            queue,
            stream_sid,
            teardown,
            stats: ReaderStats::default(),
        }
    }

    /// Read until `stop`, teardown, or failure.
    ///
    /// Consumes the reader: the queue sender is dropped on return, which tells the uplink
    /// that no more blocks are coming.
    pub async fn run(mut self) -> ReaderOutcome {
        let result = self.read_loop().await;

        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "Discarding partial audio block at end of call");
        }
        self.stats.bytes_discarded = self.buffer.discard() as u64;

        ReaderOutcome {
            result,
            stats: self.stats,
        }
    }

    async fn read_loop(&mut self) -> BridgeResult<DutyExit> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.teardown.requested() => return Ok(DutyExit::Cancelled),
                next = self.events.next() => next,
            };

            let text = match next {
                None => return Err(BridgeError::PeerClosed(Peer::Telephony)),
                Some(Err(err)) => return Err(err),
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Binary(data))) => {
                    return Err(BridgeError::ProtocolViolation(format!(
                        "unexpected binary frame from telephony ({} bytes)",
                        data.len()
                    )))
                }
            };

            match InboundEvent::parse(&text)? {
                InboundEvent::Connected { protocol } => {
                    debug!(protocol = ?protocol, "Telephony stream connected");
                }
                InboundEvent::Start { start } => {
                    info!(
                        stream_sid = %start.stream_sid,
                        call_sid = ?start.call_sid,
                        account_sid = ?start.account_sid,
                        tracks = ?start.tracks,
                        custom_parameters = ?start.custom_parameters,
                        "Telephony stream started"
                    );
                    if let Some(format) = &start.media_format {
                        debug!(
                            encoding = %format.encoding,
                            sample_rate = format.sample_rate,
                            channels = format.channels,
                            "Telephony media format"
                        );
                    }
                    self.stream_sid.set(start.stream_sid)?;
                }
                InboundEvent::Media { media } if media.track == Track::Inbound => {
                    let audio = media.audio()?;
                    self.stats.media_events += 1;
                    self.stats.bytes_received += audio.len() as u64;
                    self.buffer.extend(&audio);

                    if let Some(exit) = self.enqueue_full_blocks().await? {
                        return Ok(exit);
                    }
                }
                InboundEvent::Media { .. } => {}
                InboundEvent::Stop { stop } => {
                    info!(
                        call_sid = ?stop.and_then(|s| s.call_sid),
                        "Telephony stream stopped"
                    );
                    return Ok(DutyExit::Completed);
                }
                InboundEvent::Ignored => {
                    debug!("Ignoring telephony event");
                }
            }
        }
    }

    /// Move every complete block onto the queue.
    ///
    /// Waits for room when the queue is full; returns `Some(Cancelled)` if teardown is
    /// requested while waiting.
    async fn enqueue_full_blocks(&mut self) -> BridgeResult<Option<DutyExit>> {
        while let Some(block) = self.buffer.next_block() {
            tokio::select! {
                biased;
                _ = self.teardown.requested() => return Ok(Some(DutyExit::Cancelled)),
                sent = self.queue.send(block) => {
                    sent.map_err(|_| BridgeError::PeerClosed(Peer::Agent))?;
                    self.stats.blocks_enqueued += 1;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_payload;
    use crate::bridge::handoff::correlation_cell;
    use crate::bridge::teardown::teardown_signal;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type Inbound = mpsc::UnboundedSender<Result<Frame, BridgeError>>;

    fn media(track: &str, audio: &[u8]) -> Frame {
        Frame::Text(format!(
            r#"{{"event":"media","media":{{"track":"{}","payload":"{}"}}}}"#,
            track,
            encode_payload(audio)
        ))
    }

    fn text(json: &str) -> Frame {
        Frame::Text(json.to_string())
    }

    struct Harness {
        inbound: Inbound,
        queue: mpsc::Receiver<Vec<u8>>,
        reader: crate::bridge::handoff::CorrelationReader,
        trigger: crate::bridge::teardown::TeardownTrigger,
        task: tokio::task::JoinHandle<ReaderOutcome>,
    }

    fn spawn_reader(block_size: usize, capacity: usize) -> Harness {
        let (inbound, rx) = mpsc::unbounded_channel();
        let (queue_tx, queue) = mpsc::channel(capacity);
        let (writer, reader) = correlation_cell();
        let (trigger, listener) = teardown_signal();
        let task = tokio::spawn(
            InboundReader::new(
                UnboundedReceiverStream::new(rx),
                block_size,
                queue_tx,
                writer,
                listener,
            )
            .run(),
        );
        Harness {
            inbound,
            queue,
            reader,
            trigger,
            task,
        }
    }

    #[tokio::test]
    async fn test_stop_completes_and_blocks_are_ordered() {
        let mut h = spawn_reader(4, 16);
        h.inbound.send(Ok(text(r#"{"event":"connected"}"#))).unwrap();
        h.inbound
            .send(Ok(text(r#"{"event":"start","start":{"streamSid":"S1"}}"#)))
            .unwrap();
        h.inbound.send(Ok(media("inbound", &[1, 2, 3]))).unwrap();
        h.inbound.send(Ok(media("outbound", &[9, 9, 9, 9]))).unwrap();
        h.inbound.send(Ok(media("inbound", &[4, 5, 6, 7, 8, 9]))).unwrap();
        h.inbound.send(Ok(text(r#"{"event":"stop"}"#))).unwrap();

        let outcome = h.task.await.unwrap();
        assert_eq!(outcome.result, Ok(DutyExit::Completed));
        assert_eq!(outcome.stats.blocks_enqueued, 2);
        assert_eq!(outcome.stats.bytes_received, 9);
        assert_eq!(outcome.stats.bytes_discarded, 1);

        assert_eq!(h.queue.recv().await, Some(vec![1, 2, 3, 4]));
        assert_eq!(h.queue.recv().await, Some(vec![5, 6, 7, 8]));
        // Sender dropped with the reader: the queue is closed
        assert_eq!(h.queue.recv().await, None);
        assert_eq!(h.reader.get().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_protocol_violation() {
        let h = spawn_reader(4, 16);
        h.inbound
            .send(Ok(text(r#"{"event":"start","start":{"streamSid":"S1"}}"#)))
            .unwrap();
        h.inbound
            .send(Ok(text(r#"{"event":"start","start":{"streamSid":"S2"}}"#)))
            .unwrap();

        let outcome = h.task.await.unwrap();
        assert!(matches!(outcome.result, Err(BridgeError::ProtocolViolation(_))));
        assert_eq!(h.reader.get().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_malformed_frames_end_the_loop() {
        for frame in [
            text("{not json"),
            text(r#"{"event":"media","media":{"track":"inbound","payload":"%%%"}}"#),
            Frame::Binary(vec![0xFF; 4]),
        ] {
            let h = spawn_reader(4, 16);
            h.inbound.send(Ok(frame)).unwrap();
            let outcome = h.task.await.unwrap();
            assert!(matches!(outcome.result, Err(BridgeError::ProtocolViolation(_))));
        }
    }

    #[tokio::test]
    async fn test_stream_end_without_stop_is_peer_closed() {
        let h = spawn_reader(4, 16);
        drop(h.inbound);
        let outcome = h.task.await.unwrap();
        assert_eq!(outcome.result, Err(BridgeError::PeerClosed(Peer::Telephony)));
    }

    #[tokio::test]
    async fn test_teardown_interrupts_full_queue() {
        let h = spawn_reader(2, 1);
        // Two blocks, room for one: the reader parks on the second
        h.inbound.send(Ok(media("inbound", &[1, 2, 3, 4]))).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!h.task.is_finished());

        h.trigger.trigger();
        let outcome = h.task.await.unwrap();
        assert_eq!(outcome.result, Ok(DutyExit::Cancelled));
        assert_eq!(outcome.stats.blocks_enqueued, 1);
    }
}
