//! One-shot handoff of the call's stream sid from the inbound reader to the downlink.
//!
//! The stream sid only arrives with Twilio's `start` event, some time after the socket opens,
//! and every outbound event must carry it. The downlink therefore waits here before it reads
//! anything from the agent.
//!
//! Built on `tokio::sync::watch`: the writer half publishes `Some(sid)` once, the reader half
//! suspends until a value is present and can then read it any number of times.

use tokio::sync::watch;

use crate::error::{BridgeError, BridgeResult};

/// Create a connected writer/reader pair for one call.
pub fn correlation_cell() -> (CorrelationWriter, CorrelationReader) {
    let (tx, rx) = watch::channel(None);
    (CorrelationWriter { tx }, CorrelationReader { rx })
}

/// Write half, owned by the inbound reader.
#[derive(Debug)]
pub struct CorrelationWriter {
    tx: watch::Sender<Option<String>>,
}

impl CorrelationWriter {
    /// Publish the stream sid. A second call fails and leaves the first value in place.
    pub fn set(&self, stream_sid: String) -> BridgeResult<()> {
        let mut rejected = None;
        self.tx.send_if_modified(|current| match current {
            Some(existing) => {
                rejected = Some(existing.clone());
                false
            }
            None => {
                *current = Some(stream_sid.clone());
                true
            }
        });

        match rejected {
            Some(existing) => Err(BridgeError::ProtocolViolation(format!(
                "duplicate start event (stream {} already started, got {})",
                existing, stream_sid
            ))),
            None => Ok(()),
        }
    }
}

/// Read half, owned by the downlink.
#[derive(Debug, Clone)]
pub struct CorrelationReader {
    rx: watch::Receiver<Option<String>>,
}

impl CorrelationReader {
    /// Wait until the stream sid is known.
    ///
    /// Returns `None` if the writer is dropped without ever publishing, which happens when the
    /// call ends before Twilio sent `start`.
    pub async fn wait(&mut self) -> Option<String> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }

    /// The stream sid if it is already known, without waiting.
    pub fn get(&self) -> Option<String> {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reader_waits_for_value() {
        let (writer, mut reader) = correlation_cell();
        assert_eq!(reader.get(), None);

        let waiter = tokio::spawn(async move { reader.wait().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        writer.set("S1".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_repeated_reads_are_stable() {
        let (writer, mut reader) = correlation_cell();
        writer.set("S1".to_string()).unwrap();
        assert_eq!(reader.wait().await.as_deref(), Some("S1"));
        assert_eq!(reader.wait().await.as_deref(), Some("S1"));
        assert_eq!(reader.get().as_deref(), Some("S1"));
    }

    #[test]
    fn test_second_write_is_rejected_and_not_overwritten() {
        let (writer, reader) = correlation_cell();
        writer.set("S1".to_string()).unwrap();
        let err = writer.set("S2".to_string()).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolViolation(_)));
        assert_eq!(reader.get().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_dropped_writer_releases_waiter() {
        let (writer, mut reader) = correlation_cell();
        drop(writer);
        assert_eq!(reader.wait().await, None);
    }
}
