//! # Agent Uplink Sender
//!
//! Forwards audio blocks from the queue to the agent, one binary frame per block, in queue
//! order. It stops when the queue closes (the reader is done and everything it enqueued has
//! been sent) or when the agent refuses a frame. Either way it closes the agent socket's
//! write half on the way out.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::socket::Frame;
use super::DutyExit;
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UplinkStats {
    pub blocks_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug)]
pub struct UplinkOutcome {
    pub result: BridgeResult<DutyExit>,
    pub stats: UplinkStats,
}

pub async fn run_uplink<W>(mut queue: mpsc::Receiver<Vec<u8>>, mut agent: W) -> UplinkOutcome
where
    W: Sink<Frame, Error = BridgeError> + Unpin,
{
    let mut stats = UplinkStats::default();

    let result = loop {
        let Some(block) = queue.recv().await else {
            break Ok(DutyExit::Completed);
        };

        let len = block.len() as u64;
        if let Err(err) = agent.send(Frame::Binary(block)).await {
            break Err(err);
        }
        stats.blocks_sent += 1;
        stats.bytes_sent += len;
    };

    // Stop accepting blocks before closing, so a parked reader fails fast
    queue.close();
    if let Err(err) = agent.close().await {
        debug!(error = %err, "Agent socket already closed");
    }

    UplinkOutcome { result, stats }
}
