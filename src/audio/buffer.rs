//! # Inbound Audio Buffer
//!
//! Accumulates decoded caller audio and cuts it into fixed-size blocks for the agent uplink.
//!
//! Twilio delivers 160-byte frames every 20 ms. Sending each one as its own WebSocket frame
//! to the agent would be wasteful, so the reader batches them: whenever the buffer holds at
//! least `block_size` bytes, exactly one block of that size is sliced off the front.
//!
//! ## Invariants:
//! - Blocks are always exactly `block_size` bytes, never empty and never oversized
//! - Bytes leave the buffer in the order they arrived
//! - A remainder shorter than `block_size` stays buffered until more audio arrives
//!
//! ## Ownership:
//! The buffer is owned by the inbound reader task alone.

use std::collections::VecDeque;

/// Growable byte accumulator that emits fixed-size blocks.
#[derive(Debug)]
pub struct InboundAudioBuffer {
    /// Pending bytes not yet emitted as a block
    pending: VecDeque<u8>,

    /// Exact size of every emitted block
    block_size: usize,
}

impl InboundAudioBuffer {
    /// Create an empty buffer.
    ///
    /// ## Panics:
    /// If `block_size` is 0. Configuration validation rejects that value before any call
    /// session is created.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be greater than 0");
        Self {
            pending: VecDeque::with_capacity(block_size * 2),
            block_size,
        }
    }

    /// Append decoded audio bytes.
    pub fn extend(&mut self, audio: &[u8]) {
        self.pending.extend(audio);
    }

    /// Slice one full block off the front, if one is available.
    ///
    /// Only the block's own bytes are moved; the remainder stays where it is.
    ///
    /// ## Usage:
    /// ```ignore
    /// buffer.extend(&chunk);
    /// while let Some(block) = buffer.next_block() {
    ///     queue.send(block).await?;
    /// }
    /// ```
    pub fn next_block(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < self.block_size {
            return None;
        }
        Some(self.pending.drain(..self.block_size).collect())
    }

    /// Number of bytes waiting for a full block.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop the remainder, returning how many bytes were discarded.
    ///
    /// Called at the end of a call: a partial block is never sent.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut InboundAudioBuffer) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| buffer.next_block()).collect()
    }

    #[test]
    fn test_no_block_until_full() {
        let mut buffer = InboundAudioBuffer::new(4);
        buffer.extend(&[1, 2, 3]);
        assert!(buffer.next_block().is_none());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_exact_block_leaves_nothing() {
        let mut buffer = InboundAudioBuffer::new(4);
        buffer.extend(&[1, 2, 3, 4]);
        assert_eq!(buffer.next_block(), Some(vec![1, 2, 3, 4]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_block_count_and_order_over_uneven_chunks() {
        let mut buffer = InboundAudioBuffer::new(5);
        let input: Vec<u8> = (0..23).collect();
        let mut blocks = Vec::new();

        // Feed in awkward chunk sizes, draining after each one like the reader does
        for chunk in input.chunks(3) {
            buffer.extend(chunk);
            blocks.extend(drain(&mut buffer));
        }

        // floor(23 / 5) = 4 blocks, 3 bytes left over
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|b| b.len() == 5));
        let joined: Vec<u8> = blocks.concat();
        assert_eq!(joined, input[..20].to_vec());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_one_large_chunk_yields_several_blocks() {
        let mut buffer = InboundAudioBuffer::new(3200);
        buffer.extend(&vec![0xFF; 3200 * 2 + 80]);
        assert_eq!(drain(&mut buffer).len(), 2);
        assert_eq!(buffer.len(), 80);
    }

    #[test]
    fn test_large_payload_keeps_order_across_many_blocks() {
        let mut buffer = InboundAudioBuffer::new(160);
        let input: Vec<u8> = (0..160 * 500 + 7).map(|i| (i % 251) as u8).collect();
        buffer.extend(&input);

        let blocks = drain(&mut buffer);
        assert_eq!(blocks.len(), 500);
        assert_eq!(blocks.concat(), input[..160 * 500].to_vec());
        assert_eq!(buffer.len(), 7);

        // The remainder is still the front of the next block
        buffer.extend(&[0; 153]);
        let next = buffer.next_block().unwrap();
        assert_eq!(next[..7], input[160 * 500..]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_discard_returns_remainder() {
        let mut buffer = InboundAudioBuffer::new(10);
        buffer.extend(&[7; 6]);
        assert_eq!(buffer.discard(), 6);
        assert!(buffer.is_empty());
    }
}
