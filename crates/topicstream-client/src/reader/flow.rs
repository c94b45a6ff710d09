//! Byte-budget flow control and the buffer of received data.
//!
//! The server may only send as many bytes as the reader asked for with
//! ReadRequests. The budget is `memory_usage_max_bytes`: bytes requested but
//! not yet received plus bytes received but not yet consumed never exceed it.
//!
//! ```text
//!  budget = outstanding (asked, not received) + buffered (received, not consumed) + headroom
//!
//!  ReadResponse(bytes)   outstanding -= bytes   buffered += bytes
//!  message consumed      buffered -= share      headroom grows
//!  data discarded        buffered -= share      headroom grows
//!  headroom > 0          ReadRequest(headroom)  outstanding += headroom
//! ```

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use super::partition::PartitionSession;
use crate::codec::Codec;
use crate::offsets::OffsetRange;

#[derive(Debug, Clone)]
pub(crate) struct FlowControl {
    max: i64,
    outstanding: i64,
    buffered: i64,
}

impl FlowControl {
    pub(crate) fn new(max: i64) -> Self {
        Self {
            max,
            outstanding: 0,
            buffered: 0,
        }
    }

    /// Forget everything a dead connection asked for or delivered.
    pub(crate) fn reset(&mut self) {
        self.outstanding = 0;
        self.buffered = 0;
    }

    /// Claim the whole headroom for a ReadRequest.
    pub(crate) fn take_request(&mut self) -> Option<i64> {
        let headroom = self.max - self.outstanding - self.buffered;
        if headroom <= 0 {
            return None;
        }
        self.outstanding += headroom;
        Some(headroom)
    }

    pub(crate) fn received(&mut self, bytes: i64) {
        self.outstanding = (self.outstanding - bytes).max(0);
        self.buffered += bytes;
    }

    pub(crate) fn release(&mut self, bytes: i64) {
        self.buffered = (self.buffered - bytes).max(0);
    }

    pub(crate) fn outstanding(&self) -> i64 {
        self.outstanding
    }

    pub(crate) fn buffered(&self) -> i64 {
        self.buffered
    }
}

/// Split `total` bytes across payloads proportionally to their lengths.
/// The shares always add up to `total`.
pub(crate) fn apportion(total: i64, sizes: &[usize]) -> Vec<i64> {
    let total = total.max(0);
    let count = sizes.len();
    if count == 0 {
        return Vec::new();
    }
    let sum: i128 = sizes.iter().map(|&s| s as i128).sum();

    let mut shares = Vec::with_capacity(count);
    let mut assigned = 0i64;
    for (index, &size) in sizes.iter().enumerate() {
        let share = if index + 1 == count {
            total - assigned
        } else if sum > 0 {
            (total as i128 * size as i128 / sum) as i64
        } else {
            total / count as i64
        };
        assigned += share;
        shares.push(share);
    }
    shares
}

/// One received message, still compressed and undecoded.
#[derive(Debug, Clone)]
pub(crate) struct BufferedMessage {
    pub(crate) offset: i64,
    pub(crate) seq_no: i64,
    pub(crate) created_at: Option<SystemTime>,
    pub(crate) message_group_id: String,
    pub(crate) data: Bytes,
    pub(crate) uncompressed_size: i64,
    /// Share of the response's byte size.
    pub(crate) bytes: i64,
    pub(crate) commit_range: OffsetRange,
}

/// Attributes shared by all messages of one server batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchInfo {
    pub(crate) partition: Arc<PartitionSession>,
    pub(crate) producer_id: Arc<str>,
    pub(crate) codec: Codec,
    pub(crate) written_at: Option<SystemTime>,
}

#[derive(Debug)]
pub(crate) struct BufferedBatch {
    pub(crate) info: BatchInfo,
    pub(crate) messages: VecDeque<BufferedMessage>,
}

/// FIFO of received batches plus the flow-control counters.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    pub(crate) flow: FlowControl,
    batches: VecDeque<BufferedBatch>,
}

impl ReadBuffer {
    pub(crate) fn new(memory_usage_max_bytes: i64) -> Self {
        Self {
            flow: FlowControl::new(memory_usage_max_bytes),
            batches: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, batch: BufferedBatch) {
        if !batch.messages.is_empty() {
            self.batches.push_back(batch);
        }
    }

    /// Take the next message of an active partition session. Data of
    /// sessions that stopped in the meantime is discarded on the way.
    pub(crate) fn pop_message(&mut self) -> Option<(BatchInfo, BufferedMessage)> {
        loop {
            self.skip_inactive();
            let front = self.batches.front_mut()?;
            let Some(message) = front.messages.pop_front() else {
                self.batches.pop_front();
                continue;
            };
            let info = front.info.clone();
            if front.messages.is_empty() {
                self.batches.pop_front();
            }
            self.flow.release(message.bytes);
            return Some((info, message));
        }
    }

    /// Take the rest of the front batch of an active partition session.
    pub(crate) fn pop_batch(&mut self) -> Option<BufferedBatch> {
        self.skip_inactive();
        let batch = self.batches.pop_front()?;
        let bytes: i64 = batch.messages.iter().map(|m| m.bytes).sum();
        self.flow.release(bytes);
        Some(batch)
    }

    /// Drop the buffered data of one partition session. Returns the number
    /// of bytes released.
    pub(crate) fn discard_partition(&mut self, partition_session_id: i64) -> i64 {
        let mut released = 0;
        self.batches.retain(|batch| {
            if batch.info.partition.id() == partition_session_id {
                released += batch.messages.iter().map(|m| m.bytes).sum::<i64>();
                false
            } else {
                true
            }
        });
        self.flow.release(released);
        released
    }

    /// Drop everything and reset flow control.
    pub(crate) fn clear(&mut self) {
        self.batches.clear();
        self.flow.reset();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn message_count(&self) -> usize {
        self.batches.iter().map(|b| b.messages.len()).sum()
    }

    fn skip_inactive(&mut self) {
        while let Some(front) = self.batches.front() {
            if front.info.partition.is_active() {
                break;
            }
            let bytes: i64 = front.messages.iter().map(|m| m.bytes).sum();
            self.flow.release(bytes);
            self.batches.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_scenario() {
        let mut flow = FlowControl::new(200);
        assert_eq!(flow.take_request(), Some(200));
        assert_eq!(flow.take_request(), None);

        flow.received(50);
        assert_eq!(flow.outstanding(), 150);
        assert_eq!(flow.take_request(), None);

        flow.release(50);
        assert_eq!(flow.take_request(), Some(50));
        assert_eq!(flow.outstanding(), 200);
    }

    #[test]
    fn test_reset_restarts_from_zero_outstanding() {
        let mut flow = FlowControl::new(100);
        flow.take_request();
        flow.received(40);
        flow.reset();
        assert_eq!(flow.buffered(), 0);
        assert_eq!(flow.take_request(), Some(100));
    }

    #[test]
    fn test_apportion_sums_to_total() {
        assert_eq!(apportion(100, &[10, 30]), vec![25, 75]);
        assert_eq!(apportion(10, &[1, 1, 1]), vec![3, 3, 4]);
        assert_eq!(apportion(9, &[0, 0, 0]), vec![3, 3, 3]);
        assert_eq!(apportion(50, &[7]), vec![50]);
        assert!(apportion(50, &[]).is_empty());
    }
}
