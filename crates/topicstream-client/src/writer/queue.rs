//! Sequenced in-flight queue of one Writer.
//!
//! Entries accepted before the first init response wait unsequenced: the
//! sequence counter is unknown until the server reports the last sequence
//! number it saw for the producer. Every init response seeds the counter with
//! `max(local, server)` and marks all unacknowledged entries for resend.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::sync::oneshot;
use topicstream_proto::stream_write_message::write_request::MessageData;
use topicstream_proto::stream_write_message::write_response::{
    write_ack::MessageWriteStatus, WriteAck,
};

use super::{WriteResult, WriteStatus};
use crate::error::{ClientError, Result};

pub(crate) type Completion = oneshot::Sender<Result<WriteResult>>;

/// A write that has been accepted but not yet given a sequence number.
pub(crate) struct PendingWrite {
    pub(crate) created_at: SystemTime,
    pub(crate) data: Bytes,
    pub(crate) uncompressed_size: i64,
    pub(crate) completion: Completion,
}

struct InFlightWrite {
    seq_no: i64,
    write: PendingWrite,
    /// Generation of the stream this entry was last sent on.
    sent_on: Option<u64>,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    last_seq_no: Option<i64>,
    unsequenced: VecDeque<PendingWrite>,
    in_flight: VecDeque<InFlightWrite>,
    buffered_bytes: usize,
    rejecting: Option<ClientError>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Error for any new write, once the queue stopped accepting.
    pub(crate) fn check_open(&self) -> Result<()> {
        match &self.rejecting {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Whether a new write may be enqueued under a `max_bytes` limit.
    pub(crate) fn has_room(&self, max_bytes: usize) -> bool {
        self.buffered_bytes <= max_bytes || self.is_empty()
    }

    /// Accept a write. Returns its sequence number when the counter is
    /// already seeded.
    pub(crate) fn push(&mut self, write: PendingWrite) -> Result<Option<i64>> {
        self.check_open()?;
        self.buffered_bytes += write.data.len();
        match self.last_seq_no {
            Some(last) => {
                let seq_no = last + 1;
                self.last_seq_no = Some(seq_no);
                self.in_flight.push_back(InFlightWrite {
                    seq_no,
                    write,
                    sent_on: None,
                });
                Ok(Some(seq_no))
            }
            None => {
                self.unsequenced.push_back(write);
                Ok(None)
            }
        }
    }

    /// Apply an init response's last sequence number. Returns the seeded
    /// counter value.
    pub(crate) fn seed(&mut self, server_last_seq_no: i64) -> i64 {
        let mut counter = match self.last_seq_no {
            Some(local) => local.max(server_last_seq_no),
            None => server_last_seq_no,
        };
        while let Some(write) = self.unsequenced.pop_front() {
            counter += 1;
            self.in_flight.push_back(InFlightWrite {
                seq_no: counter,
                write,
                sent_on: None,
            });
        }
        self.last_seq_no = Some(counter);
        for entry in &mut self.in_flight {
            entry.sent_on = None;
        }
        counter
    }

    /// Build the write requests for every entry not yet sent on
    /// `generation`, in sequence order, at most `max_batch_bytes` of payload
    /// per request (a single larger entry gets a request of its own).
    pub(crate) fn take_unsent(
        &mut self,
        generation: u64,
        max_batch_bytes: usize,
    ) -> Vec<Vec<MessageData>> {
        let mut batches = Vec::new();
        let mut current: Vec<MessageData> = Vec::new();
        let mut current_bytes = 0;

        for entry in self
            .in_flight
            .iter_mut()
            .filter(|entry| entry.sent_on != Some(generation))
        {
            let size = entry.write.data.len();
            if !current.is_empty() && current_bytes + size > max_batch_bytes {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current.push(MessageData {
                seq_no: entry.seq_no,
                created_at: Some(entry.write.created_at.into()),
                data: entry.write.data.clone(),
                uncompressed_size: entry.write.uncompressed_size,
            });
            current_bytes += size;
            entry.sent_on = Some(generation);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Complete the entry matching `ack`. Returns `false` for a sequence
    /// number that is not in flight.
    pub(crate) fn acknowledge(&mut self, ack: &WriteAck, partition_id: i64) -> bool {
        let Ok(index) = self
            .in_flight
            .binary_search_by_key(&ack.seq_no, |entry| entry.seq_no)
        else {
            return false;
        };
        let Some(entry) = self.in_flight.remove(index) else {
            return false;
        };
        self.buffered_bytes = self.buffered_bytes.saturating_sub(entry.write.data.len());

        let result = match &ack.message_write_status {
            Some(MessageWriteStatus::Written(written)) => Ok(WriteResult {
                seq_no: entry.seq_no,
                partition_id,
                status: WriteStatus::Written {
                    offset: written.offset,
                },
            }),
            Some(MessageWriteStatus::Skipped(_)) => Ok(WriteResult {
                seq_no: entry.seq_no,
                partition_id,
                status: WriteStatus::AlreadyWritten,
            }),
            None => Err(ClientError::Internal(format!(
                "acknowledgement for seq_no {} carries no write status",
                entry.seq_no
            ))),
        };
        // The caller may have stopped waiting.
        let _ = entry.write.completion.send(result);
        true
    }

    /// Refuse new writes with `error`. Queued entries are kept.
    pub(crate) fn reject_new(&mut self, error: ClientError) {
        if self.rejecting.is_none() {
            self.rejecting = Some(error);
        }
    }

    /// Refuse new writes and fail every queued entry with `error`.
    pub(crate) fn fail_all(&mut self, error: ClientError) {
        self.reject_new(error.clone());
        for write in self.unsequenced.drain(..) {
            let _ = write.completion.send(Err(error.clone()));
        }
        for entry in self.in_flight.drain(..) {
            let _ = entry.write.completion.send(Err(error.clone()));
        }
        self.buffered_bytes = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.unsequenced.is_empty() && self.in_flight.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.unsequenced.len() + self.in_flight.len()
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub(crate) fn last_seq_no(&self) -> Option<i64> {
        self.last_seq_no
    }
}
