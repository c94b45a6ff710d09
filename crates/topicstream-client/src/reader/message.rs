//! Consumer-facing message and batch handles.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use super::partition::PartitionSession;
use crate::codec::Codec;
use crate::error::{ClientError, Result};
use crate::offsets::OffsetRange;

/// A decoded message bound to the partition session that delivered it.
pub struct Message<T> {
    value: T,
    offset: i64,
    seq_no: i64,
    producer_id: Arc<str>,
    message_group_id: String,
    created_at: Option<SystemTime>,
    written_at: Option<SystemTime>,
    uncompressed_size: i64,
    commit_range: OffsetRange,
    partition: Arc<PartitionSession>,
}

impl<T> Message<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        value: T,
        offset: i64,
        seq_no: i64,
        producer_id: Arc<str>,
        message_group_id: String,
        created_at: Option<SystemTime>,
        written_at: Option<SystemTime>,
        uncompressed_size: i64,
        commit_range: OffsetRange,
        partition: Arc<PartitionSession>,
    ) -> Self {
        Self {
            value,
            offset,
            seq_no,
            producer_id,
            message_group_id,
            created_at,
            written_at,
            uncompressed_size,
            commit_range,
            partition,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn seq_no(&self) -> i64 {
        self.seq_no
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn message_group_id(&self) -> &str {
        &self.message_group_id
    }

    pub fn created_at(&self) -> Option<SystemTime> {
        self.created_at
    }

    pub fn written_at(&self) -> Option<SystemTime> {
        self.written_at
    }

    pub fn uncompressed_size(&self) -> i64 {
        self.uncompressed_size
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_id(&self) -> i64 {
        self.partition.partition_id()
    }

    pub fn partition_session_id(&self) -> i64 {
        self.partition.id()
    }

    /// Offsets this message's commit covers: from the end of the previous
    /// message of the partition session up to and including this one.
    pub fn commit_range(&self) -> OffsetRange {
        self.commit_range
    }

    /// Commit the message and wait until the server's committed offset
    /// passes it.
    ///
    /// # Errors
    ///
    /// - [`ClientError::SessionDeactivated`]: the reader reconnected; the
    ///   message will be delivered again
    /// - [`ClientError::PartitionClosed`]: the server stopped the partition
    ///   session
    /// - [`ClientError::CommitBelowWatermark`] / [`ClientError::CommitOverlap`]
    /// - [`ClientError::Disposed`]: disposal started before the call
    pub async fn commit(&self) -> Result<()> {
        commit(&self.partition, self.commit_range).await
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("value", &self.value)
            .field("offset", &self.offset)
            .field("seq_no", &self.seq_no)
            .field("producer_id", &self.producer_id)
            .field("topic", &self.topic())
            .field("partition_id", &self.partition_id())
            .finish()
    }
}

/// Messages of one partition session delivered together.
///
/// Messages that failed to decode stay part of the batch as
/// [`UndecodableMessage`]s and are covered by [`Batch::commit`].
pub struct Batch<T> {
    messages: Vec<Message<T>>,
    undecodable: Vec<UndecodableMessage>,
    commit_range: OffsetRange,
    partition: Arc<PartitionSession>,
}

impl<T> Batch<T> {
    /// `commit_range` spans every entry of the batch, decoded or not.
    pub(crate) fn new(
        messages: Vec<Message<T>>,
        undecodable: Vec<UndecodableMessage>,
        commit_range: OffsetRange,
        partition: Arc<PartitionSession>,
    ) -> Self {
        Self {
            messages,
            undecodable,
            commit_range,
            partition,
        }
    }

    /// Successfully decoded messages, in offset order.
    pub fn messages(&self) -> &[Message<T>] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message<T>> {
        self.messages
    }

    /// Messages of the batch that could not be decoded, in offset order.
    pub fn undecodable(&self) -> &[UndecodableMessage] {
        &self.undecodable
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// No message of the batch decoded. The batch may still hold
    /// undecodable messages that need a commit.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_id(&self) -> i64 {
        self.partition.partition_id()
    }

    pub fn commit_range(&self) -> OffsetRange {
        self.commit_range
    }

    /// Commit every message of the batch with a single range.
    pub async fn commit(&self) -> Result<()> {
        commit(&self.partition, self.commit_range).await
    }
}

impl<T: fmt::Debug> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("messages", &self.messages)
            .field("undecodable", &self.undecodable)
            .field("commit_range", &self.commit_range)
            .finish()
    }
}

/// A received message whose payload could not be decompressed or
/// deserialized.
///
/// It occupies its offsets like any other message: the partition's committed
/// offset only moves past it once it is committed.
#[derive(Clone)]
pub struct UndecodableMessage {
    offset: i64,
    seq_no: i64,
    producer_id: Arc<str>,
    codec: Codec,
    data: Bytes,
    reason: String,
    commit_range: OffsetRange,
    partition: Arc<PartitionSession>,
}

impl UndecodableMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        offset: i64,
        seq_no: i64,
        producer_id: Arc<str>,
        codec: Codec,
        data: Bytes,
        reason: String,
        commit_range: OffsetRange,
        partition: Arc<PartitionSession>,
    ) -> Self {
        Self {
            offset,
            seq_no,
            producer_id,
            codec,
            data,
            reason,
            commit_range,
            partition,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn seq_no(&self) -> i64 {
        self.seq_no
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Codec of the batch the message arrived in.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// The payload as received, still compressed.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_id(&self) -> i64 {
        self.partition.partition_id()
    }

    pub fn partition_session_id(&self) -> i64 {
        self.partition.id()
    }

    pub fn commit_range(&self) -> OffsetRange {
        self.commit_range
    }

    /// Commit the message without processing it. Same outcomes as
    /// [`Message::commit`].
    pub async fn commit(&self) -> Result<()> {
        commit(&self.partition, self.commit_range).await
    }
}

impl fmt::Debug for UndecodableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndecodableMessage")
            .field("offset", &self.offset)
            .field("codec", &self.codec)
            .field("reason", &self.reason)
            .field("topic", &self.topic())
            .field("partition_id", &self.partition_id())
            .finish()
    }
}

impl From<UndecodableMessage> for ClientError {
    fn from(message: UndecodableMessage) -> Self {
        ClientError::Deserialization {
            topic: message.topic().to_string(),
            partition_id: message.partition_id(),
            offset: message.offset,
            reason: message.reason.clone(),
            message: Arc::new(message),
        }
    }
}

async fn commit(partition: &PartitionSession, range: OffsetRange) -> Result<()> {
    let completion = partition.commit(range)?;
    // A dropped completion means the engine went away with the commit.
    completion
        .await
        .unwrap_or(Err(ClientError::SessionDeactivated))
}
