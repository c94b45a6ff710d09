//! Reader API for consuming messages from topics.
//!
//! A [`Reader`] owns one background engine task and at most one live
//! `StreamRead` session. The server hands out partition sessions; the engine
//! buffers the data they deliver within a byte budget and hands it to
//! [`Reader::read`] / [`Reader::read_batch`] in arrival order.
//!
//! ## Architecture
//!
//! ```text
//!                     engine task
//!  ┌───────────────────────────────────────────────┐
//!  │ InitRequest ─> InitResponse                   │
//!  │ ReadRequest(headroom) ─> ReadResponse ──┐     │
//!  │ StartPartitionSession / Stop ...        │     │
//!  │ CommitOffsetRequest ─> CommitOffsetResp │     │
//!  └───────────────┬─────────────────────────┼─────┘
//!                  │ partition table         │ buffered batches
//!                  ▼                         ▼
//!          PartitionSession  <─────  ReadBuffer (FIFO)
//!            commit()                    │
//!                  ▲                     ▼
//!                  └──── Message / Batch <── read() / read_batch()
//! ```
//!
//! ## Delivery Guarantees
//!
//! At-least-once. A reconnect deactivates every partition session: commits
//! waiting for the server fail with [`ClientError::SessionDeactivated`] and
//! the uncommitted messages are delivered again on the new connection.
//!
//! ## Examples
//!
//! ```ignore
//! use topicstream_client::Reader;
//! use tokio_util::sync::CancellationToken;
//!
//! let reader = Reader::<String>::builder()
//!     .connector(connector)
//!     .consumer("billing")
//!     .topic("/local/orders")
//!     .memory_usage_max_bytes(8 * 1024 * 1024)
//!     .build()
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! loop {
//!     let message = reader.read(&cancel).await?;
//!     process(message.value());
//!     message.commit().await?;
//! }
//! ```

mod engine;
mod flow;
mod message;
mod partition;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{NoCredentials, TokenProvider};
use crate::error::{ClientError, Result};
use crate::lifecycle::{EngineState, Lifecycle};
use crate::offsets::OffsetRange;
use crate::retry::RetryPolicy;
use crate::serialization::{Builtin, Deserializer};
use crate::transport::{Connector, ReadProtocol};

pub use message::{Batch, Message, UndecodableMessage};

use engine::ReaderEngine;
use flow::{BatchInfo, BufferedMessage, ReadBuffer};

/// One topic to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSelector {
    pub path: String,

    /// Read only these partitions. Empty means all.
    #[serde(default)]
    pub partition_ids: Vec<i64>,

    /// Skip messages written before this instant.
    #[serde(default)]
    pub read_from: Option<SystemTime>,
}

impl TopicSelector {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            partition_ids: Vec::new(),
            read_from: None,
        }
    }

    pub fn partition_ids(mut self, partition_ids: impl IntoIterator<Item = i64>) -> Self {
        self.partition_ids = partition_ids.into_iter().collect();
        self
    }

    pub fn read_from(mut self, read_from: SystemTime) -> Self {
        self.read_from = Some(read_from);
        self
    }
}

impl From<&str> for TopicSelector {
    fn from(path: &str) -> Self {
        TopicSelector::new(path)
    }
}

impl From<String> for TopicSelector {
    fn from(path: String) -> Self {
        TopicSelector::new(path)
    }
}

/// Reader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Consumer name (required).
    pub consumer: String,

    /// Name reported to the server for diagnostics.
    pub reader_name: Option<String>,

    /// Topics to read (at least one).
    pub topics: Vec<TopicSelector>,

    /// Byte budget: requested-but-not-received plus buffered-but-not-consumed.
    ///
    /// Default: 16 MiB
    pub memory_usage_max_bytes: i64,

    /// Reconnect backoff.
    pub retry: RetryPolicy,

    /// How long a disposing reader waits for the server to end the stream
    /// after the half-close.
    ///
    /// Default: 5s
    pub shutdown_drain_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            consumer: String::new(),
            reader_name: None,
            topics: Vec::new(),
            memory_usage_max_bytes: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
            shutdown_drain_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct ReaderShared {
    pub(crate) lifecycle: Lifecycle,
    buffer: Mutex<ReadBuffer>,
    /// Wakes readers: new data, failure or disposal.
    pub(crate) data_ready: Notify,
    /// Wakes the engine: data consumed, commits registered, disposal.
    pub(crate) wake: Notify,
}

impl ReaderShared {
    pub(crate) fn new(memory_usage_max_bytes: i64) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            buffer: Mutex::new(ReadBuffer::new(memory_usage_max_bytes)),
            data_ready: Notify::new(),
            wake: Notify::new(),
        }
    }

    pub(crate) fn buffer(&self) -> MutexGuard<'_, ReadBuffer> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Typed consumer handle.
pub struct Reader<T> {
    shared: Arc<ReaderShared>,
    deserializer: Arc<dyn Deserializer<T>>,
    consumer: String,
    shutdown: CancellationToken,
}

impl<T: Builtin> Reader<T> {
    /// Builder using the built-in deserializer of `T`.
    pub fn builder() -> ReaderBuilder<T> {
        ReaderBuilder::new(T::deserializer())
    }
}

impl<T: Send + 'static> Reader<T> {
    /// Builder with a custom deserializer.
    pub fn builder_with_deserializer(deserializer: impl Deserializer<T>) -> ReaderBuilder<T> {
        ReaderBuilder::new(Arc::new(deserializer))
    }

    /// Next message, waiting until one is available.
    ///
    /// The message's bytes are released from the budget when it is taken,
    /// also when decoding it fails with [`ClientError::Deserialization`].
    /// Such a message still has to be committed through
    /// [`ClientError::undecodable`] before later commits of its partition
    /// can resolve.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Message<T>> {
        let (info, message) = self.next(cancel, |buffer| buffer.pop_message()).await?;
        self.decode(&info, message).map_err(ClientError::from)
    }

    /// The remaining messages of the next server batch, waiting until one is
    /// available.
    ///
    /// Messages that fail to decode are returned in
    /// [`Batch::undecodable`]; the batch's commit covers them too.
    pub async fn read_batch(&self, cancel: &CancellationToken) -> Result<Batch<T>> {
        let batch = self.next(cancel, |buffer| buffer.pop_batch()).await?;
        let info = batch.info;
        let start = batch.messages.front().map(|m| m.commit_range.start);
        let end = batch.messages.back().map(|m| m.commit_range.end);
        let commit_range = match (start, end) {
            (Some(start), Some(end)) => OffsetRange::new(start, end),
            _ => return Err(ClientError::Internal("empty batch in read buffer".to_string())),
        };

        let mut messages = Vec::with_capacity(batch.messages.len());
        let mut undecodable = Vec::new();
        for message in batch.messages {
            match self.decode(&info, message) {
                Ok(message) => messages.push(message),
                Err(failed) => undecodable.push(failed),
            }
        }
        Ok(Batch::new(
            messages,
            undecodable,
            commit_range,
            info.partition,
        ))
    }

    async fn next<U>(
        &self,
        cancel: &CancellationToken,
        mut take: impl FnMut(&mut ReadBuffer) -> Option<U>,
    ) -> Result<U> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        loop {
            let ready = self.shared.data_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            self.shared.lifecycle.check_accepting()?;
            let taken = take(&mut self.shared.buffer());
            if let Some(item) = taken {
                self.shared.wake.notify_one();
                return Ok(item);
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    fn decode(
        &self,
        info: &BatchInfo,
        message: BufferedMessage,
    ) -> std::result::Result<Message<T>, UndecodableMessage> {
        let partition = &info.partition;
        let decoded = match info.codec.decode(&message.data, message.uncompressed_size) {
            Ok(payload) => self
                .deserializer
                .deserialize(&payload)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match decoded {
            Ok(value) => Ok(Message::new(
                value,
                message.offset,
                message.seq_no,
                info.producer_id.clone(),
                message.message_group_id,
                message.created_at,
                info.written_at,
                message.uncompressed_size,
                message.commit_range,
                partition.clone(),
            )),
            Err(reason) => {
                warn!(
                    topic = %partition.topic(),
                    partition_id = partition.partition_id(),
                    offset = message.offset,
                    codec = %info.codec,
                    reason = %reason,
                    "Failed to decode message"
                );
                Err(UndecodableMessage::new(
                    message.offset,
                    message.seq_no,
                    info.producer_id.clone(),
                    info.codec,
                    message.data,
                    reason,
                    message.commit_range,
                    partition.clone(),
                ))
            }
        }
    }

    /// Stop requesting data, wait until every commit in flight resolved,
    /// then close the stream. Idempotent.
    ///
    /// Reads and commits started after this call fail with
    /// [`ClientError::Disposed`].
    pub async fn dispose(&self) -> Result<()> {
        if self.shared.lifecycle.begin_dispose() {
            info!(consumer = %self.consumer, "Disposing reader");
            self.shared.data_ready.notify_waiters();
            self.shared.wake.notify_one();
        }
        self.shared.lifecycle.wait_finished().await;
        debug!(consumer = %self.consumer, "Reader disposed");
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.state()
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Bytes received and not yet consumed.
    pub fn buffered_bytes(&self) -> i64 {
        self.shared.buffer().flow.buffered()
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builder for [`Reader`].
pub struct ReaderBuilder<T> {
    config: ReaderConfig,
    deserializer: Arc<dyn Deserializer<T>>,
    connector: Option<Arc<dyn Connector<ReadProtocol>>>,
    credentials: Arc<dyn TokenProvider>,
}

impl<T: Send + 'static> ReaderBuilder<T> {
    fn new(deserializer: Arc<dyn Deserializer<T>>) -> Self {
        Self {
            config: ReaderConfig::default(),
            deserializer,
            connector: None,
            credentials: Arc::new(NoCredentials),
        }
    }

    /// Replace all settings at once.
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used to open `StreamRead` calls (required).
    pub fn connector(mut self, connector: impl Connector<ReadProtocol>) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn shared_connector(mut self, connector: Arc<dyn Connector<ReadProtocol>>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn credentials(mut self, credentials: impl TokenProvider) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn shared_credentials(mut self, credentials: Arc<dyn TokenProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Consumer name (required).
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.config.consumer = consumer.into();
        self
    }

    pub fn reader_name(mut self, name: impl Into<String>) -> Self {
        self.config.reader_name = Some(name.into());
        self
    }

    /// Add a topic subscription. Call once per topic.
    pub fn topic(mut self, topic: impl Into<TopicSelector>) -> Self {
        self.config.topics.push(topic.into());
        self
    }

    pub fn memory_usage_max_bytes(mut self, bytes: i64) -> Self {
        self.config.memory_usage_max_bytes = bytes;
        self
    }

    pub fn deserializer(mut self, deserializer: impl Deserializer<T>) -> Self {
        self.deserializer = Arc::new(deserializer);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Build the Reader and start its engine.
    pub async fn build(self) -> Result<Reader<T>> {
        let connector = self
            .connector
            .ok_or_else(|| ClientError::ConfigError("connector is required".to_string()))?;
        let config = self.config;
        if config.consumer.is_empty() {
            return Err(ClientError::ConfigError("consumer is required".to_string()));
        }
        if config.topics.is_empty() {
            return Err(ClientError::ConfigError(
                "at least one topic is required".to_string(),
            ));
        }
        if config.memory_usage_max_bytes <= 0 {
            return Err(ClientError::ConfigError(
                "memory_usage_max_bytes must be positive".to_string(),
            ));
        }

        let shared = Arc::new(ReaderShared::new(config.memory_usage_max_bytes));
        let shutdown = CancellationToken::new();

        info!(
            consumer = %config.consumer,
            topics = config.topics.len(),
            memory_usage_max_bytes = config.memory_usage_max_bytes,
            "Starting reader"
        );

        let reader = Reader {
            shared: shared.clone(),
            deserializer: self.deserializer,
            consumer: config.consumer.clone(),
            shutdown: shutdown.clone(),
        };

        let engine = ReaderEngine::new(shared, connector, self.credentials, config, shutdown);
        tokio::spawn(engine.run());

        Ok(reader)
    }
}
