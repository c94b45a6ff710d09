//! Writer API for producing messages to a topic.
//!
//! A [`Writer`] owns one background engine task and at most one live
//! `StreamWrite` session. Every accepted message gets the next sequence
//! number of the producer and stays in the in-flight queue until the server
//! acknowledges it, across any number of reconnects.
//!
//! ## Architecture
//!
//! ```text
//! write(value, cancel)                         engine task
//!   │ serialize + compress                      │
//!   │ wait for buffer room                       │ open stream, InitRequest
//!   ▼                                            ▼
//! ┌─────────────────────┐  wake   ┌───────────────────────────┐
//! │ WriteQueue          │ ──────> │ seed counter from          │
//! │  unsequenced        │         │ InitResponse.last_seq_no   │
//! │  in_flight (seq)    │ <────── │ send WriteRequests         │
//! └─────────────────────┘  acks   │ match WriteAcks by seq_no  │
//!   │                             └───────────────────────────┘
//!   ▼
//! oneshot completion -> WriteResult
//! ```
//!
//! ## Delivery Guarantees
//!
//! - Each sequence number completes exactly once. After a reconnect every
//!   unacknowledged message is resent in sequence order; the server reports
//!   duplicates as [`WriteStatus::AlreadyWritten`].
//! - A caller's cancellation only stops that caller's wait. A message that
//!   made it into the queue is still sent.
//! - A fatal status (bad request, scheme error, unsupported codec, ...) fails
//!   every pending and future write with that error.
//!
//! ## Examples
//!
//! ```ignore
//! use topicstream_client::{Writer, Codec, StaticToken};
//! use tokio_util::sync::CancellationToken;
//!
//! let writer = Writer::<String>::builder()
//!     .connector(connector)
//!     .credentials(StaticToken::new("secret"))
//!     .topic("/local/orders")
//!     .producer_id("orders-api")
//!     .codec(Codec::Lz4)
//!     .build()
//!     .await?;
//!
//! let result = writer.write("created".to_string(), &CancellationToken::new()).await?;
//! println!("seq_no {} -> {:?}", result.seq_no, result.status);
//!
//! writer.dispose().await?;
//! ```

mod engine;
mod queue;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::credentials::{NoCredentials, TokenProvider};
use crate::error::{ClientError, Result};
use crate::lifecycle::{EngineState, Lifecycle};
use crate::retry::RetryPolicy;
use crate::serialization::{Builtin, Serializer};
use crate::transport::{Connector, WriteProtocol};

use engine::WriterEngine;
use queue::{PendingWrite, WriteQueue};

/// How the server acknowledged one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Freshly written at `offset`.
    Written { offset: i64 },
    /// The server already had this sequence number (a resend after reconnect).
    AlreadyWritten,
}

/// Completion of one [`Writer::write`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Sequence number assigned to the message.
    pub seq_no: i64,

    /// Partition the message was written to.
    pub partition_id: i64,

    pub status: WriteStatus,
}

impl WriteResult {
    /// Offset of a fresh write.
    pub fn offset(&self) -> Option<i64> {
        match self.status {
            WriteStatus::Written { offset } => Some(offset),
            WriteStatus::AlreadyWritten => None,
        }
    }
}

/// Writer settings.
///
/// All fields have defaults, so a config can be loaded from a partial
/// JSON or TOML document:
///
/// ```ignore
/// let config: WriterConfig = serde_json::from_str(r#"{
///     "topic": "/local/orders",
///     "codec": "lz4"
/// }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Topic path (required).
    pub topic: String,

    /// Producer id. A random hex id is generated when unset.
    pub producer_id: Option<String>,

    /// Message group id. Defaults to the producer id.
    pub message_group_id: Option<String>,

    /// Pin the producer to one partition.
    pub partition_id: Option<i64>,

    /// Payload codec.
    ///
    /// Default: raw
    pub codec: Codec,

    /// Upper bound of compressed payload bytes per WriteRequest.
    ///
    /// Default: 1 MiB
    pub max_batch_bytes: usize,

    /// A write waits while the unacknowledged payload bytes exceed this.
    ///
    /// Default: 64 MiB
    pub buffer_max_bytes: usize,

    /// Reconnect backoff.
    pub retry: RetryPolicy,

    /// How long a disposing writer waits for the server to end the stream
    /// after the half-close.
    ///
    /// Default: 5s
    pub shutdown_drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            producer_id: None,
            message_group_id: None,
            partition_id: None,
            codec: Codec::Raw,
            max_batch_bytes: 1024 * 1024,
            buffer_max_bytes: 64 * 1024 * 1024,
            retry: RetryPolicy::default(),
            shutdown_drain_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct WriterShared {
    pub(crate) lifecycle: Lifecycle,
    queue: Mutex<WriteQueue>,
    /// Wakes the engine: new entries or disposal.
    pub(crate) wake: Notify,
    /// Wakes writers waiting for buffer room.
    pub(crate) space: Notify,
}

impl WriterShared {
    pub(crate) fn queue(&self) -> MutexGuard<'_, WriteQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Typed producer handle.
///
/// Dropping the writer without [`dispose`](Writer::dispose) stops its engine;
/// writes still in flight then fail with [`ClientError::Disposed`].
pub struct Writer<T> {
    shared: Arc<WriterShared>,
    serializer: Arc<dyn Serializer<T>>,
    codec: Codec,
    buffer_max_bytes: usize,
    topic: String,
    producer_id: String,
    shutdown: CancellationToken,
}

impl<T: Builtin> Writer<T> {
    /// Builder using the built-in serializer of `T`.
    pub fn builder() -> WriterBuilder<T> {
        WriterBuilder::new(T::serializer())
    }
}

impl<T: Send + 'static> Writer<T> {
    /// Builder with a custom serializer.
    pub fn builder_with_serializer(serializer: impl Serializer<T>) -> WriterBuilder<T> {
        WriterBuilder::new(Arc::new(serializer))
    }

    /// Write one message and wait for its acknowledgement.
    ///
    /// Serialization and compression happen before the message is queued;
    /// a failure there fails only this call and consumes no sequence number.
    /// `cancel` aborts the wait for buffer room or for the acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Serialization`] / [`ClientError::Codec`]: local encoding failed
    /// - [`ClientError::Cancelled`]: `cancel` fired
    /// - [`ClientError::Disposed`]: disposal started before the call
    /// - the fatal error of a failed engine, e.g. [`ClientError::UnsupportedCodec`]
    pub async fn write(&self, value: T, cancel: &CancellationToken) -> Result<WriteResult> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.shared.lifecycle.check_accepting()?;

        let payload = self
            .serializer
            .serialize(&value)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        let uncompressed_size = payload.len() as i64;
        let data = self.codec.encode(&payload)?;

        let completion = self
            .enqueue(data, uncompressed_size, SystemTime::now(), cancel)
            .await?;

        tokio::select! {
            result = completion => result.unwrap_or(Err(ClientError::Disposed)),
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    async fn enqueue(
        &self,
        data: Bytes,
        uncompressed_size: i64,
        created_at: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<oneshot::Receiver<Result<WriteResult>>> {
        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut queue = self.shared.queue();
                queue.check_open()?;
                if queue.has_room(self.buffer_max_bytes) {
                    let (completion, rx) = oneshot::channel();
                    let seq_no = queue.push(PendingWrite {
                        created_at,
                        data,
                        uncompressed_size,
                        completion,
                    })?;
                    drop(queue);
                    debug!(topic = %self.topic, seq_no = ?seq_no, "Write queued");
                    self.shared.wake.notify_one();
                    return Ok(rx);
                }
            }

            debug!(topic = %self.topic, "Write buffer full, waiting for acknowledgements");
            tokio::select! {
                _ = &mut space => {}
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    /// Stop accepting writes, wait until every in-flight write resolved,
    /// then close the stream. Idempotent; concurrent callers all wait for
    /// the same completion.
    pub async fn dispose(&self) -> Result<()> {
        if self.shared.lifecycle.begin_dispose() {
            let pending = {
                let mut queue = self.shared.queue();
                queue.reject_new(ClientError::Disposed);
                queue.len()
            };
            info!(topic = %self.topic, producer_id = %self.producer_id, pending, "Disposing writer");
            self.shared.wake.notify_one();
        }
        self.shared.lifecycle.wait_finished().await;
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.state()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Last sequence number assigned, once the first init response arrived.
    pub fn last_seq_no(&self) -> Option<i64> {
        self.shared.queue().last_seq_no()
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builder for [`Writer`].
pub struct WriterBuilder<T> {
    config: WriterConfig,
    serializer: Arc<dyn Serializer<T>>,
    connector: Option<Arc<dyn Connector<WriteProtocol>>>,
    credentials: Arc<dyn TokenProvider>,
}

impl<T: Send + 'static> WriterBuilder<T> {
    fn new(serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            config: WriterConfig::default(),
            serializer,
            connector: None,
            credentials: Arc::new(NoCredentials),
        }
    }

    /// Replace all settings at once.
    pub fn config(mut self, config: WriterConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used to open `StreamWrite` calls (required).
    pub fn connector(mut self, connector: impl Connector<WriteProtocol>) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Shared transport, e.g. one `GrpcConnector` for many writers.
    pub fn shared_connector(mut self, connector: Arc<dyn Connector<WriteProtocol>>) -> Self {
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

    /// Topic path (required).
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn producer_id(mut self, producer_id: impl Into<String>) -> Self {
        self.config.producer_id = Some(producer_id.into());
        self
    }

    pub fn message_group_id(mut self, message_group_id: impl Into<String>) -> Self {
        self.config.message_group_id = Some(message_group_id.into());
        self
    }

    pub fn partition_id(mut self, partition_id: i64) -> Self {
        self.config.partition_id = Some(partition_id);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn serializer(mut self, serializer: impl Serializer<T>) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    pub fn buffer_max_bytes(mut self, bytes: usize) -> Self {
        self.config.buffer_max_bytes = bytes;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Build the Writer and start its engine.
    pub async fn build(self) -> Result<Writer<T>> {
        let connector = self
            .connector
            .ok_or_else(|| ClientError::ConfigError("connector is required".to_string()))?;
        let mut config = self.config;
        if config.topic.is_empty() {
            return Err(ClientError::ConfigError("topic is required".to_string()));
        }
        if config.max_batch_bytes == 0 {
            return Err(ClientError::ConfigError(
                "max_batch_bytes must be positive".to_string(),
            ));
        }
        let producer_id = config
            .producer_id
            .clone()
            .unwrap_or_else(generate_producer_id);
        config.producer_id = Some(producer_id.clone());
        if config.message_group_id.is_none() {
            config.message_group_id = Some(producer_id.clone());
        }

        let shared = Arc::new(WriterShared {
            lifecycle: Lifecycle::new(),
            queue: Mutex::new(WriteQueue::new()),
            wake: Notify::new(),
            space: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        info!(
            topic = %config.topic,
            producer_id = %producer_id,
            codec = %config.codec,
            "Starting writer"
        );

        let writer = Writer {
            shared: shared.clone(),
            serializer: self.serializer,
            codec: config.codec,
            buffer_max_bytes: config.buffer_max_bytes,
            topic: config.topic.clone(),
            producer_id,
            shutdown: shutdown.clone(),
        };

        let engine = WriterEngine::new(shared, connector, self.credentials, config, shutdown);
        tokio::spawn(engine.run());

        Ok(writer)
    }
}

fn generate_producer_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
