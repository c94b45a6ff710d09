//! Error types for topic client operations.
//!
//! This module defines all errors that can surface from the Reader and Writer
//! engines. Errors are categorized by source so callers can decide whether to
//! retry, rebuild the engine, or give up.
//!
//! ## Error Handling Strategy
//!
//! - **Transport faults**: `Transport` (handled internally by reconnecting;
//!   callers only see them when opening a stream fails during build)
//! - **Server status faults**: `Status` (retryable ones are handled by
//!   reconnecting, fatal ones are surfaced with the original status)
//! - **Local faults**: `Serialization`, `Deserialization`, `Codec`,
//!   `UnsupportedCodec` (isolated to the affected message, except for codec
//!   negotiation which is fatal for the whole writer)
//! - **Lifecycle faults**: `Disposed`, `SessionDeactivated`, `PartitionClosed`
//! - **Offset faults**: `CommitBelowWatermark`, `CommitOverlap`
//!
//! ## Examples
//!
//! ```ignore
//! use topicstream_client::ClientError;
//!
//! match message.commit().await {
//!     Ok(()) => {}
//!     Err(ClientError::SessionDeactivated) => {
//!         // reconnected in between: the message will be delivered again
//!     }
//!     Err(e) => eprintln!("commit failed: {}", e),
//! }
//! ```

use std::sync::Arc;
use thiserror::Error;
use topicstream_proto::StatusCode;

use crate::codec::Codec;
use crate::reader::UndecodableMessage;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure of the underlying bidirectional stream.
///
/// Every variant is transient from the engine's point of view: a transport
/// fault always triggers a reconnect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The gRPC call failed with a status.
    #[error("stream failed with {code:?}: {message}")]
    Status { code: tonic::Code, message: String },

    /// The stream could not be opened.
    #[error("failed to open stream: {0}")]
    Connect(String),

    /// The stream was already closed when it was used.
    #[error("stream is closed")]
    Closed,
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for TransportError {
    fn from(error: tonic::transport::Error) -> Self {
        TransportError::Connect(error.to_string())
    }
}

/// Error type for Reader and Writer operations.
///
/// `ClientError` is `Clone` so that a single fatal failure can be handed to
/// every pending and every future caller of an engine.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Invalid builder configuration.
    ///
    /// ## Causes
    /// - Required fields missing (topic path, consumer name)
    /// - Invalid parameter values (zero byte budget)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The stream failed and could not be used.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server answered with a non-success status.
    ///
    /// For an engine this is terminal when the status is fatal (scheme error,
    /// bad request, unauthorized, ...). The original status code and the
    /// issue text are carried as-is.
    #[error("Server returned {status}: {issues}")]
    Status { status: StatusCode, issues: String },

    /// The configured codec cannot be used.
    ///
    /// Raised for custom codecs, which this client does not implement, and
    /// when the server's init response does not list the codec among its
    /// supported codecs.
    /// Fatal for the writer.
    #[error("Codec {codec:?} is not supported (supported: {supported:?})")]
    UnsupportedCodec {
        codec: Codec,
        supported: Vec<Codec>,
    },

    /// Compressing or decompressing a payload failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The serializer rejected a value. Fails only the one write.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A received message could not be decoded into the caller's type.
    ///
    /// The message has already been accounted against the byte budget and
    /// is not redelivered on this connection. It still needs a commit before
    /// the partition's committed offset can move past it, see
    /// [`ClientError::undecodable`].
    #[error("Failed to decode message at offset {offset} of {topic}/{partition_id}: {reason}")]
    Deserialization {
        topic: String,
        partition_id: i64,
        offset: i64,
        reason: String,
        message: Arc<UndecodableMessage>,
    },

    /// The engine has been disposed (or is disposing) and accepts no new work.
    #[error("Engine is disposed")]
    Disposed,

    /// The connection that owned this partition session was replaced by a
    /// reconnect. The partition session identity is not valid anymore.
    #[error("Partition session deactivated by reconnect")]
    SessionDeactivated,

    /// The server stopped this partition session.
    #[error("Partition session {partition_session_id} closed by server")]
    PartitionClosed { partition_session_id: i64 },

    /// The commit range lies below the partition's committed watermark.
    #[error("Commit range [{start}, {end}) is below committed offset {committed}")]
    CommitBelowWatermark { start: i64, end: i64, committed: i64 },

    /// The commit range partially overlaps a commit that is still pending.
    #[error("Commit range [{start}, {end}) overlaps a pending commit")]
    CommitOverlap { start: i64, end: i64 },

    /// The caller's cancellation signal fired while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected internal state. Indicates a bug in the client.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// The message behind a [`ClientError::Deserialization`], which can still
    /// be committed.
    pub fn undecodable(&self) -> Option<&UndecodableMessage> {
        match self {
            ClientError::Deserialization { message, .. } => Some(message.as_ref()),
            _ => None,
        }
    }

    /// Whether the error describes a condition that a reconnect may clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => crate::retry::is_retryable_status(*status),
            _ => false,
        }
    }
}
