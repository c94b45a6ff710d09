//! Topicstream Client - Reader and Writer streaming engines
//!
//! This crate implements the client side of the topic service's two
//! bidirectional streams: `StreamWrite` for producing and `StreamRead` for
//! consuming. Each [`Writer`] and [`Reader`] runs one background engine task
//! that owns the stream, reconnects with backoff, refreshes credentials and
//! resolves every caller-facing future exactly once.
//!
//! # Architecture
//!
//! ```text
//!   Writer<T> / Reader<T>        (typed handles, cheap to share by reference)
//!          │ oneshot / Notify
//!          ▼
//!   writer::engine / reader::engine   (one tokio task per handle)
//!          │
//!          ▼
//!   session::StreamSession       (one live stream, pull loop, token refresh)
//!          │
//!          ▼
//!   transport::Connector         (GrpcConnector, or memory::channel in tests)
//! ```
//!
//! # Examples
//!
//! ## Writer
//!
//! ```ignore
//! use topicstream_client::{GrpcConnector, Writer};
//! use tokio_util::sync::CancellationToken;
//!
//! let connector = GrpcConnector::connect("http://localhost:2135").await?;
//! let writer = Writer::<String>::builder()
//!     .connector(connector)
//!     .topic("/local/orders")
//!     .build()
//!     .await?;
//!
//! writer.write("hello".to_string(), &CancellationToken::new()).await?;
//! writer.dispose().await?;
//! ```
//!
//! ## Reader
//!
//! ```ignore
//! use topicstream_client::{GrpcConnector, Reader};
//! use tokio_util::sync::CancellationToken;
//!
//! let connector = GrpcConnector::connect("http://localhost:2135").await?;
//! let reader = Reader::<String>::builder()
//!     .connector(connector)
//!     .consumer("analytics")
//!     .topic("/local/orders")
//!     .build()
//!     .await?;
//!
//! let message = reader.read(&CancellationToken::new()).await?;
//! message.commit().await?;
//! reader.dispose().await?;
//! ```

pub mod codec;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod offsets;
pub mod reader;
pub mod retry;
pub mod serialization;
pub(crate) mod session;
pub mod transport;
pub mod writer;

pub use codec::Codec;
pub use credentials::{NoCredentials, RotatingToken, StaticToken, TokenProvider};
pub use error::{ClientError, Result, TransportError};
pub use lifecycle::EngineState;
pub use offsets::OffsetRange;
pub use reader::{
    Batch, Message, Reader, ReaderBuilder, ReaderConfig, TopicSelector, UndecodableMessage,
};
pub use retry::RetryPolicy;
pub use serialization::{
    BoxError, Builtin, Deserializer, Int32, Int64, Json, RawBytes, Serializer, Utf8,
};
pub use transport::grpc::GrpcConnector;
pub use transport::{Connector, ReadProtocol, StreamProtocol, WriteProtocol};
pub use writer::{WriteResult, WriteStatus, Writer, WriterBuilder, WriterConfig};
