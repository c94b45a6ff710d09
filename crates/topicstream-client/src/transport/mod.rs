//! Bidirectional stream transport.
//!
//! The engines talk to the server through one [`Connector`] per engine. Each
//! `open()` produces a fresh streaming call split into an outbound
//! [`StreamSink`] and an inbound [`StreamSource`]:
//!
//! ```text
//! Writer/Reader engine
//!        │ open(auth_token)
//!        ▼
//! ┌──────────────┐   send / half_close   ┌──────────────┐
//! │  StreamSink  │ ────────────────────> │    server    │
//! └──────────────┘                       │              │
//! ┌──────────────┐   next (None = end)   │              │
//! │ StreamSource │ <──────────────────── │              │
//! └──────────────┘                       └──────────────┘
//! ```
//!
//! Two connectors ship with the crate: [`grpc::GrpcConnector`] over a tonic
//! channel and [`memory::MemoryConnector`] for in-process tests.

use async_trait::async_trait;
use std::fmt::Debug;
use topicstream_proto::{stream_read_message, stream_write_message, UpdateTokenRequest};

use crate::error::TransportError;

pub mod grpc;
pub mod memory;

/// Binds the request and response types of one streaming service.
pub trait StreamProtocol: Send + Sync + 'static {
    type Request: Debug + Send + 'static;
    type Response: Debug + Send + 'static;

    /// Short name used in logs.
    const NAME: &'static str;

    /// Build the in-band token update request of this protocol.
    fn update_token(token: String) -> Self::Request;
}

/// Reader control protocol (`StreamRead`).
#[derive(Debug, Clone, Copy)]
pub struct ReadProtocol;

impl StreamProtocol for ReadProtocol {
    type Request = stream_read_message::FromClient;
    type Response = stream_read_message::FromServer;

    const NAME: &'static str = "read";

    fn update_token(token: String) -> Self::Request {
        UpdateTokenRequest { token }.into()
    }
}

/// Writer control protocol (`StreamWrite`).
#[derive(Debug, Clone, Copy)]
pub struct WriteProtocol;

impl StreamProtocol for WriteProtocol {
    type Request = stream_write_message::FromClient;
    type Response = stream_write_message::FromServer;

    const NAME: &'static str = "write";

    fn update_token(token: String) -> Self::Request {
        UpdateTokenRequest { token }.into()
    }
}

/// Outbound half of a streaming call.
#[async_trait]
pub trait StreamSink<Req: Send + 'static>: Send {
    /// Send one request. Requests are delivered in call order.
    async fn send(&mut self, request: Req) -> Result<(), TransportError>;

    /// Signal that no further requests follow. Inbound messages keep flowing
    /// until the server ends the stream.
    async fn half_close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a streaming call.
#[async_trait]
pub trait StreamSource<Resp: Send + 'static>: Send {
    /// Advance to the next inbound message. `Ok(None)` is a clean end of
    /// stream.
    async fn next(&mut self) -> Result<Option<Resp>, TransportError>;
}

/// One opened streaming call.
pub struct RawStream<P: StreamProtocol> {
    pub sink: Box<dyn StreamSink<P::Request>>,
    pub source: Box<dyn StreamSource<P::Response>>,
}

/// Opens streaming calls of protocol `P`.
#[async_trait]
pub trait Connector<P: StreamProtocol>: Send + Sync + 'static {
    /// Open a new streaming call presenting `auth_token` when one is set.
    async fn open(&self, auth_token: Option<String>) -> Result<RawStream<P>, TransportError>;
}
