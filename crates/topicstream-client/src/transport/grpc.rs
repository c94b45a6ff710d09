//! gRPC connector over a tonic [`Channel`].
//!
//! Outbound requests are fed through an mpsc channel wrapped in a
//! [`ReceiverStream`]; dropping the sender half-closes the call. The call
//! itself is driven lazily: the response headers are awaited on the first
//! `next()` of the inbound half, so requests sent before that are buffered.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use topicstream_proto::topic_service_client::TopicServiceClient;
use tracing::debug;

use super::{Connector, RawStream, ReadProtocol, StreamSink, StreamSource, WriteProtocol};
use crate::error::TransportError;

const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Opens `StreamRead` and `StreamWrite` calls on a shared channel.
///
/// One value implements both `Connector<ReadProtocol>` and
/// `Connector<WriteProtocol>`, so it can be cloned into any number of
/// engines.
///
/// # Example
///
/// ```ignore
/// let connector = GrpcConnector::connect("http://localhost:2135")
///     .await?
///     .with_database("/local");
/// ```
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    channel: Channel,
    database: Option<String>,
    outbound_capacity: usize,
}

impl GrpcConnector {
    /// Connect eagerly to `endpoint`.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let endpoint = Self::endpoint(endpoint.into())?;
        let channel = endpoint.connect().await?;
        Ok(Self::from_channel(channel))
    }

    /// Build a connector whose channel connects on first use.
    pub fn connect_lazy(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let endpoint = Self::endpoint(endpoint.into())?;
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            database: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Send `x-database` with every call.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Number of outbound requests buffered before `send` waits.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    fn endpoint(uri: String) -> Result<Endpoint, TransportError> {
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {}", e)))?;
        Ok(endpoint
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Some(Duration::from_secs(30))))
    }

    fn request<Req>(
        &self,
        auth_token: Option<String>,
    ) -> Result<(mpsc::Sender<Req>, tonic::Request<ReceiverStream<Req>>), TransportError> {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));

        if let Some(token) = auth_token {
            let value: MetadataValue<Ascii> = format!("Bearer {}", token)
                .parse()
                .map_err(|_| TransportError::Connect("token is not valid ASCII".to_string()))?;
            request.metadata_mut().insert("authorization", value);
        }
        if let Some(database) = &self.database {
            let value: MetadataValue<Ascii> = database
                .parse()
                .map_err(|_| TransportError::Connect("database is not valid ASCII".to_string()))?;
            request.metadata_mut().insert("x-database", value);
        }

        Ok((tx, request))
    }
}

#[async_trait]
impl Connector<ReadProtocol> for GrpcConnector {
    async fn open(
        &self,
        auth_token: Option<String>,
    ) -> Result<RawStream<ReadProtocol>, TransportError> {
        let (tx, request) = self.request(auth_token)?;
        let mut client = TopicServiceClient::new(self.channel.clone());
        debug!("Opening StreamRead call");

        let call: PendingCall<_> = Box::pin(async move { client.stream_read(request).await });
        Ok(RawStream {
            sink: Box::new(ChannelSink { tx: Some(tx) }),
            source: Box::new(ResponseSource::Pending(call)),
        })
    }
}

#[async_trait]
impl Connector<WriteProtocol> for GrpcConnector {
    async fn open(
        &self,
        auth_token: Option<String>,
    ) -> Result<RawStream<WriteProtocol>, TransportError> {
        let (tx, request) = self.request(auth_token)?;
        let mut client = TopicServiceClient::new(self.channel.clone());
        debug!("Opening StreamWrite call");

        let call: PendingCall<_> = Box::pin(async move { client.stream_write(request).await });
        Ok(RawStream {
            sink: Box::new(ChannelSink { tx: Some(tx) }),
            source: Box::new(ResponseSource::Pending(call)),
        })
    }
}

type PendingCall<Resp> =
    BoxFuture<'static, Result<tonic::Response<Streaming<Resp>>, tonic::Status>>;

struct ChannelSink<Req> {
    tx: Option<mpsc::Sender<Req>>,
}

#[async_trait]
impl<Req: Send + 'static> StreamSink<Req> for ChannelSink<Req> {
    async fn send(&mut self, request: Req) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(request).await.map_err(|_| TransportError::Closed)
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

enum ResponseSource<Resp> {
    Pending(PendingCall<Resp>),
    Open(Streaming<Resp>),
    Done,
}

#[async_trait]
impl<Resp: Send + 'static> StreamSource<Resp> for ResponseSource<Resp> {
    async fn next(&mut self) -> Result<Option<Resp>, TransportError> {
        loop {
            match self {
                ResponseSource::Pending(call) => match call.await {
                    Ok(response) => *self = ResponseSource::Open(response.into_inner()),
                    Err(status) => {
                        *self = ResponseSource::Done;
                        return Err(status.into());
                    }
                },
                ResponseSource::Open(stream) => {
                    let next = stream.message().await;
                    if !matches!(next, Ok(Some(_))) {
                        *self = ResponseSource::Done;
                    }
                    return next.map_err(Into::into);
                }
                ResponseSource::Done => return Ok(None),
            }
        }
    }
}
