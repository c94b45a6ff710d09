//! In-process transport.
//!
//! [`channel`] returns a connected pair: the [`MemoryConnector`] handed to an
//! engine and the [`MemoryServer`] a test drives. Every `open()` creates one
//! [`ServerStream`] that the server side accepts, reads requests from and
//! answers on.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Connector, RawStream, StreamProtocol, StreamSink, StreamSource};
use crate::error::TransportError;

/// Create a connector and the server side it dials into.
pub fn channel<P: StreamProtocol>() -> (MemoryConnector<P>, MemoryServer<P>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let opened = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            accept_tx,
            opened: opened.clone(),
        },
        MemoryServer { accept_rx, opened },
    )
}

/// Engine side of an in-process transport.
pub struct MemoryConnector<P: StreamProtocol> {
    accept_tx: mpsc::UnboundedSender<ServerStream<P>>,
    opened: Arc<AtomicUsize>,
}

impl<P: StreamProtocol> Clone for MemoryConnector<P> {
    fn clone(&self) -> Self {
        Self {
            accept_tx: self.accept_tx.clone(),
            opened: self.opened.clone(),
        }
    }
}

#[async_trait]
impl<P: StreamProtocol> Connector<P> for MemoryConnector<P> {
    async fn open(&self, auth_token: Option<String>) -> Result<RawStream<P>, TransportError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let stream = ServerStream {
            auth_token,
            requests: request_rx,
            responses: Some(response_tx),
        };
        self.accept_tx
            .send(stream)
            .map_err(|_| TransportError::Connect("memory server is gone".to_string()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(RawStream {
            sink: Box::new(MemorySink {
                tx: Some(request_tx),
            }),
            source: Box::new(MemorySource { rx: response_rx }),
        })
    }
}

/// Test side of an in-process transport.
pub struct MemoryServer<P: StreamProtocol> {
    accept_rx: mpsc::UnboundedReceiver<ServerStream<P>>,
    opened: Arc<AtomicUsize>,
}

impl<P: StreamProtocol> MemoryServer<P> {
    /// Wait for the next stream an engine opens.
    pub async fn accept(&mut self) -> Option<ServerStream<P>> {
        self.accept_rx.recv().await
    }

    /// Like [`accept`](Self::accept) but gives up after `timeout`.
    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<ServerStream<P>> {
        tokio::time::timeout(timeout, self.accept_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take an already opened stream without waiting.
    pub fn try_accept(&mut self) -> Option<ServerStream<P>> {
        self.accept_rx.try_recv().ok()
    }

    /// Number of streams opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// Server view of one opened stream.
///
/// Dropping it ends the stream cleanly from the client's point of view.
pub struct ServerStream<P: StreamProtocol> {
    auth_token: Option<String>,
    requests: mpsc::UnboundedReceiver<P::Request>,
    responses: Option<mpsc::UnboundedSender<Result<P::Response, TransportError>>>,
}

impl<P: StreamProtocol> ServerStream<P> {
    /// Token presented when the stream was opened.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Next client request, or `None` once the client half-closed.
    pub async fn recv(&mut self) -> Option<P::Request> {
        self.requests.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<P::Request> {
        tokio::time::timeout(timeout, self.requests.recv())
            .await
            .ok()
            .flatten()
    }

    /// A request that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<P::Request> {
        self.requests.try_recv().ok()
    }

    /// Send a response. Returns `false` once the client is gone.
    pub fn send(&self, response: P::Response) -> bool {
        match &self.responses {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Break the stream with a transport error.
    pub fn fault(&mut self, error: TransportError) {
        if let Some(tx) = self.responses.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the stream cleanly.
    pub fn finish(&mut self) {
        self.responses.take();
    }
}

struct MemorySink<Req> {
    tx: Option<mpsc::UnboundedSender<Req>>,
}

#[async_trait]
impl<Req: Send + 'static> StreamSink<Req> for MemorySink<Req> {
    async fn send(&mut self, request: Req) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(request).map_err(|_| TransportError::Closed)
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

struct MemorySource<Resp> {
    rx: mpsc::UnboundedReceiver<Result<Resp, TransportError>>,
}

#[async_trait]
impl<Resp: Send + 'static> StreamSource<Resp> for MemorySource<Resp> {
    async fn next(&mut self) -> Result<Option<Resp>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}
