//! One connection attempt of an engine.
//!
//! A [`StreamSession`] wraps an opened [`RawStream`]:
//!
//! - the outbound half sits behind a [`SessionWriter`], which serializes
//!   concurrent writes and sends an in-band token update whenever the
//!   provider's token changed since the last one presented;
//! - the inbound half is drained by a single pull loop task that forwards
//!   every message, the end of stream or the fault to the engine as
//!   [`SessionEvent`]s, in arrival order.
//!
//! Each session carries the generation number it was opened with. Partition
//! sessions and in-flight writes remember the generation they belong to so
//! that state from a replaced connection can be told apart.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::credentials::TokenProvider;
use crate::error::TransportError;
use crate::transport::{Connector, StreamProtocol, StreamSink};

const EVENT_BUFFER: usize = 128;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, init handshake not finished.
    Connecting,
    /// Init handshake finished.
    Active,
    /// Half-closed or broken. Writes fail.
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// What the pull loop observed on the inbound half.
#[derive(Debug)]
pub(crate) enum SessionEvent<Resp> {
    Message(Resp),
    /// The server ended the stream cleanly.
    Finished,
    Fault(TransportError),
}

struct Outbound<Req: Send + 'static> {
    sink: Box<dyn StreamSink<Req>>,
    last_token: Option<String>,
}

struct WriterInner<P: StreamProtocol> {
    generation: u64,
    state: AtomicU8,
    credentials: Arc<dyn TokenProvider>,
    outbound: Mutex<Outbound<P::Request>>,
}

/// Outbound half of a session. Clones write to the same stream.
pub(crate) struct SessionWriter<P: StreamProtocol> {
    inner: Arc<WriterInner<P>>,
}

impl<P: StreamProtocol> Clone for SessionWriter<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: StreamProtocol> SessionWriter<P> {
    /// Send one request, preceded by a token update when the token rotated.
    ///
    /// Any failure closes the session.
    pub(crate) async fn write(&self, request: P::Request) -> Result<(), TransportError> {
        let mut outbound = self.inner.outbound.lock().await;
        if self.state() == SessionState::Closed {
            return Err(TransportError::Closed);
        }

        let token = self.inner.credentials.token();
        if token.is_some() && token != outbound.last_token {
            if let Some(value) = token.clone() {
                if let Err(e) = outbound.sink.send(P::update_token(value)).await {
                    self.mark_closed();
                    return Err(e);
                }
                debug!(
                    protocol = P::NAME,
                    generation = self.inner.generation,
                    "Sent token update"
                );
            }
            outbound.last_token = token;
        }

        trace!(protocol = P::NAME, request = ?request, "Sending request");
        if let Err(e) = outbound.sink.send(request).await {
            self.mark_closed();
            return Err(e);
        }
        Ok(())
    }

    /// Half-close the outbound direction. Idempotent.
    pub(crate) async fn half_close(&self) -> Result<(), TransportError> {
        let mut outbound = self.inner.outbound.lock().await;
        if self.inner.state.swap(2, Ordering::SeqCst) == 2 {
            return Ok(());
        }
        outbound.sink.half_close().await
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_active(&self) {
        let _ = self
            .inner
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.state.store(2, Ordering::SeqCst);
    }
}

/// One opened stream with its pull loop.
pub(crate) struct StreamSession<P: StreamProtocol> {
    writer: SessionWriter<P>,
    events: mpsc::Receiver<SessionEvent<P::Response>>,
    pull_loop: JoinHandle<()>,
}

impl<P: StreamProtocol> StreamSession<P> {
    /// Open a stream through `connector`, presenting the current token.
    pub(crate) async fn open(
        connector: &dyn Connector<P>,
        credentials: Arc<dyn TokenProvider>,
        generation: u64,
    ) -> Result<Self, TransportError> {
        let token = credentials.token();
        let raw = connector.open(token.clone()).await?;
        let mut source = raw.source;

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let pull_loop = tokio::spawn(async move {
            loop {
                let event = match source.next().await {
                    Ok(Some(message)) => SessionEvent::Message(message),
                    Ok(None) => SessionEvent::Finished,
                    Err(e) => SessionEvent::Fault(e),
                };
                let terminal = !matches!(event, SessionEvent::Message(_));
                if events_tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
            trace!(protocol = P::NAME, generation, "Pull loop finished");
        });

        debug!(protocol = P::NAME, generation, "Stream opened");
        Ok(Self {
            writer: SessionWriter {
                inner: Arc::new(WriterInner {
                    generation,
                    state: AtomicU8::new(0),
                    credentials,
                    outbound: Mutex::new(Outbound {
                        sink: raw.sink,
                        last_token: token,
                    }),
                }),
            },
            events,
            pull_loop,
        })
    }

    pub(crate) fn writer(&self) -> &SessionWriter<P> {
        &self.writer
    }

    pub(crate) fn generation(&self) -> u64 {
        self.writer.generation()
    }

    /// Next inbound event. Once the pull loop is gone this keeps returning
    /// [`SessionEvent::Finished`].
    pub(crate) async fn next_event(&mut self) -> SessionEvent<P::Response> {
        match self.events.recv().await {
            Some(event) => event,
            None => SessionEvent::Finished,
        }
    }

    /// Half-close, then let the remaining inbound messages drain until the
    /// server ends the stream or `timeout` passes. Returns the number of
    /// messages drained.
    pub(crate) async fn shutdown(mut self, timeout: Duration) -> usize {
        let generation = self.generation();
        if let Err(e) = self.writer.half_close().await {
            debug!(protocol = P::NAME, generation, error = %e, "Half-close failed");
        }

        let mut drained = 0;
        let drain = async {
            while let SessionEvent::Message(_) = self.next_event().await {
                drained += 1;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            debug!(
                protocol = P::NAME,
                generation, "Drain timed out after half-close"
            );
        }
        drained
    }
}

impl<P: StreamProtocol> Drop for StreamSession<P> {
    fn drop(&mut self) {
        self.writer.mark_closed();
        self.pull_loop.abort();
    }
}
