use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use topicstream_proto::stream_write_message::{
    from_client::ClientMessage, from_server::ServerMessage, FromServer, InitRequest,
    InitResponse, WriteRequest,
};
use topicstream_proto::{format_issues, StatusCode};
use tracing::{debug, error, info, warn};

use super::{WriterConfig, WriterShared};
use crate::codec::Codec;
use crate::credentials::TokenProvider;
use crate::error::{ClientError, TransportError};
use crate::lifecycle::EngineState;
use crate::retry::{is_retryable_status, Backoff};
use crate::session::{SessionEvent, StreamSession};
use crate::transport::{Connector, WriteProtocol};

/// Why a session ended.
enum Outcome {
    /// Transport fault or retryable status: reconnect.
    Fault(ClientError),
    /// Terminal for the engine.
    Fatal(ClientError),
    /// Disposal finished draining the queue.
    Drained,
    /// The handle was dropped.
    Shutdown,
}

/// Background task driving one Writer.
pub(super) struct WriterEngine {
    shared: Arc<WriterShared>,
    connector: Arc<dyn Connector<WriteProtocol>>,
    credentials: Arc<dyn TokenProvider>,
    config: WriterConfig,
    producer_id: String,
    shutdown: CancellationToken,
    generation: u64,
}

impl WriterEngine {
    pub(super) fn new(
        shared: Arc<WriterShared>,
        connector: Arc<dyn Connector<WriteProtocol>>,
        credentials: Arc<dyn TokenProvider>,
        config: WriterConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let producer_id = config.producer_id.clone().unwrap_or_default();
        Self {
            shared,
            connector,
            credentials,
            config,
            producer_id,
            shutdown,
            generation: 0,
        }
    }

    pub(super) async fn run(mut self) {
        if !self.config.codec.is_supported_locally() {
            let err = ClientError::UnsupportedCodec {
                codec: self.config.codec,
                supported: Codec::local(),
            };
            error!(
                topic = %self.config.topic,
                producer_id = %self.producer_id,
                codec = %self.config.codec,
                "Codec is not supported by this client, writer failed"
            );
            self.fail(err);
            self.shared.lifecycle.finish();
            return;
        }

        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            if self.shutdown.is_cancelled() || self.drained() {
                break;
            }

            let delay = backoff.next_delay();
            if !delay.is_zero() {
                debug!(
                    topic = %self.config.topic,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                let changed = self.shared.lifecycle.changed().notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => break,
                    _ = &mut changed => {}
                }
                if self.drained() {
                    break;
                }
            }

            self.generation += 1;
            let outcome = match self.connect().await {
                Ok(mut session) => {
                    backoff.reset();
                    self.shared.lifecycle.set(EngineState::Active);
                    let outcome = self.serve(&mut session).await;
                    if matches!(outcome, Outcome::Drained) {
                        session.shutdown(self.config.shutdown_drain_timeout).await;
                    }
                    outcome
                }
                Err(outcome) => outcome,
            };

            match outcome {
                Outcome::Fault(e) => {
                    warn!(
                        topic = %self.config.topic,
                        producer_id = %self.producer_id,
                        generation = self.generation,
                        error = %e,
                        "Writer stream failed, reconnecting"
                    );
                    self.shared.lifecycle.set(EngineState::Reconnecting);
                }
                Outcome::Fatal(e) => {
                    error!(
                        topic = %self.config.topic,
                        producer_id = %self.producer_id,
                        error = %e,
                        "Writer failed"
                    );
                    self.fail(e);
                    break;
                }
                Outcome::Drained => {
                    info!(
                        topic = %self.config.topic,
                        producer_id = %self.producer_id,
                        "Writer disposed"
                    );
                    break;
                }
                Outcome::Shutdown => {
                    debug!(topic = %self.config.topic, "Writer engine shut down");
                    break;
                }
            }
        }

        self.shared.queue().fail_all(ClientError::Disposed);
        self.shared.space.notify_waiters();
        self.shared.lifecycle.finish();
    }

    /// Open a stream and complete the init handshake.
    async fn connect(&mut self) -> Result<StreamSession<WriteProtocol>, Outcome> {
        let mut session = StreamSession::open(
            self.connector.as_ref(),
            self.credentials.clone(),
            self.generation,
        )
        .await
        .map_err(|e| Outcome::Fault(e.into()))?;

        session
            .writer()
            .write(self.init_request())
            .await
            .map_err(|e| Outcome::Fault(e.into()))?;

        let init = loop {
            let event = tokio::select! {
                event = session.next_event() => event,
                _ = self.shutdown.cancelled() => return Err(Outcome::Shutdown),
                _ = self.shared.wake.notified() => {
                    if self.drained() {
                        return Err(Outcome::Drained);
                    }
                    continue;
                }
            };
            match event {
                SessionEvent::Message(message) => {
                    check_status(&message)?;
                    match message.server_message {
                        Some(ServerMessage::InitResponse(init)) => break init,
                        Some(ServerMessage::UpdateTokenResponse(_)) => continue,
                        other => {
                            return Err(Outcome::Fault(ClientError::Internal(format!(
                                "unexpected message before init response: {:?}",
                                other
                            ))))
                        }
                    }
                }
                SessionEvent::Finished => return Err(Outcome::Fault(TransportError::Closed.into())),
                SessionEvent::Fault(e) => return Err(Outcome::Fault(e.into())),
            }
        };

        self.check_codec(&init)?;
        let last_seq_no = self.shared.queue().seed(init.last_seq_no);
        session.writer().mark_active();
        info!(
            topic = %self.config.topic,
            producer_id = %self.producer_id,
            generation = self.generation,
            session_id = %init.session_id,
            partition_id = init.partition_id,
            server_last_seq_no = init.last_seq_no,
            last_seq_no,
            "Writer session initialized"
        );
        Ok(session)
    }

    async fn serve(&mut self, session: &mut StreamSession<WriteProtocol>) -> Outcome {
        loop {
            if self.drained() {
                return Outcome::Drained;
            }
            if let Err(e) = self.flush(session).await {
                return Outcome::Fault(e.into());
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Outcome::Shutdown,
                event = session.next_event() => match event {
                    SessionEvent::Message(message) => {
                        if let Err(outcome) = self.handle(message) {
                            return outcome;
                        }
                    }
                    SessionEvent::Finished => return Outcome::Fault(TransportError::Closed.into()),
                    SessionEvent::Fault(e) => return Outcome::Fault(e.into()),
                },
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    /// Send every entry not yet sent on this session.
    async fn flush(&self, session: &StreamSession<WriteProtocol>) -> Result<(), TransportError> {
        let batches = self
            .shared
            .queue()
            .take_unsent(session.generation(), self.config.max_batch_bytes);
        for messages in batches {
            let first = messages.first().map(|m| m.seq_no).unwrap_or_default();
            let count = messages.len();
            let request = WriteRequest {
                messages,
                codec: self.config.codec.to_wire(),
            };
            session
                .writer()
                .write(ClientMessage::WriteRequest(request).into())
                .await?;
            debug!(
                topic = %self.config.topic,
                generation = session.generation(),
                seq_no = first,
                count,
                "Sent write request"
            );
        }
        Ok(())
    }

    fn handle(&self, message: FromServer) -> Result<(), Outcome> {
        check_status(&message)?;
        match message.server_message {
            Some(ServerMessage::WriteResponse(response)) => {
                let mut queue = self.shared.queue();
                for ack in &response.acks {
                    if !queue.acknowledge(ack, response.partition_id) {
                        debug!(
                            topic = %self.config.topic,
                            seq_no = ack.seq_no,
                            "Ignoring acknowledgement for unknown sequence number"
                        );
                    }
                }
                drop(queue);
                self.shared.space.notify_waiters();
            }
            Some(ServerMessage::UpdateTokenResponse(_)) => {
                debug!(topic = %self.config.topic, "Token update acknowledged");
            }
            Some(ServerMessage::InitResponse(_)) => {
                warn!(topic = %self.config.topic, "Ignoring init response on an initialized stream");
            }
            None => {}
        }
        Ok(())
    }

    fn check_codec(&self, init: &InitResponse) -> Result<(), Outcome> {
        let supported: Vec<Codec> = init
            .supported_codecs
            .as_ref()
            .map(|codecs| codecs.codecs.iter().map(|&id| Codec::from_wire(id)).collect())
            .unwrap_or_default();
        if supported.is_empty() || supported.contains(&self.config.codec) {
            return Ok(());
        }
        Err(Outcome::Fatal(ClientError::UnsupportedCodec {
            codec: self.config.codec,
            supported,
        }))
    }

    fn init_request(&self) -> topicstream_proto::stream_write_message::FromClient {
        ClientMessage::InitRequest(InitRequest {
            path: self.config.topic.clone(),
            producer_id: self.producer_id.clone(),
            message_group_id: self
                .config
                .message_group_id
                .clone()
                .unwrap_or_else(|| self.producer_id.clone()),
            partition_id: self.config.partition_id,
            get_last_seq_no: true,
        })
        .into()
    }

    fn drained(&self) -> bool {
        self.shared.lifecycle.is_disposing() && self.shared.queue().is_empty()
    }

    fn fail(&self, error: ClientError) {
        self.shared.queue().fail_all(error.clone());
        self.shared.lifecycle.fail(error);
        self.shared.space.notify_waiters();
    }
}

fn check_status(message: &FromServer) -> Result<(), Outcome> {
    let status = message.status_code();
    if status == StatusCode::Success {
        return Ok(());
    }
    let error = ClientError::Status {
        status,
        issues: format_issues(&message.issues),
    };
    if is_retryable_status(status) {
        Err(Outcome::Fault(error))
    } else {
        Err(Outcome::Fatal(error))
    }
}
