use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use topicstream_proto::stream_read_message::{
    commit_offset_request::PartitionCommitOffset, from_client::ClientMessage,
    from_server::ServerMessage, init_request::TopicReadSettings, CommitOffsetRequest,
    CommitOffsetResponse, FromClient, FromServer, InitRequest, ReadRequest, ReadResponse,
    StartPartitionSessionRequest, StartPartitionSessionResponse, StopPartitionSessionRequest,
    StopPartitionSessionResponse,
};
use topicstream_proto::{format_issues, StatusCode};
use tracing::{debug, error, info, warn};

use super::flow::{apportion, BatchInfo, BufferedBatch, BufferedMessage};
use super::partition::{CloseReason, PartitionSession};
use super::{ReaderConfig, ReaderShared};
use crate::codec::Codec;
use crate::credentials::TokenProvider;
use crate::error::{ClientError, TransportError};
use crate::lifecycle::EngineState;
use crate::retry::{is_retryable_status, Backoff};
use crate::session::{SessionEvent, StreamSession};
use crate::transport::{Connector, ReadProtocol};

type Session = StreamSession<ReadProtocol>;

/// Why a session ended.
enum Outcome {
    /// Transport fault or retryable status: reconnect.
    Fault(ClientError),
    /// Terminal for the engine.
    Fatal(ClientError),
    /// Disposal finished waiting for commits.
    Drained,
    /// The handle was dropped.
    Shutdown,
}

impl From<TransportError> for Outcome {
    fn from(error: TransportError) -> Self {
        Outcome::Fault(error.into())
    }
}

/// Background task driving one Reader.
pub(super) struct ReaderEngine {
    shared: Arc<ReaderShared>,
    connector: Arc<dyn Connector<ReadProtocol>>,
    credentials: Arc<dyn TokenProvider>,
    config: ReaderConfig,
    shutdown: CancellationToken,
    generation: u64,
    /// Partition sessions of the current connection. Only this task touches
    /// the table.
    partitions: HashMap<i64, Arc<PartitionSession>>,
}

impl ReaderEngine {
    pub(super) fn new(
        shared: Arc<ReaderShared>,
        connector: Arc<dyn Connector<ReadProtocol>>,
        credentials: Arc<dyn TokenProvider>,
        config: ReaderConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            connector,
            credentials,
            config,
            shutdown,
            generation: 0,
            partitions: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            // Without a live connection nothing can be in flight.
            if self.shutdown.is_cancelled() || self.shared.lifecycle.is_disposing() {
                break;
            }

            let delay = backoff.next_delay();
            if !delay.is_zero() {
                debug!(
                    consumer = %self.config.consumer,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                let changed = self.shared.lifecycle.changed().notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if self.shared.lifecycle.is_disposing() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => break,
                    _ = &mut changed => {
                        if self.shared.lifecycle.is_disposing() {
                            break;
                        }
                    }
                }
            }

            self.generation += 1;
            let outcome = match self.connect().await {
                Ok(mut session) => {
                    backoff.reset();
                    self.shared.lifecycle.set(EngineState::Active);
                    let outcome = self.serve(&mut session).await;
                    let reason = match outcome {
                        Outcome::Fault(_) | Outcome::Fatal(_) => CloseReason::Deactivated,
                        Outcome::Drained | Outcome::Shutdown => CloseReason::Disposed,
                    };
                    self.teardown(reason);
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
                        consumer = %self.config.consumer,
                        generation = self.generation,
                        error = %e,
                        "Reader stream failed, reconnecting"
                    );
                    self.shared.lifecycle.set(EngineState::Reconnecting);
                }
                Outcome::Fatal(e) => {
                    error!(
                        consumer = %self.config.consumer,
                        error = %e,
                        "Reader failed"
                    );
                    self.shared.lifecycle.fail(e);
                    break;
                }
                Outcome::Drained => {
                    info!(consumer = %self.config.consumer, "Reader drained");
                    break;
                }
                Outcome::Shutdown => {
                    debug!(consumer = %self.config.consumer, "Reader engine shut down");
                    break;
                }
            }
        }

        self.teardown(CloseReason::Disposed);
        self.shared.lifecycle.finish();
        self.shared.data_ready.notify_waiters();
    }

    /// Open a stream and complete the init handshake.
    async fn connect(&mut self) -> Result<Session, Outcome> {
        let mut session = StreamSession::open(
            self.connector.as_ref(),
            self.credentials.clone(),
            self.generation,
        )
        .await?;
        session.writer().write(self.init_request()).await?;

        let init = loop {
            let event = tokio::select! {
                event = session.next_event() => event,
                _ = self.shutdown.cancelled() => return Err(Outcome::Shutdown),
                _ = self.shared.wake.notified() => {
                    if self.shared.lifecycle.is_disposing() {
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
                SessionEvent::Finished => return Err(TransportError::Closed.into()),
                SessionEvent::Fault(e) => return Err(e.into()),
            }
        };

        session.writer().mark_active();
        self.shared.buffer().clear();
        info!(
            consumer = %self.config.consumer,
            generation = self.generation,
            session_id = %init.session_id,
            "Reader session initialized"
        );
        Ok(session)
    }

    async fn serve(&mut self, session: &mut Session) -> Outcome {
        loop {
            if self.shared.lifecycle.is_disposing() && !self.has_pending_commits() {
                return Outcome::Drained;
            }
            if let Err(outcome) = self.request_data(session).await {
                return outcome;
            }
            if let Err(outcome) = self.flush_commits(session).await {
                return outcome;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Outcome::Shutdown,
                event = session.next_event() => {
                    let handled = match event {
                        SessionEvent::Message(message) => self.handle(session, message).await,
                        SessionEvent::Finished => Err(TransportError::Closed.into()),
                        SessionEvent::Fault(e) => Err(e.into()),
                    };
                    if let Err(outcome) = handled {
                        return outcome;
                    }
                }
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    async fn handle(&mut self, session: &Session, message: FromServer) -> Result<(), Outcome> {
        check_status(&message)?;
        match message.server_message {
            Some(ServerMessage::ReadResponse(response)) => self.on_read_response(response),
            Some(ServerMessage::StartPartitionSessionRequest(request)) => {
                self.on_start_partition(session, request).await?
            }
            Some(ServerMessage::StopPartitionSessionRequest(request)) => {
                self.on_stop_partition(session, request).await?
            }
            Some(ServerMessage::CommitOffsetResponse(response)) => {
                self.on_commit_response(session, response).await?
            }
            Some(ServerMessage::UpdateTokenResponse(_)) => {
                debug!(consumer = %self.config.consumer, "Token update acknowledged");
            }
            Some(ServerMessage::InitResponse(_)) => {
                warn!(consumer = %self.config.consumer, "Ignoring init response on an initialized stream");
            }
            None => {}
        }
        Ok(())
    }

    /// Ask for as many bytes as the budget allows. Nothing is requested once
    /// disposal started.
    async fn request_data(&self, session: &Session) -> Result<(), Outcome> {
        if self.shared.lifecycle.is_disposing() {
            return Ok(());
        }
        let Some(bytes_size) = self.shared.buffer().flow.take_request() else {
            return Ok(());
        };
        session
            .writer()
            .write(ClientMessage::ReadRequest(ReadRequest { bytes_size }).into())
            .await?;
        debug!(
            consumer = %self.config.consumer,
            generation = session.generation(),
            bytes_size,
            "Sent read request"
        );
        Ok(())
    }

    /// Send every registered commit of every partition session as one
    /// request.
    async fn flush_commits(&self, session: &Session) -> Result<(), Outcome> {
        let mut commit_offsets: Vec<PartitionCommitOffset> = self
            .partitions
            .values()
            .filter_map(|partition| {
                let offsets = partition.take_unsent();
                (!offsets.is_empty()).then(|| PartitionCommitOffset {
                    partition_session_id: partition.id(),
                    offsets: offsets.into_iter().map(Into::into).collect(),
                })
            })
            .collect();
        if commit_offsets.is_empty() {
            return Ok(());
        }
        commit_offsets.sort_by_key(|c| c.partition_session_id);

        let partitions = commit_offsets.len();
        session
            .writer()
            .write(ClientMessage::CommitOffsetRequest(CommitOffsetRequest { commit_offsets }).into())
            .await?;
        debug!(
            consumer = %self.config.consumer,
            generation = session.generation(),
            partitions,
            "Sent commit request"
        );
        Ok(())
    }

    fn on_read_response(&mut self, response: ReadResponse) {
        let sizes: Vec<usize> = response
            .partition_data
            .iter()
            .flat_map(|data| data.batches.iter())
            .flat_map(|batch| batch.message_data.iter())
            .map(|message| message.data.len())
            .collect();
        let mut shares = apportion(response.bytes_size, &sizes).into_iter();

        let mut buffer = self.shared.buffer();
        buffer.flow.received(response.bytes_size);
        if sizes.is_empty() {
            buffer.flow.release(response.bytes_size);
        }

        let mut delivered = 0;
        for data in response.partition_data {
            let partition = self
                .partitions
                .get(&data.partition_session_id)
                .filter(|partition| partition.is_active())
                .cloned();

            for batch in data.batches {
                let batch_shares: Vec<i64> =
                    shares.by_ref().take(batch.message_data.len()).collect();
                let Some(partition) = &partition else {
                    let bytes: i64 = batch_shares.iter().sum();
                    buffer.flow.release(bytes);
                    warn!(
                        consumer = %self.config.consumer,
                        partition_session_id = data.partition_session_id,
                        messages = batch.message_data.len(),
                        bytes,
                        "Dropping data for unknown partition session"
                    );
                    continue;
                };

                let info = BatchInfo {
                    partition: partition.clone(),
                    producer_id: Arc::from(batch.producer_id.as_str()),
                    codec: Codec::from_wire(batch.codec),
                    written_at: batch.written_at.and_then(to_system_time),
                };
                let messages: VecDeque<BufferedMessage> = batch
                    .message_data
                    .into_iter()
                    .zip(batch_shares)
                    .map(|(message, bytes)| BufferedMessage {
                        commit_range: partition.next_commit_range(message.offset),
                        offset: message.offset,
                        seq_no: message.seq_no,
                        created_at: message.created_at.and_then(to_system_time),
                        message_group_id: message.message_group_id,
                        data: message.data,
                        uncompressed_size: message.uncompressed_size,
                        bytes,
                    })
                    .collect();
                delivered += messages.len();
                buffer.push(BufferedBatch { info, messages });
            }
        }
        let buffered = buffer.flow.buffered();
        drop(buffer);

        debug!(
            consumer = %self.config.consumer,
            bytes_size = response.bytes_size,
            messages = delivered,
            buffered,
            "Received data"
        );
        if delivered > 0 {
            self.shared.data_ready.notify_waiters();
        }
    }

    async fn on_start_partition(
        &mut self,
        session: &Session,
        request: StartPartitionSessionRequest,
    ) -> Result<(), Outcome> {
        let Some(info) = request.partition_session else {
            warn!(consumer = %self.config.consumer, "Start partition request without a partition session");
            return Ok(());
        };
        let id = info.partition_session_id;
        let partition = Arc::new(PartitionSession::new(
            id,
            info.path,
            info.partition_id,
            session.generation(),
            request.committed_offset,
            Arc::downgrade(&self.shared),
        ));
        info!(
            consumer = %self.config.consumer,
            partition_session_id = id,
            topic = %partition.topic(),
            partition_id = partition.partition_id(),
            committed_offset = request.committed_offset,
            "Partition session started"
        );
        if let Some(previous) = self.partitions.insert(id, partition) {
            warn!(partition_session_id = id, "Partition session id reused, closing the old one");
            previous.close(CloseReason::Deactivated);
        }

        session
            .writer()
            .write(
                ClientMessage::StartPartitionSessionResponse(StartPartitionSessionResponse {
                    partition_session_id: id,
                    read_offset: None,
                    commit_offset: None,
                })
                .into(),
            )
            .await?;
        Ok(())
    }

    async fn on_stop_partition(
        &mut self,
        session: &Session,
        request: StopPartitionSessionRequest,
    ) -> Result<(), Outcome> {
        let id = request.partition_session_id;
        let Some(partition) = self.partitions.get(&id).cloned() else {
            warn!(
                consumer = %self.config.consumer,
                partition_session_id = id,
                "Stop request for unknown partition session"
            );
            return Ok(());
        };

        partition.on_committed(request.committed_offset);
        let released = self.shared.buffer().discard_partition(id);

        if request.graceful {
            partition.begin_stop();
            info!(
                consumer = %self.config.consumer,
                partition_session_id = id,
                released,
                "Graceful partition stop requested"
            );
            self.flush_commits(session).await?;
            self.finish_stop(session, &partition).await?;
        } else {
            self.partitions.remove(&id);
            partition.close(CloseReason::StoppedByServer);
            info!(
                consumer = %self.config.consumer,
                partition_session_id = id,
                released,
                "Partition session stopped"
            );
        }
        Ok(())
    }

    async fn on_commit_response(
        &mut self,
        session: &Session,
        response: CommitOffsetResponse,
    ) -> Result<(), Outcome> {
        for committed in response.partitions_committed_offsets {
            let Some(partition) = self
                .partitions
                .get(&committed.partition_session_id)
                .cloned()
            else {
                debug!(
                    partition_session_id = committed.partition_session_id,
                    "Commit response for unknown partition session"
                );
                continue;
            };
            partition.on_committed(committed.committed_offset);
            debug!(
                partition_session_id = partition.id(),
                committed_offset = committed.committed_offset,
                "Offsets committed"
            );
            self.finish_stop(session, &partition).await?;
        }
        Ok(())
    }

    /// Acknowledge a graceful stop once its commits resolved.
    async fn finish_stop(
        &mut self,
        session: &Session,
        partition: &Arc<PartitionSession>,
    ) -> Result<(), Outcome> {
        if !partition.is_stopping() || !partition.is_drained() {
            return Ok(());
        }
        let id = partition.id();
        partition.close(CloseReason::StoppedByServer);
        self.partitions.remove(&id);
        session
            .writer()
            .write(
                ClientMessage::StopPartitionSessionResponse(StopPartitionSessionResponse {
                    partition_session_id: id,
                })
                .into(),
            )
            .await?;
        info!(
            consumer = %self.config.consumer,
            partition_session_id = id,
            committed_offset = partition.committed_offset(),
            "Partition session released"
        );
        Ok(())
    }

    fn has_pending_commits(&self) -> bool {
        self.partitions
            .values()
            .any(|partition| partition.has_pending_commits())
    }

    /// Close every partition session and drop all buffered data.
    fn teardown(&mut self, reason: CloseReason) {
        for (_, partition) in self.partitions.drain() {
            partition.close(reason);
        }
        self.shared.buffer().clear();
    }

    fn init_request(&self) -> FromClient {
        ClientMessage::InitRequest(InitRequest {
            topics_read_settings: self
                .config
                .topics
                .iter()
                .map(|topic| TopicReadSettings {
                    path: topic.path.clone(),
                    partition_ids: topic.partition_ids.clone(),
                    read_from: topic.read_from.map(Into::into),
                })
                .collect(),
            consumer: self.config.consumer.clone(),
            reader_name: self.config.reader_name.clone().unwrap_or_default(),
        })
        .into()
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

fn to_system_time(timestamp: prost_types::Timestamp) -> Option<SystemTime> {
    SystemTime::try_from(timestamp).ok()
}
