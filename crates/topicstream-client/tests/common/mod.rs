//! Shared helpers for the engine integration tests.
//!
//! Every test drives the engines through `transport::memory`: the test plays
//! the server, reading client requests from a `ServerStream` and answering on
//! it.

#![allow(dead_code)]

use bytes::Bytes;
use std::time::Duration;
use topicstream_client::transport::memory::{MemoryServer, ServerStream};
use topicstream_client::{Codec, ReadProtocol, RetryPolicy, WriteProtocol};
use topicstream_proto::stream_read_message as read;
use topicstream_proto::stream_write_message as write;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Log to the test writer, `RUST_LOG=topicstream_client=debug` for details.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Fast reconnects without jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
        2.0,
        0.0,
    )
}

// ---------------------------------------------------------------------------
// StreamWrite
// ---------------------------------------------------------------------------

pub async fn accept_writer(
    server: &mut MemoryServer<WriteProtocol>,
) -> ServerStream<WriteProtocol> {
    server
        .accept_timeout(TIMEOUT)
        .await
        .expect("writer did not open a stream")
}

/// Next client message, panicking after [`TIMEOUT`].
pub async fn next_write_message(
    stream: &mut ServerStream<WriteProtocol>,
) -> write::from_client::ClientMessage {
    stream
        .recv_timeout(TIMEOUT)
        .await
        .and_then(|request| request.client_message)
        .expect("writer sent nothing")
}

/// Accept a stream, check its InitRequest and answer with `last_seq_no`.
pub async fn handshake_writer(
    server: &mut MemoryServer<WriteProtocol>,
    last_seq_no: i64,
) -> (ServerStream<WriteProtocol>, write::InitRequest) {
    let mut stream = accept_writer(server).await;
    let init = match next_write_message(&mut stream).await {
        write::from_client::ClientMessage::InitRequest(init) => init,
        other => panic!("expected init request, got {:?}", other),
    };
    stream.send(write_init_response(last_seq_no, &[]));
    (stream, init)
}

pub fn write_init_response(last_seq_no: i64, codecs: &[i32]) -> write::FromServer {
    write::FromServer::success(write::from_server::ServerMessage::InitResponse(
        write::InitResponse {
            last_seq_no,
            session_id: "write-session".to_string(),
            partition_id: 0,
            supported_codecs: (!codecs.is_empty()).then(|| write::SupportedCodecs {
                codecs: codecs.to_vec(),
            }),
        },
    ))
}

/// Collect WriteRequests until `count` messages arrived. UpdateToken
/// requests are skipped.
pub async fn recv_messages(
    stream: &mut ServerStream<WriteProtocol>,
    count: usize,
) -> Vec<write::write_request::MessageData> {
    let mut messages = Vec::new();
    while messages.len() < count {
        match next_write_message(stream).await {
            write::from_client::ClientMessage::WriteRequest(request) => {
                messages.extend(request.messages)
            }
            write::from_client::ClientMessage::UpdateTokenRequest(_) => {}
            other => panic!("expected write request, got {:?}", other),
        }
    }
    messages
}

pub fn write_response(acks: Vec<write::write_response::WriteAck>) -> write::FromServer {
    write::FromServer::success(write::from_server::ServerMessage::WriteResponse(
        write::WriteResponse {
            acks,
            partition_id: 0,
        },
    ))
}

pub fn written(seq_no: i64, offset: i64) -> write::write_response::WriteAck {
    write::write_response::WriteAck::written(seq_no, offset)
}

// ---------------------------------------------------------------------------
// StreamRead
// ---------------------------------------------------------------------------

pub async fn accept_reader(server: &mut MemoryServer<ReadProtocol>) -> ServerStream<ReadProtocol> {
    server
        .accept_timeout(TIMEOUT)
        .await
        .expect("reader did not open a stream")
}

pub async fn next_read_message(
    stream: &mut ServerStream<ReadProtocol>,
) -> read::from_client::ClientMessage {
    stream
        .recv_timeout(TIMEOUT)
        .await
        .and_then(|request| request.client_message)
        .expect("reader sent nothing")
}

/// Accept a stream, answer its InitRequest and return the size of the first
/// ReadRequest.
pub async fn handshake_reader(
    server: &mut MemoryServer<ReadProtocol>,
) -> (ServerStream<ReadProtocol>, read::InitRequest, i64) {
    let mut stream = accept_reader(server).await;
    let init = match next_read_message(&mut stream).await {
        read::from_client::ClientMessage::InitRequest(init) => init,
        other => panic!("expected init request, got {:?}", other),
    };
    stream.send(read::FromServer::success(
        read::from_server::ServerMessage::InitResponse(read::InitResponse {
            session_id: "read-session".to_string(),
        }),
    ));
    let bytes_size = expect_read_request(&mut stream).await;
    (stream, init, bytes_size)
}

pub async fn expect_read_request(stream: &mut ServerStream<ReadProtocol>) -> i64 {
    match next_read_message(stream).await {
        read::from_client::ClientMessage::ReadRequest(request) => request.bytes_size,
        other => panic!("expected read request, got {:?}", other),
    }
}

/// Grant a partition session and wait for the client's confirmation.
pub async fn start_partition(
    stream: &mut ServerStream<ReadProtocol>,
    partition_session_id: i64,
    committed_offset: i64,
) {
    stream.send(read::FromServer::success(
        read::from_server::ServerMessage::StartPartitionSessionRequest(
            read::StartPartitionSessionRequest {
                partition_session: Some(read::PartitionSession {
                    partition_session_id,
                    path: "/local/orders".to_string(),
                    partition_id: partition_session_id * 10,
                }),
                committed_offset,
                partition_offsets: None,
            },
        ),
    ));
    match next_read_message(stream).await {
        read::from_client::ClientMessage::StartPartitionSessionResponse(response) => {
            assert_eq!(response.partition_session_id, partition_session_id);
        }
        other => panic!("expected start partition response, got {:?}", other),
    }
}

/// One ReadResponse carrying a single batch of `(offset, payload)` messages.
pub fn read_response(
    partition_session_id: i64,
    codec: i32,
    messages: &[(i64, &[u8])],
    bytes_size: i64,
) -> read::FromServer {
    let message_data = messages
        .iter()
        .map(|(offset, data)| read::read_response::MessageData {
            offset: *offset,
            seq_no: offset + 1,
            created_at: None,
            data: Bytes::copy_from_slice(data),
            uncompressed_size: data.len() as i64,
            message_group_id: "group".to_string(),
        })
        .collect();
    read::FromServer::success(read::from_server::ServerMessage::ReadResponse(
        read::ReadResponse {
            partition_data: vec![read::read_response::PartitionData {
                partition_session_id,
                batches: vec![read::read_response::Batch {
                    message_data,
                    producer_id: "producer".to_string(),
                    codec,
                    written_at: None,
                }],
            }],
            bytes_size,
        },
    ))
}

/// Like [`read_response`], compressing each payload with `codec` and
/// declaring its real uncompressed size.
pub fn compressed_read_response(
    partition_session_id: i64,
    codec: Codec,
    messages: &[(i64, &str)],
    bytes_size: i64,
) -> read::FromServer {
    let compressed: Vec<(i64, Bytes)> = messages
        .iter()
        .map(|(offset, payload)| (*offset, codec.encode(payload.as_bytes()).unwrap()))
        .collect();
    let raw: Vec<(i64, &[u8])> = compressed
        .iter()
        .map(|(offset, data)| (*offset, &data[..]))
        .collect();
    let mut response = read_response(partition_session_id, codec.to_wire(), &raw, bytes_size);
    if let Some(read::from_server::ServerMessage::ReadResponse(data)) =
        response.server_message.as_mut()
    {
        let batch = &mut data.partition_data[0].batches[0];
        for (message, (_, payload)) in batch.message_data.iter_mut().zip(messages) {
            message.uncompressed_size = payload.len() as i64;
        }
    }
    response
}

pub fn commit_response(partition_session_id: i64, committed_offset: i64) -> read::FromServer {
    read::FromServer::success(read::from_server::ServerMessage::CommitOffsetResponse(
        read::CommitOffsetResponse {
            partitions_committed_offsets: vec![
                read::commit_offset_response::PartitionCommittedOffset {
                    partition_session_id,
                    committed_offset,
                },
            ],
        },
    ))
}

pub fn stop_partition(
    partition_session_id: i64,
    graceful: bool,
    committed_offset: i64,
) -> read::FromServer {
    read::FromServer::success(
        read::from_server::ServerMessage::StopPartitionSessionRequest(
            read::StopPartitionSessionRequest {
                partition_session_id,
                graceful,
                committed_offset,
            },
        ),
    )
}

/// Next CommitOffsetRequest as `(partition_session_id, start, end)` triples.
/// ReadRequests that arrive first are skipped.
pub async fn expect_commit(stream: &mut ServerStream<ReadProtocol>) -> Vec<(i64, i64, i64)> {
    loop {
        match next_read_message(stream).await {
            read::from_client::ClientMessage::CommitOffsetRequest(request) => {
                return request
                    .commit_offsets
                    .iter()
                    .flat_map(|partition| {
                        partition
                            .offsets
                            .iter()
                            .map(|range| (partition.partition_session_id, range.start, range.end))
                    })
                    .collect();
            }
            read::from_client::ClientMessage::ReadRequest(_) => {}
            other => panic!("expected commit request, got {:?}", other),
        }
    }
}
