//! Integration tests for the Writer engine over the in-process transport.
//!
//! These tests verify:
//! 1. Each write completes exactly once with the server's acknowledgement
//! 2. Unacknowledged messages are resent in sequence order after a reconnect
//! 3. Codec negotiation failures are fatal
//! 4. Buffer back-pressure and caller cancellation

mod common;

use common::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use topicstream_client::transport::memory;
use topicstream_client::{
    ClientError, Codec, EngineState, RotatingToken, WriteProtocol, WriteStatus, Writer,
};
use topicstream_proto::stream_write_message as write;
use topicstream_proto::StatusCode;

#[tokio::test]
async fn test_write_completes_with_offset() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .producer_id("orders-api")
        .build()
        .await
        .unwrap();

    let (mut stream, init) = handshake_writer(&mut server, 0).await;
    assert_eq!(init.path, "/local/orders");
    assert_eq!(init.producer_id, "orders-api");
    assert_eq!(init.message_group_id, "orders-api");

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(writer.write("created".to_string(), &cancel), async {
        let messages = recv_messages(&mut stream, 1).await;
        assert_eq!(messages[0].seq_no, 1);
        assert_eq!(&messages[0].data[..], b"created");
        assert_eq!(messages[0].uncompressed_size, 7);
        assert!(messages[0].created_at.is_some());
        stream.send(write_response(vec![written(1, 42)]));
    });

    let result = result.unwrap();
    assert_eq!(result.seq_no, 1);
    assert_eq!(result.status, WriteStatus::Written { offset: 42 });
    assert_eq!(result.offset(), Some(42));
    assert!(matches!(writer.state(), EngineState::Active));
    assert_eq!(writer.last_seq_no(), Some(1));
}

#[tokio::test]
async fn test_sequence_continues_from_server_last_seq_no() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<i64>::builder()
        .connector(connector)
        .topic("/local/orders")
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 41).await;

    let cancel = CancellationToken::new();
    let (first, second, ()) = tokio::join!(writer.write(1, &cancel), writer.write(2, &cancel), async {
        let messages = recv_messages(&mut stream, 2).await;
        let seq_nos: Vec<i64> = messages.iter().map(|m| m.seq_no).collect();
        assert_eq!(seq_nos, vec![42, 43]);
        stream.send(write_response(vec![written(42, 0), written(43, 1)]));
    });

    assert_eq!(first.unwrap().seq_no, 42);
    assert_eq!(second.unwrap().seq_no, 43);
}

#[tokio::test]
async fn test_reconnect_resends_unacknowledged_in_order() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .retry_policy(fast_retry())
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancel = CancellationToken::new();
    let (a, b, c, ()) = tokio::join!(
        writer.write("a".to_string(), &cancel),
        writer.write("b".to_string(), &cancel),
        writer.write("c".to_string(), &cancel),
        async {
            let first = recv_messages(&mut stream, 3).await;
            let seq_nos: Vec<i64> = first.iter().map(|m| m.seq_no).collect();
            assert_eq!(seq_nos, vec![1, 2, 3]);

            // Break the stream before acknowledging anything.
            drop(stream);

            let (mut stream, _) = handshake_writer(&mut server, 0).await;
            let resent = recv_messages(&mut stream, 3).await;
            let seq_nos: Vec<i64> = resent.iter().map(|m| m.seq_no).collect();
            assert_eq!(seq_nos, vec![1, 2, 3]);
            let payloads: Vec<&[u8]> = resent.iter().map(|m| &m.data[..]).collect();
            assert_eq!(payloads, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);

            stream.send(write_response(vec![
                written(1, 10),
                written(2, 11),
                written(3, 12),
            ]));
            assert_eq!(server.opened(), 2);
        }
    );

    assert_eq!(a.unwrap().status, WriteStatus::Written { offset: 10 });
    assert_eq!(b.unwrap().status, WriteStatus::Written { offset: 11 });
    assert_eq!(c.unwrap().status, WriteStatus::Written { offset: 12 });
}

#[tokio::test]
async fn test_resend_of_persisted_message_reports_already_written() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .retry_policy(fast_retry())
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancel = CancellationToken::new();
    let (a, b, ()) = tokio::join!(
        writer.write("a".to_string(), &cancel),
        writer.write("b".to_string(), &cancel),
        async {
            recv_messages(&mut stream, 2).await;
            stream.fault(topicstream_client::TransportError::Closed);

            // The server persisted seq_no 1 before the fault.
            let (mut stream, _) = handshake_writer(&mut server, 1).await;
            let resent = recv_messages(&mut stream, 2).await;
            let seq_nos: Vec<i64> = resent.iter().map(|m| m.seq_no).collect();
            assert_eq!(seq_nos, vec![1, 2]);
            stream.send(write_response(vec![
                write::write_response::WriteAck::already_written(1),
                written(2, 7),
            ]));
        }
    );

    assert_eq!(a.unwrap().status, WriteStatus::AlreadyWritten);
    assert_eq!(b.unwrap().status, WriteStatus::Written { offset: 7 });
    assert_eq!(writer.last_seq_no(), Some(2));
}

#[tokio::test]
async fn test_writes_before_init_are_sequenced_after_it() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .build()
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (result, _stream) = tokio::join!(writer.write("early".to_string(), &cancel), async {
        let mut stream = accept_writer(&mut server).await;
        assert!(matches!(
            next_write_message(&mut stream).await,
            write::from_client::ClientMessage::InitRequest(_)
        ));
        // Let the write queue up before the counter is known.
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.send(write_init_response(7, &[]));

        let messages = recv_messages(&mut stream, 1).await;
        assert_eq!(messages[0].seq_no, 8);
        stream.send(write_response(vec![written(8, 0)]));
        stream
    });

    assert_eq!(result.unwrap().seq_no, 8);
}

#[tokio::test]
async fn test_lz4_payload_is_compressed_on_the_wire() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .codec(Codec::Lz4)
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let payload = "order ".repeat(200);
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(writer.write(payload.clone(), &cancel), async {
        let request = match next_write_message(&mut stream).await {
            write::from_client::ClientMessage::WriteRequest(request) => request,
            other => panic!("expected write request, got {:?}", other),
        };
        assert_eq!(request.codec, Codec::Lz4.to_wire());
        let message = &request.messages[0];
        assert_eq!(message.uncompressed_size, payload.len() as i64);
        assert!(message.data.len() < payload.len());
        assert_eq!(
            &Codec::Lz4.decode(&message.data, message.uncompressed_size).unwrap()[..],
            payload.as_bytes()
        );
        stream.send(write_response(vec![written(1, 0)]));
    });
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_locally_unsupported_codec_fails_without_traffic() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .codec(Codec::Custom(10001))
        .build()
        .await
        .unwrap();

    let result = writer
        .write("x".to_string(), &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(ClientError::UnsupportedCodec {
            codec: Codec::Custom(10001),
            ..
        })
    ));
    assert!(matches!(writer.state(), EngineState::Failed(_)));
    assert_eq!(server.opened(), 0);
    assert!(server.try_accept().is_none());
}

#[tokio::test]
async fn test_codec_missing_from_server_list_is_fatal() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .codec(Codec::Lz4)
        .build()
        .await
        .unwrap();

    let mut stream = accept_writer(&mut server).await;
    next_write_message(&mut stream).await;
    stream.send(write_init_response(0, &[Codec::Raw.to_wire()]));

    let result = writer
        .write("x".to_string(), &CancellationToken::new())
        .await;
    match result {
        Err(ClientError::UnsupportedCodec { codec, supported }) => {
            assert_eq!(codec, Codec::Lz4);
            assert_eq!(supported, vec![Codec::Raw]);
        }
        other => panic!("expected unsupported codec, got {:?}", other),
    }
    assert!(stream.try_recv().is_none());
}

#[tokio::test]
async fn test_fatal_status_fails_pending_writes() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/missing")
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(writer.write("x".to_string(), &cancel), async {
        recv_messages(&mut stream, 1).await;
        stream.send(write::FromServer::failure(
            StatusCode::SchemeError,
            "topic not found",
        ));
    });

    match result {
        Err(ClientError::Status { status, issues }) => {
            assert_eq!(status, StatusCode::SchemeError);
            assert!(issues.contains("topic not found"));
        }
        other => panic!("expected status error, got {:?}", other),
    }
    // Later writes fail the same way.
    assert!(matches!(
        writer.write("y".to_string(), &cancel).await,
        Err(ClientError::Status { .. })
    ));
}

#[tokio::test]
async fn test_retryable_status_reconnects() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .retry_policy(fast_retry())
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(writer.write("x".to_string(), &cancel), async {
        recv_messages(&mut stream, 1).await;
        stream.send(write::FromServer::failure(StatusCode::Overloaded, "busy"));

        let (mut stream, _) = handshake_writer(&mut server, 0).await;
        let messages = recv_messages(&mut stream, 1).await;
        assert_eq!(messages[0].seq_no, 1);
        stream.send(write_response(vec![written(1, 5)]));
    });

    assert_eq!(result.unwrap().offset(), Some(5));
}

#[tokio::test]
async fn test_full_buffer_blocks_until_acknowledged() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .buffer_max_bytes(10)
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancel = CancellationToken::new();
    let payload = "x".repeat(11);
    let (first, blocked, ()) = tokio::join!(
        writer.write(payload.clone(), &cancel),
        async {
            // The first write exceeds the limit on its own.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let blocked = tokio::time::timeout(
                Duration::from_millis(50),
                writer.write("y".to_string(), &cancel),
            )
            .await;
            assert!(blocked.is_err(), "write did not wait for buffer room");
            writer.write("z".to_string(), &cancel).await
        },
        async {
            recv_messages(&mut stream, 1).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.send(write_response(vec![written(1, 0)]));

            let messages = recv_messages(&mut stream, 1).await;
            assert_eq!(&messages[0].data[..], b"z");
            stream.send(write_response(vec![written(messages[0].seq_no, 1)]));
        }
    );

    assert!(first.is_ok());
    assert_eq!(blocked.unwrap().seq_no, 2);
}

#[tokio::test]
async fn test_cancel_stops_waiting_only() {
    init_tracing();
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .topic("/local/orders")
        .build()
        .await
        .unwrap();
    let (mut stream, _) = handshake_writer(&mut server, 0).await;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(
        writer.write("never".to_string(), &cancelled).await,
        Err(ClientError::Cancelled)
    ));

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(writer.write("queued".to_string(), &cancel), async {
        recv_messages(&mut stream, 1).await;
        cancel.cancel();
    });
    assert!(matches!(result, Err(ClientError::Cancelled)));

    // The queued message was not withdrawn: it still occupies seq_no 1.
    let after_cancel = CancellationToken::new();
    let (next, ()) = tokio::join!(
        writer.write("after".to_string(), &after_cancel),
        async {
            let messages = recv_messages(&mut stream, 1).await;
            assert_eq!(messages[0].seq_no, 2);
            stream.send(write_response(vec![written(1, 0), written(2, 1)]));
        }
    );
    assert_eq!(next.unwrap().seq_no, 2);
}

#[tokio::test]
async fn test_rotated_token_is_sent_before_next_write() {
    init_tracing();
    let token = RotatingToken::new("first");
    let (connector, mut server) = memory::channel::<WriteProtocol>();
    let writer = Writer::<String>::builder()
        .connector(connector)
        .credentials(token.clone())
        .topic("/local/orders")
        .build()
        .await
        .unwrap();

    let (mut stream, _) = handshake_writer(&mut server, 0).await;
    assert_eq!(stream.auth_token(), Some("first"));

    token.set("second");
    let write_cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(
        writer.write("x".to_string(), &write_cancel),
        async {
            match next_write_message(&mut stream).await {
                write::from_client::ClientMessage::UpdateTokenRequest(update) => {
                    assert_eq!(update.token, "second");
                }
                other => panic!("expected token update, got {:?}", other),
            }
            match next_write_message(&mut stream).await {
                write::from_client::ClientMessage::WriteRequest(request) => {
                    assert_eq!(request.messages[0].seq_no, 1);
                }
                other => panic!("expected write request, got {:?}", other),
            }
            stream.send(write_response(vec![written(1, 0)]));
        }
    );
    assert!(result.is_ok());
}
