//! Topic Streaming Protocol Definitions
//!
//! This crate contains the message types and the gRPC client for the two
//! bidirectional streaming calls of the topic service:
//!
//! - **StreamRead**: reader control protocol (init, flow control, partition
//!   session start/stop, offset commits)
//! - **StreamWrite**: writer control protocol (init, write, acknowledgments)
//!
//! Both directions of both calls also carry `UpdateTokenRequest` so a
//! long-lived stream can refresh its bearer token in-band.
//!
//! The types are generated from `proto/topicstream.proto` by `tonic-build`
//! at compile time. This module adds the constructors and helpers the client
//! engines use on top of them.
//!
//! ## Usage
//!
//! ```ignore
//! use topicstream_proto::topic_service_client::TopicServiceClient;
//! use topicstream_proto::stream_write_message::{from_client, FromClient, InitRequest};
//!
//! let mut client = TopicServiceClient::connect("http://localhost:2135").await?;
//! let (tx, rx) = tokio::sync::mpsc::channel(16);
//! tx.send(FromClient {
//!     client_message: Some(from_client::ClientMessage::InitRequest(InitRequest {
//!         path: "orders".to_string(),
//!         producer_id: "producer-1".to_string(),
//!         ..Default::default()
//!     })),
//! })
//! .await?;
//! let mut inbound = client
//!     .stream_write(tokio_stream::wrappers::ReceiverStream::new(rx))
//!     .await?
//!     .into_inner();
//! while let Some(message) = inbound.message().await? {
//!     println!("{:?}", message);
//! }
//! ```

use std::fmt;

tonic::include_proto!("topicstream.v1");

/// First codec id reserved for user-defined codecs.
pub const CODEC_CUSTOM_START: i32 = 10000;

impl StatusCode {
    /// Decode a raw wire value, mapping unknown values to `Unspecified`.
    pub fn from_wire(value: i32) -> Self {
        Self::try_from(value).unwrap_or(Self::Unspecified)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// Render a list of issues as a single line for error messages.
pub fn format_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|issue| issue.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl stream_read_message::FromServer {
    /// Successful server message.
    pub fn success(message: stream_read_message::from_server::ServerMessage) -> Self {
        Self {
            status: StatusCode::Success as i32,
            issues: Vec::new(),
            server_message: Some(message),
        }
    }

    /// Failed server message carrying only a status and one issue.
    pub fn failure(status: StatusCode, issue: impl Into<String>) -> Self {
        Self {
            status: status as i32,
            issues: vec![Issue {
                message: issue.into(),
                ..Default::default()
            }],
            server_message: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_wire(self.status)
    }
}

impl From<stream_read_message::from_client::ClientMessage> for stream_read_message::FromClient {
    fn from(message: stream_read_message::from_client::ClientMessage) -> Self {
        Self {
            client_message: Some(message),
        }
    }
}

impl From<UpdateTokenRequest> for stream_read_message::FromClient {
    fn from(request: UpdateTokenRequest) -> Self {
        stream_read_message::from_client::ClientMessage::UpdateTokenRequest(request).into()
    }
}

impl From<UpdateTokenResponse> for stream_read_message::from_server::ServerMessage {
    fn from(response: UpdateTokenResponse) -> Self {
        Self::UpdateTokenResponse(response)
    }
}

impl stream_write_message::FromServer {
    /// Successful server message.
    pub fn success(message: stream_write_message::from_server::ServerMessage) -> Self {
        Self {
            status: StatusCode::Success as i32,
            issues: Vec::new(),
            server_message: Some(message),
        }
    }

    /// Failed server message carrying only a status and one issue.
    pub fn failure(status: StatusCode, issue: impl Into<String>) -> Self {
        Self {
            status: status as i32,
            issues: vec![Issue {
                message: issue.into(),
                ..Default::default()
            }],
            server_message: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_wire(self.status)
    }
}

impl From<stream_write_message::from_client::ClientMessage> for stream_write_message::FromClient {
    fn from(message: stream_write_message::from_client::ClientMessage) -> Self {
        Self {
            client_message: Some(message),
        }
    }
}

impl From<UpdateTokenRequest> for stream_write_message::FromClient {
    fn from(request: UpdateTokenRequest) -> Self {
        stream_write_message::from_client::ClientMessage::UpdateTokenRequest(request).into()
    }
}

impl From<UpdateTokenResponse> for stream_write_message::from_server::ServerMessage {
    fn from(response: UpdateTokenResponse) -> Self {
        Self::UpdateTokenResponse(response)
    }
}

impl stream_write_message::write_response::WriteAck {
    pub fn written(seq_no: i64, offset: i64) -> Self {
        use stream_write_message::write_response::write_ack;
        Self {
            seq_no,
            message_write_status: Some(write_ack::MessageWriteStatus::Written(
                write_ack::Written { offset },
            )),
        }
    }

    pub fn already_written(seq_no: i64) -> Self {
        use stream_write_message::write_response::write_ack;
        Self {
            seq_no,
            message_write_status: Some(write_ack::MessageWriteStatus::Skipped(
                write_ack::Skipped {
                    reason: write_ack::skipped::Reason::AlreadyWritten as i32,
                },
            )),
        }
    }
}
