//! # Wire Protocol
//!
//! Length-prefixed protobuf frames between the client and the replication
//! service. Each frame is
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────┐
//! │ u32 BE len │ tag: u8 │ protobuf body    │
//! └────────────┴─────────┴──────────────────┘
//! ```
//!
//! where `len` counts the tag byte plus the body. Messages are hand-written
//! prost structs; the tag byte selects the message type so the read loop
//! can dispatch without trial decoding.
//!
//! Row values inside DML messages travel as JSON column maps, matching the
//! oplog's storage form, so no per-column typing is needed on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a frame body; anything larger is a corrupt stream.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

// =============================================================================
// Error Codes
// =============================================================================

/// Error codes carried inside protocol-level error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 0,
    ConnectionFailed = 1,
    InvalidPosition = 2,
    BehindWindow = 3,
    SubscriptionError = 4,
}

/// A protocol-level error payload.
#[derive(Clone, PartialEq, Message)]
pub struct ReplicationError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl ReplicationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
        }
    }

    /// Maps the wire code onto the crate error.
    pub fn into_error(self, subscription_id: Option<String>) -> Error {
        match ErrorCode::try_from(self.code) {
            Ok(ErrorCode::ConnectionFailed) => Error::ConnectionFailed(self.message),
            Ok(ErrorCode::InvalidPosition) => Error::InvalidPosition(self.message),
            Ok(ErrorCode::BehindWindow) => Error::BehindWindow,
            Ok(ErrorCode::SubscriptionError) => Error::Subscription {
                subscription_id: subscription_id.map(Into::into),
                message: self.message,
            },
            Ok(ErrorCode::Internal) | Err(_) => Error::Internal(self.message),
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthResponse {
    #[prost(message, optional, tag = "1")]
    pub error: Option<ReplicationError>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StartReplicationRequest {
    /// Resume position; empty on a fresh start.
    #[prost(bytes = "vec", tag = "1")]
    pub lsn: Vec<u8>,
    #[prost(string, optional, tag = "2")]
    pub schema_version: Option<String>,
    /// Subscriptions to resume alongside the replication stream.
    #[prost(string, repeated, tag = "3")]
    pub subscription_ids: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StartReplicationResponse {
    #[prost(message, optional, tag = "1")]
    pub error: Option<ReplicationError>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StopReplication {}

// =============================================================================
// Relations
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct RelationColumnMsg {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub sqlite_type: String,
    #[prost(bool, tag = "3")]
    pub is_nullable: bool,
    /// 1-based primary-key position; 0 for non-key columns.
    #[prost(uint32, tag = "4")]
    pub primary_key: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RelationMsg {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub schema: String,
    #[prost(string, tag = "3")]
    pub table: String,
    #[prost(message, repeated, tag = "4")]
    pub columns: Vec<RelationColumnMsg>,
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireRecordType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct DataChangeMsg {
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    #[prost(enumeration = "WireRecordType", tag = "2")]
    pub record_type: i32,
    /// JSON column map after the change.
    #[prost(string, optional, tag = "3")]
    pub new_record: Option<String>,
    /// JSON column map before the change.
    #[prost(string, optional, tag = "4")]
    pub old_record: Option<String>,
    /// Tag strings this change observed on its origin.
    #[prost(string, repeated, tag = "5")]
    pub tags: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireMigrationType {
    CreateTable = 0,
    AlterAdd = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct SchemaChangeMsg {
    #[prost(string, tag = "1")]
    pub sql: String,
    #[prost(string, tag = "2")]
    pub table: String,
    #[prost(enumeration = "WireMigrationType", tag = "3")]
    pub migration_type: i32,
    #[prost(string, optional, tag = "4")]
    pub version: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChangeMsg {
    #[prost(oneof = "change_msg::Kind", tags = "1, 2")]
    pub kind: Option<change_msg::Kind>,
}

pub mod change_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Data(super::DataChangeMsg),
        #[prost(message, tag = "2")]
        Schema(super::SchemaChangeMsg),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionMsg {
    #[prost(string, optional, tag = "1")]
    pub origin: Option<String>,
    #[prost(int64, tag = "2")]
    pub commit_timestamp: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub lsn: Vec<u8>,
    #[prost(message, repeated, tag = "4")]
    pub changes: Vec<ChangeMsg>,
}

/// A batch of transactions on the stream.
#[derive(Clone, PartialEq, Message)]
pub struct OpLogMsg {
    #[prost(message, repeated, tag = "1")]
    pub transactions: Vec<TransactionMsg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireAckKind {
    LocalSend = 0,
    RemoteCommit = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct AckMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub lsn: Vec<u8>,
    #[prost(enumeration = "WireAckKind", tag = "2")]
    pub kind: i32,
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct ShapeRequestMsg {
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Whole-table shape: the subscribed table's name.
    #[prost(string, tag = "2")]
    pub tablename: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeRequest {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    #[prost(message, repeated, tag = "2")]
    pub shape_requests: Vec<ShapeRequestMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeResponse {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ReplicationError>,
}

/// One row of a shape's initial data.
#[derive(Clone, PartialEq, Message)]
pub struct InitialRowMsg {
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    /// JSON column map.
    #[prost(string, tag = "2")]
    pub row: String,
    #[prost(string, repeated, tag = "3")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscriptionDataMsg {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    /// Stream position the data is consistent with.
    #[prost(bytes = "vec", tag = "2")]
    pub lsn: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub data: Vec<InitialRowMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscriptionErrorMsg {
    #[prost(string, optional, tag = "1")]
    pub subscription_id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ReplicationError>,
}

// =============================================================================
// Frames
// =============================================================================

/// Every message the stream can carry, tagged for dispatch.
#[derive(Clone, PartialEq)]
pub enum Frame {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    StartReplicationRequest(StartReplicationRequest),
    StartReplicationResponse(StartReplicationResponse),
    StopReplication(StopReplication),
    Relation(RelationMsg),
    OpLog(OpLogMsg),
    Ack(AckMsg),
    SubscribeRequest(SubscribeRequest),
    SubscribeResponse(SubscribeResponse),
    SubscriptionData(SubscriptionDataMsg),
    SubscriptionError(SubscriptionErrorMsg),
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Frame::AuthRequest(_) => "AuthRequest",
            Frame::AuthResponse(_) => "AuthResponse",
            Frame::StartReplicationRequest(_) => "StartReplicationRequest",
            Frame::StartReplicationResponse(_) => "StartReplicationResponse",
            Frame::StopReplication(_) => "StopReplication",
            Frame::Relation(_) => "Relation",
            Frame::OpLog(_) => "OpLog",
            Frame::Ack(_) => "Ack",
            Frame::SubscribeRequest(_) => "SubscribeRequest",
            Frame::SubscribeResponse(_) => "SubscribeResponse",
            Frame::SubscriptionData(_) => "SubscriptionData",
            Frame::SubscriptionError(_) => "SubscriptionError",
        })
    }
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::AuthRequest(_) => 1,
            Frame::AuthResponse(_) => 2,
            Frame::StartReplicationRequest(_) => 3,
            Frame::StartReplicationResponse(_) => 4,
            Frame::StopReplication(_) => 5,
            Frame::Relation(_) => 6,
            Frame::OpLog(_) => 7,
            Frame::Ack(_) => 8,
            Frame::SubscribeRequest(_) => 9,
            Frame::SubscribeResponse(_) => 10,
            Frame::SubscriptionData(_) => 11,
            Frame::SubscriptionError(_) => 12,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        fn enc<M: Message>(m: &M) -> Vec<u8> {
            let mut buf = Vec::with_capacity(m.encoded_len());
            m.encode(&mut buf).expect("Vec<u8> has unbounded capacity");
            buf
        }
        match self {
            Frame::AuthRequest(m) => enc(m),
            Frame::AuthResponse(m) => enc(m),
            Frame::StartReplicationRequest(m) => enc(m),
            Frame::StartReplicationResponse(m) => enc(m),
            Frame::StopReplication(m) => enc(m),
            Frame::Relation(m) => enc(m),
            Frame::OpLog(m) => enc(m),
            Frame::Ack(m) => enc(m),
            Frame::SubscribeRequest(m) => enc(m),
            Frame::SubscribeResponse(m) => enc(m),
            Frame::SubscriptionData(m) => enc(m),
            Frame::SubscriptionError(m) => enc(m),
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Frame> {
        Ok(match tag {
            1 => Frame::AuthRequest(AuthRequest::decode(body)?),
            2 => Frame::AuthResponse(AuthResponse::decode(body)?),
            3 => Frame::StartReplicationRequest(StartReplicationRequest::decode(body)?),
            4 => Frame::StartReplicationResponse(StartReplicationResponse::decode(body)?),
            5 => Frame::StopReplication(StopReplication::decode(body)?),
            6 => Frame::Relation(RelationMsg::decode(body)?),
            7 => Frame::OpLog(OpLogMsg::decode(body)?),
            8 => Frame::Ack(AckMsg::decode(body)?),
            9 => Frame::SubscribeRequest(SubscribeRequest::decode(body)?),
            10 => Frame::SubscribeResponse(SubscribeResponse::decode(body)?),
            11 => Frame::SubscriptionData(SubscriptionDataMsg::decode(body)?),
            12 => Frame::SubscriptionError(SubscriptionErrorMsg::decode(body)?),
            other => {
                return Err(Error::Internal(format!("unknown frame tag {other}")));
            }
        })
    }

    /// Serializes the frame with its length prefix.
    pub fn encode(&self) -> Bytes {
        let body = self.encode_body();
        let len = (body.len() + 1) as u32;
        let mut out = BytesMut::with_capacity(4 + 1 + body.len());
        out.put_u32(len);
        out.put_u8(self.tag());
        out.extend_from_slice(&body);
        out.freeze()
    }
}

/// Writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on clean end-of-stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::Internal(format!("invalid frame length {len}")));
    }

    let mut frame_buf = vec![0u8; len as usize];
    reader.read_exact(&mut frame_buf).await?;
    let (tag, body) = frame_buf.split_first().expect("len >= 1 checked above");
    Ok(Some(Frame::decode_body(*tag, body)?))
}

// =============================================================================
// Tests
// =============================================================================
