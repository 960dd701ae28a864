//! # Wire Protocol Messages
//!
//! All serializable message types carried over mesh control streams.
//! Messages are serialized with bincode under explicit size limits and
//! travel inside [`crate::signing::SignedEnvelope`]s.
//!
//! ## Protocol Types
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | DHT | [`DhtRequest`] | [`DhtResponse`] |
//! | Services | [`ServiceCall`] | [`ServiceReply`] |
//! | Gateway | [`OpenTunnelRequest`] / [`CloseTunnelRequest`] | [`OpenTunnelResponse`] / [`CloseTunnelResponse`] |
//!
//! ## Security Limits
//!
//! - `MAX_PAYLOAD_SIZE`: maximum service call payload (1 MiB)
//! - `MAX_DESERIALIZE_SIZE`: deserialization buffer bound (prevents OOM)
//! - All deserialization goes through [`deserialize_bounded`]
//! - Stream frames are length-prefixed and capped at `MAX_FRAME_SIZE`

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dht::{Key, NodeRecord};
use crate::signing::SignedEnvelope;

/// Maximum size of a service call payload (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_PAYLOAD_SIZE to allow framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Maximum length-prefixed frame on a control stream.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 8192;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Stream Framing
// ============================================================================

/// Write one length-prefixed envelope to a stream.
pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &SignedEnvelope,
) -> anyhow::Result<()> {
    let bytes = serialize(envelope)?;
    if bytes.len() > MAX_FRAME_SIZE {
        anyhow::bail!("envelope exceeds max frame size ({} bytes)", bytes.len());
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope from a stream.
/// SECURITY: The length prefix is validated before any allocation.
pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<SignedEnvelope> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("inbound frame too large ({} bytes)", len);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(deserialize_bounded(&buf)?)
}

// ============================================================================
// DHT RPCs
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping {
        from: NodeRecord,
    },
    FindNode {
        from: NodeRecord,
        target: Key,
    },
    FindValue {
        from: NodeRecord,
        key: Key,
    },
    Store {
        from: NodeRecord,
        key: Key,
        value: Vec<u8>,
        /// Remaining time-to-live in seconds, bounded by the store.
        ttl_secs: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<NodeRecord>),
    Value {
        value: Option<Vec<u8>>,
        /// Remaining TTL of the value, if present.
        ttl_secs: u64,
        closer: Vec<NodeRecord>,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// Service Call Envelope
// ============================================================================

/// Reply status for a routed service call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Ok,
    InvalidPayload,
    PayloadTooLarge,
    ServiceNotFound,
    UnknownError,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    pub method: String,
    pub correlation_id: [u8; 16],
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceReply {
    pub status: CallStatus,
    /// Echoed from the call for request/reply matching.
    pub correlation_id: [u8; 16],
    pub payload: Vec<u8>,
}

impl ServiceReply {
    pub fn error(status: CallStatus, correlation_id: [u8; 16]) -> Self {
        Self {
            status,
            correlation_id,
            payload: Vec::new(),
        }
    }
}

// ============================================================================
// Gateway Control
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenTunnelRequest {
    pub pod_id: String,
    pub destination_host: String,
    pub destination_port: u16,
    /// Optional registered service name the destination must match.
    pub service_name: Option<String>,
    /// Random nonce binding this request instance.
    pub request_nonce: [u8; 16],
    pub request_timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenTunnelResponse {
    pub tunnel_id: [u8; 16],
    pub accepted: bool,
    /// Rejection category for diagnostics; empty on acceptance.
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseTunnelRequest {
    pub tunnel_id: [u8; 16],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseTunnelResponse {
    pub closed: bool,
    pub reason: String,
}

// ============================================================================
// Top-Level Request Multiplexing
// ============================================================================

/// Every payload carried by a control envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshRequest {
    Dht(DhtRequest),
    Service(ServiceCall),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshResponse {
    Dht(DhtResponse),
    Service(ServiceReply),
    Error { message: String },
}
