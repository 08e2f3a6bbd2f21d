//! Signed, length-framed peer protocol
//!
//! Frame: `[u32 big-endian length][payload]`, where
//! `payload = json(envelope) || ed25519_signature(json(envelope))`.
//! The envelope is the message's fields plus a `type` tag, the send
//! `timestamp` and the signer's hex public key.

use crate::crypto::keys::{verify_signature, Keypair, SIGNATURE_LENGTH};
use crate::error::{CryptoError, NetworkError, Result, TorrentChainError};
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Length of the frame header in bytes
pub const LENGTH_FIELD_BYTES: usize = 4;

/// Default cap on a single frame, large enough for hex-encoded chunks
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Room reserved in a `chunk_response` frame for everything but the hex data:
/// JSON keys, chunk hash, timestamp, sender key and signature
pub const CHUNK_RESPONSE_OVERHEAD: usize = 512;

/// Largest chunk whose `chunk_response` fits in a frame of `max_frame_length`
pub fn max_chunk_size(max_frame_length: usize) -> usize {
    max_frame_length.saturating_sub(CHUNK_RESPONSE_OVERHEAD) / 2
}

/// Peer protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message on a connection: who we are and our key
    Handshake { node_id: String, pub_key: String },
    /// Either a single chunk with its replica peers, or the sender's full chunk list
    ChunkAnnounce {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        chunks: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<String>,
        node_id: String,
    },
    ChunkRequest {
        chunk_hash: String,
        requestor: String,
    },
    /// `data` is hex-encoded chunk bytes
    ChunkResponse { chunk_hash: String, data: String },
    PeerExchange { peers: Vec<String> },
    Heartbeat {},
}

impl Message {
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::ChunkAnnounce { .. } => "chunk_announce",
            Message::ChunkRequest { .. } => "chunk_request",
            Message::ChunkResponse { .. } => "chunk_response",
            Message::PeerExchange { .. } => "peer_exchange",
            Message::Heartbeat {} => "heartbeat",
        }
    }

    /// Announcement of one chunk and the peers holding it
    pub fn announce_chunk(chunk_hash: impl Into<String>, peers: Vec<String>, node_id: impl Into<String>) -> Self {
        Message::ChunkAnnounce {
            chunk_hash: Some(chunk_hash.into()),
            chunks: Vec::new(),
            peers,
            node_id: node_id.into(),
        }
    }

    /// Announcement of everything `node_id` holds
    pub fn announce_inventory(chunks: Vec<String>, node_id: impl Into<String>) -> Self {
        Message::ChunkAnnounce {
            chunk_hash: None,
            chunks,
            peers: Vec::new(),
            node_id: node_id.into(),
        }
    }
}

/// A message as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    /// Seconds since the UNIX epoch at send time
    pub timestamp: f64,
    /// Hex public key the payload is signed with
    pub sender_key: String,
}

#[derive(Deserialize)]
struct Signer {
    sender_key: String,
}

/// Serialize and sign `message` into a frame payload
pub fn encode_payload(message: &Message, keypair: &Keypair, timestamp: f64) -> Result<Vec<u8>> {
    let envelope = Envelope {
        message: message.clone(),
        timestamp,
        sender_key: keypair.public_key_hex(),
    };
    let mut payload = serde_json::to_vec(&envelope)?;
    let signature = keypair.sign(&payload);
    payload.extend_from_slice(&signature);
    Ok(payload)
}

/// Split a payload into data and signature, verify the signature against the
/// embedded key, and only then decode the message.
pub fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    if payload.len() <= SIGNATURE_LENGTH {
        return Err(invalid("payload shorter than signature"));
    }
    let (data, signature) = payload.split_at(payload.len() - SIGNATURE_LENGTH);

    let signer: Signer =
        serde_json::from_slice(data).map_err(|e| invalid(format!("missing signer: {}", e)))?;
    if !verify_signature(&signer.sender_key, data, signature)? {
        return Err(TorrentChainError::Crypto(CryptoError::InvalidSignature));
    }

    serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))
}

/// Codec for `[u32 BE length][payload]` frames
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_BYTES)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

fn invalid(reason: impl Into<String>) -> TorrentChainError {
    TorrentChainError::Network(NetworkError::InvalidMessage {
        reason: reason.into(),
    })
}
