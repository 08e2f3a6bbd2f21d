//! Error types for the TorrentChain library

use thiserror::Error;

/// Result type alias for TorrentChain operations
pub type Result<T> = std::result::Result<T, TorrentChainError>;

/// Main error type for TorrentChain operations
#[derive(Error, Debug)]
pub enum TorrentChainError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Consensus-related errors
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the listener
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to peer
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Peer address could not be parsed as host:port
    #[error("Invalid peer address: {addr}")]
    InvalidAddress { addr: String },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// The connection's outbound queue is closed
    #[error("Peer {peer} is disconnected")]
    Disconnected { peer: String },

    /// The connection's outbound queue is full; the message was dropped
    #[error("Send queue full, dropped {message_type}")]
    SendQueueFull { message_type: String },

    /// Encoded message does not fit in one frame
    #[error("{message_type} of {size} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge {
        message_type: String,
        size: usize,
        max: usize,
    },

    /// Chunk could never be served in a single response frame
    #[error("Chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },

    /// The network has been shut down
    #[error("Network is shut down")]
    ShutDown,
}

/// Cryptographic error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    /// Invalid private key
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey { reason: String },

    /// Proof of work search was stopped before a solution was found
    #[error("Proof of work search cancelled")]
    ProofOfWorkCancelled,
}

/// Storage-related error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend operation failed
    #[error("Database operation failed: {reason}")]
    DatabaseOperation { reason: String },

    /// Key cannot be mapped onto the backend
    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },

    /// Chunk could not be persisted locally even though its digest checked out
    #[error("Local integrity failure for chunk {chunk_hash}: {reason}")]
    Integrity { chunk_hash: String, reason: String },
}

/// Serialization error types
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decoding error
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl TorrentChainError {
    /// Create a validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        TorrentChainError::Validation(msg.into())
    }

    /// Create a consensus error
    pub fn consensus<T: Into<String>>(msg: T) -> Self {
        TorrentChainError::Consensus(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        TorrentChainError::Config(msg.into())
    }
}

impl From<serde_json::Error> for TorrentChainError {
    fn from(err: serde_json::Error) -> Self {
        TorrentChainError::Serialization(SerializationError::Json(err))
    }
}

impl From<hex::FromHexError> for TorrentChainError {
    fn from(err: hex::FromHexError) -> Self {
        TorrentChainError::Serialization(SerializationError::Hex(err))
    }
}
