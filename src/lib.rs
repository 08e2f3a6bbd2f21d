//! TorrentChain - peer-to-peer chunk distribution secured by a
//! proof-of-useful-work chain
//! Rust implementation

// Modules
pub mod block;
pub mod chain;
pub mod chunk_store;
pub mod crypto;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod storage;
pub mod utils;

// Re-exports
pub use block::Block;
pub use chain::{BlockValidation, Chain, ChainConfig};
pub use chunk_store::{ChunkRecord, ChunkStore, ChunkStoreConfig, PeerMergePolicy};
pub use error::{Result, TorrentChainError};
pub use network::{NetworkConfig, PeerId, PeerInfo, PeerNetwork};
pub use node::{NodeConfig, TorrentChainNode, TorrentChainNodeBuilder};
pub use protocol::{Envelope, Message};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default network port for TorrentChain nodes
pub const DEFAULT_PORT: u16 = 21000;

/// Maximum number of peers by default
pub const DEFAULT_MAX_PEERS: usize = 10;
