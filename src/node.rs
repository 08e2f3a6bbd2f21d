//! TorrentChain node: chain, chunk store and peer network wired together

use crate::{
    block::Block,
    chain::{mine_in_background, Chain, ChainConfig},
    chunk_store::{ChunkStore, ChunkStoreConfig},
    crypto::keys::Keypair,
    error::{NetworkError, Result, TorrentChainError},
    network::{NetworkConfig, PeerInfo, PeerNetwork},
    storage::{FileStorage, MemoryStorage, Storage},
    utils::{Clock, SystemClock},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument, Span};

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub chunk_store: ChunkStoreConfig,
    pub network: NetworkConfig,
}

/// Main node structure for the TorrentChain network
pub struct TorrentChainNode {
    config: NodeConfig,
    chain: Arc<Mutex<Chain>>,
    chunk_store: Arc<ChunkStore>,
    network: Arc<PeerNetwork>,
    /// Stop flag of the search in progress, if any
    mining: Mutex<Option<Arc<AtomicBool>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
    span: Span,
}

impl TorrentChainNode {
    /// Create a builder for this node
    pub fn builder() -> TorrentChainNodeBuilder {
        TorrentChainNodeBuilder::new()
    }

    /// Start listening and the background chunk sweeper
    pub async fn start(&self) -> Result<()> {
        self.network.start().await?;
        let sweeper = self.chunk_store.spawn_sweeper(self.network.shutdown_signal());
        *self.sweeper.lock().await = Some(sweeper);
        *self.running.write().await = true;
        info!(parent: &self.span, "Node started");
        Ok(())
    }

    /// Cancel mining, close every connection and stop background tasks
    pub async fn stop(&self) -> Result<()> {
        self.cancel_mining().await;
        self.network.shutdown().await;
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.await;
        }
        *self.running.write().await = false;
        info!(parent: &self.span, "Node stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// `host:port` this node is known by
    pub fn id(&self) -> &str {
        self.network.node_id()
    }

    pub fn port(&self) -> u16 {
        self.network.local_addr().port()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> Arc<Mutex<Chain>> {
        Arc::clone(&self.chain)
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunk_store
    }

    pub fn network(&self) -> &Arc<PeerNetwork> {
        &self.network
    }

    pub async fn connect_to_peer(&self, addr: &str) -> Result<()> {
        self.network.connect_to_peer(addr).await
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.network.peers().await
    }

    /// Queue a transaction for the next mined block
    pub async fn add_transaction(&self, transaction: impl Into<String>) {
        self.chain.lock().await.add_transaction(transaction);
    }

    /// Mine the pending transactions off the async executor.
    ///
    /// `Ok(None)` when nothing is pending or the head moved during the search.
    pub async fn mine(&self) -> Result<Option<Block>> {
        let stop = Arc::new(AtomicBool::new(false));
        *self.mining.lock().await = Some(Arc::clone(&stop));
        let mined = mine_in_background(Arc::clone(&self.chain), stop)
            .instrument(self.span.clone())
            .await;
        *self.mining.lock().await = None;
        mined
    }

    /// Abandon the nonce search in progress
    pub async fn cancel_mining(&self) {
        if let Some(stop) = self.mining.lock().await.as_ref() {
            stop.store(true, Ordering::Relaxed);
        }
    }

    /// Store and announce a chunk, and queue its hash for the next block
    pub async fn publish_chunk(&self, data: &[u8], replica_peers: Vec<String>) -> Result<String> {
        let chunk_hash = self.network.publish_chunk(data, replica_peers).await?;
        self.add_transaction(chunk_hash.clone()).await;
        Ok(chunk_hash)
    }

    /// Local chunk, or `None` after asking the network for it
    pub async fn get_chunk(&self, chunk_hash: &str) -> Option<Vec<u8>> {
        self.network.get_chunk(chunk_hash).await
    }

    pub async fn chain_height(&self) -> usize {
        self.chain.lock().await.len()
    }

    pub async fn difficulty(&self) -> u32 {
        self.chain.lock().await.difficulty()
    }

    /// Node state for debugging
    pub async fn get_state(&self) -> Result<serde_json::Value> {
        let (height, difficulty, pending) = {
            let chain = self.chain.lock().await;
            (chain.len(), chain.difficulty(), chain.pending_transactions().len())
        };
        Ok(serde_json::json!({
            "node_id": self.id(),
            "running": self.is_running().await,
            "chain_height": height,
            "difficulty": difficulty,
            "pending_transactions": pending,
            "peer_count": self.network.peer_count().await,
            "chunks": self.chunk_store.len().await,
        }))
    }
}

/// Where chunk bytes and metadata are kept
enum StorageChoice {
    Memory,
    /// One subdirectory per node id under this root
    Directory(PathBuf),
    Custom(Arc<dyn Storage>),
}

/// Builder for TorrentChain nodes
pub struct TorrentChainNodeBuilder {
    config: NodeConfig,
    storage: StorageChoice,
    keypair: Option<Keypair>,
    clock: Arc<dyn Clock>,
}

impl TorrentChainNodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            storage: StorageChoice::Memory,
            keypair: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the storage backend
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = StorageChoice::Custom(storage);
        self
    }

    /// Persist chunks as files under `root/<node id>`
    pub fn with_storage_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage = StorageChoice::Directory(root.into());
        self
    }

    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.network.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.network.port = port;
        self
    }

    /// Set the maximum peers
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.config.network.max_peers = max_peers;
        self
    }

    /// Set the initial mining difficulty
    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.config.chain.initial_difficulty = difficulty;
        self
    }

    /// Bind the listener, open storage and mine genesis
    pub async fn build(self) -> Result<TorrentChainNode> {
        let network_config = self.config.network.clone();
        let addr = format!("{}:{}", network_config.host, network_config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            TorrentChainError::Network(NetworkError::BindFailed {
                addr: addr.clone(),
                source,
            })
        })?;
        let node_id = format!("{}:{}", network_config.host, listener.local_addr()?.port());
        let span = info_span!("node", node_id = %node_id);

        let storage: Arc<dyn Storage> = match self.storage {
            StorageChoice::Memory => Arc::new(MemoryStorage::new()),
            StorageChoice::Directory(root) => {
                Arc::new(FileStorage::new(root.join(node_id.replace(':', "_"))))
            },
            StorageChoice::Custom(storage) => storage,
        };

        let chunk_store = Arc::new(
            ChunkStore::open(
                node_id.clone(),
                storage,
                self.config.chunk_store.clone(),
                Arc::clone(&self.clock),
            )
            .await?
            .with_span(span.clone()),
        );

        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let network = PeerNetwork::from_listener(
            listener,
            network_config,
            keypair,
            Arc::clone(&chunk_store),
        )?;

        let chain_config = self.config.chain.clone();
        let clock = Arc::clone(&self.clock);
        let chain_span = span.clone();
        let chain = tokio::task::spawn_blocking(move || {
            Chain::new_in_span(chain_config, clock, chain_span)
        })
        .await
        .map_err(|e| TorrentChainError::consensus(format!("Genesis mining failed: {}", e)))?;

        Ok(TorrentChainNode {
            config: self.config,
            chain: Arc::new(Mutex::new(chain)),
            chunk_store,
            network,
            mining: Mutex::new(None),
            sweeper: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
            span,
        })
    }
}

impl Default for TorrentChainNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
