//! Content-addressed chunk storage with TTL expiry and replication metadata
//!
//! Chunk bytes live under `<hash>.chunk` in the backing [`Storage`]; the index
//! of [`ChunkRecord`]s is mirrored as a single JSON snapshot under
//! [`METADATA_KEY`], rewritten whole on every mutation. One lock serializes
//! every operation against both, so no reader sees an index entry without its
//! bytes.

use crate::crypto::hash::content_hash;
use crate::error::{Result, StorageError, TorrentChainError};
use crate::storage::Storage;
use crate::utils::{Clock, SystemClock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Key of the persisted index snapshot
pub const METADATA_KEY: &str = "metadata.json";

/// Seven days
pub const DEFAULT_CHUNK_TTL_SECS: u64 = 604_800;

/// Storage key for a chunk's bytes
pub fn chunk_key(chunk_hash: &str) -> String {
    format!("{}.chunk", chunk_hash)
}

/// What happens to the peer list when an already-stored chunk is stored again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMergePolicy {
    /// The new list replaces the old one
    #[default]
    Replace,
    /// The new list is unioned into the old one
    Union,
}

/// Chunk store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkStoreConfig {
    /// Lifetime of a stored chunk in seconds
    pub chunk_ttl_secs: u64,
    /// How often the background sweeper runs, in seconds
    pub sweep_interval_secs: u64,
    pub peer_merge: PeerMergePolicy,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            chunk_ttl_secs: DEFAULT_CHUNK_TTL_SECS,
            sweep_interval_secs: 3600,
            peer_merge: PeerMergePolicy::Replace,
        }
    }
}

/// Index entry for one stored chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub size: u64,
    /// Peers believed to replicate the chunk
    pub peers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Persisted snapshot layout
#[derive(Debug, Serialize, Deserialize)]
struct ChunkMetadata {
    node_id: String,
    chunks: BTreeMap<String, ChunkRecord>,
    timestamp: DateTime<Utc>,
}

pub struct ChunkStore {
    node_id: String,
    storage: Arc<dyn Storage>,
    config: ChunkStoreConfig,
    clock: Arc<dyn Clock>,
    index: Mutex<HashMap<String, ChunkRecord>>,
    span: Span,
}

impl ChunkStore {
    /// Open a store on `storage`, loading the persisted index and dropping
    /// entries whose bytes are missing or whose TTL has passed.
    pub async fn open(
        node_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: ChunkStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let node_id = node_id.into();
        let span = info_span!("chunk_store", node_id = %node_id);
        let store = Self {
            node_id,
            storage,
            config,
            clock,
            index: Mutex::new(HashMap::new()),
            span,
        };
        store.load_persisted().instrument(store.span.clone()).await?;
        Ok(store)
    }

    /// Open with the system clock and default configuration
    pub async fn open_default(
        node_id: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        Self::open(node_id, storage, ChunkStoreConfig::default(), Arc::new(SystemClock)).await
    }

    /// Replace the diagnostics span used for this store's log lines
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ChunkStoreConfig {
        &self.config
    }

    async fn load_persisted(&self) -> Result<()> {
        self.storage.initialize().await?;
        let mut index = self.index.lock().await;

        match self.storage.get(METADATA_KEY).await? {
            Some(raw) => match serde_json::from_slice::<ChunkMetadata>(&raw) {
                Ok(metadata) => index.extend(metadata.chunks),
                Err(e) => error!("Failed to load persisted chunk index: {}", e),
            },
            None => debug!("No persisted chunk index, starting empty"),
        }

        let now = self.clock.now();
        let mut dropped = 0usize;
        for chunk_hash in index.keys().cloned().collect::<Vec<_>>() {
            let key = chunk_key(&chunk_hash);
            if !self.storage.exists(&key).await.unwrap_or(false) {
                index.remove(&chunk_hash);
                dropped += 1;
            } else if index
                .get(&chunk_hash)
                .map_or(true, |record| record.is_expired_at(now))
            {
                if let Err(e) = self.storage.delete(&key).await {
                    warn!("Failed to delete expired chunk {}: {}", short(&chunk_hash), e);
                }
                index.remove(&chunk_hash);
                dropped += 1;
            }
        }

        if dropped > 0 {
            info!("Dropped {} stale chunk index entries", dropped);
            self.persist(&index).await?;
        }
        info!("Loaded {} chunks", index.len());
        Ok(())
    }

    /// Write the full index snapshot
    async fn persist(&self, index: &HashMap<String, ChunkRecord>) -> Result<()> {
        let metadata = ChunkMetadata {
            node_id: self.node_id.clone(),
            chunks: index.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            timestamp: self.clock.now(),
        };
        let raw = serde_json::to_vec_pretty(&metadata)?;
        self.storage.put(METADATA_KEY, raw).await
    }

    /// Store `data` under `chunk_hash`.
    ///
    /// Returns `Ok(false)` without touching anything if the digest of `data`
    /// is not `chunk_hash`. Errors mean the node failed to persist a valid
    /// chunk.
    pub async fn store(&self, chunk_hash: &str, data: &[u8], peers: Vec<String>) -> Result<bool> {
        if content_hash(data) != chunk_hash {
            warn!(parent: &self.span, "Invalid chunk data for {}", short(chunk_hash));
            return Ok(false);
        }

        let mut index = self.index.lock().await;
        self.storage
            .put(&chunk_key(chunk_hash), data.to_vec())
            .await
            .map_err(|e| integrity(chunk_hash, e))?;

        let now = self.clock.now();
        let ttl = ChronoDuration::seconds(self.config.chunk_ttl_secs as i64);
        let peers = match (self.config.peer_merge, index.get(chunk_hash)) {
            (PeerMergePolicy::Union, Some(existing)) if !existing.is_expired_at(now) => {
                union(existing.peers.clone(), peers)
            },
            _ => peers,
        };
        index.insert(
            chunk_hash.to_string(),
            ChunkRecord {
                size: data.len() as u64,
                peers,
                created_at: now,
                expires_at: now + ttl,
            },
        );

        self.persist(&index)
            .await
            .map_err(|e| integrity(chunk_hash, e))?;
        debug!(parent: &self.span, "Stored chunk {} ({} bytes)", short(chunk_hash), data.len());
        Ok(true)
    }

    /// Bytes of an unexpired chunk whose content still matches its hash.
    ///
    /// Misses, corruption and read failures all come back as `None`.
    pub async fn retrieve(&self, chunk_hash: &str) -> Option<Vec<u8>> {
        let index = self.index.lock().await;
        let record = index.get(chunk_hash)?;
        if record.is_expired_at(self.clock.now()) {
            return None;
        }

        match self.storage.get(&chunk_key(chunk_hash)).await {
            Ok(Some(data)) if content_hash(&data) == chunk_hash => Some(data),
            Ok(Some(_)) => {
                warn!(parent: &self.span, "Stored bytes for {} fail hash check", short(chunk_hash));
                None
            },
            Ok(None) => {
                warn!(parent: &self.span, "Chunk {} indexed but missing from storage", short(chunk_hash));
                None
            },
            Err(e) => {
                warn!(parent: &self.span, "Chunk retrieval failed for {}: {}", short(chunk_hash), e);
                None
            },
        }
    }

    /// Remove a chunk's bytes and index entry. Absent chunks are fine.
    pub async fn delete(&self, chunk_hash: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        if index.contains_key(chunk_hash) {
            self.storage.delete(&chunk_key(chunk_hash)).await?;
            index.remove(chunk_hash);
            self.persist(&index).await?;
            debug!(parent: &self.span, "Deleted chunk {}", short(chunk_hash));
        }
        Ok(())
    }

    /// Whether the chunk is indexed, backed and unexpired, without reading it
    pub async fn validate(&self, chunk_hash: &str) -> bool {
        let index = self.index.lock().await;
        match index.get(chunk_hash) {
            Some(record) if !record.is_expired_at(self.clock.now()) => self
                .storage
                .exists(&chunk_key(chunk_hash))
                .await
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Union `peers` into a stored chunk's replica list
    pub async fn add_peers(&self, chunk_hash: &str, peers: &[String]) -> Result<bool> {
        let mut index = self.index.lock().await;
        let Some(record) = index.get_mut(chunk_hash) else {
            return Ok(false);
        };
        let before = record.peers.len();
        record.peers = union(std::mem::take(&mut record.peers), peers.to_vec());
        if record.peers.len() != before {
            self.persist(&index).await?;
        }
        Ok(true)
    }

    /// Remove every record whose expiry has passed. Returns how many went.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let now = self.clock.now();
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(hash, _)| hash.clone())
            .collect();

        for chunk_hash in &expired {
            if let Err(e) = self.storage.delete(&chunk_key(chunk_hash)).await {
                warn!(parent: &self.span, "Failed to delete expired chunk {}: {}", short(chunk_hash), e);
            }
            index.remove(chunk_hash);
        }

        if !expired.is_empty() {
            self.persist(&index).await?;
        }
        info!(parent: &self.span, "Completed expired chunk cleanup ({} removed)", expired.len());
        Ok(expired.len())
    }

    /// Run [`ChunkStore::sweep_expired`] every `sweep_interval_secs` until
    /// `shutdown` flips to true.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = store.sweep_expired().await {
                                error!("Chunk sweep failed: {}", e);
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                debug!("Chunk sweeper stopping");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    pub async fn record(&self, chunk_hash: &str) -> Option<ChunkRecord> {
        self.index.lock().await.get(chunk_hash).cloned()
    }

    /// Hashes of all unexpired chunks
    pub async fn chunk_hashes(&self) -> Vec<String> {
        let now = self.clock.now();
        let index = self.index.lock().await;
        let mut hashes: Vec<String> = index
            .iter()
            .filter(|(_, record)| !record.is_expired_at(now))
            .map(|(hash, _)| hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }
}

fn union(mut existing: Vec<String>, incoming: Vec<String>) -> Vec<String> {
    for peer in incoming {
        if !existing.contains(&peer) {
            existing.push(peer);
        }
    }
    existing
}

fn integrity(chunk_hash: &str, e: TorrentChainError) -> TorrentChainError {
    TorrentChainError::Storage(StorageError::Integrity {
        chunk_hash: chunk_hash.to_string(),
        reason: e.to_string(),
    })
}

/// First eight characters of a hash, for log lines
pub(crate) fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
