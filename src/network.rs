//! Peer network: authenticated connections, gossip discovery, chunk routing
//!
//! Each connection runs a read loop and a writer task. The peer table
//! (peer id -> connection) and routing table (chunk hash -> peers believed to
//! hold it) share one lock so disconnect cleanup is never observed half done.

use crate::chunk_store::{short, ChunkStore};
use crate::crypto::hash::content_hash;
use crate::crypto::keys::Keypair;
use crate::error::{NetworkError, Result, StorageError, TorrentChainError};
use crate::protocol::{
    decode_payload, encode_payload, frame_codec, max_chunk_size, Message, DEFAULT_MAX_FRAME_LENGTH,
};
use crate::utils::{current_time_secs, is_chunk_hash};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Peer identifier: the peer's listening address as `host:port`
pub type PeerId = String;

/// Any reliable, ordered, bidirectional byte stream
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host to listen on; also the host part of this node's id
    pub host: String,
    /// Port to listen on, 0 for any
    pub port: u16,
    /// Seconds between heartbeats on outbound connections
    pub heartbeat_interval_secs: u64,
    pub max_frame_length: usize,
    /// Frames queued per connection before further sends are dropped
    pub send_queue_capacity: usize,
    /// Peer exchange stops dialing once this many peers are connected
    pub max_peers: usize,
    /// Request announced chunks that are not held locally
    pub fetch_announced: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::DEFAULT_PORT,
            heartbeat_interval_secs: 30,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            send_queue_capacity: 32,
            max_peers: crate::DEFAULT_MAX_PEERS,
            fetch_announced: true,
        }
    }
}

/// Information about a connected peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Hex public key, known once the peer's handshake arrives
    pub public_key: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// Whether we dialed this peer
    pub outbound: bool,
}

struct PeerConnection {
    conn_id: u64,
    tx: mpsc::Sender<Bytes>,
    info: PeerInfo,
}

#[derive(Default)]
struct PeerTables {
    peers: HashMap<PeerId, PeerConnection>,
    routing: HashMap<String, HashSet<PeerId>>,
}

/// Per-connection read-loop state
struct Connection {
    conn_id: u64,
    tx: mpsc::Sender<Bytes>,
    peer_id: Option<PeerId>,
    /// Key from the peer's handshake; frames signed by anything else are dropped
    peer_key: Option<String>,
    handshake_sent: bool,
}

pub struct PeerNetwork {
    node_id: PeerId,
    local_addr: SocketAddr,
    keypair: Keypair,
    config: NetworkConfig,
    chunk_store: Arc<ChunkStore>,
    tables: Mutex<PeerTables>,
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
    span: Span,
}

impl PeerNetwork {
    /// Bind the listener. The node id is `host:port` of the bound address.
    pub async fn bind(
        config: NetworkConfig,
        keypair: Keypair,
        chunk_store: Arc<ChunkStore>,
    ) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            TorrentChainError::Network(NetworkError::BindFailed {
                addr: addr.clone(),
                source,
            })
        })?;
        Self::from_listener(listener, config, keypair, chunk_store)
    }

    /// Wrap an already-bound listener
    pub fn from_listener(
        listener: TcpListener,
        config: NetworkConfig,
        keypair: Keypair,
        chunk_store: Arc<ChunkStore>,
    ) -> Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let node_id = format!("{}:{}", config.host, local_addr.port());
        let span = info_span!("network", node_id = %node_id);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            node_id,
            local_addr,
            keypair,
            config,
            chunk_store,
            tables: Mutex::new(PeerTables::default()),
            listener: Mutex::new(Some(listener)),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            span,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunk_store
    }

    /// A receiver that flips to `true` on shutdown, for companion tasks
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn spawn_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut.instrument(self.span.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|h| !h.is_finished());
            tasks.push(handle);
        }
    }

    /// Start accepting inbound connections
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            TorrentChainError::config("network already started")
        })?;
        info!(parent: &self.span, "Node listening on {}", self.local_addr);

        let network = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        self.spawn_task(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            if let Err(e) = network.attach_stream(stream, None).await {
                                warn!("Failed to attach connection from {}: {}", addr, e);
                            }
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Accept loop stopped");
        });
        Ok(())
    }

    /// Dial `addr` (`host:port`) and handshake. Already-connected peers and
    /// our own address are skipped.
    pub async fn connect_to_peer(self: &Arc<Self>, addr: &str) -> Result<()> {
        if addr.rsplit_once(':').and_then(|(_, port)| port.parse::<u16>().ok()).is_none() {
            return Err(TorrentChainError::Network(NetworkError::InvalidAddress {
                addr: addr.to_string(),
            }));
        }
        if addr == self.node_id || self.tables.lock().await.peers.contains_key(addr) {
            return Ok(());
        }

        let stream = TcpStream::connect(addr).await.map_err(|source| {
            error!(parent: &self.span, "Failed to connect to {}: {}", addr, source);
            TorrentChainError::Network(NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                source,
            })
        })?;
        info!(parent: &self.span, "Connected to {}", addr);
        self.attach_stream(stream, Some(addr.to_string())).await?;
        Ok(())
    }

    /// Run the protocol over an established stream.
    ///
    /// With `outbound_peer` set, the peer is registered immediately, our
    /// handshake is sent and heartbeats start; otherwise we wait for the
    /// remote handshake. Returns the connection id.
    pub async fn attach_stream<S: Transport>(
        self: &Arc<Self>,
        stream: S,
        outbound_peer: Option<PeerId>,
    ) -> Result<u64> {
        if self.is_shut_down() {
            return Err(TorrentChainError::Network(NetworkError::ShutDown));
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let framed = Framed::new(stream, frame_codec(self.config.max_frame_length));
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.config.send_queue_capacity.max(1));

        let mut writer_shutdown = self.shutdown_signal();
        self.spawn_task(async move {
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => frame,
                    _ = writer_shutdown.changed() => return,
                };
                let Some(frame) = frame else { break };
                // A peer that stopped reading must not hold up shutdown
                let sent = tokio::select! {
                    sent = sink.send(frame) => sent,
                    _ = writer_shutdown.changed() => return,
                };
                match sent {
                    Ok(()) => {},
                    // The codec refused this frame before writing anything
                    Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                        warn!("Dropping unsendable frame on connection {}: {}", conn_id, e);
                    },
                    Err(e) => {
                        warn!("Connection lost while sending message: {}", e);
                        break;
                    },
                }
            }
            let _ = sink.close().await;
        });

        let mut conn = Connection {
            conn_id,
            tx,
            peer_id: None,
            peer_key: None,
            handshake_sent: false,
        };

        if let Some(peer_id) = outbound_peer {
            self.register_peer(&conn, &peer_id, None, true).await;
            conn.peer_id = Some(peer_id);
            self.send_handshake(&mut conn)?;
            self.spawn_heartbeat(conn_id, conn.tx.clone());
        }

        let network = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        self.spawn_task(async move {
            loop {
                tokio::select! {
                    frame = frames.next() => match frame {
                        Some(Ok(payload)) => network.handle_frame(&mut conn, &payload).await,
                        Some(Err(e)) => {
                            warn!("Read failed on connection {}: {}", conn.conn_id, e);
                            break;
                        }
                        None => {
                            warn!("Connection closed by {}", conn.peer_id.as_deref().unwrap_or("unknown peer"));
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            network.remove_connection(conn.conn_id).await;
        });

        Ok(conn_id)
    }

    fn spawn_heartbeat(self: &Arc<Self>, conn_id: u64, tx: mpsc::Sender<Bytes>) {
        let network = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        self.spawn_task(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = network.send_on(&tx, &Message::Heartbeat {}) {
                            warn!("Heartbeat failed on connection {}: {}", conn_id, e);
                            network.remove_connection(conn_id).await;
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Queue a signed frame without waiting. Oversized frames and frames
    /// that find the queue full are dropped with an error.
    fn send_on(&self, tx: &mpsc::Sender<Bytes>, message: &Message) -> Result<()> {
        let payload = encode_payload(message, &self.keypair, current_time_secs())?;
        let message_type = message.message_type().to_string();
        if payload.len() > self.config.max_frame_length {
            return Err(TorrentChainError::Network(NetworkError::MessageTooLarge {
                message_type,
                size: payload.len(),
                max: self.config.max_frame_length,
            }));
        }
        tx.try_send(Bytes::from(payload)).map_err(|e| {
            let error = match e {
                TrySendError::Full(_) => NetworkError::SendQueueFull { message_type },
                TrySendError::Closed(_) => NetworkError::Disconnected { peer: message_type },
            };
            TorrentChainError::Network(error)
        })
    }

    /// Largest chunk this network can serve in one `chunk_response`
    pub fn max_chunk_size(&self) -> usize {
        max_chunk_size(self.config.max_frame_length)
    }

    fn send_handshake(&self, conn: &mut Connection) -> Result<()> {
        let handshake = Message::Handshake {
            node_id: self.node_id.clone(),
            pub_key: self.keypair.public_key_hex(),
        };
        self.send_on(&conn.tx, &handshake)?;
        conn.handshake_sent = true;
        Ok(())
    }

    /// Send to one connected peer
    pub async fn send_to(&self, peer_id: &str, message: &Message) -> Result<()> {
        let tx = {
            let tables = self.tables.lock().await;
            tables.peers.get(peer_id).map(|p| p.tx.clone())
        };
        match tx {
            Some(tx) => self.send_on(&tx, message),
            None => Err(TorrentChainError::Network(NetworkError::Disconnected {
                peer: peer_id.to_string(),
            })),
        }
    }

    /// Send to every connected peer. Returns how many sends were queued.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let targets: Vec<(PeerId, mpsc::Sender<Bytes>)> = {
            let tables = self.tables.lock().await;
            tables
                .peers
                .iter()
                .map(|(id, p)| (id.clone(), p.tx.clone()))
                .collect()
        };
        let mut sent = 0;
        for (peer_id, tx) in targets {
            match self.send_on(&tx, message) {
                Ok(()) => sent += 1,
                Err(e) => warn!(parent: &self.span, "Broadcast to {} failed: {}", peer_id, e),
            }
        }
        sent
    }

    async fn register_peer(
        &self,
        conn: &Connection,
        peer_id: &str,
        public_key: Option<String>,
        outbound: bool,
    ) {
        let mut tables = self.tables.lock().await;
        let outbound = outbound
            || tables
                .peers
                .get(peer_id)
                .is_some_and(|p| p.conn_id == conn.conn_id && p.info.outbound);
        tables.peers.insert(
            peer_id.to_string(),
            PeerConnection {
                conn_id: conn.conn_id,
                tx: conn.tx.clone(),
                info: PeerInfo {
                    id: peer_id.to_string(),
                    public_key,
                    last_seen: Utc::now(),
                    outbound,
                },
            },
        );
    }

    /// Drop whichever peer is bound to `conn_id` and purge it from routing.
    /// Routing entries themselves stay even if they become empty.
    async fn remove_connection(&self, conn_id: u64) {
        let mut tables = self.tables.lock().await;
        let removed: Vec<PeerId> = tables
            .peers
            .iter()
            .filter(|(_, p)| p.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in removed {
            tables.peers.remove(&peer_id);
            for holders in tables.routing.values_mut() {
                holders.remove(&peer_id);
            }
            info!(parent: &self.span, "Peer removed: {}", peer_id);
        }
    }

    async fn handle_frame(self: &Arc<Self>, conn: &mut Connection, payload: &[u8]) {
        let envelope = match decode_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Invalid message on connection {}: {}", conn.conn_id, e);
                return;
            },
        };

        let is_handshake = matches!(envelope.message, Message::Handshake { .. });
        match &conn.peer_key {
            Some(key) if *key != envelope.sender_key => {
                warn!("Dropping frame signed by unexpected key on connection {}", conn.conn_id);
                return;
            },
            None if !is_handshake => {
                warn!(
                    "Dropping {} received before handshake on connection {}",
                    envelope.message.message_type(),
                    conn.conn_id
                );
                return;
            },
            _ => {},
        }

        if let Some(peer_id) = &conn.peer_id {
            if let Some(peer) = self.tables.lock().await.peers.get_mut(peer_id) {
                peer.info.last_seen = Utc::now();
            }
        }

        debug!("Received {} on connection {}", envelope.message.message_type(), conn.conn_id);
        let sender_key = envelope.sender_key;
        match envelope.message {
            Message::Handshake { node_id, pub_key } => {
                if pub_key != sender_key {
                    warn!("Handshake key does not match signer, dropping");
                    return;
                }
                self.handle_handshake(conn, node_id, pub_key).await;
            },
            Message::ChunkAnnounce {
                chunk_hash,
                chunks,
                peers,
                node_id,
            } => self.handle_chunk_announce(conn, chunk_hash, chunks, peers, node_id).await,
            Message::ChunkRequest { chunk_hash, requestor } => {
                self.handle_chunk_request(conn, &chunk_hash, &requestor).await
            },
            Message::ChunkResponse { chunk_hash, data } => {
                self.handle_chunk_response(conn, &chunk_hash, &data).await
            },
            Message::PeerExchange { peers } => self.handle_peer_exchange(peers).await,
            Message::Heartbeat {} => {},
        }
    }

    async fn handle_handshake(self: &Arc<Self>, conn: &mut Connection, node_id: String, pub_key: String) {
        conn.peer_key = Some(pub_key.clone());
        self.register_peer(conn, &node_id, Some(pub_key), false).await;
        conn.peer_id = Some(node_id.clone());
        info!("Handshake completed with {}", node_id);

        if !conn.handshake_sent {
            if let Err(e) = self.send_handshake(conn) {
                warn!("Failed to answer handshake from {}: {}", node_id, e);
                return;
            }
        }

        let peer_list: Vec<PeerId> = self.tables.lock().await.peers.keys().cloned().collect();
        let inventory = self.chunk_store.chunk_hashes().await;
        let replies = [
            Message::PeerExchange { peers: peer_list },
            Message::announce_inventory(inventory, self.node_id.clone()),
        ];
        for reply in &replies {
            if let Err(e) = self.send_on(&conn.tx, reply) {
                warn!("Failed to send {} to {}: {}", reply.message_type(), node_id, e);
            }
        }
    }

    async fn handle_chunk_announce(
        self: &Arc<Self>,
        conn: &Connection,
        chunk_hash: Option<String>,
        chunks: Vec<String>,
        peers: Vec<String>,
        node_id: String,
    ) {
        let chunk_hash = chunk_hash.filter(|h| is_chunk_hash(h));
        let chunks: Vec<String> = chunks.into_iter().filter(|h| is_chunk_hash(h)).collect();

        let mut announced = Vec::new();
        {
            let mut tables = self.tables.lock().await;
            if let Some(chunk_hash) = chunk_hash {
                let mut holders: HashSet<PeerId> = peers.iter().cloned().collect();
                holders.insert(node_id.clone());
                holders.remove(&self.node_id);
                debug!("Updated routing table for chunk {}", short(&chunk_hash));
                tables.routing.insert(chunk_hash.clone(), holders);
                announced.push(chunk_hash);
            }
            for chunk_hash in chunks {
                tables
                    .routing
                    .entry(chunk_hash.clone())
                    .or_default()
                    .insert(node_id.clone());
                announced.push(chunk_hash);
            }
        }

        for chunk_hash in announced {
            if self.chunk_store.validate(&chunk_hash).await {
                let mut replicas = peers.clone();
                replicas.push(node_id.clone());
                if let Err(e) = self.chunk_store.add_peers(&chunk_hash, &replicas).await {
                    warn!("Failed to record replicas of {}: {}", short(&chunk_hash), e);
                }
            } else if self.config.fetch_announced {
                let request = Message::ChunkRequest {
                    chunk_hash: chunk_hash.clone(),
                    requestor: self.node_id.clone(),
                };
                if let Err(e) = self.send_on(&conn.tx, &request) {
                    warn!("Failed to request chunk {}: {}", short(&chunk_hash), e);
                }
            }
        }
    }

    async fn handle_chunk_request(&self, conn: &Connection, chunk_hash: &str, requestor: &str) {
        match self.chunk_store.retrieve(chunk_hash).await {
            Some(data) => {
                let response = Message::ChunkResponse {
                    chunk_hash: chunk_hash.to_string(),
                    data: hex::encode(data),
                };
                if let Err(e) = self.send_on(&conn.tx, &response) {
                    warn!("Failed to answer {} for chunk {}: {}", requestor, short(chunk_hash), e);
                }
            },
            None => warn!("Requested chunk not found: {}", short(chunk_hash)),
        }
    }

    async fn handle_chunk_response(&self, conn: &Connection, chunk_hash: &str, data: &str) {
        let bytes = match hex::decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Undecodable chunk data for {}: {}", short(chunk_hash), e);
                return;
            },
        };
        if content_hash(&bytes) != chunk_hash {
            warn!("Received invalid chunk: {}", short(chunk_hash));
            return;
        }

        let replicas: Vec<String> = conn.peer_id.iter().cloned().collect();
        match self.chunk_store.store(chunk_hash, &bytes, replicas).await {
            Ok(true) => info!("Stored new chunk: {}", short(chunk_hash)),
            Ok(false) => warn!("Received invalid chunk: {}", short(chunk_hash)),
            Err(e) => error!("Failed to store received chunk {}: {}", short(chunk_hash), e),
        }
    }

    async fn handle_peer_exchange(self: &Arc<Self>, peers: Vec<PeerId>) {
        let unknown: Vec<PeerId> = {
            let tables = self.tables.lock().await;
            let room = self.config.max_peers.saturating_sub(tables.peers.len());
            peers
                .into_iter()
                .filter(|p| *p != self.node_id && !tables.peers.contains_key(p))
                .take(room)
                .collect()
        };
        for peer in unknown {
            self.dial_in_background(peer);
        }
    }

    /// Boxed so the read loop's future type does not contain itself
    fn dial_in_background(self: &Arc<Self>, peer: PeerId) {
        let network = Arc::clone(self);
        let dial: BoxFuture<'static, ()> = Box::pin(async move {
            // Failure is already logged by connect_to_peer
            let _ = network.connect_to_peer(&peer).await;
        });
        self.spawn_task(dial);
    }

    /// Local chunk if present; otherwise ask every peer and return `None`.
    /// Any later response is verified and stored independently.
    pub async fn get_chunk(&self, chunk_hash: &str) -> Option<Vec<u8>> {
        if let Some(data) = self.chunk_store.retrieve(chunk_hash).await {
            return Some(data);
        }
        let request = Message::ChunkRequest {
            chunk_hash: chunk_hash.to_string(),
            requestor: self.node_id.clone(),
        };
        let asked = self.broadcast(&request).await;
        debug!(parent: &self.span, "Requested chunk {} from {} peers", short(chunk_hash), asked);
        None
    }

    /// Store `data` locally and announce it. Chunks too large to answer a
    /// request with are refused. Failing to store is a local integrity error,
    /// not a miss.
    pub async fn publish_chunk(&self, data: &[u8], replica_peers: Vec<String>) -> Result<String> {
        let max = self.max_chunk_size();
        if data.len() > max {
            return Err(TorrentChainError::Network(NetworkError::ChunkTooLarge {
                size: data.len(),
                max,
            }));
        }
        let chunk_hash = content_hash(data);
        if !self.chunk_store.store(&chunk_hash, data, replica_peers.clone()).await? {
            return Err(TorrentChainError::Storage(StorageError::Integrity {
                chunk_hash,
                reason: "chunk rejected by local store".to_string(),
            }));
        }

        let mut peers = replica_peers;
        if !peers.contains(&self.node_id) {
            peers.push(self.node_id.clone());
        }
        let announcement = Message::announce_chunk(chunk_hash.clone(), peers, self.node_id.clone());
        let sent = self.broadcast(&announcement).await;
        info!(parent: &self.span, "Published chunk {} to {} peers", short(&chunk_hash), sent);
        Ok(chunk_hash)
    }

    /// Snapshot of connected peers
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let tables = self.tables.lock().await;
        let mut peers: Vec<PeerInfo> = tables.peers.values().map(|p| p.info.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn peer_count(&self) -> usize {
        self.tables.lock().await.peers.len()
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.tables.lock().await.peers.contains_key(peer_id)
    }

    /// Peers believed to hold `chunk_hash`, or `None` if never announced
    pub async fn chunk_holders(&self, chunk_hash: &str) -> Option<Vec<PeerId>> {
        let tables = self.tables.lock().await;
        tables.routing.get(chunk_hash).map(|holders| {
            let mut holders: Vec<PeerId> = holders.iter().cloned().collect();
            holders.sort();
            holders
        })
    }

    /// Signal every task to stop and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.tables.lock().await.peers.clear();

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                warn!(parent: &self.span, "Task did not stop within 5s, aborting");
                handle.abort();
            }
        }
        info!(parent: &self.span, "Network shut down");
    }
}
