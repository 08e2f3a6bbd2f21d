use std::sync::Arc;
use torrentchain::crypto::hash::content_hash;
use torrentchain::crypto::Keypair;
use torrentchain::storage::{FileStorage, Storage};
use torrentchain::{ChainConfig, NodeConfig, Result, TorrentChainNode};

fn fast_config() -> NodeConfig {
    NodeConfig {
        chain: ChainConfig {
            initial_difficulty: 1,
            hash_iterations: 1,
            ..ChainConfig::default()
        },
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn test_node_initialization() -> Result<()> {
    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .host("127.0.0.1")
        .port(0)
        .max_peers(3)
        .build()
        .await?;

    assert_ne!(node.port(), 0);
    assert_eq!(node.id(), format!("127.0.0.1:{}", node.port()));
    assert_eq!(node.config().network.max_peers, 3);
    assert_eq!(node.chain_height().await, 1);
    assert_eq!(node.difficulty().await, 1);
    assert!(!node.is_running().await);
    Ok(())
}

#[tokio::test]
async fn test_node_start_stop() -> Result<()> {
    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .port(0)
        .build()
        .await?;

    node.start().await?;
    assert!(node.is_running().await);
    // The listener can only be taken once
    assert!(node.start().await.is_err());

    node.stop().await?;
    assert!(!node.is_running().await);
    Ok(())
}

#[tokio::test]
async fn test_published_chunk_is_mined_into_a_block() -> Result<()> {
    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .port(0)
        .build()
        .await?;
    node.start().await?;

    let chunk_hash = node.publish_chunk(b"block me", Vec::new()).await?;
    assert_eq!(node.get_chunk(&chunk_hash).await, Some(b"block me".to_vec()));

    let block = node.mine().await?.expect("block mined");
    assert_eq!(block.index, 1);
    assert_eq!(block.transactions, vec![chunk_hash.clone()]);
    assert_eq!(block.useful_work_data, chunk_hash);
    assert_eq!(node.chain_height().await, 2);
    assert!(node.chain().lock().await.validate_chain().is_ok());

    // Nothing left to mine
    assert!(node.mine().await?.is_none());

    let state = node.get_state().await?;
    assert_eq!(state["chain_height"], 2);
    assert_eq!(state["chunks"], 1);
    assert_eq!(state["running"], true);

    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_chunks_survive_restart_on_file_storage() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let chunk_hash = content_hash(b"durable");

    {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
        let node = TorrentChainNode::builder()
            .with_config(fast_config())
            .with_storage(storage)
            .port(0)
            .build()
            .await?;
        node.publish_chunk(b"durable", Vec::new()).await?;
    }

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .with_storage(storage)
        .port(0)
        .build()
        .await?;
    assert_eq!(node.get_chunk(&chunk_hash).await, Some(b"durable".to_vec()));
    Ok(())
}

#[tokio::test]
async fn test_storage_dir_is_per_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .with_storage_dir(dir.path())
        .port(0)
        .build()
        .await?;
    node.publish_chunk(b"filed", Vec::new()).await?;

    let node_dir = dir.path().join(node.id().replace(':', "_"));
    assert!(node_dir.join(format!("{}.chunk", content_hash(b"filed"))).exists());
    assert!(node_dir.join("metadata.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_keypair_is_used_for_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("node.key");
    let keypair = Keypair::load_or_generate(&key_path).await?;
    let reloaded = Keypair::load_or_generate(&key_path).await?;
    assert_eq!(keypair.public_key_hex(), reloaded.public_key_hex());

    let node = TorrentChainNode::builder()
        .with_config(fast_config())
        .with_keypair(reloaded)
        .port(0)
        .build()
        .await?;
    assert_eq!(node.network().public_key_hex(), keypair.public_key_hex());
    Ok(())
}

#[test]
fn test_node_config_from_partial_json() {
    let config: NodeConfig = serde_json::from_str(
        r#"{ "chain": { "initial_difficulty": 3 }, "chunk_store": { "peer_merge": "union" } }"#,
    )
    .unwrap();
    assert_eq!(config.chain.initial_difficulty, 3);
    assert_eq!(config.chain.hash_iterations, 1000);
    assert_eq!(config.chunk_store.chunk_ttl_secs, 604_800);
    assert_eq!(config.network.port, torrentchain::DEFAULT_PORT);
    assert_eq!(config.chunk_store.peer_merge, torrentchain::PeerMergePolicy::Union);
}
