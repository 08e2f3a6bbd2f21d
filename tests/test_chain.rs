use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use torrentchain::block::ZERO_HASH;
use torrentchain::chain::{mine_in_background, seal_block};
use torrentchain::error::CryptoError;
use torrentchain::utils::ManualClock;
use torrentchain::{BlockValidation, Chain, ChainConfig, TorrentChainError};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

fn fast_config() -> ChainConfig {
    ChainConfig {
        initial_difficulty: 1,
        hash_iterations: 1,
        ..ChainConfig::default()
    }
}

fn clocked(config: ChainConfig) -> (Chain, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let chain = Chain::with_clock(config, clock.clone());
    (chain, clock)
}

#[test]
fn test_genesis_block() {
    let chain = Chain::new(fast_config());
    let genesis = chain.last_block();

    assert_eq!(chain.len(), 1);
    assert!(genesis.is_genesis());
    assert_eq!(genesis.previous_hash, ZERO_HASH);
    assert_eq!(genesis.transactions, vec!["GenesisBlock".to_string()]);
    assert_eq!(genesis.useful_work_data, "GenesisBlock");
    assert!(genesis.hash.starts_with('0'));
    assert!(chain.validate_chain().is_ok());
}

#[test]
fn test_mine_without_transactions_is_noop() {
    let mut chain = Chain::new(fast_config());
    assert!(chain.mine().is_none());
    assert_eq!(chain.len(), 1);
}

#[test]
fn test_mine_single_transaction() {
    let mut chain = Chain::new(fast_config());
    chain.add_transaction("tx1");

    let block = chain.mine().expect("block mined");
    assert_eq!(block.index, 1);
    assert_eq!(block.transactions, vec!["tx1".to_string()]);
    assert_eq!(block.useful_work_data, "tx1");
    assert_eq!(block.previous_hash, chain.block_at(0).unwrap().hash);
    assert!(block.hash.starts_with('0'));
    assert_eq!(block.hash, block.calculate_hash(1));
    assert!(chain.pending_transactions().is_empty());
    assert_eq!(chain.len(), 2);
}

#[test]
fn test_append_rejects_wrong_previous_hash() {
    let mut chain = Chain::new(fast_config());
    chain.add_transaction("tx1");
    let mut block = chain.candidate_block().unwrap();
    block.previous_hash = "f".repeat(64);
    seal_block(&mut block, 1, &AtomicBool::new(false));

    assert_eq!(chain.append(block), BlockValidation::PreviousHashMismatch);
    assert_eq!(chain.len(), 1);
}

#[test]
fn test_append_rejects_tampered_block() {
    let mut chain = Chain::new(fast_config());
    chain.add_transaction("tx1");
    let mut block = chain.candidate_block().unwrap();
    seal_block(&mut block, 1, &AtomicBool::new(false));

    let mut tampered = block.clone();
    tampered.transactions = vec!["tx2".to_string()];
    assert_eq!(chain.is_valid_block(&tampered), BlockValidation::HashMismatch);

    let mut wrong_work = block.clone();
    wrong_work.useful_work_data = "other".to_string();
    seal_block(&mut wrong_work, 1, &AtomicBool::new(false));
    assert_eq!(chain.is_valid_block(&wrong_work), BlockValidation::UsefulWorkMismatch);

    assert!(chain.append(block).is_accepted());
}

#[test]
fn test_difficulty_rises_when_blocks_come_fast() {
    let config = ChainConfig {
        adjustment_interval: 2,
        target_block_time_secs: 1.0,
        ..fast_config()
    };
    let (mut chain, clock) = clocked(config);

    for tx in ["a", "b"] {
        clock.advance(Duration::from_millis(100));
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }

    assert_eq!(chain.difficulty(), 2);
    assert!(chain.validate_chain().is_ok());
}

#[test]
fn test_difficulty_falls_by_one_when_blocks_come_slow() {
    let config = ChainConfig {
        initial_difficulty: 2,
        adjustment_interval: 2,
        target_block_time_secs: 1.0,
        ..fast_config()
    };
    let (mut chain, clock) = clocked(config);

    for tx in ["a", "b"] {
        clock.advance(Duration::from_secs(5));
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }
    assert_eq!(chain.difficulty(), 1);

    // Never below one
    for tx in ["c", "d"] {
        clock.advance(Duration::from_secs(5));
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }
    assert_eq!(chain.difficulty(), 1);
}

#[test]
fn test_difficulty_steady_inside_band() {
    let config = ChainConfig {
        adjustment_interval: 2,
        target_block_time_secs: 1.0,
        ..fast_config()
    };
    let (mut chain, clock) = clocked(config);

    for tx in ["a", "b"] {
        clock.advance(Duration::from_secs(1));
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }
    assert_eq!(chain.difficulty(), 1);
}

#[test]
fn test_restored_chain_validates_and_detects_breaks() {
    let mut chain = Chain::new(fast_config());
    for tx in ["a", "b", "c"] {
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }

    let clock = Arc::new(ManualClock::starting_now());
    let restored =
        Chain::from_blocks(fast_config(), chain.blocks().to_vec(), clock.clone()).unwrap();
    assert_eq!(restored.len(), 4);
    assert!(restored.validate_chain().is_ok());

    let mut blocks = chain.blocks().to_vec();
    blocks[2].nonce += 1;
    let broken = Chain::from_blocks(fast_config(), blocks, clock.clone()).unwrap();
    assert!(broken.validate_chain().is_err());

    assert!(Chain::from_blocks(fast_config(), Vec::new(), clock).is_err());
}

#[test]
fn test_restored_chain_keeps_adjusted_difficulty() {
    let config = ChainConfig {
        adjustment_interval: 2,
        target_block_time_secs: 1.0,
        ..fast_config()
    };
    let (mut chain, clock) = clocked(config.clone());
    for tx in ["a", "b"] {
        clock.advance(Duration::from_millis(100));
        chain.add_transaction(tx);
        chain.mine().expect("mined");
    }
    // The head was sealed at 1; appending it raised the working difficulty
    assert_eq!(chain.last_block().difficulty, 1);
    assert_eq!(chain.difficulty(), 2);

    let mut restored = Chain::from_blocks(config.clone(), chain.blocks().to_vec(), clock.clone()).unwrap();
    assert_eq!(restored.difficulty(), 2);

    clock.advance(Duration::from_secs(1));
    restored.add_transaction("c");
    let next = restored.mine().expect("mined");
    assert_eq!(next.difficulty, 2);
    assert!(next.hash.starts_with("00"));

    // Inside an interval the head's own difficulty carries over
    let partial = chain.blocks()[..2].to_vec();
    let restored = Chain::from_blocks(config, partial, clock).unwrap();
    assert_eq!(restored.difficulty(), 1);
}

#[derive(Clone, Default)]
struct EventSpans(Arc<std::sync::Mutex<Vec<Option<&'static str>>>>);

impl<S> Layer<S> for EventSpans
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let span = ctx.event_span(event).map(|span| span.name());
        self.0.lock().unwrap().push(span);
    }
}

#[test]
fn test_chain_logs_inside_injected_span() {
    let spans = EventSpans::default();
    let subscriber = tracing_subscriber::registry().with(spans.clone());
    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("node", node_id = "127.0.0.1:21000");
        let clock = Arc::new(ManualClock::starting_now());
        let mut chain = Chain::new_in_span(fast_config(), clock, span);
        chain.add_transaction("tx1");
        chain.mine().expect("mined");
    });

    let recorded = spans.0.lock().unwrap();
    // Genesis, append and mined lines at least
    assert!(recorded.len() >= 3);
    assert!(recorded.iter().all(|span| *span == Some("node")));
}

#[test]
fn test_mine_with_cancel_leaves_chain_untouched() {
    let mut chain = Chain::new(fast_config());
    chain.set_difficulty(64);
    chain.add_transaction("tx1");

    let stop = AtomicBool::new(true);
    assert!(chain.mine_with_cancel(&stop).is_none());
    assert_eq!(chain.len(), 1);
    assert_eq!(chain.pending_transactions(), ["tx1".to_string()]);
}

#[tokio::test]
async fn test_background_mining_appends_block() {
    let chain = Arc::new(Mutex::new(Chain::new(fast_config())));
    chain.lock().await.add_transaction("tx1");

    let block = mine_in_background(chain.clone(), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap()
        .expect("block mined");
    assert_eq!(block.index, 1);
    assert_eq!(chain.lock().await.len(), 2);
}

#[tokio::test]
async fn test_background_mining_can_be_cancelled() {
    let chain = Arc::new(Mutex::new(Chain::new(fast_config())));
    {
        let mut chain = chain.lock().await;
        chain.set_difficulty(64);
        chain.add_transaction("tx1");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mining = tokio::spawn(mine_in_background(chain.clone(), stop.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The chain lock is free while the search runs
    assert_eq!(chain.lock().await.len(), 1);
    stop.store(true, Ordering::Relaxed);

    let result = mining.await.unwrap();
    assert!(matches!(
        result,
        Err(TorrentChainError::Crypto(CryptoError::ProofOfWorkCancelled))
    ));
    assert_eq!(chain.lock().await.len(), 1);
}
