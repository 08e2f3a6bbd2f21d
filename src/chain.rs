//! Chain of sealed blocks with dead-band difficulty adjustment

use crate::block::{Block, ZERO_HASH};
use crate::crypto::pow::{derive_useful_work, meets_difficulty, DEFAULT_HASH_ITERATIONS};
use crate::error::{CryptoError, Result, TorrentChainError};
use crate::utils::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Span};

/// Chain parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Difficulty used to seal genesis and the first blocks
    pub initial_difficulty: u32,
    /// Desired seconds between blocks
    pub target_block_time_secs: f64,
    /// Recompute difficulty every this many blocks
    pub adjustment_interval: u64,
    /// Sequential hash rounds used for block hashes
    pub hash_iterations: u32,
    /// Sole transaction of the genesis block
    pub genesis_marker: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: 2,
            target_block_time_secs: 10.0,
            adjustment_interval: 10,
            hash_iterations: DEFAULT_HASH_ITERATIONS,
            genesis_marker: "GenesisBlock".to_string(),
        }
    }
}

/// Outcome of checking a block against the chain head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidation {
    Accepted,
    /// `previous_hash` does not match the head's hash
    PreviousHashMismatch,
    /// Stored hash differs from the recomputed one
    HashMismatch,
    /// Hash lacks the leading zeros its difficulty demands
    InsufficientWork,
    /// `useful_work_data` is not derived from the block's transactions
    UsefulWorkMismatch,
}

impl BlockValidation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BlockValidation::Accepted)
    }
}

impl fmt::Display for BlockValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            BlockValidation::Accepted => "accepted",
            BlockValidation::PreviousHashMismatch => "previous hash mismatch",
            BlockValidation::HashMismatch => "hash mismatch",
            BlockValidation::InsufficientWork => "insufficient work",
            BlockValidation::UsefulWorkMismatch => "useful work mismatch",
        };
        f.write_str(reason)
    }
}

/// Increment the nonce from its current value until the block's hash meets
/// its difficulty. Returns `false` if `should_stop` was raised first.
pub fn seal_block(block: &mut Block, hash_iterations: u32, should_stop: &AtomicBool) -> bool {
    block.rehash(hash_iterations);
    while !block.meets_difficulty() {
        if should_stop.load(Ordering::Relaxed) {
            return false;
        }
        block.nonce = block.nonce.wrapping_add(1);
        block.rehash(hash_iterations);
    }
    true
}

/// Ordered sequence of sealed blocks, always starting with genesis
pub struct Chain {
    config: ChainConfig,
    blocks: Vec<Block>,
    difficulty: u32,
    pending_transactions: Vec<String>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("height", &self.blocks.len())
            .field("difficulty", &self.difficulty)
            .field("pending", &self.pending_transactions.len())
            .finish()
    }
}

impl Chain {
    /// Create a chain and mine its genesis block
    pub fn new(config: ChainConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a chain whose timestamps come from `clock`
    pub fn with_clock(config: ChainConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new_in_span(config, clock, info_span!("chain"))
    }

    /// Create a chain that logs under `span`, genesis included
    pub fn new_in_span(config: ChainConfig, clock: Arc<dyn Clock>, span: Span) -> Self {
        let mut chain = Self {
            difficulty: config.initial_difficulty.max(1),
            config,
            blocks: Vec::new(),
            pending_transactions: Vec::new(),
            clock,
            span,
        };
        let genesis = chain.create_genesis();
        info!(parent: &chain.span, "Genesis block sealed: {}", genesis.hash);
        chain.blocks.push(genesis);
        chain
    }

    /// Restore a chain from already-sealed blocks without re-validating them.
    /// Use [`Chain::validate_chain`] to check them.
    ///
    /// The working difficulty is the head's, re-adjusted if the head closed an
    /// adjustment interval, so the next block is sealed as if the chain had
    /// never been reloaded.
    pub fn from_blocks(
        config: ChainConfig,
        blocks: Vec<Block>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let head = blocks
            .last()
            .ok_or_else(|| TorrentChainError::consensus("chain must contain a genesis block"))?;
        let head_index = head.index;
        let mut chain = Self {
            difficulty: head.difficulty.max(1),
            config,
            blocks,
            pending_transactions: Vec::new(),
            clock,
            span: info_span!("chain"),
        };
        if chain.closes_interval(head_index) {
            chain.adjust_difficulty();
        }
        Ok(chain)
    }

    /// Replace the diagnostics span used for this chain's log lines
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn closes_interval(&self, index: u64) -> bool {
        index != 0 && index % self.config.adjustment_interval.max(1) == 0
    }

    /// Build and seal the genesis block at the current difficulty
    pub fn create_genesis(&self) -> Block {
        let transactions = vec![self.config.genesis_marker.clone()];
        let useful_work = derive_useful_work(&transactions);
        let mut genesis = Block::with_timestamp(
            0,
            self.clock.now_secs(),
            transactions,
            ZERO_HASH,
            self.difficulty,
            0,
            useful_work,
            self.config.hash_iterations,
        );
        seal_block(&mut genesis, self.config.hash_iterations, &AtomicBool::new(false));
        genesis
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_at(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// The head of the chain. Genesis guarantees it exists.
    pub fn last_block(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty.max(1);
    }

    pub fn add_transaction(&mut self, transaction: impl Into<String>) {
        self.pending_transactions.push(transaction.into());
    }

    pub fn pending_transactions(&self) -> &[String] {
        &self.pending_transactions
    }

    /// Check a block against the current head without appending it
    pub fn is_valid_block(&self, block: &Block) -> BlockValidation {
        if block.previous_hash != self.last_block().hash {
            return BlockValidation::PreviousHashMismatch;
        }
        check_block_contents(block, self.config.hash_iterations)
    }

    /// Append a block if it extends the head and is correctly sealed.
    ///
    /// Rejections are ordinary outcomes, not errors.
    pub fn append(&mut self, block: Block) -> BlockValidation {
        let verdict = self.is_valid_block(&block);
        if !verdict.is_accepted() {
            warn!(parent: &self.span, "Rejected block {}: {}", block.index, verdict);
            return verdict;
        }

        let index = block.index;
        debug!(parent: &self.span, "Appended block {} ({})", index, block.hash);
        self.blocks.push(block);

        if self.closes_interval(index) {
            self.adjust_difficulty();
        }
        BlockValidation::Accepted
    }

    /// Unsealed block for the pending transactions, or `None` if there are none
    pub fn candidate_block(&self) -> Option<Block> {
        if self.pending_transactions.is_empty() {
            return None;
        }
        let head = self.last_block();
        let transactions = self.pending_transactions.clone();
        let useful_work = derive_useful_work(&transactions);
        Some(Block::with_timestamp(
            head.index + 1,
            self.clock.now_secs(),
            transactions,
            head.hash.clone(),
            self.difficulty,
            0,
            useful_work,
            self.config.hash_iterations,
        ))
    }

    /// Seal and append a block of all pending transactions
    pub fn mine(&mut self) -> Option<Block> {
        self.mine_with_cancel(&AtomicBool::new(false))
    }

    /// Like [`Chain::mine`], abandoning the search when `should_stop` is raised
    pub fn mine_with_cancel(&mut self, should_stop: &AtomicBool) -> Option<Block> {
        let mut candidate = self.candidate_block()?;
        if !seal_block(&mut candidate, self.config.hash_iterations, should_stop) {
            info!(parent: &self.span, "Mining of block {} cancelled", candidate.index);
            return None;
        }
        self.commit_mined(candidate)
    }

    /// Append a block sealed elsewhere and drop the transactions it included
    /// from the front of the pending queue.
    fn commit_mined(&mut self, block: Block) -> Option<Block> {
        if !self.append(block.clone()).is_accepted() {
            return None;
        }
        let included = block.transactions.len();
        if self.pending_transactions.starts_with(&block.transactions) {
            self.pending_transactions.drain(..included);
        } else {
            self.pending_transactions
                .retain(|tx| !block.transactions.contains(tx));
        }
        info!(
            parent: &self.span,
            "Mined block {} with {} transactions at difficulty {}",
            block.index, included, block.difficulty
        );
        Some(block)
    }

    /// Raise difficulty by one if the last interval was sealed in under half
    /// the expected time, lower it by one (never below 1) if it took more than
    /// double. Inside that band nothing changes.
    pub fn adjust_difficulty(&mut self) {
        let interval = self.config.adjustment_interval as usize;
        if self.blocks.len() <= interval {
            return;
        }

        let reference = &self.blocks[self.blocks.len() - interval - 1];
        let actual_time = self.last_block().timestamp - reference.timestamp;
        let expected_time = self.config.target_block_time_secs * interval as f64;

        let previous = self.difficulty;
        if actual_time < expected_time / 2.0 {
            self.difficulty += 1;
        } else if actual_time > expected_time * 2.0 {
            self.difficulty = self.difficulty.saturating_sub(1).max(1);
        }

        if self.difficulty != previous {
            info!(
                parent: &self.span,
                "Difficulty adjusted {} -> {} (actual {:.3}s, expected {:.3}s)",
                previous, self.difficulty, actual_time, expected_time
            );
        }
    }

    /// Re-check linkage, hashes, work and useful-work derivation of every block
    pub fn validate_chain(&self) -> Result<()> {
        for (i, block) in self.blocks.iter().enumerate() {
            let verdict = match i {
                0 if block.previous_hash != ZERO_HASH => BlockValidation::PreviousHashMismatch,
                0 => check_block_contents(block, self.config.hash_iterations),
                _ if block.previous_hash != self.blocks[i - 1].hash => {
                    BlockValidation::PreviousHashMismatch
                },
                _ => check_block_contents(block, self.config.hash_iterations),
            };
            if !verdict.is_accepted() {
                return Err(TorrentChainError::validation(format!(
                    "block {} invalid: {}",
                    block.index, verdict
                )));
            }
        }
        Ok(())
    }
}

fn check_block_contents(block: &Block, hash_iterations: u32) -> BlockValidation {
    if block.hash != block.calculate_hash(hash_iterations) {
        return BlockValidation::HashMismatch;
    }
    if !meets_difficulty(&block.hash, block.difficulty) {
        return BlockValidation::InsufficientWork;
    }
    if block.useful_work_data != derive_useful_work(&block.transactions) {
        return BlockValidation::UsefulWorkMismatch;
    }
    BlockValidation::Accepted
}

/// Mine the pending transactions on a blocking worker without holding the
/// chain lock during the nonce search.
///
/// Raising `should_stop` abandons the search with
/// [`CryptoError::ProofOfWorkCancelled`]. If the head moved while sealing the
/// append is rejected and `Ok(None)` is returned.
pub async fn mine_in_background(
    chain: Arc<Mutex<Chain>>,
    should_stop: Arc<AtomicBool>,
) -> Result<Option<Block>> {
    let (candidate, hash_iterations) = {
        let chain = chain.lock().await;
        match chain.candidate_block() {
            Some(candidate) => (candidate, chain.config.hash_iterations),
            None => return Ok(None),
        }
    };

    let sealed = tokio::task::spawn_blocking(move || {
        let mut block = candidate;
        seal_block(&mut block, hash_iterations, &should_stop).then_some(block)
    })
    .await
    .map_err(|e| TorrentChainError::consensus(format!("Mining task failed: {}", e)))?;

    let block = sealed.ok_or(TorrentChainError::Crypto(CryptoError::ProofOfWorkCancelled))?;
    let mut chain = chain.lock().await;
    Ok(chain.commit_mined(block))
}
