//! Block structure and canonical hashing

use crate::crypto::{hash::sequential_hash, pow::meets_difficulty};
use crate::utils::current_time_secs;
use serde::{Deserialize, Serialize};

/// Previous-hash sentinel for the genesis block
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A block of opaque transaction identifiers sealed by proof of useful work.
///
/// `hash` always equals [`Block::calculate_hash`] over the other fields for
/// any block accepted into a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub transactions: Vec<String>,
    pub previous_hash: String,
    pub nonce: u64,
    pub useful_work_data: String,
    pub difficulty: u32,
    pub hash: String,
}

impl Block {
    /// Build an unsealed block stamped with the current time and hash it once
    pub fn new(
        index: u64,
        transactions: Vec<String>,
        previous_hash: impl Into<String>,
        difficulty: u32,
        nonce: u64,
        useful_work_data: impl Into<String>,
        hash_iterations: u32,
    ) -> Self {
        Self::with_timestamp(
            index,
            current_time_secs(),
            transactions,
            previous_hash,
            difficulty,
            nonce,
            useful_work_data,
            hash_iterations,
        )
    }

    /// Same as [`Block::new`] with an explicit timestamp
    #[allow(clippy::too_many_arguments)]
    pub fn with_timestamp(
        index: u64,
        timestamp: f64,
        transactions: Vec<String>,
        previous_hash: impl Into<String>,
        difficulty: u32,
        nonce: u64,
        useful_work_data: impl Into<String>,
        hash_iterations: u32,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp,
            transactions,
            previous_hash: previous_hash.into(),
            nonce,
            useful_work_data: useful_work_data.into(),
            difficulty,
            hash: String::new(),
        };
        block.rehash(hash_iterations);
        block
    }

    /// Field serialization fed to the hash, in fixed order:
    /// index, timestamp, transactions, previous_hash, nonce, useful_work_data, difficulty.
    pub fn canonical_string(&self) -> String {
        // A JSON array of strings cannot fail to serialize
        let transactions = serde_json::to_string(&self.transactions).unwrap_or_default();
        format!(
            "{}{:.6}{}{}{}{}{}",
            self.index,
            self.timestamp,
            transactions,
            self.previous_hash,
            self.nonce,
            self.useful_work_data,
            self.difficulty
        )
    }

    /// Re-derive the hash from the current field values
    pub fn calculate_hash(&self, hash_iterations: u32) -> String {
        sequential_hash(self.canonical_string().as_bytes(), hash_iterations)
    }

    /// Recompute and store the hash
    pub fn rehash(&mut self, hash_iterations: u32) {
        self.hash = self.calculate_hash(hash_iterations);
    }

    /// Whether the stored hash satisfies the block's own difficulty
    pub fn meets_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}
