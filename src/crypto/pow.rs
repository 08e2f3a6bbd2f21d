//! Proof of Useful Work implementation
//!
//! The "useful work" is a commitment derived from a transaction set. A proof
//! is a nonce such that the sequential hash of `useful_work || nonce` starts
//! with `difficulty` hexadecimal zeros.

use crate::crypto::hash::sequential_hash;
use crate::crypto::KeylessCryptoPrimitive;
use crate::error::{CryptoError, Result, TorrentChainError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task;

/// Default number of chained SHA-256 rounds per candidate
pub const DEFAULT_HASH_ITERATIONS: u32 = 1000;

/// Proof of useful work parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfWorkConfig {
    /// Number of leading hex zeros required
    pub difficulty: u32,
    /// Sequential hash rounds applied to every candidate
    pub hash_iterations: u32,
    /// Number of worker threads to use for the nonce search
    pub threads: usize,
}

impl Default for ProofOfWorkConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            hash_iterations: DEFAULT_HASH_ITERATIONS,
            threads: num_cpus::get(),
        }
    }
}

/// The transaction set a proof commits to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsefulWorkChallenge {
    pub transactions: Vec<String>,
}

impl UsefulWorkChallenge {
    pub fn new<I, T>(transactions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            transactions: transactions.into_iter().map(Into::into).collect(),
        }
    }
}

/// A solved search: the nonce, the useful-work buffer and the final hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsefulWorkProof {
    pub nonce: u64,
    pub useful_work: String,
    pub hash: String,
}

/// Concatenate the transactions, in order, into the useful-work buffer.
///
/// Empty input yields an empty buffer.
pub fn derive_useful_work<T: AsRef<str>>(transactions: &[T]) -> String {
    transactions.iter().map(AsRef::as_ref).collect()
}

/// Check if hash meets difficulty requirement
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Hash of a single candidate nonce
pub fn candidate_hash(useful_work: &str, nonce: u64, iterations: u32) -> String {
    sequential_hash(format!("{}{}", useful_work, nonce).as_bytes(), iterations)
}

/// Sequential nonce search over the useful-work buffer of `transactions`.
///
/// Starts at nonce zero and has no upper bound; it only returns once a
/// satisfying hash is found.
pub fn search_proof_of_work<T: AsRef<str>>(
    transactions: &[T],
    difficulty: u32,
    iterations: u32,
) -> UsefulWorkProof {
    let useful_work = derive_useful_work(transactions);
    let mut nonce: u64 = 0;
    loop {
        let hash = candidate_hash(&useful_work, nonce, iterations);
        if meets_difficulty(&hash, difficulty) {
            return UsefulWorkProof {
                nonce,
                useful_work,
                hash,
            };
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Multi-threaded, cancellable proof of useful work
#[derive(Debug, Clone)]
pub struct ProofOfUsefulWork {
    config: ProofOfWorkConfig,
}

impl ProofOfUsefulWork {
    /// Create a new instance with default configuration
    pub fn new() -> Self {
        Self {
            config: ProofOfWorkConfig::default(),
        }
    }

    /// Create a new instance with custom configuration
    pub fn with_config(config: ProofOfWorkConfig) -> Self {
        Self { config }
    }

    /// Create an instance with specified difficulty and hash rounds
    pub fn with_difficulty(difficulty: u32, hash_iterations: u32) -> Self {
        Self {
            config: ProofOfWorkConfig {
                difficulty,
                hash_iterations,
                ..ProofOfWorkConfig::default()
            },
        }
    }

    /// Search one stride of the nonce space on a blocking thread
    async fn search_worker(
        useful_work: Arc<String>,
        difficulty: u32,
        iterations: u32,
        start_nonce: u64,
        nonce_step: u64,
        should_stop: Arc<AtomicBool>,
        found: Arc<AtomicBool>,
    ) -> Option<UsefulWorkProof> {
        task::spawn_blocking(move || {
            let mut nonce = start_nonce;

            while !should_stop.load(Ordering::Relaxed) && !found.load(Ordering::Relaxed) {
                let hash = candidate_hash(&useful_work, nonce, iterations);

                if meets_difficulty(&hash, difficulty) {
                    found.store(true, Ordering::Relaxed);
                    return Some(UsefulWorkProof {
                        nonce,
                        useful_work: useful_work.to_string(),
                        hash,
                    });
                }

                nonce = match nonce.checked_add(nonce_step) {
                    Some(next) => next,
                    None => break,
                };
            }

            None
        })
        .await
        .unwrap_or(None)
    }

    /// Search for a proof, sharding the nonce space across worker threads.
    ///
    /// Setting `should_stop` abandons the search with
    /// [`CryptoError::ProofOfWorkCancelled`]. Any satisfying nonce may win.
    pub async fn search(
        &self,
        challenge: &UsefulWorkChallenge,
        should_stop: Arc<AtomicBool>,
    ) -> Result<UsefulWorkProof> {
        let useful_work = Arc::new(derive_useful_work(&challenge.transactions));
        let found = Arc::new(AtomicBool::new(false));
        let threads = self.config.threads.max(1);
        let nonce_step = threads as u64;

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                task::spawn(Self::search_worker(
                    useful_work.clone(),
                    self.config.difficulty,
                    self.config.hash_iterations,
                    i as u64,
                    nonce_step,
                    should_stop.clone(),
                    found.clone(),
                ))
            })
            .collect();

        let mut solution = None;
        for handle in handles {
            if let Ok(Some(proof)) = handle.await {
                if solution.is_none() {
                    solution = Some(proof);
                }
            }
        }

        solution.ok_or(TorrentChainError::Crypto(CryptoError::ProofOfWorkCancelled))
    }

    /// Verify a proof against its challenge
    pub fn verify_sync(&self, challenge: &UsefulWorkChallenge, proof: &UsefulWorkProof) -> bool {
        if proof.useful_work != derive_useful_work(&challenge.transactions) {
            return false;
        }
        let calculated = candidate_hash(&proof.useful_work, proof.nonce, self.config.hash_iterations);
        calculated == proof.hash && meets_difficulty(&proof.hash, self.config.difficulty)
    }

    /// Get the current difficulty
    pub fn difficulty(&self) -> u32 {
        self.config.difficulty
    }

    /// Set the difficulty
    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.config.difficulty = difficulty;
    }
}

impl Default for ProofOfUsefulWork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeylessCryptoPrimitive for ProofOfUsefulWork {
    type Input = Vec<String>;
    type Output = String;
    type Challenge = UsefulWorkChallenge;
    type Proof = UsefulWorkProof;

    async fn compute(&self, input: Self::Input) -> Result<Self::Output> {
        Ok(derive_useful_work(&input))
    }

    async fn create_proof(&self, challenge: Self::Challenge) -> Result<Self::Proof> {
        self.search(&challenge, Arc::new(AtomicBool::new(false))).await
    }

    async fn verify_proof(&self, challenge: Self::Challenge, proof: Self::Proof) -> Result<bool> {
        let verifier = self.clone();
        task::spawn_blocking(move || verifier.verify_sync(&challenge, &proof))
            .await
            .map_err(|e| TorrentChainError::consensus(format!("Task join error: {}", e)))
    }
}
