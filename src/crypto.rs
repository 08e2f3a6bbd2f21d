//! Cryptographic primitives: hashing, proof of useful work and node keys

pub mod hash;
pub mod keys;
pub mod pow;

use crate::error::Result;
use async_trait::async_trait;

/// Trait for keyless cryptographic primitives (hashing, proof of work, etc.)
#[async_trait]
pub trait KeylessCryptoPrimitive: Send + Sync {
    type Input;
    type Output;
    type Challenge;
    type Proof;

    async fn compute(&self, input: Self::Input) -> Result<Self::Output>;
    async fn create_proof(&self, challenge: Self::Challenge) -> Result<Self::Proof>;
    async fn verify_proof(&self, challenge: Self::Challenge, proof: Self::Proof) -> Result<bool>;
}

// Re-export commonly used types
pub use hash::*;
pub use keys::{verify_signature, Keypair, SIGNATURE_LENGTH};
pub use pow::{
    derive_useful_work, meets_difficulty, search_proof_of_work, ProofOfUsefulWork,
    ProofOfWorkConfig, UsefulWorkChallenge, UsefulWorkProof,
};
