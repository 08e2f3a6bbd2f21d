//! Hash utilities and functions

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Content address of a chunk: lower-case hex SHA-256 of its bytes
pub fn content_hash(data: &[u8]) -> String {
    sha256_hex(data)
}

/// Apply SHA-256 to its own raw digest `iterations` times, starting from
/// `data`, and hex-encode the final digest.
///
/// A single iteration is exactly [`sha256_hex`]. Zero is treated as one so
/// the output is always a digest.
pub fn sequential_hash(data: &[u8], iterations: u32) -> String {
    let mut digest = sha256(data);
    for _ in 1..iterations.max(1) {
        digest = sha256(&digest);
    }
    hex::encode(digest)
}
