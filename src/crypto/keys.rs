//! Node identity keys (Ed25519)

use crate::error::{CryptoError, Result, TorrentChainError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::path::Path;

/// Length in bytes of a detached signature
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Signing keypair owned by a node
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a hex-encoded 32-byte secret
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| {
            TorrentChainError::Crypto(CryptoError::InvalidPrivateKey {
                reason: "Invalid hex encoding".to_string(),
            })
        })?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            TorrentChainError::Crypto(CryptoError::InvalidPrivateKey {
                reason: "Invalid key length for Ed25519".to_string(),
            })
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Load a hex-encoded secret from `path`, or generate one and write it there
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Self::from_hex(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, keypair.secret_hex()).await?;
                tracing::info!("Generated new node key at {}", path.display());
                Ok(keypair)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Secret key as hex (be careful with this!)
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key as hex, the form carried in handshakes
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Detached signature over `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Parse a hex-encoded Ed25519 public key
pub fn parse_public_key(hex_str: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_str).map_err(|_| {
        TorrentChainError::Crypto(CryptoError::InvalidPublicKey {
            reason: "Invalid hex encoding".to_string(),
        })
    })?;
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        TorrentChainError::Crypto(CryptoError::InvalidPublicKey {
            reason: "Invalid key length for Ed25519".to_string(),
        })
    })?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| {
        TorrentChainError::Crypto(CryptoError::InvalidPublicKey {
            reason: "Invalid Ed25519 key".to_string(),
        })
    })
}

/// Verify a detached signature against a hex-encoded public key.
///
/// Malformed keys or signatures are errors; a well-formed signature that does
/// not match is `Ok(false)`.
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature: &[u8]) -> Result<bool> {
    let public_key = parse_public_key(public_key_hex)?;
    let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| TorrentChainError::Crypto(CryptoError::InvalidSignature))?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(public_key.verify(message, &signature).is_ok())
}
