//! # convoy-crypto
//!
//! Encryption strategies for data at rest.  Code migrations that re-encrypt
//! stored secrets receive a [`Strategy`] object and never see the key
//! material directly.  The wire format is `nonce || ciphertext` with a
//! 24-byte XChaCha20-Poly1305 nonce prepended.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;

/// XChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

pub type SymmetricKey = [u8; 32];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// An at-rest encryption strategy.
///
/// Implementations must be safe to share across threads; the migration
/// engine holds one behind an `Arc` for the lifetime of a run.
pub trait Strategy: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through strategy for deployments without an encryption key.
///
/// Encrypt and decrypt both return their input unchanged, so code
/// migrations can run the same path whether or not encryption is on.
pub struct NoEncryption;

impl Strategy for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// XChaCha20-Poly1305 strategy over a 256-bit symmetric key.
pub struct Key {
    key: SymmetricKey,
}

impl Key {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Derive a key from a passphrase with BLAKE3, domain-separated so the
    /// same passphrase used elsewhere in the service yields a different key.
    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("convoy 2024-01-09 db encryption key");
        hasher.update(passphrase);
        let hash = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&hash.as_bytes()[..32]);
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }
}

impl Strategy for Key {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(&self.key.into());
        let nonce_bytes = generate_nonce();
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(&self.key.into());
        let nonce = XNonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

pub fn generate_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}
