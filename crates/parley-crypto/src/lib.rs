//! Cryptographic primitives for Parley.
//!
//! This crate provides:
//! - A per-session RSA identity whose public half is exchanged as PEM
//! - Sealing of envelopes for a peer's public key
//! - Opening of inbound payloads that may be sealed or plain
//!
//! # Design
//!
//! Sealing wraps a fresh ChaCha20-Poly1305 key with RSA-OAEP (SHA-256) for
//! the recipient, so arbitrarily large payloads fit. There is no forward
//! secrecy: anyone holding a session private key can open every payload
//! sealed for it.

#![forbid(unsafe_code)]

pub mod identity;
pub mod seal;

use thiserror::Error;

pub use identity::{
    fingerprint_pem, validate_public_key, CryptoIdentity, PeerPublicKey, KEY_BITS, MIN_KEY_BITS,
};
pub use seal::Sealed;

/// Cryptographic failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl From<CryptoError> for parley_common::Error {
    fn from(err: CryptoError) -> Self {
        parley_common::Error::crypto(err)
    }
}
