//! Per-session RSA identity.
//!
//! Every process generates a fresh key pair at startup and hands out the
//! public half as SPKI PEM during key exchange. Nothing is persisted: the
//! identity lives exactly as long as the [`CryptoIdentity`] value.
//!
//! # Example
//!
//! ```no_run
//! use parley_crypto::identity::CryptoIdentity;
//!
//! let identity = CryptoIdentity::generate().unwrap();
//! println!("fingerprint: {}", identity.fingerprint());
//! assert!(identity.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
//! ```

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::CryptoError;

/// Modulus size used for session identities.
pub const KEY_BITS: usize = 2048;

/// Smallest modulus that can still wrap a payload key under OAEP-SHA256.
pub const MIN_KEY_BITS: usize = 1024;

/// The process's own key pair.
///
/// The private key is zeroized on drop by `rsa`.
pub struct CryptoIdentity {
    private_key: RsaPrivateKey,
    public_pem: String,
    fingerprint: String,
}

impl CryptoIdentity {
    /// Generate a fresh 2048-bit key pair using the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(KEY_BITS)
    }

    /// Generate a key pair with a specific modulus size.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyGeneration(format!(
                "{bits}-bit keys are below the {MIN_KEY_BITS}-bit minimum"
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = private_key.to_public_key();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let fingerprint = fingerprint_of(&public_key)?;

        Ok(Self {
            private_key,
            public_pem,
            fingerprint,
        })
    }

    /// Public key as SPKI PEM, ready for a `key_exchange` envelope.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// SHA-256 hex of the public key's DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Modulus size in bits.
    pub fn key_bits(&self) -> usize {
        self.private_key.size() * 8
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field("bits", &self.key_bits())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// A peer's public key received during key exchange.
#[derive(Clone)]
pub struct PeerPublicKey {
    key: RsaPublicKey,
}

impl PeerPublicKey {
    /// Parse SPKI PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem.trim())
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        if key.size() * 8 < MIN_KEY_BITS {
            return Err(CryptoError::InvalidPublicKey(format!(
                "{}-bit key is too small",
                key.size() * 8
            )));
        }
        Ok(Self { key })
    }

    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        fingerprint_of(&self.key)
    }

    pub(crate) fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({} bits)", self.key.size() * 8)
    }
}

/// Checks that `pem` is an acceptable peer key.
pub fn validate_public_key(pem: &str) -> Result<(), CryptoError> {
    PeerPublicKey::from_pem(pem).map(|_| ())
}

/// Fingerprint of a PEM public key, for logs.
pub fn fingerprint_pem(pem: &str) -> Result<String, CryptoError> {
    PeerPublicKey::from_pem(pem)?.fingerprint()
}

fn fingerprint_of(key: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity_is_2048_bits() {
        let identity = CryptoIdentity::generate().unwrap();
        assert_eq!(identity.key_bits(), KEY_BITS);
        assert!(identity
            .public_key_pem()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_pem_reimports_with_same_fingerprint() {
        let identity = CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap();
        let peer = PeerPublicKey::from_pem(identity.public_key_pem()).unwrap();

        assert_eq!(peer.fingerprint().unwrap(), identity.fingerprint());
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn test_small_keys_rejected() {
        assert!(matches!(
            CryptoIdentity::generate_with_bits(512),
            Err(CryptoError::KeyGeneration(_))
        ));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(validate_public_key("not a key").is_err());
        assert!(validate_public_key("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n").is_err());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let identity = CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("fingerprint"));
        assert!(!rendered.contains("BEGIN"));
    }
}
