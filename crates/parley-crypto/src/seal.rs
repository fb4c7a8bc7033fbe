//! Sealing payloads for a peer and opening what peers send us.
//!
//! # Wire Format
//!
//! A sealed payload is one base64 string:
//!
//! ```text
//! [k bytes: RSA-OAEP-SHA256(payload key)] [12 bytes: nonce] [ciphertext + 16 byte tag]
//! ```
//!
//! `k` is the recipient's modulus size. The payload key is a fresh 32-byte
//! ChaCha20-Poly1305 key, so payload size is not limited by the RSA block.
//!
//! Peers send sealed payloads once keys are exchanged and plain envelope
//! JSON before that, so [`CryptoIdentity::open`] accepts both.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use parley_common::Envelope;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::Oaep;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::identity::{CryptoIdentity, PeerPublicKey};
use crate::CryptoError;

const PAYLOAD_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Result of [`CryptoIdentity::seal_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sealed {
    /// Base64 ciphertext for the peer.
    Encrypted(String),
    /// No peer key was available; the plaintext goes out unchanged.
    Clear(String),
}

impl Sealed {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Encrypted(s) | Self::Clear(s) => s,
        }
    }
}

impl CryptoIdentity {
    /// Seal `plaintext` for the holder of `peer_public_key`.
    ///
    /// With no key the plaintext is returned as [`Sealed::Clear`]; callers
    /// decide whether sending in the clear is acceptable. A key that is
    /// present but unusable is an error.
    pub fn seal_for(
        &self,
        plaintext: &str,
        peer_public_key: Option<&str>,
    ) -> Result<Sealed, CryptoError> {
        match peer_public_key {
            None => Ok(Sealed::Clear(plaintext.to_string())),
            Some(pem) => {
                let peer = PeerPublicKey::from_pem(pem)?;
                seal(&peer, plaintext.as_bytes()).map(Sealed::Encrypted)
            }
        }
    }

    /// Recover an envelope from whatever a peer sent.
    ///
    /// Input that already parses as an [`Envelope`] is returned unchanged.
    /// Otherwise it is decrypted with the private key and returned if the
    /// result parses as an envelope. Any failure returns the input unchanged.
    pub fn open(&self, payload: &str) -> String {
        // TODO: tag sealed payloads explicitly (encrypted vs clear) so JSON-looking
        // plaintext and stray ciphertext can no longer be confused.
        if Envelope::decode(payload).is_ok() {
            return payload.to_string();
        }

        match self.decrypt(payload) {
            Ok(text) if Envelope::decode(&text).is_ok() => text,
            Ok(_) => {
                debug!("decrypted payload is not an envelope, passing input through");
                payload.to_string()
            }
            Err(e) => {
                debug!("payload did not open, passing input through: {}", e);
                payload.to_string()
            }
        }
    }

    /// Decrypt a sealed payload without the envelope checks of [`open`](Self::open).
    pub fn decrypt(&self, payload: &str) -> Result<String, CryptoError> {
        let blob = STANDARD
            .decode(payload.trim())
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;

        let wrapped_len = self.private_key().size();
        if blob.len() < wrapped_len + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "sealed payload too short: {} bytes",
                blob.len()
            )));
        }
        let (wrapped, rest) = blob.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = Zeroizing::new(
            self.private_key()
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?,
        );
        if key.len() != PAYLOAD_KEY_LEN {
            return Err(CryptoError::Decryption("unexpected payload key length".into()));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".into()))
    }
}

fn seal(peer: &PeerPublicKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut key = Zeroizing::new([0u8; PAYLOAD_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let wrapped = peer
        .rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key[..])
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut blob = Vec::with_capacity(wrapped.len() + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&wrapped);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MIN_KEY_BITS;
    use std::sync::OnceLock;

    fn alice() -> &'static CryptoIdentity {
        static KEY: OnceLock<CryptoIdentity> = OnceLock::new();
        KEY.get_or_init(|| CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap())
    }

    fn bob() -> &'static CryptoIdentity {
        static KEY: OnceLock<CryptoIdentity> = OnceLock::new();
        KEY.get_or_init(|| CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap())
    }

    fn message(content: &str) -> String {
        Envelope::Message {
            username: "alice".into(),
            content: content.into(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let plaintext = message("hello bob");
        let sealed = alice()
            .seal_for(&plaintext, Some(bob().public_key_pem()))
            .unwrap();

        assert!(sealed.is_encrypted());
        assert_ne!(sealed.as_str(), plaintext);
        assert_eq!(bob().open(sealed.as_str()), plaintext);
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let plaintext = message(&"x".repeat(64 * 1024));
        let sealed = alice()
            .seal_for(&plaintext, Some(bob().public_key_pem()))
            .unwrap();
        assert_eq!(bob().decrypt(sealed.as_str()).unwrap(), plaintext);
    }

    #[test]
    fn test_no_key_is_clear_passthrough() {
        let sealed = alice().seal_for("plain words", None).unwrap();
        assert_eq!(sealed, Sealed::Clear("plain words".into()));
        assert_eq!(sealed.as_str(), "plain words");
    }

    #[test]
    fn test_bad_peer_key_is_an_error() {
        assert!(matches!(
            alice().seal_for("hi", Some("garbage")),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_open_plain_envelope_unchanged() {
        let plaintext = message("already clear");
        assert_eq!(bob().open(&plaintext), plaintext);
    }

    #[test]
    fn test_open_wrong_recipient_returns_input() {
        let sealed = alice()
            .seal_for(&message("for bob only"), Some(bob().public_key_pem()))
            .unwrap()
            .as_str()
            .to_string();
        assert_eq!(alice().open(&sealed), sealed);
        assert!(alice().decrypt(&sealed).is_err());
    }

    #[test]
    fn test_open_sealed_non_envelope_returns_input() {
        let sealed = alice()
            .seal_for("just some text", Some(bob().public_key_pem()))
            .unwrap()
            .as_str()
            .to_string();
        assert_eq!(bob().decrypt(&sealed).unwrap(), "just some text");
        assert_eq!(bob().open(&sealed), sealed);
    }

    #[test]
    fn test_open_plain_text_returns_input() {
        assert_eq!(bob().open("bob: hi"), "bob: hi");
        assert_eq!(bob().open("aGVsbG8="), "aGVsbG8=");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let sealed = alice()
            .seal_for(&message("integrity"), Some(bob().public_key_pem()))
            .unwrap()
            .as_str()
            .to_string();
        let mut blob = STANDARD.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = STANDARD.encode(blob);

        assert!(bob().decrypt(&tampered).is_err());
        assert_eq!(bob().open(&tampered), tampered);
    }
}
