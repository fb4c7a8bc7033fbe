//! Key exchange and sealed delivery between two session identities.

use parley_common::{Envelope, Inbound};
use parley_crypto::{fingerprint_pem, CryptoIdentity, Sealed, MIN_KEY_BITS};

fn identity() -> CryptoIdentity {
    CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap()
}

/// Keys travel inside plain `key_exchange` envelopes, then messages are sealed.
#[test]
fn test_exchange_then_sealed_message() {
    let alice = identity();
    let bob = identity();

    // Alice's key exchange is not sealed; Bob opens it unchanged.
    let offer = Envelope::KeyExchange {
        username: "alice".into(),
        public_key: alice.public_key_pem().to_string(),
    }
    .encode()
    .unwrap();
    let opened = bob.open(&offer);
    let alice_pem = match Inbound::classify(opened) {
        Inbound::Envelope(Envelope::KeyExchange { public_key, .. }) => public_key,
        other => panic!("unexpected inbound: {other:?}"),
    };
    assert_eq!(fingerprint_pem(&alice_pem).unwrap(), alice.fingerprint());

    // Bob replies with a sealed message only Alice can open.
    let reply = Envelope::Message {
        username: "bob".into(),
        content: "welcome".into(),
    }
    .encode()
    .unwrap();
    let sealed = bob.seal_for(&reply, Some(&alice_pem)).unwrap();
    assert!(matches!(sealed, Sealed::Encrypted(_)));

    let wire = sealed.as_str();
    assert_eq!(alice.open(wire), reply);
    assert_eq!(bob.open(wire), wire);
}

/// Payloads are not limited by the RSA block size.
#[test]
fn test_file_sized_payload() {
    let alice = identity();
    let bob = identity();

    let file = Envelope::File {
        username: Some("alice".into()),
        filename: "blob.bin".into(),
        content: "A".repeat(2 * 1024 * 1024),
    }
    .encode()
    .unwrap();

    let wire = alice
        .seal_for(&file, Some(bob.public_key_pem()))
        .unwrap()
        .as_str()
        .to_string();
    assert_eq!(bob.open(&wire), file);
}

/// Sealing the same plaintext twice never yields the same ciphertext.
#[test]
fn test_sealing_is_randomized() {
    let alice = identity();
    let bob = identity();
    let text = Envelope::Disconnect {
        username: "alice".into(),
    }
    .encode()
    .unwrap();

    let first = alice.seal_for(&text, Some(bob.public_key_pem())).unwrap();
    let second = alice.seal_for(&text, Some(bob.public_key_pem())).unwrap();
    assert_ne!(first, second);
    assert_eq!(bob.open(first.as_str()), bob.open(second.as_str()));
}
