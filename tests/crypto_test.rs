//! Cryptography tests: reference vectors, key agreement symmetry and the
//! Encrypt-then-MAC construction.
//!
//! Run with: cargo test --test crypto_test

use hex_literal::hex;
use meshrelay::crypto;
use meshrelay::identity::{self, NodeIdentity};

// =============================================================================
// SIGNING VECTORS
// =============================================================================

#[test]
fn rfc8032_vector_1() {
    let seed = hex!("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60");
    let id = NodeIdentity::from_seed(&seed, "vector");

    assert_eq!(
        id.public_key,
        hex!("d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a")
    );
    assert_eq!(id.node_hash(), 0xd7);

    let sig = id.sign(b"");
    assert_eq!(
        sig.to_vec(),
        hex!(
            "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e065224901555fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
        )
        .to_vec()
    );
    assert!(identity::verify(&id.public_key, b"", &sig));
}

#[test]
fn signature_covers_message() {
    let id = NodeIdentity::from_seed(&[0x11; 32], "t");
    let sig = id.sign(b"payload one");
    assert!(identity::verify(&id.public_key, b"payload one", &sig));
    assert!(!identity::verify(&id.public_key, b"payload two", &sig));

    let other = NodeIdentity::from_seed(&[0x12; 32], "t");
    assert!(!identity::verify(&other.public_key, b"payload one", &sig));
}

// =============================================================================
// KEY AGREEMENT
// =============================================================================

#[test]
fn ecdh_is_symmetric() {
    let a = NodeIdentity::from_seed(&[1u8; 32], "a");
    let b = NodeIdentity::from_seed(&[2u8; 32], "b");

    let ab = crypto::shared_secret(&a, &b.public_key).unwrap();
    let ba = crypto::shared_secret(&b, &a.public_key).unwrap();
    assert_eq!(ab, ba);

    let c = NodeIdentity::from_seed(&[3u8; 32], "c");
    let ac = crypto::shared_secret(&a, &c.public_key).unwrap();
    assert_ne!(ab, ac);
}

#[test]
fn ecdh_rejects_invalid_pubkey() {
    let a = NodeIdentity::from_seed(&[1u8; 32], "a");
    // Not a valid compressed Edwards point.
    let junk = [0xFFu8; 32];
    assert!(crypto::shared_secret(&a, &junk).is_err());
}

// =============================================================================
// ENCRYPT-THEN-MAC
// =============================================================================

#[test]
fn roundtrip_all_block_boundaries() {
    let a = NodeIdentity::from_seed(&[1u8; 32], "a");
    let b = NodeIdentity::from_seed(&[2u8; 32], "b");
    let secret = crypto::shared_secret(&a, &b.public_key).unwrap();

    for len in [1usize, 4, 15, 16, 17, 31, 32, 100, 159, 160] {
        let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let sealed = crypto::encrypt_then_mac(&secret, &plaintext);
        assert_eq!(sealed.len(), 2 + len.div_ceil(16) * 16);

        let recovered = crypto::mac_then_decrypt(&secret, &sealed).unwrap();
        assert_eq!(&recovered[..len], &plaintext[..]);
        assert!(recovered[len..].iter().all(|&b| b == 0), "padding must be zero");
    }
}

#[test]
fn wrong_secret_fails_before_decrypt() {
    let secret = [0x41u8; 32];
    let sealed = crypto::encrypt_then_mac(&secret, b"confidential");
    let mut wrong = secret;
    wrong[0] ^= 1;
    assert_eq!(
        crypto::mac_then_decrypt(&wrong, &sealed),
        Err(crypto::CryptoError::AuthFailed)
    );
}

// =============================================================================
// ANONYMOUS LOGIN PAYLOAD
// =============================================================================

#[test]
fn anon_request_roundtrip() {
    let repeater = NodeIdentity::from_seed(&[7u8; 32], "relay");
    let client = NodeIdentity::from_seed(&[8u8; 32], "client");
    let secret = crypto::shared_secret(&client, &repeater.public_key).unwrap();

    let mut inner = Vec::new();
    inner.extend_from_slice(&1_737_312_000u32.to_le_bytes());
    inner.extend_from_slice(b"hunter2");
    let sealed = crypto::encrypt_then_mac(&secret, &inner);

    let mut body = Vec::new();
    body.extend_from_slice(&client.public_key);
    body.extend_from_slice(&sealed);

    let req = crypto::open_anon_request(&repeater, &body).unwrap();
    assert_eq!(req.ephemeral_pub, client.public_key);
    assert_eq!(req.secret, secret);
    assert_eq!(req.timestamp, 1_737_312_000);
    assert_eq!(req.password, b"hunter2");
}

#[test]
fn login_ok_seals_to_18_bytes() {
    let secret = [0x55u8; 32];
    let mut rng = rand::rngs::mock::StepRng::new(1, 1);
    let body = crypto::build_login_ok(1_737_312_000, 240, meshrelay::types::PERM_ADMIN, &mut rng);
    assert_eq!(body.len(), 13);
    // 2-byte MAC plus one padded AES block.
    let sealed = crypto::encrypt_then_mac(&secret, &body);
    assert_eq!(sealed.len(), 18);
}
