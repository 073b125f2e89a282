//! Session cryptography: Ed25519→X25519 key agreement and the AES-128-ECB
//! Encrypt-then-MAC construction used by every authenticated payload.
//!
//! The MAC is the first two bytes of HMAC-SHA256 over the ciphertext, keyed
//! with the full 32-byte shared secret; AES is keyed with the first 16
//! bytes. Two MAC bytes only gate work — replay and session checks carry
//! the real authentication weight.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use ed25519_dalek::VerifyingKey;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::identity::NodeIdentity;
use crate::types::{FIRMWARE_BYTE, PERM_ADMIN};

type HmacSha256 = Hmac<Sha256>;

pub const SHARED_SECRET_LEN: usize = 32;
pub const MAC_LEN: usize = 2;
pub const AES_BLOCK_LEN: usize = 16;

/// Largest plaintext a single frame can carry after headers and MAC.
pub const MAX_PLAINTEXT_LEN: usize = 160;

/// LOGIN_OK plaintext length before block padding.
pub const LOGIN_OK_LEN: usize = 13;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    BadPublicKey,
    /// MAC mismatch. No plaintext is produced.
    #[error("authentication failed")]
    AuthFailed,
    #[error("bad ciphertext length")]
    BadLength,
}

/// ECDH over the Ed25519→X25519 bridge.
///
/// The expanded private key's scalar half is clamped by the X25519
/// function itself; the peer's Edwards-Y key is mapped to Montgomery-U
/// (`u = (1 + y) / (1 - y)`) before the scalar multiplication. Both
/// directions of a pair derive the same 32 bytes.
pub fn shared_secret(
    ours: &NodeIdentity,
    their_ed_pub: &[u8; 32],
) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
    let vk = VerifyingKey::from_bytes(their_ed_pub).map_err(|_| CryptoError::BadPublicKey)?;
    let montgomery = vk.to_montgomery();

    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&ours.expanded_private()[..32]);
    Ok(x25519_dalek::x25519(scalar, montgomery.to_bytes()))
}

/// Encrypt `plaintext` and prepend the truncated MAC.
///
/// Output layout: `[mac:2 | ciphertext]` where the ciphertext is the
/// zero-padded plaintext, ECB block by block. The padding is not removed
/// on decrypt; trailing zeros are the application's problem.
pub fn encrypt_then_mac(secret: &[u8; SHARED_SECRET_LEN], plaintext: &[u8]) -> Vec<u8> {
    let padded_len = plaintext.len().div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN;
    let mut out = vec![0u8; MAC_LEN + padded_len];
    out[MAC_LEN..MAC_LEN + plaintext.len()].copy_from_slice(plaintext);

    let cipher = Aes128::new(GenericArray::from_slice(&secret[..AES_BLOCK_LEN]));
    for block in out[MAC_LEN..].chunks_exact_mut(AES_BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    let mac = hmac_trunc(secret, &out[MAC_LEN..]);
    out[..MAC_LEN].copy_from_slice(&mac);
    out
}

/// Verify the truncated MAC (constant time), then decrypt.
///
/// Returns the full padded plaintext. A MAC mismatch yields `AuthFailed`
/// and never touches AES.
pub fn mac_then_decrypt(
    secret: &[u8; SHARED_SECRET_LEN],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < MAC_LEN + AES_BLOCK_LEN {
        return Err(CryptoError::BadLength);
    }
    let ciphertext = &data[MAC_LEN..];
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(CryptoError::BadLength);
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| CryptoError::BadLength)?;
    mac.update(ciphertext);
    mac.verify_truncated_left(&data[..MAC_LEN])
        .map_err(|_| CryptoError::AuthFailed)?;

    let cipher = Aes128::new(GenericArray::from_slice(&secret[..AES_BLOCK_LEN]));
    let mut plain = ciphertext.to_vec();
    for block in plain.chunks_exact_mut(AES_BLOCK_LEN) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(plain)
}

fn hmac_trunc(secret: &[u8; SHARED_SECRET_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    [full[0], full[1]]
}

/// A decrypted anonymous login request.
pub struct AnonRequest {
    pub ephemeral_pub: [u8; 32],
    pub secret: [u8; SHARED_SECRET_LEN],
    pub timestamp: u32,
    /// Password bytes with the block padding trimmed.
    pub password: Vec<u8>,
}

/// Open an ANON_REQ body (everything after the destination hash):
/// `[ephemeral_pub:32 | mac:2 | ciphertext]`, inner `[ts:u32-LE | password]`.
pub fn open_anon_request(ours: &NodeIdentity, body: &[u8]) -> Result<AnonRequest, CryptoError> {
    if body.len() < 32 + MAC_LEN + AES_BLOCK_LEN {
        return Err(CryptoError::BadLength);
    }
    let mut ephemeral_pub = [0u8; 32];
    ephemeral_pub.copy_from_slice(&body[..32]);

    let secret = shared_secret(ours, &ephemeral_pub)?;
    let plain = mac_then_decrypt(&secret, &body[32..])?;
    if plain.len() < 4 {
        return Err(CryptoError::BadLength);
    }

    let timestamp = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let mut password = plain[4..].to_vec();
    while password.last() == Some(&0) {
        password.pop();
    }

    Ok(AnonRequest { ephemeral_pub, secret, timestamp, password })
}

/// Build the 13-byte LOGIN_OK plaintext:
/// `[ts:u32-LE | code=0 | keep_alive/4 | is_admin | permissions | random:4 | fw]`.
pub fn build_login_ok<R: RngCore>(
    timestamp: u32,
    keep_alive_secs: u32,
    permissions: u8,
    rng: &mut R,
) -> [u8; LOGIN_OK_LEN] {
    let mut out = [0u8; LOGIN_OK_LEN];
    out[..4].copy_from_slice(&timestamp.to_le_bytes());
    out[4] = 0;
    out[5] = (keep_alive_secs / 4).min(255) as u8;
    out[6] = u8::from(permissions == PERM_ADMIN);
    out[7] = permissions;
    rng.fill_bytes(&mut out[8..12]);
    out[12] = FIRMWARE_BYTE;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PERM_GUEST;
    use rand::rngs::mock::StepRng;

    fn secret() -> [u8; 32] {
        let mut s = [0u8; 32];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        s
    }

    #[test]
    fn roundtrip_pads_to_block() {
        let s = secret();
        let sealed = encrypt_then_mac(&s, b"hello");
        assert_eq!(sealed.len(), MAC_LEN + AES_BLOCK_LEN);
        let plain = mac_then_decrypt(&s, &sealed).unwrap();
        assert_eq!(&plain[..5], b"hello");
        assert!(plain[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn mac_mismatch_yields_no_plaintext() {
        let s = secret();
        let mut sealed = encrypt_then_mac(&s, b"hello");
        sealed[0] ^= 0xFF;
        assert_eq!(mac_then_decrypt(&s, &sealed), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let s = secret();
        let mut sealed = encrypt_then_mac(&s, b"hello");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(mac_then_decrypt(&s, &sealed), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn login_ok_layout() {
        let mut rng = StepRng::new(0xAB, 0);
        let body = build_login_ok(1_700_000_000, 240, PERM_GUEST, &mut rng);
        assert_eq!(&body[..4], &1_700_000_000u32.to_le_bytes());
        assert_eq!(body[4], 0);
        assert_eq!(body[5], 60);
        assert_eq!(body[6], 0);
        assert_eq!(body[7], PERM_GUEST);
        assert_eq!(body[12], FIRMWARE_BYTE);
    }
}
