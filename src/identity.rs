//! Node identity: Ed25519 keypair, signing, and the one-byte node hash.
//!
//! The private key is held in the 64-byte expanded form (SHA-512 of the
//! seed with the scalar half clamped in place) so a key loaded from the
//! non-volatile record signs byte-identically to one freshly derived.

use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::types::{NodeType, ADV_FLAG_LOCATION, ADV_FLAG_NAME, ADV_TYPE_MASK, MAX_NAME_LEN};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const PRIVATE_KEY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

/// The node's own identity and self-description.
///
/// Once created the keypair is stable: only `newid` (an explicit reset)
/// replaces it. The node hash `public_key[0]` is expected to collide;
/// anything that matters compares full keys.
#[derive(Clone)]
pub struct NodeIdentity {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    private_key: [u8; PRIVATE_KEY_LEN],
    pub name: String,
    pub flags: u8,
    /// Latitude in micro-degrees; meaningful only when the location flag is set.
    pub lat: i32,
    /// Longitude in micro-degrees.
    pub lon: i32,
}

impl NodeIdentity {
    /// Derive a keypair from a 32-byte seed.
    ///
    /// Expansion is SHA-512(seed) with the scalar half clamped (bits 0-2
    /// cleared, bit 254 set, bit 255 cleared), matching the reference
    /// encoding, so stored keys round-trip exactly.
    pub fn from_seed(seed: &[u8; 32], name: &str) -> Self {
        let mut expanded = [0u8; PRIVATE_KEY_LEN];
        expanded.copy_from_slice(&Sha512::digest(seed));
        expanded[0] &= 248;
        expanded[31] &= 63;
        expanded[31] |= 64;

        let signing = ed25519_dalek::SigningKey::from_bytes(seed);
        let public_key = signing.verifying_key().to_bytes();

        let mut id = Self {
            public_key,
            private_key: expanded,
            name: String::new(),
            flags: NodeType::Repeater.nibble(),
            lat: 0,
            lon: 0,
        };
        let _ = id.set_name(name);
        id
    }

    /// Fresh random identity.
    pub fn generate<R: RngCore>(rng: &mut R, name: &str) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(&seed, name)
    }

    /// Rebuild from the persisted key material. `None` when the public key
    /// is not a valid compressed point; callers treat that as a corrupt
    /// record.
    pub fn from_stored(
        public_key: [u8; PUBLIC_KEY_LEN],
        private_key: [u8; PRIVATE_KEY_LEN],
        name: String,
        flags: u8,
        lat: i32,
        lon: i32,
    ) -> Option<Self> {
        VerifyingKey::from_bytes(&public_key).ok()?;
        Some(Self { public_key, private_key, name, flags, lat, lon })
    }

    /// One-byte abbreviation of this identity.
    pub fn node_hash(&self) -> u8 {
        self.public_key[0]
    }

    /// Detached Ed25519 signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        let esk = ExpandedSecretKey::from_bytes(&self.private_key);
        // Construction validates the public key, so decompression holds.
        let vk = VerifyingKey::from_bytes(&self.public_key)
            .expect("identity public key is a valid compressed point");
        raw_sign::<Sha512>(&esk, msg, &vk).to_bytes()
    }

    pub(crate) fn expanded_private(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.private_key
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_nibble(self.flags & ADV_TYPE_MASK).unwrap_or(NodeType::None)
    }

    pub fn set_node_type(&mut self, ty: NodeType) {
        self.flags = (self.flags & !ADV_TYPE_MASK) | ty.nibble();
    }

    /// Set the display name. Fails on empty or > 15 bytes.
    pub fn set_name(&mut self, name: &str) -> Result<(), ()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(());
        }
        self.name = name.to_string();
        self.flags |= ADV_FLAG_NAME;
        Ok(())
    }

    pub fn has_location(&self) -> bool {
        self.flags & ADV_FLAG_LOCATION != 0
    }

    pub fn set_location(&mut self, lat: i32, lon: i32) {
        self.lat = lat;
        self.lon = lon;
        self.flags |= ADV_FLAG_LOCATION;
    }

    pub fn clear_location(&mut self) {
        self.lat = 0;
        self.lon = 0;
        self.flags &= !ADV_FLAG_LOCATION;
    }
}

/// Verify a detached signature. Malformed keys or signatures verify false.
pub fn verify(public_key: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(vk) => vk.verify(msg, &Signature::from_bytes(sig)).is_ok(),
        Err(_) => false,
    }
}
