//! Duplicate-packet suppression.
//!
//! A bounded FIFO of SipHash fingerprints. Admission is the forwarding
//! gate: a fingerprint enters the cache exactly once, and the second
//! arrival of the same frame is the signal to drop it.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use super::packet::Packet;
use crate::types::DEDUP_CAPACITY;

// Fixed keys: the fingerprint only has to be stable within one process
// lifetime, not across nodes.
const FP_KEY_0: u64 = 0x6d65_7368_7265_6c61;
const FP_KEY_1: u64 = 0x7970_6b74_6664_7570;

/// Fingerprint window: header, first 8 path bytes, first 16 payload bytes.
pub fn fingerprint(packet: &Packet) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(FP_KEY_0, FP_KEY_1);
    hasher.write_u8(packet.header);
    hasher.write(&packet.path[..packet.path.len().min(8)]);
    hasher.write(&packet.payload[..packet.payload.len().min(16)]);
    hasher.finish()
}

/// Bounded FIFO set of recent fingerprints.
#[derive(Debug)]
pub struct DedupCache {
    slots: [u64; DEDUP_CAPACITY],
    len: usize,
    next: usize,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self { slots: [0; DEDUP_CAPACITY], len: 0, next: 0 }
    }

    /// Admit a fingerprint. Returns `false` if it was already present;
    /// `true` admits it (possibly displacing the oldest entry).
    pub fn admit(&mut self, fp: u64) -> bool {
        if self.contains(fp) {
            return false;
        }
        self.slots[self.next] = fp;
        self.next = (self.next + 1) % DEDUP_CAPACITY;
        self.len = (self.len + 1).min(DEDUP_CAPACITY);
        true
    }

    pub fn contains(&self, fp: u64) -> bool {
        self.slots[..self.len].contains(&fp)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
