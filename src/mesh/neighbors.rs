//! Direct-neighbor table: repeaters heard over zero hops.
//!
//! Directness is the whole point — an advert that arrived through a
//! forwarder says nothing about radio reachability, so only zero-hop
//! adverts are admitted. Eviction is layered: expired entries go first,
//! LRU only when the table is genuinely full of live neighbors.

use crate::types::NEIGHBOR_EXPIRY_SECS;

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub pubkey: [u8; 32],
    pub name: String,
    pub last_heard_ms: u64,
    pub snr_q: i8,
    pub rssi: i16,
}

impl Neighbor {
    pub fn prefix6(&self) -> [u8; 6] {
        let mut p = [0u8; 6];
        p.copy_from_slice(&self.pubkey[..6]);
        p
    }
}

#[derive(Debug)]
pub struct NeighborTable {
    entries: Vec<Neighbor>,
    capacity: usize,
}

impl NeighborTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity }
    }

    /// Record a zero-hop repeater advert. The caller is responsible for
    /// the zero-hop and repeater checks; this table just stores.
    pub fn observe(&mut self, pubkey: [u8; 32], name: &str, rssi: i16, snr_q: i8, now_ms: u64) {
        if let Some(n) = self.entries.iter_mut().find(|n| n.pubkey == pubkey) {
            if !name.is_empty() {
                n.name = name.to_string();
            }
            n.last_heard_ms = now_ms;
            n.snr_q = snr_q;
            n.rssi = rssi;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_one(now_ms);
        }
        self.entries.push(Neighbor {
            pubkey,
            name: name.to_string(),
            last_heard_ms: now_ms,
            snr_q,
            rssi,
        });
    }

    /// Expired first, then oldest.
    fn evict_one(&mut self, now_ms: u64) {
        let expiry_ms = NEIGHBOR_EXPIRY_SECS as u64 * 1000;
        if let Some(idx) = self
            .entries
            .iter()
            .position(|n| now_ms.saturating_sub(n.last_heard_ms) >= expiry_ms)
        {
            self.entries.swap_remove(idx);
            return;
        }
        if let Some(idx) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| n.last_heard_ms)
            .map(|(i, _)| i)
        {
            self.entries.swap_remove(idx);
        }
    }

    /// Drop everything expired. Called from reactor housekeeping.
    pub fn prune(&mut self, now_ms: u64) {
        let expiry_ms = NEIGHBOR_EXPIRY_SECS as u64 * 1000;
        self.entries
            .retain(|n| now_ms.saturating_sub(n.last_heard_ms) < expiry_ms);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u8) -> [u8; 32] {
        let mut k = [0u8; 32];
        k[0] = tag;
        k
    }

    #[test]
    fn observe_and_refresh() {
        let mut table = NeighborTable::new(4);
        table.observe(key(1), "r1", -90, 12, 1000);
        table.observe(key(1), "r1", -88, 16, 2000);
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().last_heard_ms, 2000);
    }

    #[test]
    fn expired_evicted_before_lru() {
        let mut table = NeighborTable::new(2);
        let hour_ms = NEIGHBOR_EXPIRY_SECS as u64 * 1000;
        table.observe(key(1), "old", -90, 0, 0);
        table.observe(key(2), "recent", -90, 0, hour_ms - 1);
        // key(1) is expired at insertion time of key(3).
        table.observe(key(3), "new", -90, 0, hour_ms + 10);
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|n| n.pubkey != key(1)));
    }

    #[test]
    fn prune_removes_stale() {
        let mut table = NeighborTable::new(8);
        table.observe(key(1), "a", -90, 0, 0);
        table.observe(key(2), "b", -90, 0, 500_000);
        table.prune(NEIGHBOR_EXPIRY_SECS as u64 * 1000 + 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().pubkey, key(2));
    }
}
