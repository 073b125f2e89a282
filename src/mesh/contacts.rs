//! Full-key contact table with cached ECDH secrets.
//!
//! Eight slots, LRU. The shared secret is bound to the pubkey occupying a
//! slot: whenever a slot is reused for a different key the secret is
//! recomputed, never inherited.

use crate::crypto::SHARED_SECRET_LEN;
use crate::types::CONTACTS_CAPACITY;

#[derive(Debug, Clone)]
pub struct Contact {
    pub pubkey: [u8; 32],
    pub shared_secret: [u8; SHARED_SECRET_LEN],
    pub name: String,
    pub last_rssi: i16,
    pub last_snr_q: i8,
    pub last_seen_ms: u64,
}

impl Contact {
    pub fn hash(&self) -> u8 {
        self.pubkey[0]
    }
}

#[derive(Debug, Default)]
pub struct ContactTable {
    entries: Vec<Contact>,
}

impl ContactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a contact.
    ///
    /// `derive_secret` runs only when the pubkey is not already resident —
    /// i.e. on first insert or when an evicted slot is being reused — so
    /// the ECDH cost is paid once per key.
    pub fn upsert<F>(
        &mut self,
        pubkey: [u8; 32],
        name: &str,
        rssi: i16,
        snr_q: i8,
        now_ms: u64,
        derive_secret: F,
    ) -> bool
    where
        F: FnOnce() -> Option<[u8; SHARED_SECRET_LEN]>,
    {
        if let Some(entry) = self.entries.iter_mut().find(|c| c.pubkey == pubkey) {
            if !name.is_empty() {
                entry.name = name.to_string();
            }
            entry.last_rssi = rssi;
            entry.last_snr_q = snr_q;
            entry.last_seen_ms = now_ms;
            return false;
        }

        let Some(shared_secret) = derive_secret() else {
            return false;
        };

        if self.entries.len() >= CONTACTS_CAPACITY {
            if let Some(idx) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.last_seen_ms)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(idx);
            }
        }

        self.entries.push(Contact {
            pubkey,
            shared_secret,
            name: name.to_string(),
            last_rssi: rssi,
            last_snr_q: snr_q,
            last_seen_ms: now_ms,
        });
        true
    }

    pub fn find_by_pubkey(&self, pubkey: &[u8; 32]) -> Option<&Contact> {
        self.entries.iter().find(|c| &c.pubkey == pubkey)
    }

    /// All contacts whose pubkey starts with the given hex-decoded prefix.
    pub fn find_by_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a Contact> {
        self.entries.iter().filter(move |c| c.pubkey.starts_with(prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
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
        k[1] = tag;
        k
    }

    #[test]
    fn secret_derived_once_per_key() {
        let mut table = ContactTable::new();
        let mut calls = 0;
        table.upsert(key(1), "a", -80, 0, 100, || {
            calls += 1;
            Some([1u8; 32])
        });
        table.upsert(key(1), "a", -78, 0, 200, || {
            calls += 1;
            Some([9u8; 32])
        });
        assert_eq!(calls, 1);
        assert_eq!(table.find_by_pubkey(&key(1)).unwrap().shared_secret, [1u8; 32]);
    }

    #[test]
    fn slot_reuse_recomputes_secret() {
        let mut table = ContactTable::new();
        for i in 0..CONTACTS_CAPACITY as u8 {
            table.upsert(key(i), "n", -80, 0, i as u64, || Some([i; 32]));
        }
        // key(0) is the LRU victim; its slot is reused with a fresh secret.
        assert!(table.upsert(key(0xEE), "new", -70, 0, 1000, || Some([0xEE; 32])));
        assert_eq!(table.len(), CONTACTS_CAPACITY);
        assert!(table.find_by_pubkey(&key(0)).is_none());
        assert_eq!(
            table.find_by_pubkey(&key(0xEE)).unwrap().shared_secret,
            [0xEE; 32]
        );
    }

    #[test]
    fn prefix_lookup() {
        let mut table = ContactTable::new();
        table.upsert(key(0xAB), "x", -80, 0, 1, || Some([0u8; 32]));
        assert_eq!(table.find_by_prefix(&[0xAB]).count(), 1);
        assert_eq!(table.find_by_prefix(&[0xAB, 0xAB]).count(), 1);
        assert_eq!(table.find_by_prefix(&[0xAB, 0xCD]).count(), 0);
    }
}
