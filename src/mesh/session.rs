//! Authenticated client sessions and the access-control list.
//!
//! A session is keyed on the client's ephemeral Ed25519 public key and
//! carries the cached ECDH secret plus the replay high-water-mark: a
//! request timestamp must strictly exceed the last accepted one.

use tracing::debug;

use crate::crypto::SHARED_SECRET_LEN;
use crate::types::{ACL_CAPACITY, PERM_ADMIN, PERM_GUEST, PERM_NONE, SESSIONS_CAPACITY};

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub pubkey: [u8; 32],
    pub secret: [u8; SHARED_SECRET_LEN],
    pub permissions: u8,
    /// Replay watermark: highest request timestamp accepted so far.
    pub last_req_ts: u32,
    pub last_activity_ms: u64,
    /// Path snapshot from the packet that established the session.
    pub return_path: Vec<u8>,
}

impl ClientSession {
    pub fn hash(&self) -> u8 {
        self.pubkey[0]
    }

    pub fn is_admin(&self) -> bool {
        self.permissions == PERM_ADMIN
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Vec<ClientSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh the session for an ephemeral key. Eviction is
    /// LRU by activity when all slots are taken by other clients.
    pub fn install(
        &mut self,
        pubkey: [u8; 32],
        secret: [u8; SHARED_SECRET_LEN],
        permissions: u8,
        req_ts: u32,
        return_path: Vec<u8>,
        now_ms: u64,
    ) {
        if let Some(s) = self.sessions.iter_mut().find(|s| s.pubkey == pubkey) {
            s.secret = secret;
            s.permissions = permissions;
            s.last_req_ts = req_ts;
            s.last_activity_ms = now_ms;
            s.return_path = return_path;
            return;
        }

        if self.sessions.len() >= SESSIONS_CAPACITY {
            if let Some(idx) = self
                .sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_activity_ms)
                .map(|(i, _)| i)
            {
                debug!(hash = self.sessions[idx].hash(), "evicting idle session");
                self.sessions.swap_remove(idx);
            }
        }

        self.sessions.push(ClientSession {
            pubkey,
            secret,
            permissions,
            last_req_ts: req_ts,
            last_activity_ms: now_ms,
            return_path,
        });
    }

    /// Session whose ephemeral pubkey abbreviates to `src_hash`.
    pub fn find_by_hash_mut(&mut self, src_hash: u8) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|s| s.pubkey[0] == src_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// =============================================================================
// ACCESS CONTROL
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AclEntry {
    pub prefix: [u8; 6],
    pub permissions: u8,
    /// Replay watermark remembered across session eviction.
    pub last_ts: u32,
}

/// Password-based permission assignment plus the remembered client list.
#[derive(Debug, Default)]
pub struct AccessControl {
    entries: Vec<AclEntry>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a login password to permissions. Admin is checked first; an
    /// empty guest password disables guest login entirely.
    pub fn check_password(admin_pw: &str, guest_pw: &str, offered: &[u8]) -> u8 {
        if !admin_pw.is_empty() && offered == admin_pw.as_bytes() {
            return PERM_ADMIN;
        }
        if !guest_pw.is_empty() && offered == guest_pw.as_bytes() {
            return PERM_GUEST;
        }
        PERM_NONE
    }

    /// Record a successful login, updating the replay watermark for the
    /// key prefix. Bounded; the oldest-watermark entry is recycled.
    pub fn record_login(&mut self, pubkey: &[u8; 32], permissions: u8, ts: u32) {
        let mut prefix = [0u8; 6];
        prefix.copy_from_slice(&pubkey[..6]);

        if let Some(e) = self.entries.iter_mut().find(|e| e.prefix == prefix) {
            e.permissions = permissions;
            e.last_ts = e.last_ts.max(ts);
            return;
        }

        if self.entries.len() >= ACL_CAPACITY {
            if let Some(idx) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_ts)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(idx);
            }
        }
        self.entries.push(AclEntry { prefix, permissions, last_ts: ts });
    }

    /// Stored watermark for a key, if any. Used to refuse replayed logins
    /// after the in-RAM session was evicted.
    pub fn watermark(&self, pubkey: &[u8; 32]) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| pubkey.starts_with(&e.prefix))
            .map(|e| e.last_ts)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AclEntry> {
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
    fn install_and_lookup() {
        let mut table = SessionTable::new();
        table.install(key(7), [1u8; 32], PERM_ADMIN, 100, vec![1, 2], 5000);
        let s = table.find_by_hash_mut(7).unwrap();
        assert!(s.is_admin());
        assert_eq!(s.last_req_ts, 100);
        assert_eq!(s.return_path, vec![1, 2]);
    }

    #[test]
    fn lru_eviction_by_activity() {
        let mut table = SessionTable::new();
        for i in 0..SESSIONS_CAPACITY as u8 {
            table.install(key(i), [0u8; 32], PERM_GUEST, 1, vec![], 1000 + i as u64);
        }
        table.install(key(0xCC), [0u8; 32], PERM_GUEST, 1, vec![], 9000);
        assert_eq!(table.len(), SESSIONS_CAPACITY);
        assert!(table.find_by_hash_mut(0).is_none());
        assert!(table.find_by_hash_mut(0xCC).is_some());
    }

    #[test]
    fn password_precedence() {
        assert_eq!(
            AccessControl::check_password("root", "view", b"root"),
            PERM_ADMIN
        );
        assert_eq!(
            AccessControl::check_password("root", "view", b"view"),
            PERM_GUEST
        );
        assert_eq!(AccessControl::check_password("root", "view", b"nope"), PERM_NONE);
        // Empty guest slot disables guest login.
        assert_eq!(AccessControl::check_password("root", "", b""), PERM_NONE);
    }

    #[test]
    fn acl_remembers_watermark() {
        let mut acl = AccessControl::new();
        acl.record_login(&key(1), PERM_ADMIN, 500);
        acl.record_login(&key(1), PERM_ADMIN, 400);
        assert_eq!(acl.watermark(&key(1)), Some(500));
        assert_eq!(acl.watermark(&key(2)), None);
    }
}
