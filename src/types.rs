// meshrelay — Protocol Constants and Types
// Copyright (c) 2024-2026 The meshrelay developers
// Distributed under the MIT software license.

//! Node-level constants and the persistent configuration record.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every table has a fixed capacity with an
//!    explicit eviction rule. The node runs on a target with tens of
//!    kilobytes of RAM; nothing here grows with traffic.
//!
//! 2. **Single source of truth** — wire and table limits live in this file
//!    and in `mesh::packet`. Handlers must not hardcode sizes elsewhere.
//!
//! # Memory Budget
//!
//! | Table        | Capacity | Entry size | Total   |
//! |--------------|----------|------------|---------|
//! | Dedup cache  | 32       | 8 B        | 256 B   |
//! | SeenNodes    | 16       | ~40 B      | ~640 B  |
//! | Contacts     | 8        | ~96 B      | ~768 B  |
//! | Neighbors    | 50       | ~48 B      | ~2.4 KB |
//! | Sessions     | 8        | ~120 B     | ~1 KB   |
//! | TX queue     | 4        | ≤255 B     | ~1 KB   |

// =============================================================================
// FIRMWARE IDENTIFICATION
// =============================================================================

/// Human-readable firmware version, reported by the `status` CLI command.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Single-byte firmware tag carried in the LOGIN_OK response.
pub const FIRMWARE_BYTE: u8 = 0x04;

// =============================================================================
// TABLE CAPACITIES
// =============================================================================

/// Recent packet fingerprints held for duplicate suppression.
/// Replacement is FIFO; 32 entries cover several seconds of a busy channel.
pub const DEDUP_CAPACITY: usize = 32;

/// Observed node hashes with signal history. Evicted LRU by last-seen.
pub const SEEN_NODES_CAPACITY: usize = 16;

/// Full-key contacts with cached shared secrets. Evicted LRU.
pub const CONTACTS_CAPACITY: usize = 8;

/// Default cap for the direct-neighbor table. Tunable via `NodeConfig`;
/// entries expire after [`NEIGHBOR_EXPIRY_SECS`] before LRU applies.
pub const NEIGHBORS_DEFAULT_CAPACITY: usize = 50;

/// A neighbor not heard for this long is expired before any LRU eviction.
pub const NEIGHBOR_EXPIRY_SECS: u32 = 3600;

/// Concurrent authenticated client sessions. Evicted LRU by activity.
pub const SESSIONS_CAPACITY: usize = 8;

/// Access-control entries remembered across sessions, keyed by a 6-byte
/// pubkey prefix.
pub const ACL_CAPACITY: usize = 16;

/// Outbound packets waiting for the channel. Overflow evicts the oldest.
pub const TX_QUEUE_CAPACITY: usize = 4;

// =============================================================================
// RATE LIMITS
// =============================================================================
// Sliding windows; see `mesh::rate_limit`. Reconfiguration resets a window.

/// Anonymous login attempts allowed per minute.
pub const LOGIN_LIMIT: (u32, u64) = (5, 60_000);

/// Authenticated requests allowed per minute.
pub const REQUEST_LIMIT: (u32, u64) = (30, 60_000);

/// Flood forwards allowed per minute.
pub const FORWARD_LIMIT: (u32, u64) = (100, 60_000);

/// Discovery responses allowed per two minutes.
pub const DISCOVER_LIMIT: (u32, u64) = (4, 120_000);

// =============================================================================
// SCHEDULING
// =============================================================================

/// Serial interaction is preserved for this long after boot: the reactor
/// refuses to hand out sleep hints inside the window.
pub const BOOT_SAFE_WINDOW_MS: u64 = 120_000;

/// Lower bound on the persistent-stats auto-save interval. Flash wear is
/// the constraint; the CLI cannot configure anything shorter.
pub const AUTO_SAVE_MIN_SECS: u16 = 300;

/// Delay between the first time sync and the first self advert.
pub const FIRST_ADVERT_DELAY_MS: u64 = 5_000;

/// Keep-alive interval handed to clients in LOGIN_OK, in seconds.
/// Encoded on the wire divided by 4 to fit one byte.
pub const KEEP_ALIVE_SECS: u32 = 240;

/// A CLI-issued reboot fires this long after its response leaves the queue.
pub const REBOOT_GRACE_MS: u64 = 500;

// =============================================================================
// ERROR THRESHOLDS
// =============================================================================

/// Consecutive radio driver errors before the radio is reset.
pub const MAX_RADIO_ERRORS: u32 = 5;

/// Total recovered errors before the node requests a reboot.
pub const MAX_TOTAL_ERRORS: u32 = 25;

// =============================================================================
// PERMISSIONS
// =============================================================================

/// No access. Sessions never store this; a failed login installs nothing.
pub const PERM_NONE: u8 = 0x00;

/// Read-only command set.
pub const PERM_GUEST: u8 = 0x01;

/// Full command set. Admin implies the guest bits.
pub const PERM_ADMIN: u8 = 0x03;

// =============================================================================
// ADVERT FLAGS
// =============================================================================
// One byte: low nibble = node type, high nibble = content bits.

/// Appdata carries latitude and longitude.
pub const ADV_FLAG_LOCATION: u8 = 0x10;

/// Appdata ends with a display name.
pub const ADV_FLAG_NAME: u8 = 0x80;

/// Mask for the node-type nibble.
pub const ADV_TYPE_MASK: u8 = 0x0F;

/// Role a node advertises in its flags nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    None,
    Chat,
    Repeater,
    Room,
    Sensor,
}

impl NodeType {
    /// Decode the low nibble of an advert flags byte. Values above 4 are
    /// not recognized and yield `None` here so callers can reject them.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble & ADV_TYPE_MASK {
            0 => Some(NodeType::None),
            1 => Some(NodeType::Chat),
            2 => Some(NodeType::Repeater),
            3 => Some(NodeType::Room),
            4 => Some(NodeType::Sensor),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            NodeType::None => 0,
            NodeType::Chat => 1,
            NodeType::Repeater => 2,
            NodeType::Room => 3,
            NodeType::Sensor => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NodeType::None => "none",
            NodeType::Chat => "chat",
            NodeType::Repeater => "repeater",
            NodeType::Room => "room",
            NodeType::Sensor => "sensor",
        }
    }
}

// =============================================================================
// NODE CONFIGURATION
// =============================================================================

/// Maximum password and node-name length, bytes.
pub const MAX_NAME_LEN: usize = 15;

/// Mutable node configuration, persisted as the NodeConfig record.
///
/// Defaults apply on first boot and whenever the stored record fails its
/// magic/version/CRC check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Seconds between periodic self adverts. 0 disables the beacon.
    pub advert_interval_secs: u16,
    /// Seconds between persistent-stats saves; clamped to
    /// [`AUTO_SAVE_MIN_SECS`] on load and on CLI writes.
    pub autosave_secs: u16,
    /// Deep sleep permitted when the reactor is idle.
    pub sleep_enabled: bool,
    /// Radio RX boosted-gain mode.
    pub rx_boost: bool,
    /// Flood forwarding enabled. Dedup admission still runs when off.
    pub repeat_enabled: bool,
    /// Rate limiters enforced.
    pub limits_enabled: bool,
    /// RX duty mode: 0 = continuous, 1 = duty-cycled, 2 = duty-cycled with
    /// deep sleep between events.
    pub rx_mode: u8,
    /// Direct-neighbor table capacity.
    pub neighbor_cap: u8,
    /// New-node alerts enabled.
    pub alert_enabled: bool,
    /// Full public key of the alert destination; all zero when unset.
    pub alert_dest: [u8; 32],
    /// Admin password, ≤ 15 bytes.
    pub admin_password: String,
    /// Guest password, ≤ 15 bytes. Empty disables guest login.
    pub guest_password: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advert_interval_secs: 1800,
            autosave_secs: AUTO_SAVE_MIN_SECS,
            sleep_enabled: false,
            rx_boost: true,
            repeat_enabled: true,
            limits_enabled: true,
            rx_mode: 1,
            neighbor_cap: NEIGHBORS_DEFAULT_CAPACITY as u8,
            alert_enabled: false,
            alert_dest: [0u8; 32],
            admin_password: "password".to_string(),
            guest_password: String::new(),
        }
    }
}

impl NodeConfig {
    pub fn alert_dest_set(&self) -> bool {
        self.alert_dest.iter().any(|&b| b != 0)
    }
}
