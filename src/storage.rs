//! Non-volatile persistence: three fixed-offset records in a ≥512-byte
//! commit-based area.
//!
//! Every record carries magic, version and a trailing CRC-16. Any check
//! failing on load means defaults are used and written back; a half-done
//! commit therefore costs configuration, never a crash.

use thiserror::Error;
use tracing::warn;

use crate::identity::NodeIdentity;
use crate::stats::PersistentStats;
use crate::types::{NodeConfig, AUTO_SAVE_MIN_SECS, MAX_NAME_LEN};

/// Minimum area the provider must expose.
pub const STORE_SIZE: usize = 512;

pub const CONFIG_OFFSET: usize = 0;
pub const CONFIG_AREA: usize = 96;
pub const IDENTITY_OFFSET: usize = 96;
pub const IDENTITY_AREA: usize = 160;
pub const STATS_OFFSET: usize = 256;
pub const STATS_AREA: usize = 64;

const CONFIG_MAGIC: u16 = 0x4D43;
const CONFIG_VERSION: u8 = 1;
const IDENTITY_MAGIC: u16 = 0x4D49;
const IDENTITY_VERSION: u8 = 1;
const STATS_MAGIC: u16 = 0x4D53;
const STATS_VERSION: u8 = 1;

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(String),
    #[error("access beyond the storage area")]
    OutOfBounds,
    /// Magic, version or CRC mismatch.
    #[error("record corrupt")]
    Corrupt,
}

/// Byte-addressable non-volatile area with commit semantics. Writes are
/// buffered; nothing is durable until [`NvStorage::commit`].
pub trait NvStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

// =============================================================================
// RECORD CODECS
// =============================================================================

fn seal(buf: &mut [u8], body_len: usize) {
    let crc = CRC16.checksum(&buf[..body_len]);
    buf[body_len..body_len + 2].copy_from_slice(&crc.to_le_bytes());
}

fn check_seal(buf: &[u8], body_len: usize) -> bool {
    let stored = u16::from_le_bytes([buf[body_len], buf[body_len + 1]]);
    CRC16.checksum(&buf[..body_len]) == stored
}

fn put_short_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_NAME_LEN);
    buf[0] = len as u8;
    buf[1..1 + len].copy_from_slice(&bytes[..len]);
}

fn get_short_str(buf: &[u8]) -> String {
    let len = (buf[0] as usize).min(MAX_NAME_LEN);
    String::from_utf8_lossy(&buf[1..1 + len]).into_owned()
}

const CONFIG_BODY: usize = 74;

fn encode_config(cfg: &NodeConfig) -> [u8; CONFIG_AREA] {
    let mut buf = [0u8; CONFIG_AREA];
    buf[0..2].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
    buf[2] = CONFIG_VERSION;
    buf[3..5].copy_from_slice(&cfg.advert_interval_secs.to_le_bytes());
    buf[5..7].copy_from_slice(&cfg.autosave_secs.to_le_bytes());
    buf[7] = u8::from(cfg.sleep_enabled)
        | u8::from(cfg.rx_boost) << 1
        | u8::from(cfg.repeat_enabled) << 2
        | u8::from(cfg.limits_enabled) << 3
        | u8::from(cfg.alert_enabled) << 4;
    buf[8] = cfg.rx_mode;
    buf[9] = cfg.neighbor_cap;
    put_short_str(&mut buf[10..26], &cfg.admin_password);
    put_short_str(&mut buf[26..42], &cfg.guest_password);
    buf[42..74].copy_from_slice(&cfg.alert_dest);
    seal(&mut buf, CONFIG_BODY);
    buf
}

fn decode_config(buf: &[u8; CONFIG_AREA]) -> Result<NodeConfig, StorageError> {
    if u16::from_le_bytes([buf[0], buf[1]]) != CONFIG_MAGIC
        || buf[2] != CONFIG_VERSION
        || !check_seal(buf, CONFIG_BODY)
    {
        return Err(StorageError::Corrupt);
    }
    let flags = buf[7];
    let mut alert_dest = [0u8; 32];
    alert_dest.copy_from_slice(&buf[42..74]);
    Ok(NodeConfig {
        advert_interval_secs: u16::from_le_bytes([buf[3], buf[4]]),
        autosave_secs: u16::from_le_bytes([buf[5], buf[6]]).max(AUTO_SAVE_MIN_SECS),
        sleep_enabled: flags & 0x01 != 0,
        rx_boost: flags & 0x02 != 0,
        repeat_enabled: flags & 0x04 != 0,
        limits_enabled: flags & 0x08 != 0,
        rx_mode: buf[8].min(2),
        neighbor_cap: buf[9],
        alert_enabled: flags & 0x10 != 0,
        alert_dest,
        admin_password: get_short_str(&buf[10..26]),
        guest_password: get_short_str(&buf[26..42]),
    })
}

const IDENTITY_BODY: usize = 124;

fn encode_identity(id: &NodeIdentity) -> [u8; IDENTITY_AREA] {
    let mut buf = [0u8; IDENTITY_AREA];
    buf[0..2].copy_from_slice(&IDENTITY_MAGIC.to_le_bytes());
    buf[2] = IDENTITY_VERSION;
    buf[3..35].copy_from_slice(&id.public_key);
    buf[35..99].copy_from_slice(id.expanded_private());
    buf[99] = id.flags;
    buf[100..104].copy_from_slice(&id.lat.to_le_bytes());
    buf[104..108].copy_from_slice(&id.lon.to_le_bytes());
    put_short_str(&mut buf[108..124], &id.name);
    seal(&mut buf, IDENTITY_BODY);
    buf
}

fn decode_identity(buf: &[u8; IDENTITY_AREA]) -> Result<NodeIdentity, StorageError> {
    if u16::from_le_bytes([buf[0], buf[1]]) != IDENTITY_MAGIC
        || buf[2] != IDENTITY_VERSION
        || !check_seal(buf, IDENTITY_BODY)
    {
        return Err(StorageError::Corrupt);
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[3..35]);
    let mut private_key = [0u8; 64];
    private_key.copy_from_slice(&buf[35..99]);
    let lat = i32::from_le_bytes([buf[100], buf[101], buf[102], buf[103]]);
    let lon = i32::from_le_bytes([buf[104], buf[105], buf[106], buf[107]]);
    NodeIdentity::from_stored(
        public_key,
        private_key,
        get_short_str(&buf[108..124]),
        buf[99],
        lat,
        lon,
    )
    .ok_or(StorageError::Corrupt)
}

const STATS_BODY: usize = 43;

fn encode_stats(stats: &PersistentStats) -> [u8; STATS_AREA] {
    let mut buf = [0u8; STATS_AREA];
    buf[0..2].copy_from_slice(&STATS_MAGIC.to_le_bytes());
    buf[2] = STATS_VERSION;
    let fields = [
        stats.rx,
        stats.tx,
        stats.fwd,
        stats.unique_nodes,
        stats.logins,
        stats.login_failures,
        stats.rate_limited,
        stats.uptime_secs,
        stats.boot_count,
        stats.first_boot_unix,
    ];
    for (i, f) in fields.iter().enumerate() {
        buf[3 + i * 4..7 + i * 4].copy_from_slice(&f.to_le_bytes());
    }
    seal(&mut buf, STATS_BODY);
    buf
}

fn decode_stats(buf: &[u8; STATS_AREA]) -> Result<PersistentStats, StorageError> {
    if u16::from_le_bytes([buf[0], buf[1]]) != STATS_MAGIC
        || buf[2] != STATS_VERSION
        || !check_seal(buf, STATS_BODY)
    {
        return Err(StorageError::Corrupt);
    }
    let mut fields = [0u32; 10];
    for (i, f) in fields.iter_mut().enumerate() {
        *f = u32::from_le_bytes([
            buf[3 + i * 4],
            buf[4 + i * 4],
            buf[5 + i * 4],
            buf[6 + i * 4],
        ]);
    }
    Ok(PersistentStats {
        rx: fields[0],
        tx: fields[1],
        fwd: fields[2],
        unique_nodes: fields[3],
        logins: fields[4],
        login_failures: fields[5],
        rate_limited: fields[6],
        uptime_secs: fields[7],
        boot_count: fields[8],
        first_boot_unix: fields[9],
    })
}

// =============================================================================
// LOAD / SAVE
// =============================================================================

/// Load the config record; `Corrupt` means the caller should default+save.
pub fn load_config<S: NvStorage>(store: &mut S) -> Result<NodeConfig, StorageError> {
    let mut buf = [0u8; CONFIG_AREA];
    store.read(CONFIG_OFFSET, &mut buf)?;
    decode_config(&buf)
}

pub fn save_config<S: NvStorage>(store: &mut S, cfg: &NodeConfig) -> Result<(), StorageError> {
    store.write(CONFIG_OFFSET, &encode_config(cfg))?;
    store.commit()
}

pub fn load_identity<S: NvStorage>(store: &mut S) -> Result<NodeIdentity, StorageError> {
    let mut buf = [0u8; IDENTITY_AREA];
    store.read(IDENTITY_OFFSET, &mut buf)?;
    decode_identity(&buf)
}

pub fn save_identity<S: NvStorage>(store: &mut S, id: &NodeIdentity) -> Result<(), StorageError> {
    store.write(IDENTITY_OFFSET, &encode_identity(id))?;
    store.commit()
}

pub fn load_stats<S: NvStorage>(store: &mut S) -> Result<PersistentStats, StorageError> {
    let mut buf = [0u8; STATS_AREA];
    store.read(STATS_OFFSET, &mut buf)?;
    decode_stats(&buf)
}

pub fn save_stats<S: NvStorage>(store: &mut S, stats: &PersistentStats) -> Result<(), StorageError> {
    store.write(STATS_OFFSET, &encode_stats(stats))?;
    store.commit()
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Volatile provider for tests and the simulator.
#[derive(Debug, Clone)]
pub struct MemStorage {
    data: Vec<u8>,
    pub commits: u32,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self { data: vec![0u8; STORE_SIZE], commits: 0 }
    }
}

impl NvStorage for MemStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds);
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds);
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.commits += 1;
        Ok(())
    }
}

/// File-backed provider for the host harness: the whole area is one small
/// file rewritten atomically on commit.
#[derive(Debug)]
pub struct FileStorage {
    path: std::path::PathBuf,
    data: Vec<u8>,
}

impl FileStorage {
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(mut bytes) => {
                bytes.resize(STORE_SIZE, 0);
                bytes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "storage file missing, starting blank");
                vec![0u8; STORE_SIZE]
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok(Self { path, data })
    }
}

impl NvStorage for FileStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds);
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds);
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &self.data).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let mut store = MemStorage::new();
        let mut cfg = NodeConfig::default();
        cfg.advert_interval_secs = 600;
        cfg.admin_password = "hunter".into();
        cfg.alert_dest[0] = 0x7E;
        save_config(&mut store, &cfg).unwrap();
        let back = load_config(&mut store).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(store.commits, 1);
    }

    #[test]
    fn blank_area_reads_corrupt() {
        let mut store = MemStorage::new();
        assert!(matches!(load_config(&mut store), Err(StorageError::Corrupt)));
        assert!(matches!(load_identity(&mut store), Err(StorageError::Corrupt)));
        assert!(matches!(load_stats(&mut store), Err(StorageError::Corrupt)));
    }

    #[test]
    fn identity_roundtrip_signs_identically() {
        let mut store = MemStorage::new();
        let mut id = NodeIdentity::from_seed(&[5u8; 32], "relay");
        id.set_location(1_000_000, -2_000_000);
        save_identity(&mut store, &id).unwrap();
        let back = load_identity(&mut store).unwrap();
        assert_eq!(back.public_key, id.public_key);
        assert_eq!(back.name, "relay");
        assert_eq!(back.lat, 1_000_000);
        assert_eq!(back.sign(b"x").to_vec(), id.sign(b"x").to_vec());
    }

    #[test]
    fn bitflip_detected() {
        let mut store = MemStorage::new();
        save_stats(&mut store, &PersistentStats { rx: 7, ..Default::default() }).unwrap();
        // Flip one byte inside the stats record.
        let mut byte = [0u8; 1];
        store.read(STATS_OFFSET + 5, &mut byte).unwrap();
        store.write(STATS_OFFSET + 5, &[byte[0] ^ 0x40]).unwrap();
        assert!(matches!(load_stats(&mut store), Err(StorageError::Corrupt)));
    }

    #[test]
    fn autosave_clamped_on_load() {
        let mut store = MemStorage::new();
        let cfg = NodeConfig { autosave_secs: 10, ..Default::default() };
        save_config(&mut store, &cfg).unwrap();
        assert_eq!(load_config(&mut store).unwrap().autosave_secs, AUTO_SAVE_MIN_SECS);
    }
}
