//! Signed self-description adverts: building our own and parsing peers'.
//!
//! Advert payload: `[pubkey:32 | ts:u32-LE | sig:64 | appdata]` with the
//! signature covering `pubkey || ts || appdata`. Appdata is
//! `[flags:1 | lat:i32-LE lon:i32-LE? | name?]`.
//!
//! A known peer firmware omits the flags byte when it carries a location,
//! so the parser accepts both layouts: canonical when the would-be flags
//! byte looks valid, otherwise a scan for the first plausible name start
//! classifying whatever precedes it.

use thiserror::Error;
use tracing::debug;

use super::packet::{Packet, PayloadType, RouteType};
use crate::identity::{self, NodeIdentity};
use crate::types::{NodeType, ADV_FLAG_LOCATION, ADV_FLAG_NAME, ADV_TYPE_MASK};

/// Fixed prefix: pubkey + timestamp + signature.
pub const ADVERT_PREFIX_LEN: usize = 32 + 4 + 64;

/// Longest name we keep from a peer advert.
const MAX_PARSED_NAME: usize = 31;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdvertError {
    #[error("advert shorter than {ADVERT_PREFIX_LEN} bytes")]
    TooShort,
    #[error("advert signature invalid")]
    BadSignature,
    /// The builder re-checks its own signature before release.
    #[error("self-verification failed")]
    SelfVerify,
    #[error("appdata matches neither canonical nor fallback layout")]
    MalformedAppData,
}

/// Best-effort view of a parsed advert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertInfo {
    pub pubkey: [u8; 32],
    pub pubkey_hash: u8,
    pub timestamp: u32,
    pub flags: u8,
    pub has_location: bool,
    pub lat: i32,
    pub lon: i32,
    pub has_name: bool,
    pub name: String,
    pub is_repeater: bool,
    pub is_chat: bool,
}

/// Build a signed advert for our own identity.
///
/// `zero_hop` selects direct routing with an empty path (the form
/// neighbors key their directness on); otherwise the advert floods.
pub fn build_advert(
    identity: &NodeIdentity,
    timestamp: u32,
    zero_hop: bool,
) -> Result<Packet, AdvertError> {
    let appdata = build_appdata(identity);

    let mut signed = Vec::with_capacity(36 + appdata.len());
    signed.extend_from_slice(&identity.public_key);
    signed.extend_from_slice(&timestamp.to_le_bytes());
    signed.extend_from_slice(&appdata);
    let sig = identity.sign(&signed);

    // Never release an advert we cannot verify ourselves.
    if !identity::verify(&identity.public_key, &signed, &sig) {
        return Err(AdvertError::SelfVerify);
    }

    let mut payload = Vec::with_capacity(ADVERT_PREFIX_LEN + appdata.len());
    payload.extend_from_slice(&identity.public_key);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&sig);
    payload.extend_from_slice(&appdata);

    let route = if zero_hop { RouteType::Direct } else { RouteType::Flood };
    Ok(Packet::new(route, PayloadType::Advert, payload))
}

fn build_appdata(identity: &NodeIdentity) -> Vec<u8> {
    let mut appdata = vec![identity.flags];
    if identity.has_location() {
        appdata.extend_from_slice(&identity.lat.to_le_bytes());
        appdata.extend_from_slice(&identity.lon.to_le_bytes());
    }
    if identity.flags & ADV_FLAG_NAME != 0 {
        appdata.extend_from_slice(identity.name.as_bytes());
    }
    appdata
}

/// Parse and verify a received advert payload.
pub fn parse_advert(payload: &[u8]) -> Result<AdvertInfo, AdvertError> {
    if payload.len() < ADVERT_PREFIX_LEN {
        return Err(AdvertError::TooShort);
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&payload[..32]);
    let timestamp = u32::from_le_bytes([payload[32], payload[33], payload[34], payload[35]]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&payload[36..100]);
    let appdata = &payload[ADVERT_PREFIX_LEN..];

    // The signature covers the appdata exactly as transmitted, so even the
    // buggy layout verifies; only the interpretation below is tolerant.
    let mut signed = Vec::with_capacity(36 + appdata.len());
    signed.extend_from_slice(&pubkey);
    signed.extend_from_slice(&timestamp.to_le_bytes());
    signed.extend_from_slice(appdata);
    if !identity::verify(&pubkey, &signed, &sig) {
        return Err(AdvertError::BadSignature);
    }

    let (flags, has_location, lat, lon, name) = parse_appdata(appdata)?;
    let node_type = NodeType::from_nibble(flags & ADV_TYPE_MASK);

    Ok(AdvertInfo {
        pubkey,
        pubkey_hash: pubkey[0],
        timestamp,
        flags,
        has_location,
        lat,
        lon,
        has_name: !name.is_empty(),
        name,
        is_repeater: node_type == Some(NodeType::Repeater),
        is_chat: node_type == Some(NodeType::Chat),
    })
}

/// Appdata interpretation: canonical if the flags byte looks valid, else
/// scan for a name start and classify the preceding bytes.
fn parse_appdata(appdata: &[u8]) -> Result<(u8, bool, i32, i32, String), AdvertError> {
    if appdata.is_empty() {
        return Ok((0, false, 0, 0, String::new()));
    }

    let candidate = appdata[0];
    let recognized_type = NodeType::from_nibble(candidate & ADV_TYPE_MASK).is_some();
    if candidate & ADV_FLAG_NAME != 0 && recognized_type {
        return parse_canonical(appdata);
    }

    // Fallback for the peer that drops the flags byte with a location.
    let Some(name_start) = scan_name_start(appdata) else {
        return Err(AdvertError::MalformedAppData);
    };
    match name_start {
        0 => {
            let name = take_name(&appdata[name_start..]);
            Ok((ADV_FLAG_NAME, false, 0, 0, name))
        }
        8 => {
            let lat = i32::from_le_bytes([appdata[0], appdata[1], appdata[2], appdata[3]]);
            let lon = i32::from_le_bytes([appdata[4], appdata[5], appdata[6], appdata[7]]);
            let name = take_name(&appdata[name_start..]);
            debug!("advert appdata missing flags byte, recovered location");
            Ok((ADV_FLAG_NAME | ADV_FLAG_LOCATION, true, lat, lon, name))
        }
        7 => {
            // One location byte lost in transit; the coordinates are not
            // recoverable but the name still is.
            let name = take_name(&appdata[name_start..]);
            debug!("advert appdata with truncated location, coordinates dropped");
            Ok((ADV_FLAG_NAME, false, 0, 0, name))
        }
        _ => Err(AdvertError::MalformedAppData),
    }
}

fn parse_canonical(appdata: &[u8]) -> Result<(u8, bool, i32, i32, String), AdvertError> {
    let flags = appdata[0];
    let mut cursor = 1usize;
    let mut lat = 0i32;
    let mut lon = 0i32;
    let has_location = flags & ADV_FLAG_LOCATION != 0;

    if has_location {
        if appdata.len() < cursor + 8 {
            return Err(AdvertError::MalformedAppData);
        }
        lat = i32::from_le_bytes([
            appdata[cursor],
            appdata[cursor + 1],
            appdata[cursor + 2],
            appdata[cursor + 3],
        ]);
        lon = i32::from_le_bytes([
            appdata[cursor + 4],
            appdata[cursor + 5],
            appdata[cursor + 6],
            appdata[cursor + 7],
        ]);
        cursor += 8;
    }

    let name = if flags & ADV_FLAG_NAME != 0 {
        take_name(&appdata[cursor..])
    } else {
        String::new()
    };
    Ok((flags, has_location, lat, lon, name))
}

/// First offset that plausibly starts a name: an ASCII letter followed by
/// at least three more characters from `[A-Za-z0-9-]`.
fn scan_name_start(appdata: &[u8]) -> Option<usize> {
    for i in 0..appdata.len() {
        if appdata[i].is_ascii_alphabetic()
            && appdata.len() >= i + 4
            && appdata[i + 1..i + 4].iter().all(|&b| is_name_char(b))
        {
            return Some(i);
        }
    }
    None
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

fn take_name(bytes: &[u8]) -> String {
    let mut name = String::from_utf8_lossy(bytes).into_owned();
    if name.len() > MAX_PARSED_NAME {
        // Cut on a character boundary; lossy decoding can produce
        // multi-byte replacement characters anywhere.
        let mut cut = MAX_PARSED_NAME;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        let mut id = NodeIdentity::from_seed(&[3u8; 32], "relay-1");
        id.set_location(46_500_000, 6_600_000);
        id
    }

    #[test]
    fn build_parse_roundtrip() {
        let id = identity();
        let pkt = build_advert(&id, 1_737_312_000, false).unwrap();
        assert_eq!(pkt.payload_type(), PayloadType::Advert);
        assert_eq!(pkt.route(), RouteType::Flood);

        let info = parse_advert(&pkt.payload).unwrap();
        assert_eq!(info.pubkey, id.public_key);
        assert_eq!(info.pubkey_hash, id.node_hash());
        assert_eq!(info.timestamp, 1_737_312_000);
        assert!(info.has_location);
        assert_eq!(info.lat, 46_500_000);
        assert_eq!(info.lon, 6_600_000);
        assert_eq!(info.name, "relay-1");
        assert!(info.is_repeater);
    }

    #[test]
    fn zero_hop_is_direct_with_empty_path() {
        let pkt = build_advert(&identity(), 1_737_312_000, true).unwrap();
        assert_eq!(pkt.route(), RouteType::Direct);
        assert!(pkt.path.is_empty());
    }

    #[test]
    fn tampered_advert_rejected() {
        let id = identity();
        let mut pkt = build_advert(&id, 1_737_312_000, false).unwrap();
        let last = pkt.payload.len() - 1;
        pkt.payload[last] ^= 0x01;
        assert_eq!(parse_advert(&pkt.payload), Err(AdvertError::BadSignature));
    }

    #[test]
    fn missing_flags_byte_recovered() {
        // Simulate the buggy peer: appdata = lat | lon | name, no flags.
        let id = identity();
        let mut appdata = Vec::new();
        appdata.extend_from_slice(&46_500_000i32.to_le_bytes());
        appdata.extend_from_slice(&6_600_000i32.to_le_bytes());
        appdata.extend_from_slice(b"alpine-gw");

        let mut signed = Vec::new();
        signed.extend_from_slice(&id.public_key);
        signed.extend_from_slice(&1_737_312_000u32.to_le_bytes());
        signed.extend_from_slice(&appdata);
        let sig = id.sign(&signed);

        let mut payload = Vec::new();
        payload.extend_from_slice(&id.public_key);
        payload.extend_from_slice(&1_737_312_000u32.to_le_bytes());
        payload.extend_from_slice(&sig);
        payload.extend_from_slice(&appdata);

        let info = parse_advert(&payload).unwrap();
        assert!(info.has_location);
        assert_eq!(info.lat, 46_500_000);
        assert_eq!(info.lon, 6_600_000);
        assert_eq!(info.name, "alpine-gw");
    }

    #[test]
    fn garbage_appdata_rejected() {
        let id = identity();
        let appdata = [0x01u8, 0x02, 0x03, 0x04, 0x05];

        let mut signed = Vec::new();
        signed.extend_from_slice(&id.public_key);
        signed.extend_from_slice(&1_737_312_000u32.to_le_bytes());
        signed.extend_from_slice(&appdata);
        let sig = id.sign(&signed);

        let mut payload = Vec::new();
        payload.extend_from_slice(&id.public_key);
        payload.extend_from_slice(&1_737_312_000u32.to_le_bytes());
        payload.extend_from_slice(&sig);
        payload.extend_from_slice(&appdata);

        assert_eq!(parse_advert(&payload), Err(AdvertError::MalformedAppData));
    }
}
