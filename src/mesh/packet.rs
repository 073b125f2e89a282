//! Wire format: one header byte, a one-byte path length, the hop path,
//! and the payload. Payload length is never on the wire — receivers derive
//! it from the framing length.

use thiserror::Error;

/// Hop path entries are single node-hash bytes; at most 63 of them.
pub const MAX_PATH_LEN: usize = 63;

/// Longest payload deployed peers accept. Longer payloads are clamped on
/// deserialize and the excess dropped.
pub const MAX_PAYLOAD_LEN: usize = 180;

/// Full frame bound: header + path_len + path + payload.
pub const MAX_FRAME_LEN: usize = 255;

const ROUTE_MASK: u8 = 0x03;
const TYPE_SHIFT: u8 = 2;
const TYPE_MASK: u8 = 0x0F;
const VERSION_SHIFT: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame shorter than 2 bytes")]
    TooShort,
    #[error("path length {0} exceeds {MAX_PATH_LEN}")]
    BadPath(u8),
    #[error("declared path overruns a {0}-byte frame")]
    BadLength(usize),
}

/// Route nibble, bits 0-1 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    TransportFlood,
    Flood,
    Direct,
    TransportDirect,
}

impl RouteType {
    fn from_bits(bits: u8) -> Self {
        match bits & ROUTE_MASK {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    fn bits(self) -> u8 {
        match self {
            RouteType::TransportFlood => 0,
            RouteType::Flood => 1,
            RouteType::Direct => 2,
            RouteType::TransportDirect => 3,
        }
    }
}

/// Payload type, bits 2-5 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Request,
    Response,
    TxtMsg,
    Ack,
    Advert,
    GroupTxt,
    GroupData,
    AnonRequest,
    Path,
    Trace,
    Control,
    Reserved(u8),
}

impl PayloadType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & TYPE_MASK {
            0x0 => PayloadType::Request,
            0x1 => PayloadType::Response,
            0x2 => PayloadType::TxtMsg,
            0x3 => PayloadType::Ack,
            0x4 => PayloadType::Advert,
            0x5 => PayloadType::GroupTxt,
            0x6 => PayloadType::GroupData,
            0x7 => PayloadType::AnonRequest,
            0x8 => PayloadType::Path,
            0x9 => PayloadType::Trace,
            0xA => PayloadType::Control,
            other => PayloadType::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PayloadType::Request => 0x0,
            PayloadType::Response => 0x1,
            PayloadType::TxtMsg => 0x2,
            PayloadType::Ack => 0x3,
            PayloadType::Advert => 0x4,
            PayloadType::GroupTxt => 0x5,
            PayloadType::GroupData => 0x6,
            PayloadType::AnonRequest => 0x7,
            PayloadType::Path => 0x8,
            PayloadType::Trace => 0x9,
            PayloadType::Control => 0xA,
            PayloadType::Reserved(v) => v & TYPE_MASK,
        }
    }

    /// Payloads that open with a destination hash when directly addressed.
    pub fn is_addressed(self) -> bool {
        matches!(
            self,
            PayloadType::AnonRequest | PayloadType::Request | PayloadType::Response
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            PayloadType::Request => "REQ",
            PayloadType::Response => "RESP",
            PayloadType::TxtMsg => "TXT",
            PayloadType::Ack => "ACK",
            PayloadType::Advert => "ADVERT",
            PayloadType::GroupTxt => "GRP_TXT",
            PayloadType::GroupData => "GRP_DATA",
            PayloadType::AnonRequest => "ANON_REQ",
            PayloadType::Path => "PATH",
            PayloadType::Trace => "TRACE",
            PayloadType::Control => "CONTROL",
            PayloadType::Reserved(_) => "RESERVED",
        }
    }
}

/// One mesh packet plus the RX metadata the radio reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: u8,
    pub path: Vec<u8>,
    pub payload: Vec<u8>,
    /// dBm, receive side only.
    pub rssi: i16,
    /// Signed quarter-dB, receive side only.
    pub snr_q: i8,
    pub received_at_ms: u64,
}

impl Packet {
    pub fn new(route: RouteType, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        let header = route.bits() | (payload_type.bits() << TYPE_SHIFT);
        Self { header, path: Vec::new(), payload, rssi: 0, snr_q: 0, received_at_ms: 0 }
    }

    pub fn route(&self) -> RouteType {
        RouteType::from_bits(self.header)
    }

    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_bits(self.header >> TYPE_SHIFT)
    }

    pub fn version(&self) -> u8 {
        self.header >> VERSION_SHIFT
    }

    pub fn is_flood(&self) -> bool {
        matches!(self.route(), RouteType::Flood | RouteType::TransportFlood)
    }

    /// Total bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        2 + self.path.len() + self.payload.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.header);
        out.push(self.path.len() as u8);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a received frame. Oversized payloads are clamped to
    /// [`MAX_PAYLOAD_LEN`]; the caller learns about it from the returned
    /// `clamped` flag and keeps its own counter.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, bool), PacketError> {
        if bytes.len() < 2 {
            return Err(PacketError::TooShort);
        }
        let header = bytes[0];
        let path_len = bytes[1] as usize;
        if path_len > MAX_PATH_LEN {
            return Err(PacketError::BadPath(bytes[1]));
        }
        if 2 + path_len > bytes.len() {
            return Err(PacketError::BadLength(bytes.len()));
        }

        let path = bytes[2..2 + path_len].to_vec();
        let rest = &bytes[2 + path_len..];
        let clamped = rest.len() > MAX_PAYLOAD_LEN;
        let payload = rest[..rest.len().min(MAX_PAYLOAD_LEN)].to_vec();

        Ok((
            Self { header, path, payload, rssi: 0, snr_q: 0, received_at_ms: 0 },
            clamped,
        ))
    }
}
