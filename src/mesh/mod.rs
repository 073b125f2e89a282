//! Mesh protocol layer: wire codec, forwarding, CSMA, adverts, tables and
//! the request dispatcher.

pub mod advert;
pub mod contacts;
pub mod csma;
pub mod dedup;
pub mod dispatch;
pub mod forward;
pub mod neighbors;
pub mod packet;
pub mod rate_limit;
pub mod seen;
pub mod session;

// Re-exports
pub use advert::{build_advert, parse_advert, AdvertError, AdvertInfo};
pub use contacts::{Contact, ContactTable};
pub use csma::{backoff_ms, contention_slots, ChannelSense, TX_DELAY_MIN_MS};
pub use dedup::{fingerprint, DedupCache};
pub use dispatch::{
    CONTROL_DISCOVER_NIBBLE, CONTROL_DISCOVER_RESP, REQ_GET_ACCESS_LIST, REQ_GET_MINMAXAVG,
    REQ_GET_NEIGHBOURS, REQ_GET_STATUS, REQ_GET_TELEMETRY, REQ_KEEP_ALIVE, REQ_SEND_CLI,
    TXT_TYPE_CLI, TXT_TYPE_PLAIN, TXT_TYPE_SIGNED,
};
pub use forward::{evaluate, ForwardDecision, QueuedPacket, TxQueue};
pub use neighbors::{Neighbor, NeighborTable};
pub use packet::{
    Packet, PacketError, PayloadType, RouteType, MAX_FRAME_LEN, MAX_PATH_LEN, MAX_PAYLOAD_LEN,
};
pub use rate_limit::{RateLimiter, RateLimits};
pub use seen::{SeenNode, SeenNodes};
pub use session::{AccessControl, AclEntry, ClientSession, SessionTable};
