//! Flood forwarding: the eligibility rules and the bounded TX queue.

use std::collections::VecDeque;

use super::dedup::{fingerprint, DedupCache};
use super::packet::{Packet, MAX_PATH_LEN};
use super::rate_limit::{RateLimits, RateLimiter};
use crate::types::TX_QUEUE_CAPACITY;

/// Why a received flood was or was not queued for repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Forward,
    NotFlood,
    /// Directly addressed payload whose destination hash is ours.
    AddressedToUs,
    Duplicate,
    PathFull,
    RateLimited,
    /// Repeat mode disabled by configuration.
    Disabled,
}

/// Apply the forwarding rules in order. Dedup admission happens here —
/// even packets later refused for a full path or a tripped limiter are
/// admitted to the cache, so a retry cannot dodge rule 3.
pub fn evaluate(
    packet: &Packet,
    local_hash: u8,
    dedup: &mut DedupCache,
    forward_limiter: &mut RateLimiter,
    limits_enabled: bool,
    repeat_enabled: bool,
    now_ms: u64,
) -> ForwardDecision {
    if !packet.is_flood() {
        return ForwardDecision::NotFlood;
    }
    if packet.payload_type().is_addressed()
        && packet.payload.first() == Some(&local_hash)
    {
        return ForwardDecision::AddressedToUs;
    }
    if !dedup.admit(fingerprint(packet)) {
        return ForwardDecision::Duplicate;
    }
    if packet.path.len() >= MAX_PATH_LEN {
        return ForwardDecision::PathFull;
    }
    if !repeat_enabled {
        return ForwardDecision::Disabled;
    }
    if !RateLimits::check(forward_limiter, limits_enabled, now_ms) {
        return ForwardDecision::RateLimited;
    }
    ForwardDecision::Forward
}

/// One queued outbound packet.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub packet: Packet,
    /// Earliest transmit time; 0 means immediately.
    pub not_before_ms: u64,
    /// Request a reboot shortly after this packet leaves the air.
    pub reboot_after: bool,
}

impl QueuedPacket {
    pub fn immediate(packet: Packet) -> Self {
        Self { packet, not_before_ms: 0, reboot_after: false }
    }
}

/// Bounded FIFO of outbound packets. Overflow evicts the oldest entry;
/// scheduled adverts jump the line via [`TxQueue::push_front`].
#[derive(Debug, Default)]
pub struct TxQueue {
    entries: VecDeque<QueuedPacket>,
    pub overflow_drops: u32,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, entry: QueuedPacket) {
        if self.entries.len() >= TX_QUEUE_CAPACITY {
            self.entries.pop_front();
            self.overflow_drops = self.overflow_drops.saturating_add(1);
        }
        self.entries.push_back(entry);
    }

    pub fn push_front(&mut self, entry: QueuedPacket) {
        if self.entries.len() >= TX_QUEUE_CAPACITY {
            self.entries.pop_back();
            self.overflow_drops = self.overflow_drops.saturating_add(1);
        }
        self.entries.push_front(entry);
    }

    /// Remove and return the first entry whose hold-off has elapsed.
    pub fn pop_ready(&mut self, now_ms: u64) -> Option<QueuedPacket> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.not_before_ms <= now_ms)?;
        self.entries.remove(idx)
    }

    /// Time until any entry becomes ready, for sleep planning.
    pub fn next_ready_in_ms(&self, now_ms: u64) -> Option<u64> {
        self.entries
            .iter()
            .map(|e| e.not_before_ms.saturating_sub(now_ms))
            .min()
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
    use crate::mesh::packet::{PayloadType, RouteType};

    fn flood(payload: Vec<u8>) -> Packet {
        Packet::new(RouteType::Flood, PayloadType::TxtMsg, payload)
    }

    fn limits() -> RateLimiter {
        RateLimiter::new(100, 60_000)
    }

    #[test]
    fn direct_packets_not_forwarded() {
        let pkt = Packet::new(RouteType::Direct, PayloadType::TxtMsg, vec![1, 2]);
        let mut dedup = DedupCache::new();
        let mut rl = limits();
        assert_eq!(
            evaluate(&pkt, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::NotFlood
        );
    }

    #[test]
    fn addressed_request_to_us_dropped() {
        let pkt = Packet::new(RouteType::Flood, PayloadType::Request, vec![0x42, 0x10]);
        let mut dedup = DedupCache::new();
        let mut rl = limits();
        assert_eq!(
            evaluate(&pkt, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::AddressedToUs
        );
        // TXT floods are not in the exempt list even when addressed to us.
        let txt = flood(vec![0x42, 0x10]);
        assert_eq!(
            evaluate(&txt, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::Forward
        );
    }

    #[test]
    fn second_arrival_is_duplicate() {
        let pkt = flood(vec![9, 9, 9]);
        let mut dedup = DedupCache::new();
        let mut rl = limits();
        assert_eq!(
            evaluate(&pkt, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::Forward
        );
        assert_eq!(
            evaluate(&pkt, 0x42, &mut dedup, &mut rl, true, true, 1),
            ForwardDecision::Duplicate
        );
    }

    #[test]
    fn full_path_dropped() {
        let mut pkt = flood(vec![1]);
        pkt.path = vec![0xAA; MAX_PATH_LEN];
        let mut dedup = DedupCache::new();
        let mut rl = limits();
        assert_eq!(
            evaluate(&pkt, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::PathFull
        );
    }

    #[test]
    fn limiter_trips() {
        let mut dedup = DedupCache::new();
        let mut rl = RateLimiter::new(1, 60_000);
        let a = flood(vec![1]);
        let b = flood(vec![2]);
        assert_eq!(
            evaluate(&a, 0x42, &mut dedup, &mut rl, true, true, 0),
            ForwardDecision::Forward
        );
        assert_eq!(
            evaluate(&b, 0x42, &mut dedup, &mut rl, true, true, 1),
            ForwardDecision::RateLimited
        );
    }

    #[test]
    fn queue_overflow_evicts_oldest() {
        let mut q = TxQueue::new();
        for i in 0..=TX_QUEUE_CAPACITY as u8 {
            q.push_back(QueuedPacket::immediate(flood(vec![i])));
        }
        assert_eq!(q.len(), TX_QUEUE_CAPACITY);
        assert_eq!(q.overflow_drops, 1);
        // Oldest (payload [0]) was evicted.
        assert_eq!(q.pop_ready(0).unwrap().packet.payload, vec![1]);
    }

    #[test]
    fn hold_off_respected() {
        let mut q = TxQueue::new();
        let mut delayed = QueuedPacket::immediate(flood(vec![1]));
        delayed.not_before_ms = 500;
        q.push_back(delayed);
        q.push_back(QueuedPacket::immediate(flood(vec![2])));
        // The delayed entry is skipped, the ready one drains first.
        assert_eq!(q.pop_ready(100).unwrap().packet.payload, vec![2]);
        assert!(q.pop_ready(100).is_none());
        assert_eq!(q.pop_ready(500).unwrap().packet.payload, vec![1]);
    }
}
