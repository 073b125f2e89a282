//! Channel-sense multiple access: listen-before-talk with SNR-weighted
//! backoff and abort-on-busy.
//!
//! The contention window widens with the strength of the last station we
//! heard: a node that hears its neighbors loudly can afford to yield, a
//! node at the edge of the mesh gets priority, which evens out delivery
//! across the area.

use rand::Rng;

use crate::radio::{RadioTimings, IRQ_HEADER_VALID, IRQ_PREAMBLE_DETECTED};

/// Fixed lead-in before any backoff slots.
pub const TX_DELAY_MIN_MS: u64 = 30;

/// Contention window bounds, in slots.
pub const CSMA_MIN_SLOTS: u32 = 2;
pub const CSMA_MAX_SLOTS: u32 = 8;

/// SNR (quarter-dB) mapped to a slot count: −20 dB or worse → 2 slots,
/// +10 dB or better → 8 slots, linear in between.
pub fn contention_slots(snr_q: i8) -> u32 {
    let span = (CSMA_MAX_SLOTS - CSMA_MIN_SLOTS) as i32;
    let scaled = (snr_q as i32 + 80) * span / 120;
    (CSMA_MIN_SLOTS as i32 + scaled.clamp(0, span)) as u32
}

/// Randomized wait before a transmission attempt.
pub fn backoff_ms<R: Rng>(snr_q: i8, timings: &RadioTimings, rng: &mut R) -> u64 {
    let slots = contention_slots(snr_q);
    let chosen = rng.gen_range(0..slots);
    TX_DELAY_MIN_MS + chosen as u64 * timings.slot_ms as u64
}

/// Carrier sense built from the radio's preamble/header IRQ flags, with
/// false-positive and stall clearing.
#[derive(Debug, Default)]
pub struct ChannelSense {
    preamble_at_ms: Option<u64>,
    header_at_ms: Option<u64>,
}

impl ChannelSense {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the latched IRQ bits for this poll.
    pub fn update(&mut self, irq: u16, now_ms: u64) {
        if irq & IRQ_PREAMBLE_DETECTED != 0 && self.preamble_at_ms.is_none() {
            self.preamble_at_ms = Some(now_ms);
        }
        if irq & IRQ_HEADER_VALID != 0 && self.header_at_ms.is_none() {
            self.header_at_ms = Some(now_ms);
        }
    }

    /// Is someone else on the air right now?
    ///
    /// A preamble with no header inside `2 × preamble_time` was a false
    /// positive; a header older than `max_packet_time` is a stall. Both
    /// are cleared as a side effect.
    pub fn busy(&mut self, now_ms: u64, timings: &RadioTimings) -> bool {
        if let Some(t) = self.header_at_ms {
            if now_ms.saturating_sub(t) <= timings.max_packet_ms as u64 {
                return true;
            }
            self.header_at_ms = None;
            self.preamble_at_ms = None;
        }

        if let Some(t) = self.preamble_at_ms {
            let age = now_ms.saturating_sub(t);
            if self.header_at_ms.is_none() && age > 2 * timings.preamble_ms as u64 {
                self.preamble_at_ms = None;
                return false;
            }
            return true;
        }
        false
    }

    /// Frame fully received (or TX finished): the channel observation is
    /// consumed.
    pub fn clear(&mut self) {
        self.preamble_at_ms = None;
        self.header_at_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioParams;
    use rand::rngs::mock::StepRng;

    fn timings() -> RadioTimings {
        RadioTimings::from_params(&RadioParams::default())
    }

    #[test]
    fn weak_stations_get_priority() {
        assert_eq!(contention_slots(-80), CSMA_MIN_SLOTS);
        assert_eq!(contention_slots(40), CSMA_MAX_SLOTS);
        assert!(contention_slots(0) > contention_slots(-60));
        assert!(contention_slots(0) < contention_slots(36));
    }

    #[test]
    fn backoff_bounded_by_window() {
        let t = timings();
        let mut rng = StepRng::new(0, 1);
        for _ in 0..32 {
            let d = backoff_ms(40, &t, &mut rng);
            assert!(d >= TX_DELAY_MIN_MS);
            assert!(d < TX_DELAY_MIN_MS + CSMA_MAX_SLOTS as u64 * t.slot_ms as u64);
        }
    }

    #[test]
    fn preamble_false_positive_clears() {
        let t = timings();
        let mut sense = ChannelSense::new();
        sense.update(IRQ_PREAMBLE_DETECTED, 0);
        assert!(sense.busy(1, &t));
        // No header within 2× preamble time: cleared.
        assert!(!sense.busy(2 * t.preamble_ms as u64 + 1, &t));
        assert!(!sense.busy(2 * t.preamble_ms as u64 + 2, &t));
    }

    #[test]
    fn header_holds_channel_until_stall() {
        let t = timings();
        let mut sense = ChannelSense::new();
        sense.update(IRQ_PREAMBLE_DETECTED | IRQ_HEADER_VALID, 0);
        assert!(sense.busy(t.max_packet_ms as u64, &t));
        // Stalled reception: cleared after max packet time.
        assert!(!sense.busy(t.max_packet_ms as u64 + 1, &t));
    }
}
