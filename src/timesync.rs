//! Gossip time synchronization.
//!
//! There is no RTC: the first valid timestamp heard on the air is trusted
//! outright, and every later correction needs two independent sources that
//! agree. A single peer advertising a wrong clock can therefore never move
//! an already-synced node.

use tracing::{debug, info};

/// Timestamps before 2020-01-01 UTC are rejected.
pub const MIN_VALID_UNIX: u32 = 1_577_836_800;

/// Timestamps at or after 2100-01-01 UTC are rejected.
pub const MAX_VALID_UNIX: u32 = 4_102_444_800;

/// Agreement tolerance for both the in-sync check and consensus, seconds.
pub const SYNC_TOLERANCE_SECS: u32 = 300;

/// An unconfirmed re-sync candidate ages out after this long.
pub const PENDING_MAX_AGE_MS: u64 = 3_600_000;

/// Outcome of feeding one observed timestamp to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Out of the accepted range; ignored.
    Invalid,
    /// First observation while unsynced; adopted without confirmation.
    FirstSync,
    /// Already synced. An outlier may have been parked as pending.
    InSync,
    /// A second source confirmed the pending candidate; clock re-based.
    ConsensusResync,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    candidate_unix: u32,
    seen_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Unsynced,
    Synced {
        base_unix: u32,
        base_mono_ms: u64,
        pending: Option<Pending>,
    },
}

/// Monotonic-clock-anchored Unix time.
#[derive(Debug, Clone)]
pub struct TimeSync {
    state: State,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    pub fn new() -> Self {
        Self { state: State::Unsynced }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, State::Synced { .. })
    }

    /// Current Unix time estimate. While unsynced this degrades to
    /// monotonic seconds, which callers must treat as unreliable.
    pub fn now_unix(&self, now_ms: u64) -> u32 {
        match self.state {
            State::Unsynced => (now_ms / 1000) as u32,
            State::Synced { base_unix, base_mono_ms, .. } => {
                base_unix.wrapping_add(((now_ms.saturating_sub(base_mono_ms)) / 1000) as u32)
            }
        }
    }

    /// Force the clock, used by the operator `time <unix>` command. Treated
    /// like a first sync: trusted without confirmation.
    pub fn force(&mut self, unix: u32, now_ms: u64) {
        self.state = State::Synced { base_unix: unix, base_mono_ms: now_ms, pending: None };
    }

    /// Feed a timestamp heard from the mesh.
    pub fn observe(&mut self, ts: u32, now_ms: u64) -> SyncOutcome {
        if !(MIN_VALID_UNIX..MAX_VALID_UNIX).contains(&ts) {
            return SyncOutcome::Invalid;
        }

        match self.state {
            State::Unsynced => {
                self.state =
                    State::Synced { base_unix: ts, base_mono_ms: now_ms, pending: None };
                info!(unix = ts, "time synced from first observation");
                SyncOutcome::FirstSync
            }
            State::Synced { base_unix, base_mono_ms, pending } => {
                let estimate = self.now_unix(now_ms);
                if ts.abs_diff(estimate) < SYNC_TOLERANCE_SECS {
                    // Agreement with our own clock clears any parked outlier.
                    self.state =
                        State::Synced { base_unix, base_mono_ms, pending: None };
                    return SyncOutcome::InSync;
                }

                let live_pending = pending.filter(|p| {
                    now_ms.saturating_sub(p.seen_at_ms) < PENDING_MAX_AGE_MS
                });

                if let Some(p) = live_pending {
                    // Advance the candidate by the time elapsed since we
                    // parked it before comparing.
                    let adjusted = p.candidate_unix.wrapping_add(
                        ((now_ms.saturating_sub(p.seen_at_ms)) / 1000) as u32,
                    );
                    if ts.abs_diff(adjusted) < SYNC_TOLERANCE_SECS {
                        let agreed = ts / 2 + adjusted / 2 + (ts & adjusted & 1);
                        self.state = State::Synced {
                            base_unix: agreed,
                            base_mono_ms: now_ms,
                            pending: None,
                        };
                        info!(
                            unix = agreed,
                            drift = estimate.abs_diff(agreed),
                            "time re-synced by two-source consensus"
                        );
                        return SyncOutcome::ConsensusResync;
                    }
                }

                debug!(ts, estimate, "time outlier parked pending confirmation");
                self.state = State::Synced {
                    base_unix,
                    base_mono_ms,
                    pending: Some(Pending { candidate_unix: ts, seen_at_ms: now_ms }),
                };
                SyncOutcome::InSync
            }
        }
    }

    /// Expire a stale pending candidate. Called from the reactor's
    /// housekeeping tick.
    pub fn maintain(&mut self, now_ms: u64) {
        if let State::Synced { pending: Some(p), base_unix, base_mono_ms } = self.state {
            if now_ms.saturating_sub(p.seen_at_ms) >= PENDING_MAX_AGE_MS {
                self.state = State::Synced { base_unix, base_mono_ms, pending: None };
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        matches!(self.state, State::Synced { pending: Some(_), .. })
    }
}
