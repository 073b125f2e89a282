//! The repeater reactor: a single-owner cooperative loop driving the
//! radio, the TX queue, periodic beacons, persistence auto-save and the
//! error thresholds.
//!
//! All state mutation happens inside [`RepeaterNode::poll`]; the host
//! calls it with the monotonic clock and acts on the returned hints
//! (sleep window, reboot request). Nothing in here suspends.

use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use tracing::{debug, info, warn};

use crate::identity::NodeIdentity;
use crate::mesh::advert::build_advert;
use crate::mesh::csma::{backoff_ms, ChannelSense};
use crate::mesh::contacts::ContactTable;
use crate::mesh::dedup::DedupCache;
use crate::mesh::forward::{self, ForwardDecision, QueuedPacket, TxQueue};
use crate::mesh::neighbors::NeighborTable;
use crate::mesh::packet::{Packet, PayloadType, RouteType};
use crate::mesh::rate_limit::RateLimits;
use crate::mesh::seen::SeenNodes;
use crate::mesh::session::{AccessControl, SessionTable};
use crate::radio::{
    airtime_ms, Radio, RadioError, RadioParams, RadioTimings, IRQ_CRC_ERR, IRQ_HEADER_VALID,
    IRQ_PREAMBLE_DETECTED, IRQ_RX_DONE, IRQ_TX_DONE,
};
use crate::stats::{AirtimeLedger, PacketStats, PersistentStats, RadioStats, RepeaterStatus};
use crate::storage::{self, NvStorage};
use crate::timesync::TimeSync;
use crate::types::{
    NodeConfig, BOOT_SAFE_WINDOW_MS, FIRST_ADVERT_DELAY_MS, MAX_RADIO_ERRORS, MAX_TOTAL_ERRORS,
    REBOOT_GRACE_MS,
};

/// Extra wait for a TX-done report beyond the frame's own airtime.
const TX_DONE_SLACK_MS: u64 = 100;

/// Noise-floor sampling cadence while the channel is quiet.
const NOISE_SAMPLE_INTERVAL_MS: u64 = 1_000;

/// Housekeeping cadence (timesync pending expiry, neighbor pruning).
const HOUSEKEEP_INTERVAL_MS: u64 = 5_000;

/// Host-updated sensor readings surfaced via telemetry.
#[derive(Debug, Clone, Default)]
pub struct Sensors {
    pub battery_mv: u16,
    /// Deci-degrees Celsius.
    pub temperature_dc: i16,
    /// Raw analog reading, hundredths.
    pub analog: i16,
}

/// What the host should do after one reactor iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollStatus {
    /// Restart the process/device. Set by the error threshold and by a
    /// deferred CLI reboot.
    pub reboot_requested: bool,
    /// The reactor is idle for at least this long; the host may light- or
    /// deep-sleep. `None` while anything is pending.
    pub sleep_ok_ms: Option<u64>,
}

enum TxPhase {
    Idle,
    Backoff { until_ms: u64, entry: QueuedPacket },
    Transmitting { deadline_ms: u64, airtime: u32, flood: bool, reboot_after: bool },
}

/// The store-and-forward repeater. Owns every table; see module docs.
pub struct RepeaterNode<R: Radio, S: NvStorage> {
    pub(crate) radio: R,
    pub(crate) store: S,
    pub(crate) params: RadioParams,
    pub(crate) timings: RadioTimings,

    pub(crate) identity: NodeIdentity,
    pub(crate) config: NodeConfig,
    pub(crate) timesync: TimeSync,

    pub(crate) seen: SeenNodes,
    pub(crate) contacts: ContactTable,
    pub(crate) neighbors: NeighborTable,
    pub(crate) sessions: SessionTable,
    pub(crate) acl: AccessControl,
    pub(crate) dedup: DedupCache,
    pub(crate) txq: TxQueue,
    pub(crate) limits: RateLimits,

    pub(crate) stats: PersistentStats,
    pub(crate) pkt_stats: PacketStats,
    pub(crate) radio_stats: RadioStats,
    pub(crate) airtime: AirtimeLedger,
    pub(crate) sensors: Sensors,

    pub(crate) rng: ChaCha12Rng,
    sense: ChannelSense,
    tx: TxPhase,

    boot_ms: u64,
    last_save_ms: u64,
    last_noise_ms: u64,
    last_housekeep_ms: u64,
    pub(crate) next_advert_ms: Option<u64>,
    pub(crate) reboot_at_ms: Option<u64>,
    pub(crate) ping_seq: u32,

    radio_errors: u32,
    pub(crate) total_errors: u32,
}

impl<R: Radio, S: NvStorage> RepeaterNode<R, S> {
    /// Boot: load (or default) the persistent records, bring the radio up,
    /// enter RX. A radio `begin` failure is the one fatal boot error.
    pub fn new(
        mut radio: R,
        mut store: S,
        params: RadioParams,
        now_ms: u64,
    ) -> Result<Self, RadioError> {
        let mut rng = ChaCha12Rng::from_entropy();

        let config = match storage::load_config(&mut store) {
            Ok(cfg) => cfg,
            Err(_) => {
                warn!("config record invalid, writing defaults");
                let cfg = NodeConfig::default();
                let _ = storage::save_config(&mut store, &cfg);
                cfg
            }
        };

        let identity = match storage::load_identity(&mut store) {
            Ok(id) => id,
            Err(_) => {
                let id = NodeIdentity::generate(&mut rng, "Repeater");
                info!(pubkey = %hex::encode(id.public_key), "generated new identity");
                let _ = storage::save_identity(&mut store, &id);
                id
            }
        };

        let mut stats = match storage::load_stats(&mut store) {
            Ok(s) => s,
            Err(_) => {
                warn!("stats record invalid, writing defaults");
                PersistentStats::default()
            }
        };
        stats.boot_count = stats.boot_count.saturating_add(1);
        let _ = storage::save_stats(&mut store, &stats);

        radio.begin(&params)?;
        let _ = radio.set_rx_boost(config.rx_boost);
        let _ = radio.set_crc(true);
        let timings = RadioTimings::from_params(&params);
        let duty = rx_duty_period(config.rx_mode, &timings);
        radio.start_receive(duty)?;

        info!(
            "repeater up: {} ({:02x}) boot {}",
            identity.name,
            identity.node_hash(),
            stats.boot_count
        );

        let neighbor_cap = config.neighbor_cap as usize;
        Ok(Self {
            radio,
            store,
            params,
            timings,
            identity,
            config,
            timesync: TimeSync::new(),
            seen: SeenNodes::new(),
            contacts: ContactTable::new(),
            neighbors: NeighborTable::new(neighbor_cap),
            sessions: SessionTable::new(),
            acl: AccessControl::new(),
            dedup: DedupCache::new(),
            txq: TxQueue::new(),
            limits: RateLimits::new(),
            stats,
            pkt_stats: PacketStats::default(),
            radio_stats: RadioStats::default(),
            airtime: AirtimeLedger::default(),
            sensors: Sensors::default(),
            rng,
            sense: ChannelSense::new(),
            tx: TxPhase::Idle,
            boot_ms: now_ms,
            last_save_ms: now_ms,
            last_noise_ms: now_ms,
            last_housekeep_ms: now_ms,
            next_advert_ms: None,
            reboot_at_ms: None,
            ping_seq: 0,
            radio_errors: 0,
            total_errors: 0,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Host access to the transceiver (frame injection in the simulator,
    /// platform duty-cycle tweaks on hardware).
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Host access to the persistence provider.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_synced(&self) -> bool {
        self.timesync.is_synced()
    }

    /// Current Unix-time estimate (monotonic seconds while unsynced).
    pub fn now_unix(&self, now_ms: u64) -> u32 {
        self.timesync.now_unix(now_ms)
    }

    pub fn local_hash(&self) -> u8 {
        self.identity.node_hash()
    }

    pub fn set_sensors(&mut self, sensors: Sensors) {
        self.sensors = sensors;
    }

    pub fn uptime_secs(&self, now_ms: u64) -> u32 {
        (now_ms.saturating_sub(self.boot_ms) / 1000) as u32
    }

    // =========================================================================
    // REACTOR
    // =========================================================================

    /// One reactor iteration. A received frame is fully dispatched before
    /// the TX queue is touched, and at most one queued packet makes
    /// progress per call so an incoming frame can always preempt.
    pub fn poll(&mut self, now_ms: u64) -> PollStatus {
        let irq = self.radio.irq_status();
        self.sense.update(irq, now_ms);

        if irq & IRQ_CRC_ERR != 0 {
            self.radio.clear_irq(IRQ_CRC_ERR | IRQ_PREAMBLE_DETECTED | IRQ_HEADER_VALID);
            self.sense.clear();
            self.pkt_stats.crc_errors += 1;
            debug!("frame dropped: crc mismatch");
        }

        if irq & IRQ_RX_DONE != 0 {
            self.radio
                .clear_irq(IRQ_RX_DONE | IRQ_PREAMBLE_DETECTED | IRQ_HEADER_VALID);
            self.sense.clear();
            self.on_rx_done(now_ms);
        }

        if irq & IRQ_TX_DONE != 0 {
            self.radio.clear_irq(IRQ_TX_DONE);
            self.on_tx_done(now_ms);
        }

        self.check_tx_timeout(now_ms);
        self.advance_tx(now_ms);
        self.run_beacon(now_ms);
        self.run_autosave(now_ms);
        self.run_housekeeping(now_ms);

        let mut status = PollStatus::default();
        if self.total_errors >= MAX_TOTAL_ERRORS {
            warn!(errors = self.total_errors, "error threshold reached, requesting reboot");
            status.reboot_requested = true;
        }
        if let Some(at) = self.reboot_at_ms {
            if now_ms >= at {
                status.reboot_requested = true;
            }
        }
        status.sleep_ok_ms = self.sleep_window(now_ms);
        status
    }

    fn on_rx_done(&mut self, now_ms: u64) {
        let mut buf = [0u8; 256];
        let len = match self.radio.read_data(&mut buf) {
            Ok(0) => return,
            Ok(len) => len,
            Err(e) => {
                self.note_radio_error(e);
                return;
            }
        };
        self.radio_errors = 0;

        self.stats.rx = self.stats.rx.saturating_add(1);
        self.pkt_stats.n_recv += 1;

        let (mut packet, clamped) = match Packet::deserialize(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                self.pkt_stats.deserialize_errors += 1;
                debug!(error = %e, "frame dropped");
                return;
            }
        };
        if clamped {
            self.pkt_stats.oversize_clamped += 1;
        }

        packet.rssi = self.radio.rssi();
        packet.snr_q = self.radio.snr_q();
        packet.received_at_ms = now_ms;
        self.radio_stats.sample_packet(packet.rssi, packet.snr_q);
        if packet.is_flood() {
            self.pkt_stats.recv_flood += 1;
        } else {
            self.pkt_stats.recv_direct += 1;
        }

        debug!(
            kind = packet.payload_type().label(),
            hops = packet.path.len(),
            rssi = packet.rssi,
            "rx"
        );

        // Dispatch fully before the queue is considered.
        self.dispatch_local(&packet, now_ms);
        self.maybe_forward(packet, now_ms);
    }

    /// Forwarding rules, path growth, queueing. The path is mutated here,
    /// before enqueue — a CSMA abort later re-queues the packet as-is.
    fn maybe_forward(&mut self, mut packet: Packet, now_ms: u64) {
        let decision = forward::evaluate(
            &packet,
            self.identity.node_hash(),
            &mut self.dedup,
            &mut self.limits.forward,
            self.config.limits_enabled,
            self.config.repeat_enabled,
            now_ms,
        );
        match decision {
            ForwardDecision::Forward => {
                // Trace packets collect SNR readings; everything else
                // collects repeater hashes.
                let hop = if packet.payload_type() == PayloadType::Trace {
                    packet.snr_q as u8
                } else {
                    self.identity.node_hash()
                };
                packet.path.push(hop);
                self.stats.fwd = self.stats.fwd.saturating_add(1);
                self.enqueue(QueuedPacket::immediate(packet));
            }
            ForwardDecision::Duplicate => {
                if packet.is_flood() {
                    self.pkt_stats.flood_dups = self.pkt_stats.flood_dups.saturating_add(1);
                } else {
                    self.pkt_stats.direct_dups = self.pkt_stats.direct_dups.saturating_add(1);
                }
            }
            ForwardDecision::RateLimited => {
                self.stats.rate_limited = self.stats.rate_limited.saturating_add(1);
            }
            ForwardDecision::NotFlood
            | ForwardDecision::AddressedToUs
            | ForwardDecision::PathFull
            | ForwardDecision::Disabled => {}
        }
    }

    pub(crate) fn enqueue(&mut self, entry: QueuedPacket) {
        self.txq.push_back(entry);
        self.pkt_stats.full_events = self.txq.overflow_drops as u16;
    }

    fn on_tx_done(&mut self, now_ms: u64) {
        // A late TX-done after a timeout must not disturb a newer phase.
        let (airtime, flood, reboot_after) =
            match std::mem::replace(&mut self.tx, TxPhase::Idle) {
                TxPhase::Transmitting { airtime, flood, reboot_after, .. } => {
                    (airtime, flood, reboot_after)
                }
                other => {
                    self.tx = other;
                    return;
                }
            };

        self.airtime.add_ms(airtime);
        self.stats.tx = self.stats.tx.saturating_add(1);
        self.pkt_stats.n_sent += 1;
        if flood {
            self.pkt_stats.sent_flood += 1;
        } else {
            self.pkt_stats.sent_direct += 1;
        }

        if let Err(e) = self.radio.finish_transmit() {
            self.note_radio_error(e);
        }
        self.restart_receive();
        self.sense.clear();

        if reboot_after {
            info!("response sent, reboot scheduled");
            self.reboot_at_ms = Some(now_ms + REBOOT_GRACE_MS);
        }
    }

    fn check_tx_timeout(&mut self, now_ms: u64) {
        if let TxPhase::Transmitting { deadline_ms, .. } = self.tx {
            if now_ms > deadline_ms {
                warn!("transmission never completed, dropping frame");
                self.tx = TxPhase::Idle;
                let _ = self.radio.finish_transmit();
                self.note_radio_error(RadioError::Code(-1));
                self.restart_receive();
            }
        }
    }

    /// CSMA: pull one ready packet into backoff, abort on a busy channel,
    /// transmit when the wait expires cleanly.
    fn advance_tx(&mut self, now_ms: u64) {
        match std::mem::replace(&mut self.tx, TxPhase::Idle) {
            TxPhase::Idle => {
                if let Some(entry) = self.txq.pop_ready(now_ms) {
                    let wait = backoff_ms(self.radio_stats.last_snr_q, &self.timings, &mut self.rng);
                    self.tx = TxPhase::Backoff { until_ms: now_ms + wait, entry };
                }
            }
            TxPhase::Backoff { until_ms, entry } => {
                if self.sense.busy(now_ms, &self.timings) {
                    // Someone is on the air: yield, keep the packet.
                    debug!("csma abort, channel busy");
                    self.txq.push_front(entry);
                    self.tx = TxPhase::Idle;
                } else if now_ms >= until_ms {
                    self.start_transmit(entry, now_ms);
                } else {
                    self.tx = TxPhase::Backoff { until_ms, entry };
                }
            }
            transmitting => self.tx = transmitting,
        }
    }

    fn start_transmit(&mut self, entry: QueuedPacket, now_ms: u64) {
        let frame = entry.packet.serialize();
        let airtime = airtime_ms(&self.params, frame.len());
        match self.radio.start_transmit(&frame) {
            Ok(()) => {
                self.tx = TxPhase::Transmitting {
                    deadline_ms: now_ms + airtime as u64 + TX_DONE_SLACK_MS,
                    airtime,
                    flood: entry.packet.is_flood(),
                    reboot_after: entry.reboot_after,
                };
            }
            Err(e) => {
                self.note_radio_error(e);
                self.txq.push_front(entry);
                self.restart_receive();
            }
        }
    }

    // =========================================================================
    // PERIODIC WORK
    // =========================================================================

    fn run_beacon(&mut self, now_ms: u64) {
        let Some(due) = self.next_advert_ms else {
            return;
        };
        if now_ms < due {
            return;
        }

        self.next_advert_ms = if self.config.advert_interval_secs > 0 {
            Some(now_ms + self.config.advert_interval_secs as u64 * 1000)
        } else {
            None
        };

        if let Err(e) = self.send_advert(false, now_ms) {
            debug!(error = e, "beacon skipped");
        }
    }

    /// Build and queue a self advert. Refused while unsynced: an advert
    /// carries a timestamp other nodes may trust first.
    pub(crate) fn send_advert(&mut self, zero_hop: bool, now_ms: u64) -> Result<(), &'static str> {
        if !self.timesync.is_synced() {
            return Err("time not synced");
        }
        let ts = self.timesync.now_unix(now_ms);
        let packet = build_advert(&self.identity, ts, zero_hop).map_err(|_| "advert build failed")?;
        // Self adverts outrank queued responses and forwards.
        self.txq.push_front(QueuedPacket::immediate(packet));
        self.pkt_stats.full_events = self.txq.overflow_drops as u16;
        debug!(ts, zero_hop, "advert queued");
        Ok(())
    }

    /// Called by the dispatcher on the first successful time sync.
    pub(crate) fn on_first_sync(&mut self, now_ms: u64) {
        if self.stats.first_boot_unix == 0 {
            self.stats.first_boot_unix = self.timesync.now_unix(now_ms);
        }
        self.next_advert_ms = Some(now_ms + FIRST_ADVERT_DELAY_MS);
    }

    fn run_autosave(&mut self, now_ms: u64) {
        let interval_ms = self.config.autosave_secs as u64 * 1000;
        if now_ms.saturating_sub(self.last_save_ms) < interval_ms {
            return;
        }
        self.save_stats(now_ms);
    }

    pub(crate) fn save_stats(&mut self, now_ms: u64) {
        let delta = (now_ms.saturating_sub(self.last_save_ms) / 1000) as u32;
        self.stats.uptime_secs = self.stats.uptime_secs.saturating_add(delta);
        self.last_save_ms = now_ms;
        if let Err(e) = storage::save_stats(&mut self.store, &self.stats) {
            warn!(error = %e, "stats save failed");
            self.total_errors += 1;
        }
    }

    pub(crate) fn save_config(&mut self) {
        if let Err(e) = storage::save_config(&mut self.store, &self.config) {
            warn!(error = %e, "config save failed");
            self.total_errors += 1;
        }
    }

    pub(crate) fn save_identity(&mut self) {
        if let Err(e) = storage::save_identity(&mut self.store, &self.identity) {
            warn!(error = %e, "identity save failed");
            self.total_errors += 1;
        }
    }

    fn run_housekeeping(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_noise_ms) >= NOISE_SAMPLE_INTERVAL_MS {
            self.last_noise_ms = now_ms;
            if matches!(self.tx, TxPhase::Idle) && !self.sense.busy(now_ms, &self.timings) {
                let rssi = self.radio.channel_rssi();
                self.radio_stats.sample_noise(rssi);
            }
        }

        if now_ms.saturating_sub(self.last_housekeep_ms) >= HOUSEKEEP_INTERVAL_MS {
            self.last_housekeep_ms = now_ms;
            self.timesync.maintain(now_ms);
            self.neighbors.prune(now_ms);
        }
    }

    // =========================================================================
    // ERRORS AND SLEEP
    // =========================================================================

    fn note_radio_error(&mut self, e: RadioError) {
        self.radio_errors += 1;
        self.total_errors += 1;
        warn!(error = %e, consecutive = self.radio_errors, "radio error");
        if self.radio_errors >= MAX_RADIO_ERRORS {
            warn!("radio error threshold reached, resetting transceiver");
            self.radio.reset();
            if self.radio.begin(&self.params).is_ok() {
                let _ = self.radio.set_rx_boost(self.config.rx_boost);
                let _ = self.radio.set_crc(true);
                self.restart_receive();
                self.radio_errors = 0;
            }
        }
    }

    pub(crate) fn restart_receive(&mut self) {
        let duty = rx_duty_period(self.config.rx_mode, &self.timings);
        if let Err(e) = self.radio.start_receive(duty) {
            self.radio_errors += 1;
            self.total_errors += 1;
            warn!(error = %e, "failed to re-enter rx");
        }
    }

    fn sleep_window(&mut self, now_ms: u64) -> Option<u64> {
        if !self.config.sleep_enabled
            || self.config.rx_mode < 2
            || now_ms.saturating_sub(self.boot_ms) < BOOT_SAFE_WINDOW_MS
            || !self.txq.is_empty()
            || !matches!(self.tx, TxPhase::Idle)
            || self.radio.irq_status() != 0
            || self.reboot_at_ms.is_some()
        {
            return None;
        }

        let mut window = self.config.autosave_secs as u64 * 1000;
        if let Some(due) = self.next_advert_ms {
            window = window.min(due.saturating_sub(now_ms));
        }
        (window > 0).then_some(window)
    }

    /// Current status record for GET_STATUS and the `status` command.
    pub fn status_snapshot(&self, now_ms: u64) -> RepeaterStatus {
        RepeaterStatus {
            batt_mv: self.sensors.battery_mv,
            tx_queue_len: self.txq.len() as u16,
            noise_floor: self.radio_stats.noise_floor(),
            last_rssi: self.radio_stats.last_rssi,
            n_packets_recv: self.pkt_stats.n_recv,
            n_packets_sent: self.pkt_stats.n_sent,
            total_air_time_secs: self.airtime.total_secs(),
            total_up_time_secs: self.uptime_secs(now_ms),
            n_sent_flood: self.pkt_stats.sent_flood,
            n_sent_direct: self.pkt_stats.sent_direct,
            n_recv_flood: self.pkt_stats.recv_flood,
            n_recv_direct: self.pkt_stats.recv_direct,
            n_full_events: self.pkt_stats.full_events,
            last_snr_q: self.radio_stats.last_snr_q as i16,
            n_direct_dups: self.pkt_stats.direct_dups,
            n_flood_dups: self.pkt_stats.flood_dups,
        }
    }

    /// Queue a directed ping probe toward `dest_hash`.
    pub(crate) fn send_ping(&mut self, dest_hash: u8) {
        self.ping_seq = self.ping_seq.wrapping_add(1);
        let mut payload = vec![dest_hash, self.identity.node_hash(), b'D', b'P'];
        payload.extend_from_slice(format!("#{} {}", self.ping_seq, self.identity.name).as_bytes());
        let packet = Packet::new(RouteType::Flood, PayloadType::TxtMsg, payload);
        self.enqueue(QueuedPacket::immediate(packet));
    }
}

fn rx_duty_period(rx_mode: u8, timings: &RadioTimings) -> u32 {
    if rx_mode == 0 {
        0
    } else {
        // Sniff at twice the preamble rate so no frame start is missed.
        (timings.preamble_ms / 2).max(1)
    }
}
