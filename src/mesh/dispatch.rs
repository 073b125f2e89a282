//! Payload-type dispatch: what the repeater does with each frame it
//! decodes, beyond forwarding it.

use rand::Rng;
use tracing::{debug, info};

use super::advert::parse_advert;
use super::forward::QueuedPacket;
use super::packet::{Packet, PayloadType, RouteType};
use super::rate_limit::RateLimits;
use super::session::AccessControl;
use crate::crypto;
use crate::node::RepeaterNode;
use crate::radio::Radio;
use crate::storage::NvStorage;
use crate::timesync::SyncOutcome;
use crate::types::{KEEP_ALIVE_SECS, PERM_NONE};
use crate::cli;

// =============================================================================
// REQUEST AND TEXT TYPE CODES
// =============================================================================

pub const REQ_GET_STATUS: u8 = 0x01;
pub const REQ_KEEP_ALIVE: u8 = 0x02;
pub const REQ_GET_TELEMETRY: u8 = 0x03;
pub const REQ_GET_MINMAXAVG: u8 = 0x04;
pub const REQ_GET_NEIGHBOURS: u8 = 0x05;
pub const REQ_GET_ACCESS_LIST: u8 = 0x06;
pub const REQ_SEND_CLI: u8 = 0x07;

/// Upper six bits of the first post-timestamp byte of a TXT_MSG.
pub const TXT_TYPE_PLAIN: u8 = 0;
pub const TXT_TYPE_CLI: u8 = 1;
pub const TXT_TYPE_SIGNED: u8 = 2;

/// A discovery request's first byte carries this in its high nibble.
pub const CONTROL_DISCOVER_NIBBLE: u8 = 0x8;
/// First byte of a discovery response.
pub const CONTROL_DISCOVER_RESP: u8 = 0x90;

/// Longest CLI output shipped inside one encrypted response.
const MAX_REMOTE_CLI_OUT: usize = 150;

/// Neighbour entries per GET_NEIGHBOURS response, bounded by the
/// plaintext budget: 4 (ts) + 4 (counts) + 13 × 11 ≤ 160.
const MAX_NEIGHBOUR_RESULTS: usize = 13;

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Truncate on a character boundary; node names may be multi-byte.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

impl<R: Radio, S: NvStorage> RepeaterNode<R, S> {
    /// Route one received frame to its handler. Forwarding is separate;
    /// this is the "what does it mean to us" half.
    pub(crate) fn dispatch_local(&mut self, packet: &Packet, now_ms: u64) {
        let local = self.identity.node_hash();
        match packet.payload_type() {
            PayloadType::Advert => self.on_advert(packet, now_ms),
            PayloadType::Control => self.on_control(packet, now_ms),
            PayloadType::AnonRequest => {
                if packet.payload.first() == Some(&local) {
                    self.on_anon_request(packet, now_ms);
                }
            }
            PayloadType::Request => {
                if packet.payload.first() == Some(&local) {
                    self.on_request(packet, now_ms);
                }
            }
            PayloadType::TxtMsg => self.on_txt(packet, now_ms),
            // Trace path growth happens in the forwarding step; nothing to
            // answer locally. Remaining types are forward-only traffic.
            _ => {}
        }
    }

    // =========================================================================
    // ADVERT
    // =========================================================================

    fn on_advert(&mut self, packet: &Packet, now_ms: u64) {
        let info = match parse_advert(&packet.payload) {
            Ok(info) => info,
            Err(e) => {
                self.pkt_stats.deserialize_errors += 1;
                debug!(error = %e, "advert dropped");
                return;
            }
        };
        if info.pubkey == self.identity.public_key {
            return;
        }

        if self.timesync.observe(info.timestamp, now_ms) == SyncOutcome::FirstSync {
            self.on_first_sync(now_ms);
        }

        let is_new = self.seen.observe(info.pubkey_hash, packet.rssi, packet.snr_q, now_ms);
        if info.has_name {
            self.seen.set_name(info.pubkey_hash, &info.name);
        }
        if is_new {
            self.stats.unique_nodes = self.stats.unique_nodes.saturating_add(1);
            info!("new node {:02x} {}", info.pubkey_hash, info.name);
        }

        let identity = &self.identity;
        self.contacts.upsert(
            info.pubkey,
            &info.name,
            packet.rssi,
            packet.snr_q,
            now_ms,
            || crypto::shared_secret(identity, &info.pubkey).ok(),
        );

        // Directness requires a zero-hop arrival; a forwarded advert says
        // nothing about radio reachability.
        if packet.path.is_empty() && info.is_repeater {
            self.neighbors
                .observe(info.pubkey, &info.name, packet.rssi, packet.snr_q, now_ms);
        }

        if is_new
            && self.config.alert_enabled
            && self.config.alert_dest_set()
            && self.config.alert_dest != info.pubkey
        {
            let label = if info.has_name {
                info.name.clone()
            } else {
                format!("{:02x}", info.pubkey_hash)
            };
            self.send_alert(&format!("NEW: {} ({:02x})", label, info.pubkey_hash), now_ms);
        }
    }

    /// Encrypted TXT notification to the configured alert destination.
    pub(crate) fn send_alert(&mut self, text: &str, now_ms: u64) {
        if !self.timesync.is_synced() {
            debug!("alert skipped, time not synced");
            return;
        }
        let dest = self.config.alert_dest;
        let secret = match self.contacts.find_by_pubkey(&dest) {
            Some(c) => c.shared_secret,
            None => match crypto::shared_secret(&self.identity, &dest) {
                Ok(s) => s,
                Err(_) => {
                    debug!("alert destination key invalid");
                    return;
                }
            },
        };

        let ts = self.timesync.now_unix(now_ms);
        let mut inner = Vec::with_capacity(5 + text.len());
        inner.extend_from_slice(&ts.to_le_bytes());
        inner.push(TXT_TYPE_PLAIN << 2);
        inner.extend_from_slice(text.as_bytes());

        let sealed = crypto::encrypt_then_mac(&secret, &inner);
        let mut payload = vec![dest[0], self.identity.node_hash()];
        payload.extend_from_slice(&sealed);
        self.enqueue(QueuedPacket::immediate(Packet::new(
            RouteType::Flood,
            PayloadType::TxtMsg,
            payload,
        )));
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    fn on_control(&mut self, packet: &Packet, now_ms: u64) {
        let p = &packet.payload;
        if p.len() < 6 || p[0] >> 4 != CONTROL_DISCOVER_NIBBLE {
            return;
        }
        let type_filter = p[1];
        if type_filter & (1 << self.identity.node_type().nibble()) == 0 {
            return;
        }
        let enabled = self.config.limits_enabled;
        if !RateLimits::check(&mut self.limits.discover, enabled, now_ms) {
            self.stats.rate_limited = self.stats.rate_limited.saturating_add(1);
            return;
        }

        let mut resp = Vec::with_capacity(15);
        resp.push(CONTROL_DISCOVER_RESP);
        resp.push(self.identity.node_type().nibble());
        resp.push(packet.snr_q as u8);
        resp.extend_from_slice(&p[2..6]);
        resp.extend_from_slice(&self.identity.public_key[..8]);

        // Jitter so simultaneous responders spread out.
        let delay = self.rng.gen_range(0..2_000u64);
        self.enqueue(QueuedPacket {
            packet: Packet::new(RouteType::Flood, PayloadType::Control, resp),
            not_before_ms: now_ms + delay,
            reboot_after: false,
        });
    }

    // =========================================================================
    // LOGIN
    // =========================================================================

    fn on_anon_request(&mut self, packet: &Packet, now_ms: u64) {
        let enabled = self.config.limits_enabled;
        if !RateLimits::check(&mut self.limits.login, enabled, now_ms) {
            self.stats.rate_limited = self.stats.rate_limited.saturating_add(1);
            return;
        }

        let req = match crypto::open_anon_request(&self.identity, &packet.payload[1..]) {
            Ok(r) => r,
            Err(e) => {
                self.stats.login_failures = self.stats.login_failures.saturating_add(1);
                debug!(error = %e, "login attempt rejected");
                return;
            }
        };

        let permissions = AccessControl::check_password(
            &self.config.admin_password,
            &self.config.guest_password,
            &req.password,
        );
        if permissions == PERM_NONE {
            self.stats.login_failures = self.stats.login_failures.saturating_add(1);
            debug!("login rejected: wrong password");
            return;
        }

        // Sessions are evictable; the ACL watermark survives and blocks a
        // replayed login from resurrecting an old timestamp.
        if let Some(w) = self.acl.watermark(&req.ephemeral_pub) {
            if req.timestamp <= w {
                debug!(ts = req.timestamp, watermark = w, "login replayed");
                return;
            }
        }

        self.sessions.install(
            req.ephemeral_pub,
            req.secret,
            permissions,
            req.timestamp,
            packet.path.clone(),
            now_ms,
        );
        self.acl.record_login(&req.ephemeral_pub, permissions, req.timestamp);
        self.stats.logins = self.stats.logins.saturating_add(1);
        info!(
            "client login {:02x} admin={}",
            req.ephemeral_pub[0],
            permissions == crate::types::PERM_ADMIN
        );

        let ts = self.timesync.now_unix(now_ms);
        let body = crypto::build_login_ok(ts, KEEP_ALIVE_SECS, permissions, &mut self.rng);
        self.send_encrypted(PayloadType::Response, req.ephemeral_pub[0], &req.secret, &body, false);
    }

    // =========================================================================
    // AUTHENTICATED REQUESTS
    // =========================================================================

    fn on_request(&mut self, packet: &Packet, now_ms: u64) {
        let enabled = self.config.limits_enabled;
        if !RateLimits::check(&mut self.limits.request, enabled, now_ms) {
            self.stats.rate_limited = self.stats.rate_limited.saturating_add(1);
            return;
        }

        let p = &packet.payload;
        if p.len() < 2 {
            return;
        }
        let src_hash = p[1];
        let Some((secret, is_admin, pubkey, permissions, ts, plain)) =
            self.open_session_payload(src_hash, &p[2..], now_ms)
        else {
            return;
        };
        self.acl.record_login(&pubkey, permissions, ts);

        let req_type = plain[4];
        let args = trim_padding(&plain[5..]).to_vec();

        match req_type {
            REQ_GET_STATUS => {
                let body = self.status_snapshot(now_ms).encode();
                self.respond(src_hash, &secret, ts, &body, false);
            }
            REQ_KEEP_ALIVE => {
                self.respond(src_hash, &secret, ts, &[], false);
            }
            REQ_GET_TELEMETRY => {
                let body = self.telemetry_lpp();
                self.respond(src_hash, &secret, ts, &body, false);
            }
            REQ_GET_MINMAXAVG => {
                let body = self.minmax_body();
                self.respond(src_hash, &secret, ts, &body, false);
            }
            REQ_GET_NEIGHBOURS => {
                let body = self.neighbours_body(now_ms);
                self.respond(src_hash, &secret, ts, &body, false);
            }
            REQ_GET_ACCESS_LIST => {
                if !is_admin {
                    self.respond(src_hash, &secret, ts, b"E:admin", false);
                    return;
                }
                let body = self.access_list_body();
                self.respond(src_hash, &secret, ts, &body, false);
            }
            REQ_SEND_CLI => {
                let cmd = String::from_utf8_lossy(&args).into_owned();
                if !is_admin && !cli::guest_allowed(cmd.trim()) {
                    self.respond(src_hash, &secret, ts, b"E:admin", false);
                    return;
                }
                let mut out = cli::execute(self, cmd.trim(), now_ms);
                truncate_utf8(&mut out, MAX_REMOTE_CLI_OUT);
                // A remote reboot answers first; the restart is anchored to
                // the response leaving the air, not to this handler.
                let reboot = is_admin && cmd.trim() == "reboot";
                if reboot {
                    self.reboot_at_ms = None;
                }
                self.respond(src_hash, &secret, ts, out.as_bytes(), reboot);
            }
            other => {
                debug!(req_type = other, "unknown request type");
                self.respond(src_hash, &secret, ts, b"Err:?", false);
            }
        }
    }

    /// Common session + MAC + replay pipeline for REQUEST and TXT frames.
    /// Returns the session essentials and the decrypted padded plaintext.
    #[allow(clippy::type_complexity)]
    fn open_session_payload(
        &mut self,
        src_hash: u8,
        sealed: &[u8],
        now_ms: u64,
    ) -> Option<([u8; 32], bool, [u8; 32], u8, u32, Vec<u8>)> {
        let Some(session) = self.sessions.find_by_hash_mut(src_hash) else {
            debug!("no session for request from {:02x}", src_hash);
            return None;
        };
        let plain = match crypto::mac_then_decrypt(&session.secret, sealed) {
            Ok(pl) => pl,
            Err(e) => {
                debug!(error = %e, "request rejected");
                return None;
            }
        };
        if plain.len() < 5 {
            return None;
        }
        let ts = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
        if ts <= session.last_req_ts {
            debug!(ts, watermark = session.last_req_ts, "request replayed");
            return None;
        }
        session.last_req_ts = ts;
        session.last_activity_ms = now_ms;
        Some((
            session.secret,
            session.is_admin(),
            session.pubkey,
            session.permissions,
            ts,
            plain,
        ))
    }

    /// Encrypted RESPONSE with the request timestamp echoed first.
    fn respond(
        &mut self,
        dest_hash: u8,
        secret: &[u8; 32],
        req_ts: u32,
        body: &[u8],
        reboot_after: bool,
    ) {
        let mut inner = Vec::with_capacity(4 + body.len());
        inner.extend_from_slice(&req_ts.to_le_bytes());
        inner.extend_from_slice(body);
        self.send_encrypted(PayloadType::Response, dest_hash, secret, &inner, reboot_after);
    }

    /// Seal and queue an addressed payload over flood routing with an
    /// empty path; the client walks the flood back.
    fn send_encrypted(
        &mut self,
        ptype: PayloadType,
        dest_hash: u8,
        secret: &[u8; 32],
        inner: &[u8],
        reboot_after: bool,
    ) {
        let sealed = crypto::encrypt_then_mac(secret, inner);
        let mut payload = vec![dest_hash, self.identity.node_hash()];
        payload.extend_from_slice(&sealed);
        self.enqueue(QueuedPacket {
            packet: Packet::new(RouteType::Flood, ptype, payload),
            not_before_ms: 0,
            reboot_after,
        });
    }

    // =========================================================================
    // TEXT MESSAGES
    // =========================================================================

    fn on_txt(&mut self, packet: &Packet, now_ms: u64) {
        let p = &packet.payload;
        if p.len() < 4 || p[0] != self.identity.node_hash() {
            return;
        }
        let src_hash = p[1];

        // Directed ping probes ride unencrypted.
        if &p[2..4] == b"DP" {
            self.seen.observe(src_hash, packet.rssi, packet.snr_q, now_ms);
            let mut reply = vec![src_hash, self.identity.node_hash(), b'P', b'O'];
            reply.extend_from_slice(
                format!("{} {}", self.identity.name, packet.rssi).as_bytes(),
            );
            self.enqueue(QueuedPacket::immediate(Packet::new(
                RouteType::Flood,
                PayloadType::TxtMsg,
                reply,
            )));
            return;
        }
        if &p[2..4] == b"PO" {
            self.seen.observe(src_hash, packet.rssi, packet.snr_q, now_ms);
            info!(
                "ping reply from {:02x}: {}",
                src_hash,
                String::from_utf8_lossy(&p[4..])
            );
            return;
        }

        // Encrypted text rides the same budget as binary requests.
        let enabled = self.config.limits_enabled;
        if !RateLimits::check(&mut self.limits.request, enabled, now_ms) {
            self.stats.rate_limited = self.stats.rate_limited.saturating_add(1);
            return;
        }

        let Some((secret, is_admin, pubkey, permissions, ts, plain)) =
            self.open_session_payload(src_hash, &p[2..], now_ms)
        else {
            return;
        };
        self.acl.record_login(&pubkey, permissions, ts);

        let txt_type = plain[4] >> 2;
        let text = String::from_utf8_lossy(trim_padding(&plain[5..])).into_owned();

        match txt_type {
            TXT_TYPE_CLI => {
                if !is_admin && !cli::guest_allowed(text.trim()) {
                    self.send_txt_reply(src_hash, &secret, "E:admin", now_ms);
                    return;
                }
                let mut out = cli::execute(self, text.trim(), now_ms);
                truncate_utf8(&mut out, MAX_REMOTE_CLI_OUT);
                self.send_txt_reply(src_hash, &secret, &out, now_ms);
            }
            TXT_TYPE_PLAIN | TXT_TYPE_SIGNED => {
                info!("text message from {:02x}: {}", src_hash, text);
            }
            other => {
                debug!(txt_type = other, "unknown text type");
            }
        }
    }

    fn send_txt_reply(&mut self, dest_hash: u8, secret: &[u8; 32], text: &str, now_ms: u64) {
        let ts = self.timesync.now_unix(now_ms);
        let mut inner = Vec::with_capacity(5 + text.len());
        inner.extend_from_slice(&ts.to_le_bytes());
        inner.push(TXT_TYPE_PLAIN << 2);
        inner.extend_from_slice(text.as_bytes());
        self.send_encrypted(PayloadType::TxtMsg, dest_hash, secret, &inner, false);
    }

    // =========================================================================
    // RESPONSE BODIES
    // =========================================================================

    fn telemetry_lpp(&self) -> Vec<u8> {
        let mut lpp = Vec::with_capacity(24);
        // Channel 1: voltage, 0.01 V units.
        lpp.extend_from_slice(&[1, 0x74]);
        lpp.extend_from_slice(&(self.sensors.battery_mv / 10).to_be_bytes());
        // Channel 2: temperature, 0.1 °C units.
        lpp.extend_from_slice(&[2, 0x67]);
        lpp.extend_from_slice(&self.sensors.temperature_dc.to_be_bytes());
        // Channel 3: analog input, 0.01 units.
        lpp.extend_from_slice(&[3, 0x02]);
        lpp.extend_from_slice(&self.sensors.analog.to_be_bytes());
        // Channel 4: GPS, 1e-4 degree, 0.01 m altitude.
        if self.identity.has_location() {
            lpp.extend_from_slice(&[4, 0x88]);
            let lat = self.identity.lat / 100;
            let lon = self.identity.lon / 100;
            lpp.extend_from_slice(&lat.to_be_bytes()[1..4]);
            lpp.extend_from_slice(&lon.to_be_bytes()[1..4]);
            lpp.extend_from_slice(&[0, 0, 0]);
        }
        lpp
    }

    fn minmax_body(&self) -> Vec<u8> {
        let r = &self.radio_stats;
        let mut body = Vec::with_capacity(18);
        for v in [
            r.rssi.min,
            r.rssi.max,
            r.rssi.avg(),
            r.snr_q.min,
            r.snr_q.max,
            r.snr_q.avg(),
            r.noise.min,
            r.noise.max,
            r.noise.avg(),
        ] {
            body.extend_from_slice(&v.to_le_bytes());
        }
        body
    }

    fn neighbours_body(&self, now_ms: u64) -> Vec<u8> {
        let count = self.neighbors.len() as u16;
        let entries: Vec<_> = self.neighbors.iter().take(MAX_NEIGHBOUR_RESULTS).collect();

        let mut body = Vec::with_capacity(4 + entries.len() * 11);
        body.extend_from_slice(&count.to_le_bytes());
        body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for n in entries {
            body.extend_from_slice(&n.prefix6());
            let secs = (now_ms.saturating_sub(n.last_heard_ms) / 1000) as u32;
            body.extend_from_slice(&secs.to_le_bytes());
            body.push(n.snr_q as u8);
        }
        body
    }

    fn access_list_body(&self) -> Vec<u8> {
        let mut body = vec![self.acl.len() as u8];
        for e in self.acl.iter() {
            body.extend_from_slice(&e.prefix);
            body.push(e.permissions);
        }
        body
    }
}
