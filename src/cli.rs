//! Line-oriented administration CLI.
//!
//! One command per line, short answers, `E:`-prefixed failures. The same
//! pipeline serves the serial console and authenticated SEND_CLI / CLI
//! text requests; remote permission gating happens before execution.

use crate::node::RepeaterNode;
use crate::radio::Radio;
use crate::storage::NvStorage;
use crate::types::{NodeConfig, NodeType, FIRMWARE_VERSION, MAX_NAME_LEN, REBOOT_GRACE_MS};

/// Parsed command, prefix-dispatched from the first token.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Status,
    Stats,
    Lifetime,
    RadioStats,
    PacketStats,
    Advert { local: bool },
    AdvertInterval(u16),
    Nodes,
    Contacts,
    Contact(String),
    Neighbours,
    Identity,
    ShowName,
    SetName(String),
    ShowLocation,
    SetLocation(f64, f64),
    ClearLocation,
    ShowTime,
    SetTime(u32),
    NodeType(NodeType),
    Passwd { admin: bool, password: String },
    Sleep(Option<bool>),
    RxBoost(Option<bool>),
    Repeat(Option<bool>),
    Mode(u8),
    AlertShow,
    AlertEnable(bool),
    AlertDest(String),
    AlertClear,
    AlertTest,
    Ping(Option<String>),
    NewId,
    Reset,
    Save,
    Reboot,
    Help,
    Unknown,
}

fn parse(line: &str) -> Command {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Command::Unknown;
    };
    let rest: Vec<&str> = tokens.collect();

    match head {
        "status" => Command::Status,
        "stats" => Command::Stats,
        "lifetime" => Command::Lifetime,
        "radiostats" => Command::RadioStats,
        "packetstats" => Command::PacketStats,
        "advert" => match rest.as_slice() {
            [] => Command::Advert { local: false },
            ["local"] => Command::Advert { local: true },
            ["interval", secs] => secs
                .parse()
                .map(Command::AdvertInterval)
                .unwrap_or(Command::Unknown),
            _ => Command::Unknown,
        },
        "nodes" => Command::Nodes,
        "contacts" => Command::Contacts,
        "contact" => match rest.as_slice() {
            [hex] => Command::Contact((*hex).to_string()),
            _ => Command::Unknown,
        },
        "neighbours" | "neighbors" => Command::Neighbours,
        "identity" => Command::Identity,
        "name" => match rest.as_slice() {
            [] => Command::ShowName,
            _ => Command::SetName(rest.join(" ")),
        },
        "location" => match rest.as_slice() {
            [] => Command::ShowLocation,
            ["clear"] => Command::ClearLocation,
            [lat, lon] => match (lat.parse(), lon.parse()) {
                (Ok(lat), Ok(lon)) => Command::SetLocation(lat, lon),
                _ => Command::Unknown,
            },
            _ => Command::Unknown,
        },
        "time" => match rest.as_slice() {
            [] => Command::ShowTime,
            [unix] => unix.parse().map(Command::SetTime).unwrap_or(Command::Unknown),
            _ => Command::Unknown,
        },
        "nodetype" => match rest.as_slice() {
            ["chat"] => Command::NodeType(NodeType::Chat),
            ["repeater"] => Command::NodeType(NodeType::Repeater),
            _ => Command::Unknown,
        },
        "passwd" => match rest.as_slice() {
            ["admin", pw] => Command::Passwd { admin: true, password: (*pw).to_string() },
            ["guest", pw] => Command::Passwd { admin: false, password: (*pw).to_string() },
            _ => Command::Unknown,
        },
        "sleep" => Command::Sleep(parse_on_off(&rest)),
        "rxboost" => Command::RxBoost(parse_on_off(&rest)),
        "repeat" => Command::Repeat(parse_on_off(&rest)),
        "mode" => match rest.as_slice() {
            [m] => match m.parse::<u8>() {
                Ok(m) if m <= 2 => Command::Mode(m),
                _ => Command::Unknown,
            },
            _ => Command::Unknown,
        },
        "alert" => match rest.as_slice() {
            [] => Command::AlertShow,
            ["on"] => Command::AlertEnable(true),
            ["off"] => Command::AlertEnable(false),
            ["clear"] => Command::AlertClear,
            ["test"] => Command::AlertTest,
            ["dest", hex] => Command::AlertDest((*hex).to_string()),
            _ => Command::Unknown,
        },
        "ping" => match rest.as_slice() {
            [] => Command::Ping(None),
            [hex] => Command::Ping(Some((*hex).to_string())),
            _ => Command::Unknown,
        },
        "newid" => Command::NewId,
        "reset" => Command::Reset,
        "save" => Command::Save,
        "reboot" => Command::Reboot,
        "help" => Command::Help,
        _ => Command::Unknown,
    }
}

fn parse_on_off(rest: &[&str]) -> Option<bool> {
    match rest {
        ["on"] => Some(true),
        ["off"] => Some(false),
        _ => None,
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

fn format_time(unix: u32) -> String {
    match chrono::DateTime::from_timestamp(unix as i64, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{unix}"),
    }
}

/// May a guest session run this line? Read-only commands only, and the
/// parameterized ones only in their display form.
pub fn guest_allowed(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return false;
    };
    let has_args = tokens.next().is_some();
    match head {
        "status" | "stats" | "lifetime" | "telemetry" | "nodes" | "neighbours"
        | "neighbors" | "identity" => true,
        "time" | "location" | "repeat" => !has_args,
        _ => false,
    }
}

/// Run one command line against the node. Always returns a short text
/// answer; state-changing commands persist their record before returning.
pub fn execute<R: Radio, S: NvStorage>(
    node: &mut RepeaterNode<R, S>,
    line: &str,
    now_ms: u64,
) -> String {
    match parse(line) {
        Command::Status => {
            let s = node.status_snapshot(now_ms);
            format!(
                "meshrelay v{} | {} ({:02x}) | up {}s | q {} | rssi {} snr {} | noise {} | {}",
                FIRMWARE_VERSION,
                node.identity.name,
                node.identity.node_hash(),
                s.total_up_time_secs,
                s.tx_queue_len,
                s.last_rssi,
                s.last_snr_q as f32 / 4.0,
                s.noise_floor,
                if node.timesync.is_synced() {
                    format_time(node.timesync.now_unix(now_ms))
                } else {
                    "time unsynced".to_string()
                },
            )
        }
        Command::Stats => {
            let p = &node.pkt_stats;
            format!(
                "rx {} (flood {} direct {}) tx {} (flood {} direct {}) dups {}/{} airtime {}s",
                p.n_recv,
                p.recv_flood,
                p.recv_direct,
                p.n_sent,
                p.sent_flood,
                p.sent_direct,
                p.flood_dups,
                p.direct_dups,
                node.airtime.total_secs(),
            )
        }
        Command::Lifetime => {
            let s = &node.stats;
            format!(
                "boot {} | rx {} tx {} fwd {} | nodes {} | logins {} (fail {}) | limited {} | up {}s | first {}",
                s.boot_count,
                s.rx,
                s.tx,
                s.fwd,
                s.unique_nodes,
                s.logins,
                s.login_failures,
                s.rate_limited,
                s.uptime_secs,
                if s.first_boot_unix == 0 {
                    "-".to_string()
                } else {
                    format_time(s.first_boot_unix)
                },
            )
        }
        Command::RadioStats => {
            let r = &node.radio_stats;
            format!(
                "rssi {}/{}/{} | snr {}/{}/{} (q) | noise {}/{}/{} floor {}",
                r.rssi.min,
                r.rssi.avg(),
                r.rssi.max,
                r.snr_q.min,
                r.snr_q.avg(),
                r.snr_q.max,
                r.noise.min,
                r.noise.avg(),
                r.noise.max,
                r.noise_floor(),
            )
        }
        Command::PacketStats => {
            let p = &node.pkt_stats;
            format!(
                "recv {} sent {} | crc {} | bad {} | clamped {} | qfull {} | errors {}",
                p.n_recv,
                p.n_sent,
                p.crc_errors,
                p.deserialize_errors,
                p.oversize_clamped,
                p.full_events,
                node.total_errors,
            )
        }
        Command::Advert { local } => match node.send_advert(local, now_ms) {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("E:{e}"),
        },
        Command::AdvertInterval(secs) => {
            node.config.advert_interval_secs = secs;
            if secs == 0 {
                node.next_advert_ms = None;
            } else if node.timesync.is_synced() {
                node.next_advert_ms = Some(now_ms + secs as u64 * 1000);
            }
            node.save_config();
            "OK".to_string()
        }
        Command::Nodes => {
            if node.seen.is_empty() {
                return "no nodes".to_string();
            }
            node.seen
                .iter()
                .map(|n| {
                    format!(
                        "{:02x} {} rssi {} snr {} pkts {} age {}s",
                        n.hash,
                        n.name.as_deref().unwrap_or("-"),
                        n.last_rssi,
                        n.last_snr_q as f32 / 4.0,
                        n.packets,
                        (now_ms.saturating_sub(n.last_seen_ms)) / 1000,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::Contacts => {
            if node.contacts.is_empty() {
                return "no contacts".to_string();
            }
            node.contacts
                .iter()
                .map(|c| {
                    format!(
                        "{} {} rssi {}",
                        hex::encode(&c.pubkey[..4]),
                        if c.name.is_empty() { "-" } else { &c.name },
                        c.last_rssi,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::Contact(prefix_hex) => {
            let Ok(prefix) = hex::decode(&prefix_hex) else {
                return "Err:?".to_string();
            };
            let matches: Vec<_> = node.contacts.find_by_prefix(&prefix).collect();
            match matches.as_slice() {
                [] => "not found".to_string(),
                [c] => format!(
                    "{}\nname {} | rssi {} snr {} | seen {}s ago",
                    hex::encode(c.pubkey),
                    if c.name.is_empty() { "-" } else { &c.name },
                    c.last_rssi,
                    c.last_snr_q as f32 / 4.0,
                    (now_ms.saturating_sub(c.last_seen_ms)) / 1000,
                ),
                _ => "ambiguous".to_string(),
            }
        }
        Command::Neighbours => {
            if node.neighbors.is_empty() {
                return "no neighbours".to_string();
            }
            node.neighbors
                .iter()
                .map(|n| {
                    format!(
                        "{} {} snr {} age {}s",
                        hex::encode(n.prefix6()),
                        if n.name.is_empty() { "-" } else { &n.name },
                        n.snr_q as f32 / 4.0,
                        (now_ms.saturating_sub(n.last_heard_ms)) / 1000,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::Identity => format!(
            "{}\nhash {:02x} | type {} | name {}",
            hex::encode(node.identity.public_key),
            node.identity.node_hash(),
            node.identity.node_type().label(),
            node.identity.name,
        ),
        Command::ShowName => node.identity.name.clone(),
        Command::SetName(name) => {
            if node.identity.set_name(&name).is_err() {
                return format!("E:1-{MAX_NAME_LEN}");
            }
            node.save_identity();
            "OK".to_string()
        }
        Command::ShowLocation => {
            if node.identity.has_location() {
                format!(
                    "{:.6} {:.6}",
                    node.identity.lat as f64 / 1e6,
                    node.identity.lon as f64 / 1e6,
                )
            } else {
                "no location".to_string()
            }
        }
        Command::SetLocation(lat, lon) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return "Err:?".to_string();
            }
            node.identity
                .set_location((lat * 1e6) as i32, (lon * 1e6) as i32);
            node.save_identity();
            "OK".to_string()
        }
        Command::ClearLocation => {
            node.identity.clear_location();
            node.save_identity();
            "OK".to_string()
        }
        Command::ShowTime => {
            if node.timesync.is_synced() {
                let unix = node.timesync.now_unix(now_ms);
                format!("{} ({})", unix, format_time(unix))
            } else {
                "unsynced".to_string()
            }
        }
        Command::SetTime(unix) => {
            node.timesync.force(unix, now_ms);
            node.on_first_sync(now_ms);
            "OK".to_string()
        }
        Command::NodeType(ty) => {
            node.identity.set_node_type(ty);
            node.save_identity();
            "OK".to_string()
        }
        Command::Passwd { admin, password } => {
            if password.is_empty() || password.len() > MAX_NAME_LEN {
                return format!("E:1-{MAX_NAME_LEN}");
            }
            if admin {
                node.config.admin_password = password;
            } else {
                node.config.guest_password = password;
            }
            node.save_config();
            "OK".to_string()
        }
        Command::Sleep(arg) => match arg {
            None => format!("sleep {}", on_off(node.config.sleep_enabled)),
            Some(v) => {
                node.config.sleep_enabled = v;
                node.save_config();
                "OK".to_string()
            }
        },
        Command::RxBoost(arg) => match arg {
            None => format!("rxboost {}", on_off(node.config.rx_boost)),
            Some(v) => {
                node.config.rx_boost = v;
                if node.radio.set_rx_boost(v).is_err() {
                    return "E:radio".to_string();
                }
                node.save_config();
                "OK".to_string()
            }
        },
        Command::Repeat(arg) => match arg {
            None => format!("repeat {}", on_off(node.config.repeat_enabled)),
            Some(v) => {
                node.config.repeat_enabled = v;
                node.save_config();
                "OK".to_string()
            }
        },
        Command::Mode(m) => {
            node.config.rx_mode = m;
            node.restart_receive();
            node.save_config();
            "OK".to_string()
        }
        Command::AlertShow => {
            if node.config.alert_dest_set() {
                format!(
                    "alert {} dest {}",
                    on_off(node.config.alert_enabled),
                    hex::encode(&node.config.alert_dest[..4]),
                )
            } else {
                format!("alert {} dest -", on_off(node.config.alert_enabled))
            }
        }
        Command::AlertEnable(v) => {
            node.config.alert_enabled = v;
            node.save_config();
            "OK".to_string()
        }
        Command::AlertDest(prefix_hex) => {
            let Ok(prefix) = hex::decode(&prefix_hex) else {
                return "Err:?".to_string();
            };
            let matches: Vec<_> = node
                .contacts
                .find_by_prefix(&prefix)
                .map(|c| c.pubkey)
                .collect();
            match matches.as_slice() {
                [pubkey] => {
                    node.config.alert_dest = *pubkey;
                    node.save_config();
                    "OK".to_string()
                }
                [] => "not found".to_string(),
                _ => "ambiguous".to_string(),
            }
        }
        Command::AlertClear => {
            node.config.alert_dest = [0u8; 32];
            node.config.alert_enabled = false;
            node.save_config();
            "OK".to_string()
        }
        Command::AlertTest => {
            if !node.config.alert_dest_set() {
                return "no dest".to_string();
            }
            node.send_alert("TEST", now_ms);
            "OK".to_string()
        }
        Command::Ping(target) => {
            let dest = match target {
                None => None,
                Some(hexstr) => match hex::decode(&hexstr) {
                    Ok(bytes) if !bytes.is_empty() => Some(bytes[0]),
                    _ => return "Err:?".to_string(),
                },
            };
            // Without a target, probe the most recently heard node.
            let dest = dest.or_else(|| {
                node.seen
                    .iter()
                    .max_by_key(|n| n.last_seen_ms)
                    .map(|n| n.hash)
            });
            match dest {
                Some(hash) => {
                    node.send_ping(hash);
                    format!("ping {:02x}", hash)
                }
                None => "no nodes".to_string(),
            }
        }
        Command::NewId => {
            let name = node.identity.name.clone();
            let flags = node.identity.flags;
            let (lat, lon) = (node.identity.lat, node.identity.lon);
            let mut id = crate::identity::NodeIdentity::generate(&mut node.rng, &name);
            id.flags = flags;
            id.lat = lat;
            id.lon = lon;
            node.identity = id;
            node.save_identity();
            format!("new hash {:02x}", node.identity.node_hash())
        }
        Command::Reset => {
            node.config = NodeConfig::default();
            node.stats = Default::default();
            node.save_config();
            node.save_stats(now_ms);
            "OK".to_string()
        }
        Command::Save => {
            node.save_stats(now_ms);
            node.save_config();
            "OK".to_string()
        }
        Command::Reboot => {
            node.reboot_at_ms = Some(now_ms + REBOOT_GRACE_MS);
            "rebooting".to_string()
        }
        Command::Help => concat!(
            "status stats lifetime radiostats packetstats\n",
            "advert [local] | advert interval <sec>\n",
            "nodes contacts contact <hex> neighbours identity\n",
            "name [<n>] location [<lat> <lon>|clear] time [<unix>]\n",
            "nodetype chat|repeater passwd admin|guest <pwd>\n",
            "sleep|rxboost|repeat [on|off] mode 0|1|2\n",
            "alert [on|off|dest <hex>|clear|test] ping [<hex>]\n",
            "newid reset save reboot",
        )
        .to_string(),
        Command::Unknown => "Err:?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basics() {
        assert_eq!(parse("status"), Command::Status);
        assert_eq!(parse("advert local"), Command::Advert { local: true });
        assert_eq!(parse("advert interval 600"), Command::AdvertInterval(600));
        assert_eq!(parse("time 1737312000"), Command::SetTime(1_737_312_000));
        assert_eq!(
            parse("passwd admin hunter"),
            Command::Passwd { admin: true, password: "hunter".into() }
        );
        assert_eq!(parse("neighbors"), Command::Neighbours);
        assert_eq!(parse("mode 3"), Command::Unknown);
        assert_eq!(parse("bogus"), Command::Unknown);
    }

    #[test]
    fn parse_location() {
        assert_eq!(
            parse("location 46.5 6.6"),
            Command::SetLocation(46.5, 6.6)
        );
        assert_eq!(parse("location clear"), Command::ClearLocation);
        assert_eq!(parse("location"), Command::ShowLocation);
        assert_eq!(parse("location x y"), Command::Unknown);
    }
}
