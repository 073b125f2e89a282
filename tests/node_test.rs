//! End-to-end reactor tests over the simulated radio: time sync, dedup,
//! login, authenticated requests, directed ping, path growth and CSMA.
//!
//! Run with: cargo test --test node_test

use meshrelay::cli;
use meshrelay::crypto;
use meshrelay::identity::NodeIdentity;
use meshrelay::mesh::advert::{build_advert, parse_advert};
use meshrelay::mesh::dispatch::REQ_SEND_CLI;
use meshrelay::mesh::packet::{Packet, PayloadType, RouteType};
use meshrelay::node::RepeaterNode;
use meshrelay::radio::RadioParams;
use meshrelay::sim::SimRadio;
use meshrelay::storage::MemStorage;
use meshrelay::types::{FIRMWARE_BYTE, PERM_ADMIN};

type Node = RepeaterNode<SimRadio, MemStorage>;

fn make_node() -> Node {
    RepeaterNode::new(SimRadio::new(), MemStorage::new(), RadioParams::default(), 0)
        .expect("sim radio always begins")
}

/// Drive the reactor millisecond by millisecond.
fn run(node: &mut Node, clock: &mut u64, until_ms: u64) {
    while *clock < until_ms {
        *clock += 1;
        node.radio_mut().advance(*clock);
        node.poll(*clock);
    }
}

fn sent_packets(node: &mut Node) -> Vec<Packet> {
    node.radio_mut()
        .sent
        .iter()
        .map(|f| Packet::deserialize(f).expect("node emits valid frames").0)
        .collect()
}

// =============================================================================
// SCENARIO: BOOT, ADVERT, TIME SYNC
// =============================================================================

#[test]
fn first_advert_syncs_clock_and_schedules_beacon() {
    let mut node = make_node();
    let mut clock = 0u64;
    run(&mut node, &mut clock, 1_000);
    assert!(!node.is_synced());

    let peer = NodeIdentity::from_seed(&[0x42; 32], "peer-1");
    let adv = build_advert(&peer, 1_737_312_000, false).unwrap();
    node.radio_mut().inject(adv.serialize(), -90, 24);
    run(&mut node, &mut clock, 1_100);

    assert!(node.is_synced());
    assert_eq!(node.now_unix(clock), 1_737_312_000);

    let nodes_out = cli::execute(&mut node, "nodes", clock);
    assert!(nodes_out.contains("peer-1"), "seen table tracks the advertiser: {nodes_out}");
    let contacts_out = cli::execute(&mut node, "contacts", clock);
    assert!(contacts_out.contains(&hex::encode(&peer.public_key[..4])));

    // Our own advert fires ~5 s after the first sync and carries a
    // timestamp advanced by the elapsed time.
    run(&mut node, &mut clock, 12_000);
    let our_adverts: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::Advert)
        .filter_map(|p| parse_advert(&p.payload).ok())
        .filter(|i| i.pubkey == node.identity().public_key)
        .collect();
    assert_eq!(our_adverts.len(), 1);
    let ts = our_adverts[0].timestamp;
    assert!(
        (1_737_312_004..=1_737_312_008).contains(&ts),
        "beacon timestamp {ts} should be ~5 s after sync"
    );

    // The peer's flood advert was also repeated, with our hash appended.
    let forwarded: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::Advert)
        .filter(|p| p.path == vec![node.local_hash()])
        .collect();
    assert_eq!(forwarded.len(), 1);
}

// =============================================================================
// SCENARIO: DEDUP
// =============================================================================

#[test]
fn duplicate_flood_is_forwarded_once() {
    let mut node = make_node();
    let mut clock = 0u64;
    let dest = node.local_hash().wrapping_add(1);

    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, vec![dest, 0x33, b'h', b'i']);
    node.radio_mut().inject(pkt.serialize(), -95, 10);
    node.radio_mut().inject(pkt.serialize(), -95, 10);
    run(&mut node, &mut clock, 4_000);

    let repeats: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::TxtMsg)
        .collect();
    assert_eq!(repeats.len(), 1, "second arrival must be suppressed");
    assert_eq!(repeats[0].path, vec![node.local_hash()]);

    let lifetime = cli::execute(&mut node, "lifetime", clock);
    assert!(lifetime.contains("fwd 1 |"), "fwd counted once: {lifetime}");
}

// =============================================================================
// SCENARIO: LOGIN AND AUTHENTICATED REQUESTS
// =============================================================================

struct Client {
    id: NodeIdentity,
    secret: [u8; 32],
}

fn login(node: &mut Node, clock: &mut u64, password: &str, ts: u32) -> Client {
    let id = NodeIdentity::from_seed(&[0x77; 32], "client");
    let secret = crypto::shared_secret(&id, &node.identity().public_key).unwrap();

    let mut inner = Vec::new();
    inner.extend_from_slice(&ts.to_le_bytes());
    inner.extend_from_slice(password.as_bytes());
    let sealed = crypto::encrypt_then_mac(&secret, &inner);

    let mut payload = vec![node.local_hash()];
    payload.extend_from_slice(&id.public_key);
    payload.extend_from_slice(&sealed);

    let pkt = Packet::new(RouteType::Flood, PayloadType::AnonRequest, payload);
    node.radio_mut().inject(pkt.serialize(), -88, 30);
    let until = *clock + 3_000;
    run(node, clock, until);

    Client { id, secret }
}

fn responses_to(node: &mut Node, client_hash: u8) -> Vec<Packet> {
    sent_packets(node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::Response)
        .filter(|p| p.payload.first() == Some(&client_hash))
        .collect()
}

#[test]
fn admin_login_yields_login_ok() {
    let mut node = make_node();
    let mut clock = 0u64;
    cli::execute(&mut node, "passwd admin admin", clock);

    let client = login(&mut node, &mut clock, "admin", 1_737_312_100);

    let responses = responses_to(&mut node, client.id.public_key[0]);
    assert_eq!(responses.len(), 1);
    // dest + src + 2-byte MAC + one AES block.
    assert_eq!(responses[0].payload.len(), 2 + 18);
    assert!(responses[0].path.is_empty(), "responses flood with an empty path");

    let plain = crypto::mac_then_decrypt(&client.secret, &responses[0].payload[2..]).unwrap();
    assert_eq!(plain[4], 0, "login code");
    assert_eq!(plain[5], 60, "keep-alive 240 s encoded /4");
    assert_eq!(plain[6], 1, "is_admin");
    assert_eq!(plain[7], PERM_ADMIN);
    assert_eq!(plain[12], FIRMWARE_BYTE);

    let lifetime = cli::execute(&mut node, "lifetime", clock);
    assert!(lifetime.contains("logins 1 (fail 0)"), "{lifetime}");
}

#[test]
fn wrong_password_installs_nothing() {
    let mut node = make_node();
    let mut clock = 0u64;
    cli::execute(&mut node, "passwd admin admin", clock);

    let client = login(&mut node, &mut clock, "letmein", 1_737_312_100);

    assert!(responses_to(&mut node, client.id.public_key[0]).is_empty());
    let lifetime = cli::execute(&mut node, "lifetime", clock);
    assert!(lifetime.contains("logins 0 (fail 1)"), "{lifetime}");
}

fn request_frame(node: &Node, client: &Client, ts: u32, req_type: u8, data: &[u8]) -> Vec<u8> {
    let mut inner = Vec::new();
    inner.extend_from_slice(&ts.to_le_bytes());
    inner.push(req_type);
    inner.extend_from_slice(data);
    let sealed = crypto::encrypt_then_mac(&client.secret, &inner);

    let mut payload = vec![node.local_hash(), client.id.public_key[0]];
    payload.extend_from_slice(&sealed);
    Packet::new(RouteType::Flood, PayloadType::Request, payload).serialize()
}

#[test]
fn send_cli_status_echoes_timestamp_and_blocks_replay() {
    let mut node = make_node();
    let mut clock = 0u64;
    cli::execute(&mut node, "passwd admin admin", clock);
    let t = 1_737_312_100u32;
    let client = login(&mut node, &mut clock, "admin", t);

    let frame = request_frame(&node, &client, t + 1, REQ_SEND_CLI, b"status");
    node.radio_mut().inject(frame.clone(), -88, 30);
    let until = clock + 3_000;
    run(&mut node, &mut clock, until);

    let responses = responses_to(&mut node, client.id.public_key[0]);
    assert_eq!(responses.len(), 2, "login-ok plus one cli response");
    let plain = crypto::mac_then_decrypt(&client.secret, &responses[1].payload[2..]).unwrap();
    assert_eq!(&plain[..4], &(t + 1).to_le_bytes(), "request timestamp echoed");
    let text = String::from_utf8_lossy(&plain[4..]);
    assert!(text.contains("meshrelay"), "status text expected: {text}");

    // Replaying the identical request yields no further response.
    node.radio_mut().inject(frame, -88, 30);
    let until = clock + 3_000;
    run(&mut node, &mut clock, until);
    assert_eq!(responses_to(&mut node, client.id.public_key[0]).len(), 2);
}

#[test]
fn guest_reads_but_cannot_mutate() {
    let mut node = make_node();
    let mut clock = 0u64;
    cli::execute(&mut node, "passwd admin admin", clock);
    cli::execute(&mut node, "passwd guest view", clock);
    let t = 1_737_312_100u32;
    let client = login(&mut node, &mut clock, "view", t);

    // Read-only commands are in the guest set.
    let frame = request_frame(&node, &client, t + 1, REQ_SEND_CLI, b"status");
    node.radio_mut().inject(frame, -88, 30);
    let until = clock + 3_000;
    run(&mut node, &mut clock, until);

    let responses = responses_to(&mut node, client.id.public_key[0]);
    assert_eq!(responses.len(), 2);
    let plain = crypto::mac_then_decrypt(&client.secret, &responses[1].payload[2..]).unwrap();
    let text = String::from_utf8_lossy(&plain[4..]).into_owned();
    assert!(text.contains("meshrelay"), "guest may read status: {text}");

    // Anything else answers E:admin and runs nothing.
    let frame = request_frame(&node, &client, t + 2, REQ_SEND_CLI, b"reboot");
    node.radio_mut().inject(frame, -88, 30);
    let until = clock + 3_000;
    run(&mut node, &mut clock, until);

    let responses = responses_to(&mut node, client.id.public_key[0]);
    assert_eq!(responses.len(), 3);
    let plain = crypto::mac_then_decrypt(&client.secret, &responses[2].payload[2..]).unwrap();
    let text = String::from_utf8_lossy(&plain[4..]);
    assert!(text.starts_with("E:admin"), "{text}");
}

// =============================================================================
// SCENARIO: DIRECTED PING
// =============================================================================

#[test]
fn directed_ping_answers_with_name_and_rssi() {
    let mut node = make_node();
    let mut clock = 0u64;

    let mut payload = vec![node.local_hash(), 0x5A, b'D', b'P'];
    payload.extend_from_slice(b"#5 Alice");
    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, payload);
    node.radio_mut().inject(pkt.serialize(), -90, 16);
    run(&mut node, &mut clock, 4_000);

    let pongs: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::TxtMsg)
        .filter(|p| p.payload.len() >= 4 && &p.payload[2..4] == b"PO")
        .collect();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0].payload[0], 0x5A);
    assert_eq!(pongs[0].payload[1], node.local_hash());
    let text = String::from_utf8_lossy(&pongs[0].payload[4..]).into_owned();
    assert!(text.contains("Repeater"), "{text}");
    assert!(text.contains("-90"), "{text}");
}

// =============================================================================
// SCENARIO: PATH GROWTH
// =============================================================================

#[test]
fn forwarded_flood_grows_path() {
    let mut node = make_node();
    let mut clock = 0u64;
    let dest = node.local_hash().wrapping_add(1);

    let mut pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, vec![dest, 0x33, b'y', b'o']);
    pkt.path = vec![0xA1, 0xB2];
    node.radio_mut().inject(pkt.serialize(), -97, 4);
    run(&mut node, &mut clock, 4_000);

    let repeats: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::TxtMsg)
        .collect();
    assert_eq!(repeats.len(), 1);
    assert_eq!(repeats[0].path, vec![0xA1, 0xB2, node.local_hash()]);
    assert_eq!(repeats[0].path.len(), 3);
}

// =============================================================================
// SCENARIO: CSMA ABORT ON BUSY CHANNEL
// =============================================================================

#[test]
fn busy_channel_defers_transmission() {
    let mut node = make_node();
    let mut clock = 0u64;
    let dest = node.local_hash().wrapping_add(1);

    // Jam the channel before anything is queued.
    node.radio_mut().force_preamble = true;
    node.radio_mut().force_header = true;

    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, vec![dest, 0x33, b'h', b'i']);
    node.radio_mut().inject(pkt.serialize(), -95, 10);
    run(&mut node, &mut clock, 3_000);
    assert_eq!(node.radio_mut().sent_count(), 0, "no transmission on a busy channel");

    // Channel clears: the retained packet goes out once the stale header
    // observation ages past the maximum packet time.
    node.radio_mut().force_preamble = false;
    node.radio_mut().force_header = false;
    run(&mut node, &mut clock, 9_000);
    assert_eq!(node.radio_mut().sent_count(), 1);
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[test]
fn discovery_request_is_answered_with_tag_echo() {
    let mut node = make_node();
    let mut clock = 0u64;

    let mut payload = vec![0x80u8, 1 << 2];
    payload.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    let pkt = Packet::new(RouteType::Flood, PayloadType::Control, payload);
    node.radio_mut().inject(pkt.serialize(), -101, -8);
    run(&mut node, &mut clock, 6_000);

    let responses: Vec<_> = sent_packets(&mut node)
        .into_iter()
        .filter(|p| p.payload_type() == PayloadType::Control)
        .filter(|p| p.payload.first() == Some(&0x90))
        .collect();
    assert_eq!(responses.len(), 1);
    let r = &responses[0].payload;
    assert_eq!(r[1], 2, "repeater node type");
    assert_eq!(r[2] as i8, -8, "inbound snr echoed");
    assert_eq!(&r[3..7], &0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(&r[7..15], &node.identity().public_key[..8]);
}

// =============================================================================
// NEIGHBORS
// =============================================================================

#[test]
fn only_zero_hop_repeaters_become_neighbours() {
    let mut node = make_node();
    let mut clock = 0u64;

    let direct_peer = NodeIdentity::from_seed(&[0x21; 32], "near-rpt");
    let adv = build_advert(&direct_peer, 1_737_312_000, true).unwrap();
    node.radio_mut().inject(adv.serialize(), -80, 36);

    let far_peer = NodeIdentity::from_seed(&[0x22; 32], "far-rpt");
    let mut far_adv = build_advert(&far_peer, 1_737_312_001, false).unwrap();
    far_adv.path = vec![0x99];
    node.radio_mut().inject(far_adv.serialize(), -120, -40);

    run(&mut node, &mut clock, 2_000);

    let out = cli::execute(&mut node, "neighbours", clock);
    assert!(out.contains("near-rpt"), "{out}");
    assert!(!out.contains("far-rpt"), "forwarded advert must not create a neighbour: {out}");
}

// =============================================================================
// RADIO ERROR THRESHOLDS
// =============================================================================

#[test]
fn repeated_radio_errors_reset_the_transceiver() {
    let mut node = make_node();
    let mut clock = 0u64;
    let dest = node.local_hash().wrapping_add(1);

    node.radio_mut().fail_transmit = true;
    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, vec![dest, 0x33, b'h', b'i']);
    node.radio_mut().inject(pkt.serialize(), -95, 10);

    // Every transmit attempt fails and re-queues; the consecutive-error
    // threshold forces a transceiver reset and re-begin.
    run(&mut node, &mut clock, 10_000);
    assert!(node.radio_mut().resets >= 1, "radio reset after repeated errors");
    assert!(node.radio_mut().begin_calls >= 2, "radio re-initialized after reset");
    assert_eq!(node.radio_mut().sent_count(), 0);

    // Once the driver recovers, the retained packet still goes out.
    node.radio_mut().fail_transmit = false;
    run(&mut node, &mut clock, 14_000);
    assert_eq!(node.radio_mut().sent_count(), 1);
}

// =============================================================================
// PERSISTENCE ACROSS REBOOT
// =============================================================================

#[test]
fn identity_and_config_survive_reboot() {
    let mut node = make_node();
    let mut clock = 0u64;
    cli::execute(&mut node, "name relay-7", clock);
    cli::execute(&mut node, "passwd admin hunter", clock);
    cli::execute(&mut node, "save", clock);
    let pubkey = node.identity().public_key;

    let store = node.storage_mut().clone();
    let mut reborn = RepeaterNode::new(SimRadio::new(), store, RadioParams::default(), 0).unwrap();
    assert_eq!(reborn.identity().public_key, pubkey);
    assert_eq!(reborn.identity().name, "relay-7");
    assert_eq!(reborn.config().admin_password, "hunter");

    let lifetime = cli::execute(&mut reborn, "lifetime", clock);
    assert!(lifetime.starts_with("boot 2"), "boot counter increments: {lifetime}");
}
