//! meshrelay host harness.
//!
//! Runs the repeater reactor against a simulated LoRa channel bridged
//! over UDP: every transmitted frame is sent as one datagram to each
//! configured peer, every received datagram is injected into the
//! simulated radio with this node's configured link quality. Stdin is the
//! serial console.
//!
//! A `reboot` (CLI or remote) exits with a dedicated code so a supervisor
//! loop can restart the process, mimicking a device reset.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use meshrelay::cli;
use meshrelay::node::{RepeaterNode, Sensors};
use meshrelay::radio::RadioParams;
use meshrelay::sim::SimRadio;
use meshrelay::storage::FileStorage;

/// Process exit code meaning "restart me".
const RESTART_EXIT_CODE: i32 = 7;

/// Reactor tick. The real firmware spins freely; 2 ms keeps the harness
/// honest without burning a host core.
const TICK_MS: u64 = 2;

#[derive(Parser)]
#[command(name = "meshrelay", version, about = "Store-and-forward LoRa mesh repeater")]
struct Args {
    /// UDP port simulating the radio channel
    #[arg(short, long, default_value = "17171")]
    port: u16,

    /// Peer nodes on the simulated channel (repeatable)
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Non-volatile storage file
    #[arg(short, long, default_value = "./meshrelay.nv")]
    store: PathBuf,

    /// Simulated RSSI for received frames, dBm
    #[arg(long, default_value = "-92")]
    rssi: i16,

    /// Simulated SNR for received frames, quarter-dB
    #[arg(long, default_value = "22")]
    snr: i8,

    /// Radio frequency, Hz
    #[arg(long, default_value = "869525000")]
    freq: u32,

    /// LoRa spreading factor
    #[arg(long, default_value = "11")]
    sf: u8,

    /// LoRa bandwidth, Hz
    #[arg(long, default_value = "250000")]
    bw: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshrelay=info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();

    let params = RadioParams {
        frequency_hz: args.freq,
        spreading_factor: args.sf,
        bandwidth_hz: args.bw,
        ..Default::default()
    };

    let storage = match FileStorage::open(&args.store) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot open storage {}: {}", args.store.display(), e);
            return;
        }
    };

    let boot = Instant::now();
    let mut node = match RepeaterNode::new(SimRadio::new(), storage, params, 0) {
        Ok(n) => n,
        Err(e) => {
            // Radio begin failure is fatal on hardware too.
            error!("radio init failed: {e}");
            std::process::exit(1);
        }
    };
    node.set_sensors(Sensors { battery_mv: 3_700, temperature_dc: 215, analog: 0 });

    let socket = match UdpSocket::bind(("0.0.0.0", args.port)).await {
        Ok(s) => s,
        Err(e) => {
            error!("cannot bind udp port {}: {}", args.port, e);
            return;
        }
    };

    info!("════════════════════════════════════════════════");
    info!(
        "  meshrelay v{} — {} ({:02x})",
        env!("CARGO_PKG_VERSION"),
        node.identity().name,
        node.identity().node_hash(),
    );
    info!("════════════════════════════════════════════════");
    info!(
        "channel: udp :{} -> {} peer(s) | sf{} bw{} @ {} Hz",
        args.port,
        args.peers.len(),
        args.sf,
        args.bw,
        args.freq,
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rx_buf = [0u8; 512];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now_ms = boot.elapsed().as_millis() as u64;
                node.radio_mut().advance(now_ms);
                let status = node.poll(now_ms);

                // Bridge transmitted frames onto the UDP channel.
                let sent: Vec<Vec<u8>> = node.radio_mut().sent.drain(..).collect();
                for frame in sent {
                    for peer in &args.peers {
                        if let Err(e) = socket.send_to(&frame, peer).await {
                            warn!("udp send to {peer} failed: {e}");
                        }
                    }
                }

                if status.reboot_requested {
                    info!("reboot requested, exiting for supervisor restart");
                    std::process::exit(RESTART_EXIT_CODE);
                }
            }

            recv = socket.recv_from(&mut rx_buf) => {
                match recv {
                    Ok((len, _from)) if len > 0 => {
                        node.radio_mut().inject(rx_buf[..len].to_vec(), args.rssi, args.snr);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("udp recv failed: {e}"),
                }
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let now_ms = boot.elapsed().as_millis() as u64;
                        let out = cli::execute(&mut node, line.trim(), now_ms);
                        println!("{out}");
                    }
                    Ok(Some(_)) => {}
                    // stdin closed (piped input drained): keep relaying.
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin error: {e}");
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let now_ms = boot.elapsed().as_millis() as u64;
                let _ = cli::execute(&mut node, "save", now_ms);
                break;
            }
        }
    }
}
