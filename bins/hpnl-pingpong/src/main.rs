use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam::channel;
use hpnl_core::{EventQueueService, ServiceConfig, METADATA_SIZE};
use hpnl_logging::{init_logging, LogConfig};
use hpnl_net::EventKind;
use hpnl_net_loopback::LoopbackFabric;
use hpnl_types::Address;

const PING: u8 = 1;
const PONG: u8 = 2;

/// HPNL ping-pong demo
///
/// Starts a server and a client service on one in-process fabric, then
/// bounces framed messages between them and reports the round-trip latency.
#[derive(Parser, Debug)]
#[command(name = "hpnl-pingpong", version, about)]
struct Args {
    /// Address the server listens on
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    #[arg(short, long, default_value_t = 12191)]
    port: u16,

    /// Size of every send and receive buffer in bytes
    #[arg(short = 's', long, default_value_t = 65536)]
    buffer_size: usize,

    /// Number of send buffers per service
    #[arg(short = 'n', long, default_value_t = 32)]
    buffer_number: usize,

    /// Payload bytes per message, excluding the frame header
    #[arg(short, long, default_value_t = 4096)]
    message_size: usize,

    #[arg(short, long, default_value_t = 1000)]
    iterations: u64,

    /// Service configuration file (TOML); command-line sizes override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&LogConfig::with_level(&args.log_level))?;

    let mut base = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    base.buffer_size = args.buffer_size;
    base.buffer_num = args.buffer_number;
    if args.message_size + METADATA_SIZE > base.buffer_size {
        bail!(
            "message size {} plus the {METADATA_SIZE}-byte header exceeds buffer size {}",
            args.message_size,
            base.buffer_size
        );
    }
    let addr = Address::from_host(&args.address, args.port)
        .with_context(|| format!("invalid address {}", args.address))?;

    let fabric = LoopbackFabric::new();

    let server = EventQueueService::new(
        ServiceConfig {
            is_server: true,
            ..base.clone()
        },
        fabric.transport(),
    )?;
    server.set_callback(EventKind::Received, |conn, id, len| {
        let echoed = conn
            .recv_buffer(id)
            .and_then(|buffer| buffer.parse(len))
            .and_then(|frame| conn.send_frame(PONG, frame.header.seq, &frame.payload));
        if let Err(err) = echoed {
            tracing::warn!(peer = %conn.peer_addr(), error = %err, "echo failed");
        }
    });
    server.start()?;
    server.listen(addr)?;

    let client = EventQueueService::new(
        ServiceConfig {
            is_server: false,
            ..base
        },
        fabric.transport(),
    )?;
    let (pong_tx, pong_rx) = channel::unbounded();
    client.set_callback(EventKind::Received, move |conn, id, len| {
        match conn.recv_buffer(id).and_then(|buffer| buffer.parse(len)) {
            Ok(frame) => {
                pong_tx.send(frame.header.seq).ok();
            }
            Err(err) => tracing::warn!(error = %err, "malformed reply"),
        }
    });
    client.start()?;

    let conn = client.connect(addr, 3000)?;
    tracing::info!(local = %conn.local_addr(), peer = %conn.peer_addr(), "connected");

    let message = vec![0x5a; args.message_size];
    let started = Instant::now();
    for seq in 0..args.iterations {
        conn.send_frame(PING, seq, &message)?;
        let echoed = pong_rx
            .recv_timeout(Duration::from_secs(5))
            .with_context(|| format!("no reply for message {seq}"))?;
        if echoed != seq {
            bail!("reply out of order: expected {seq}, got {echoed}");
        }
    }
    let elapsed = started.elapsed();

    let round_trips = args.iterations.max(1) as f64;
    let bytes = 2.0 * round_trips * args.message_size as f64;
    tracing::info!(
        iterations = args.iterations,
        message_size = args.message_size,
        elapsed_ms = elapsed.as_millis() as u64,
        avg_rtt_us = elapsed.as_secs_f64() * 1e6 / round_trips,
        throughput_mib_s = bytes / elapsed.as_secs_f64().max(f64::EPSILON) / (1024.0 * 1024.0),
        "ping-pong finished"
    );

    conn.shutdown();
    client.join()?;
    server.stop();
    server.join()?;
    Ok(())
}
