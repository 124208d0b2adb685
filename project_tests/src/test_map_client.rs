//! Live load client for the map endpoint. Opens one or more subscriptions,
//! reports frame rate and device counts, and flags any frame whose revision
//! does not move strictly forward.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use lib_heatmap::models::{FrameKind, SnapshotFrame, WIRE_VERSION};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Map endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:8050/ws/map")]
    url: String,

    /// Delivery mode: full or incremental
    #[arg(short, long, default_value = "full")]
    mode: String,

    /// Concurrent subscriptions to open
    #[arg(short, long, default_value_t = 1)]
    clients: usize,

    /// Report interval in seconds
    #[arg(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    frames: AtomicU64,
    deltas: AtomicU64,
    device_rows: AtomicU64,
    last_device_count: AtomicU64,
    out_of_order: AtomicU64,
    version_mismatch: AtomicU64,
    disconnected: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Stats::default());
    let endpoint = format!("{}?mode={}", args.url, args.mode);

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let interval = Duration::from_secs(args.report_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut last_frames = 0;
        loop {
            sleep(interval).await;
            let frames = stats_reporter.frames.load(Ordering::Relaxed);
            let per_minute = (frames - last_frames) as f64 * 60.0 / interval.as_secs_f64();
            last_frames = frames;

            println!("\n----- Map Client Summary -----");
            println!("Frames: {} total, {:.1}/min", frames, per_minute);
            println!("Deltas: {}", stats_reporter.deltas.load(Ordering::Relaxed));
            println!("Device rows received: {}", stats_reporter.device_rows.load(Ordering::Relaxed));
            println!("Devices in last full frame: {}", stats_reporter.last_device_count.load(Ordering::Relaxed));
            println!("Out-of-order revisions: {}", stats_reporter.out_of_order.load(Ordering::Relaxed));
            println!("Unexpected wire versions: {}", stats_reporter.version_mismatch.load(Ordering::Relaxed));
            println!("Disconnected clients: {}", stats_reporter.disconnected.load(Ordering::Relaxed));
            println!("------------------------------\n");
        }
    });

    let mut clients = Vec::new();
    for client in 0..args.clients.max(1) {
        let endpoint = endpoint.clone();
        let stats = Arc::clone(&stats);
        clients.push(tokio::spawn(async move {
            if let Err(e) = run_client(client, &endpoint, &stats).await {
                eprintln!("client {}: {:#}", client, e);
            }
            stats.disconnected.fetch_add(1, Ordering::Relaxed);
        }));
    }
    println!("Opened {} subscription(s) to {}. Press Ctrl+C to stop.", args.clients.max(1), endpoint);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = futures_util::future::join_all(clients) => {
            println!("All clients disconnected.");
        }
    }
    Ok(())
}

async fn run_client(client: usize, endpoint: &str, stats: &Stats) -> Result<()> {
    let (ws_stream, _) = connect_async(endpoint)
        .await
        .with_context(|| format!("failed to connect to {}", endpoint))?;
    let (_write, mut read) = ws_stream.split();
    let mut last_revision: Option<u64> = None;

    while let Some(msg) = read.next().await {
        let text = match msg.context("read failed")? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                println!("client {}: closed by server: {:?}", client, frame);
                break;
            }
            _ => continue,
        };
        let frame: SnapshotFrame = serde_json::from_str(text.as_str()).context("unparsable frame")?;

        stats.frames.fetch_add(1, Ordering::Relaxed);
        stats.device_rows.fetch_add(frame.devices.len() as u64, Ordering::Relaxed);
        if frame.version != WIRE_VERSION {
            stats.version_mismatch.fetch_add(1, Ordering::Relaxed);
        }
        match frame.kind {
            FrameKind::Snapshot => stats.last_device_count.store(frame.devices.len() as u64, Ordering::Relaxed),
            FrameKind::Delta => {
                stats.deltas.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(last) = last_revision {
            if frame.revision <= last {
                stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                eprintln!("client {}: revision {} after {}", client, frame.revision, last);
            }
        }
        last_revision = Some(frame.revision);
    }
    Ok(())
}
