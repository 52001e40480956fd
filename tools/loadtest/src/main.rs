// =============================================================================
// SONICNET — Load Test Tool
// =============================================================================
// Emits synthetic SOS/STATUS_UPDATE/HEARTBEAT traffic onto a UDP multicast
// group at a configurable rate, speaking the mesh's JSON wire format
// directly (no dependency on the mesh crate itself).
// =============================================================================

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tokio::net::UdpSocket;

#[derive(Parser)]
#[command(name = "sonicnet-loadtest")]
#[command(about = "Traffic generator for a running SonicNet mesh")]
struct Args {
    /// Multicast group address
    #[arg(long, default_value = "224.1.1.1")]
    group: Ipv4Addr,

    /// Multicast port
    #[arg(long, default_value_t = 9999)]
    port: u16,

    /// Packets per second
    #[arg(long, default_value_t = 20)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct synthetic sender node ids
    #[arg(long, default_value_t = 10)]
    senders: usize,

    /// Fraction of generated packets that are SOS (0.0-1.0), the rest split
    /// between STATUS_UPDATE and HEARTBEAT
    #[arg(long, default_value_t = 0.2)]
    sos_fraction: f64,
}

#[derive(Serialize)]
struct LoadtestPacket {
    packet_id: String,
    sender_id: String,
    thread_id: String,
    packet_type: &'static str,
    urgency: &'static str,
    message: String,
    location_text: Option<String>,
    gps: Option<serde_json::Value>,
    timestamp: f64,
    hop_count: u32,
    ttl: u32,
    relay_path: Vec<String>,
    requires_ack: bool,
    ack_received: bool,
    ack_nodes: Vec<String>,
    received_via: Vec<String>,
    battery_level: Option<f64>,
    signal_strength: std::collections::HashMap<String, f64>,
    media_attachments: Vec<serde_json::Value>,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

fn build_packet(sender_id: &str, rng: &mut impl Rng, sos_fraction: f64) -> LoadtestPacket {
    let roll: f64 = rng.gen();
    let (packet_type, urgency, message, ttl, requires_ack) = if roll < sos_fraction {
        ("SOS", "CRITICAL", "synthetic SOS from load test".to_string(), 20, true)
    } else if roll < sos_fraction + (1.0 - sos_fraction) / 2.0 {
        ("STATUS_UPDATE", "MEDIUM", "synthetic status update".to_string(), 10, false)
    } else {
        ("HEARTBEAT", "LOW", "heartbeat".to_string(), 5, false)
    };

    let thread_id = uuid::Uuid::new_v4().to_string();
    let timestamp = now_secs();
    let packet_id = format!("{:016x}", rng.gen::<u64>());

    LoadtestPacket {
        packet_id,
        sender_id: sender_id.to_string(),
        thread_id,
        packet_type,
        urgency,
        message,
        location_text: None,
        gps: None,
        timestamp,
        hop_count: 0,
        ttl,
        relay_path: vec![sender_id.to_string()],
        requires_ack,
        ack_received: false,
        ack_nodes: Vec::new(),
        received_via: Vec::new(),
        battery_level: Some(rng.gen_range(10.0..100.0)),
        signal_strength: std::collections::HashMap::new(),
        media_attachments: Vec::new(),
    }
}

struct Counters {
    sent: AtomicU64,
    send_errors: AtomicU64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("=== SonicNet Load Test ===");
    println!("Target:   {}:{}", args.group, args.port);
    println!("Rate:     {} pkt/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Senders:  {}", args.senders);
    println!("SOS frac: {:.2}", args.sos_fraction);
    println!();

    let sender_ids: Vec<String> = (0..args.senders).map(|i| format!("loadtest-{i}")).collect();

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.expect("bind local socket");
    socket.set_multicast_ttl_v4(2).expect("set multicast ttl");
    let target = (args.group, args.port);

    let counters = Arc::new(Counters {
        sent: AtomicU64::new(0),
        send_errors: AtomicU64::new(0),
    });

    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("Sending...\n");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let sender_id = &sender_ids[(tick as usize) % sender_ids.len()];
        let packet = build_packet(sender_id, &mut rng, args.sos_fraction);
        let encoded = serde_json::to_vec(&packet).expect("encode packet");

        match socket.send_to(&encoded, target).await {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} errors={} ({:.0} pkt/s)",
                elapsed,
                sent,
                counters.send_errors.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target_elapsed = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual_elapsed = start.elapsed();
        if actual_elapsed < target_elapsed {
            tokio::time::sleep(target_elapsed - actual_elapsed).await;
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    println!("\n=== Results ===");
    println!("Duration:    {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:  {}", sent);
    println!("Send errors: {}", counters.send_errors.load(Ordering::Relaxed));
    println!("Throughput:  {:.1} pkt/s", sent as f64 / elapsed.as_secs_f64());
}
