//! Boots a single SonicNet node from CLI args/environment and runs it
//! until `Ctrl-C`.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use sonicnet::config::Config;
use sonicnet::coordinator::Coordinator;
use sonicnet::transport::acoustic::{AcousticReceiver, AcousticSender, NullAudioCodec};
use sonicnet::transport::ble::{BleReceiver, BleSender, NullBleAdapter};
use sonicnet::transport::udp::{UdpReceiver, UdpSender};
use sonicnet::transport::Transport;

#[derive(Parser)]
#[command(name = "sonicnet-node")]
#[command(about = "Runs one SonicNet mesh node")]
struct Args {
    /// Node identifier; a random one is generated if omitted
    #[arg(long)]
    node_id: Option<String>,

    /// Emit structured logs as JSON instead of human-readable text
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Disable the BLE transport (it runs with a no-op adapter by default
    /// since no real BLE stack is wired in)
    #[arg(long, default_value_t = false)]
    no_ble: bool,

    /// Disable the acoustic transport
    #[arg(long, default_value_t = false)]
    no_acoustic: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_json);

    let node_id = args.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = Config::from_env();
    info!(node_id = %node_id, "sonicnet_node_starting");

    let enable_ble = !args.no_ble;
    let enable_acoustic = !args.no_acoustic;
    let node_id_for_build = node_id.clone();
    let config_for_build = config.clone();

    let coordinator = Arc::new(Coordinator::new(node_id.clone(), config, move |inbound| {
        let mut transports = Vec::new();

        let group = Ipv4Addr::from_str(&config_for_build.udp_multicast_group).unwrap_or(Ipv4Addr::new(224, 1, 1, 1));
        let udp_sender = UdpSender::new(node_id_for_build.clone(), group, config_for_build.udp_port);
        let udp_receiver = UdpReceiver::new(node_id_for_build.clone(), group, config_for_build.udp_port, inbound.clone());
        transports.push(Transport::new(Box::new(udp_sender), Box::new(udp_receiver)));

        if enable_ble {
            let peers = sonicnet::transport::ble::new_peer_map();
            let adapter = Arc::new(NullBleAdapter);
            let ble_sender = BleSender::new(node_id_for_build.clone(), adapter.clone(), peers.clone());
            let ble_receiver = BleReceiver::new(
                node_id_for_build.clone(),
                adapter,
                peers,
                inbound.clone(),
                config_for_build.ble_scan_interval,
            );
            transports.push(Transport::new(Box::new(ble_sender), Box::new(ble_receiver)));
        }

        if enable_acoustic {
            let codec = Arc::new(NullAudioCodec {
                sample_rate: config_for_build.ggwave_sample_rate,
                samples_per_frame: config_for_build.ggwave_samples_per_frame,
            });
            let acoustic_sender = AcousticSender::new(node_id_for_build.clone(), codec.clone(), config_for_build.ggwave_volume as u8);
            let acoustic_receiver = AcousticReceiver::new(node_id_for_build.clone(), codec, inbound.clone());
            transports.push(Transport::new(Box::new(acoustic_sender), Box::new(acoustic_receiver)));
        }

        transports
    }));

    if let Err(e) = coordinator.clone().start().await {
        eprintln!("failed to start coordinator: {e}");
        std::process::exit(1);
    }

    info!("sonicnet_node_running");
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    coordinator.stop().await;
}

fn init_logging(json: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "sonicnet=info".to_string());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
