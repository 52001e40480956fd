//! The node coordinator: owns the node id, the packet manager, the
//! inbound queue, the uploader handle, and every transport. Wires the
//! inbound dispatch, heartbeat, and maintenance loops together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::manager::{AdmitOutcome, NetworkStats, PacketManager};
use crate::packet::{GpsLocation, Packet, PacketType, Urgency};
use crate::transport::Transport;
use crate::uploader::Uploader;

/// Events a subscriber can receive. Mirrors spec.md's `{packet_received,
/// packet_sent, sos_received, peer_discovered, connection_status_changed}`
/// set, minus the last two (no peer-discovery/transport-health signal
/// exists yet to drive them — transports only expose aggregate stats).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PacketReceived(Packet),
    PacketSent(Packet),
    SosReceived(Packet),
}

#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub tag: &'static str,
    pub running: bool,
    pub stats: crate::transport::TransportStatsSnapshot,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: String,
    pub running: bool,
    pub network: NetworkStats,
    pub transports: Vec<TransportStatus>,
}

pub struct Coordinator {
    node_id: String,
    config: Config,
    manager: Arc<PacketManager>,
    uploader: Option<Arc<Uploader>>,
    transports: Vec<Transport>,
    inbound_rx: Mutex<Option<tokio::sync::mpsc::Receiver<Packet>>>,
    inbound_tx: tokio::sync::mpsc::Sender<Packet>,
    events: broadcast::Sender<NodeEvent>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// `build_transports` receives the coordinator's inbound sender so each
    /// transport's receiver half can be wired to the same shared queue
    /// before the coordinator itself exists.
    pub fn new(
        node_id: impl Into<String>,
        config: Config,
        build_transports: impl FnOnce(tokio::sync::mpsc::Sender<Packet>) -> Vec<Transport>,
    ) -> Self {
        let node_id = node_id.into();
        let manager = Arc::new(PacketManager::new(&config));
        let uploader = config
            .server_api_url
            .clone()
            .map(|url| Arc::new(Uploader::new(url, config.server_upload_interval, manager.clone())));
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(config.inbound_queue_capacity);
        let (events, _) = broadcast::channel(256);
        let transports = build_transports(inbound_tx.clone());

        Self {
            node_id,
            config,
            manager,
            uploader,
            transports,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            inbound_tx,
            events,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn inbound_sender(&self) -> tokio::sync::mpsc::Sender<Packet> {
        self.inbound_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Constructs a locally-originated packet with its initial TTL resolved
    /// from this node's `Config` rather than `Urgency`'s hardcoded default,
    /// so the `TTL_{CRITICAL,HIGH,MEDIUM,LOW}` config keys actually take
    /// effect on packets this node sends.
    fn make_packet(
        &self,
        message: impl Into<String>,
        packet_type: PacketType,
        urgency: Urgency,
        thread_id: Option<String>,
        location_text: Option<String>,
        gps: Option<GpsLocation>,
    ) -> Packet {
        let mut packet = Packet::new(self.node_id.clone(), message, packet_type, urgency, thread_id, location_text, gps);
        packet.ttl = self.config.initial_ttl(urgency);
        packet
    }

    /// Boot order: packet manager is already constructed; bring up the
    /// uploader, then each transport independently (a transport startup
    /// failure is logged and that transport is left stopped, not fatal),
    /// then spawn the three coordinator loops.
    pub async fn start(self: Arc<Self>) -> Result<(), crate::error::TransportError> {
        self.running.store(true, Ordering::SeqCst);

        if let Some(uploader) = &self.uploader {
            uploader.clone().start();
        }

        for transport in &self.transports {
            if let Err(e) = transport.start().await {
                warn!(tag = transport.tag(), error = %e, "transport_start_failed");
            }
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.clone().spawn_dispatch_loop());
        tasks.push(self.clone().spawn_heartbeat_loop());
        tasks.push(self.clone().spawn_maintenance_loop());
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        for transport in &self.transports {
            transport.stop().await;
        }
        if let Some(uploader) = &self.uploader {
            uploader.stop().await;
        }
        info!(node = %self.node_id, "coordinator_stopped");
    }

    fn spawn_dispatch_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut inbound_rx = self
                .inbound_rx
                .lock()
                .await
                .take()
                .expect("dispatch loop started exactly once");
            info!(node = %self.node_id, "dispatch_loop_started");
            while self.running.load(Ordering::SeqCst) {
                let packet = tokio::select! {
                    p = inbound_rx.recv() => p,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => None,
                };
                let Some(packet) = packet else { continue };
                self.handle_inbound(packet).await;
            }
            info!("dispatch_loop_stopped");
        })
    }

    #[instrument(skip(self, packet), fields(packet_id = %packet.packet_id))]
    async fn handle_inbound(&self, packet: Packet) {
        if packet.sender_id == self.node_id {
            return;
        }
        let transport_tag = packet.received_via.last().cloned();
        let rssi = packet.signal_strength.get(&packet.sender_id).copied();

        let admitted = match self.manager.add_packet(packet, transport_tag.as_deref(), rssi) {
            AdmitOutcome::Admitted(p) => p,
            AdmitOutcome::Dropped(_) => return,
        };

        let _ = self.events.send(NodeEvent::PacketReceived(admitted.clone()));
        if matches!(admitted.packet_type, PacketType::Sos) {
            let _ = self.events.send(NodeEvent::SosReceived(admitted.clone()));
        }

        if admitted.requires_ack {
            let ack = self.manager.create_ack(&admitted, &self.node_id);
            self.broadcast(ack).await;
        }

        if self.manager.should_relay(&admitted, &self.node_id) {
            let mut relayed = admitted.clone();
            relayed.increment_hop(&self.node_id, transport_tag.as_deref(), None);
            self.broadcast(relayed).await;
            self.manager.mark_relayed();
        }
    }

    /// Concurrently invokes `send` on every running transport; per-transport
    /// failures are isolated (the trait's `send` already swallows and
    /// counts errors, so nothing here can abort the fan-out).
    async fn broadcast(&self, packet: Packet) {
        let sends = self.transports.iter().filter(|t| t.is_running()).map(|t| t.send(packet.clone()));
        futures_join_all(sends).await;
        self.manager.mark_sent();
        let _ = self.events.send(NodeEvent::PacketSent(packet));
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            while self.running.load(Ordering::SeqCst) {
                tick.tick().await;
                let heartbeat = self.make_packet("heartbeat", PacketType::Heartbeat, Urgency::Low, None, None, None);
                self.broadcast(heartbeat).await;
            }
        })
    }

    fn spawn_maintenance_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.maintenance_interval;
        let max_age = self.config.packet_expiration;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            while self.running.load(Ordering::SeqCst) {
                tick.tick().await;
                self.manager.cleanup(max_age);
                for packet in self.manager.relay_candidates(20) {
                    if self.manager.should_relay(&packet, &self.node_id) {
                        let mut relayed = packet;
                        relayed.increment_hop(&self.node_id, None, None);
                        self.broadcast(relayed).await;
                        self.manager.mark_relayed();
                    }
                }
            }
        })
    }

    pub async fn send_sos(&self, message: impl Into<String>, urgency: Urgency, gps: Option<GpsLocation>) -> Packet {
        let packet = self.make_packet(message, PacketType::Sos, urgency, None, None, gps);
        self.manager.add_packet(packet.clone(), None, None);
        self.broadcast(packet.clone()).await;
        packet
    }

    pub async fn send_status_update(&self, message: impl Into<String>, thread_id: impl Into<String>) -> Packet {
        let packet = self.make_packet(
            message,
            PacketType::StatusUpdate,
            Urgency::Medium,
            Some(thread_id.into()),
            None,
            None,
        );
        self.manager.add_packet(packet.clone(), None, None);
        self.broadcast(packet.clone()).await;
        packet
    }

    pub async fn send_all_clear(&self, thread_id: impl Into<String>) -> Packet {
        let packet = self.make_packet(
            "all clear",
            PacketType::AllClear,
            Urgency::Low,
            Some(thread_id.into()),
            None,
            None,
        );
        self.manager.add_packet(packet.clone(), None, None);
        self.broadcast(packet.clone()).await;
        packet
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            network: self.manager.stats(),
            transports: self
                .transports
                .iter()
                .map(|t| TransportStatus {
                    tag: t.tag(),
                    running: t.is_running(),
                    stats: t.sender.stats(),
                })
                .collect(),
        }
    }
}

async fn futures_join_all<F, O>(futures: impl Iterator<Item = F>) -> Vec<O>
where
    F: std::future::Future<Output = O>,
{
    let handles: Vec<_> = futures.collect();
    let mut out = Vec::with_capacity(handles.len());
    for f in handles {
        out.push(f.await);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportReceiver, TransportSender};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct NullSender {
        running: AtomicBool,
        sent: AtomicU64,
    }

    #[async_trait]
    impl TransportSender for NullSender {
        fn tag(&self) -> &'static str {
            "null"
        }
        async fn start(&self) -> Result<(), crate::error::TransportError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
        async fn send(&self, _packet: Packet) {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn stats(&self) -> crate::transport::TransportStatsSnapshot {
            Default::default()
        }
    }

    struct NullReceiver {
        running: AtomicBool,
    }

    #[async_trait]
    impl TransportReceiver for NullReceiver {
        fn tag(&self) -> &'static str {
            "null"
        }
        async fn start(&self) -> Result<(), crate::error::TransportError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn stats(&self) -> crate::transport::TransportStatsSnapshot {
            Default::default()
        }
    }

    fn null_transport() -> Transport {
        Transport::new(
            Box::new(NullSender { running: AtomicBool::new(false), sent: AtomicU64::new(0) }),
            Box::new(NullReceiver { running: AtomicBool::new(false) }),
        )
    }

    #[tokio::test]
    async fn send_sos_admits_and_broadcasts() {
        let coordinator = Arc::new(Coordinator::new("node-A", Config::default(), |_| vec![null_transport()]));
        coordinator.clone().start().await.unwrap();
        let packet = coordinator.send_sos("help", Urgency::Critical, None).await;
        assert_eq!(coordinator.status().network.cache_size, 1);
        assert_eq!(packet.sender_id, "node-A");
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn inbound_packet_from_self_is_ignored() {
        let coordinator = Arc::new(Coordinator::new("node-A", Config::default(), |_| vec![]));
        coordinator.clone().start().await.unwrap();
        let mut rx = coordinator.subscribe();
        let packet = Packet::new("node-A", "loop", PacketType::Sos, Urgency::High, None, None, None);
        coordinator.inbound_sender().send(packet).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(rx.try_recv().is_err());
        coordinator.stop().await;
    }
}
