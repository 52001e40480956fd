//! IP-multicast transport. `IP_MULTICAST_TTL=2`; no fragmentation
//! handling — packets larger than the path MTU fail at the OS and count
//! as a send error.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{InboundSender, TransportReceiver, TransportSender, TransportStats, TransportStatsSnapshot};
use crate::error::TransportError;
use crate::packet::Packet;

const TAG: &str = "udp";
const DATAGRAM_CAP: usize = 4096;

pub struct UdpSender {
    node_id: String,
    group: Ipv4Addr,
    port: u16,
    socket: Mutex<Option<UdpSocket>>,
    running: AtomicBool,
    stats: TransportStats,
}

impl UdpSender {
    pub fn new(node_id: String, group: Ipv4Addr, port: u16) -> Self {
        Self {
            node_id,
            group,
            port,
            socket: Mutex::new(None),
            running: AtomicBool::new(false),
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl TransportSender for UdpSender {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| TransportError::StartupError(e.to_string()))?;
        socket
            .set_multicast_ttl_v4(2)
            .map_err(|e| TransportError::StartupError(e.to_string()))?;
        *self.socket.lock().await = Some(socket);
        self.running.store(true, Ordering::SeqCst);
        info!(node = %self.node_id, "udp_sender_started");
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.socket.lock().await = None;
        info!("udp_sender_stopped");
    }

    async fn send(&self, packet: Packet) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let encoded = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "udp_send_encode_failed");
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let guard = self.socket.lock().await;
        let Some(socket) = guard.as_ref() else { return };
        let target = SocketAddr::from((self.group, self.port));
        match socket.send_to(&encoded, target).await {
            Ok(_) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                debug!(packet_id = %packet.packet_id, "udp_sent");
            }
            Err(e) => {
                warn!(error = %e, "udp_send_failed");
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct UdpReceiver {
    node_id: String,
    group: Ipv4Addr,
    port: u16,
    inbound: InboundSender,
    running: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl UdpReceiver {
    pub fn new(node_id: String, group: Ipv4Addr, port: u16, inbound: InboundSender) -> Self {
        Self {
            node_id,
            group,
            port,
            inbound,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
        }
    }
}

#[async_trait]
impl TransportReceiver for UdpReceiver {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", self.port))
            .map_err(|e| TransportError::StartupError(e.to_string()))?;
        socket
            .join_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TransportError::StartupError(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::StartupError(e.to_string()))?;
        let socket = UdpSocket::from_std(socket).map_err(|e| TransportError::StartupError(e.to_string()))?;

        let node_id = self.node_id.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let inbound = self.inbound.clone();
        running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_CAP];
            info!(node = %node_id, "udp_receive_loop_started");
            while running.load(Ordering::SeqCst) {
                let (n, addr) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "udp_recv_failed");
                        stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                match Packet::decode(&buf[..n]) {
                    Ok(mut packet) => {
                        if super::is_loopback(&packet, &node_id) {
                            continue;
                        }
                        stats.packets_received.fetch_add(1, Ordering::Relaxed);
                        debug!(%addr, packet_id = %packet.packet_id, "udp_received");
                        packet.received_via.push(TAG.to_string());
                        if !super::queue_push(&inbound, &stats, packet) {
                            break;
                        }
                    }
                    Err(_) => {
                        stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            info!("udp_receive_loop_stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_send_without_start_is_a_noop() {
        let sender = UdpSender::new("A".to_string(), Ipv4Addr::new(224, 1, 1, 1), 9999);
        let p = Packet::new("A", "help", crate::packet::PacketType::Sos, crate::packet::Urgency::High, None, None, None);
        sender.send(p).await;
        assert_eq!(sender.stats().packets_sent, 0);
    }
}
