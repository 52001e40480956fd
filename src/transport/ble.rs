//! BLE GATT transport: a Nordic-UART-like profile with one service and
//! two characteristics (`RX` written by peers, `TX` written by us). The
//! BLE stack itself is out of scope; this module speaks only through
//! the `BleAdapter` trait, so a real `btleplug`-backed adapter can be
//! plugged in without touching the peer state machine or chunking
//! protocol below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::{InboundSender, TransportReceiver, TransportSender, TransportStats, TransportStatsSnapshot};
use crate::error::TransportError;
use crate::packet::Packet;

pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
pub const RX_CHARACTERISTIC_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
pub const TX_CHARACTERISTIC_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

const TAG: &str = "ble";
const MAX_CHUNK_SIZE: usize = 180;
const MAX_CONNECTION_FAILURES: u32 = 3;
const PEER_STALE_AFTER: Duration = Duration::from_secs(300);
const CHUNK_BUFFER_TTL: Duration = Duration::from_secs(30);
const PER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Undiscovered,
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct BlePeer {
    pub state: PeerState,
    pub last_seen: Instant,
    pub connection_failures: u32,
}

/// The capability this crate needs from a real BLE stack: scan for peers
/// advertising our service, connect, and write a characteristic. A
/// conforming adapter owns its own medium resources.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    async fn scan(&self, duration: Duration) -> Vec<String>;
    async fn connect(&self, address: &str) -> Result<(), TransportError>;
    async fn write_rx(&self, address: &str, data: &[u8]) -> Result<(), TransportError>;
}

/// No-op adapter used when no real BLE stack is wired in: scans find
/// nothing, so the transport stays idle but `running` rather than
/// failing startup outright.
#[derive(Default)]
pub struct NullBleAdapter;

#[async_trait]
impl BleAdapter for NullBleAdapter {
    async fn scan(&self, _duration: Duration) -> Vec<String> {
        Vec::new()
    }

    async fn connect(&self, _address: &str) -> Result<(), TransportError> {
        Err(TransportError::StartupError("no BLE adapter configured".into()))
    }

    async fn write_rx(&self, _address: &str, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::SendError("no BLE adapter configured".into()))
    }
}

struct ChunkBuffer {
    chunks: HashMap<usize, String>,
    created: Instant,
    ended: bool,
}

pub struct BleSender {
    node_id: String,
    adapter: Arc<dyn BleAdapter>,
    peers: Arc<Mutex<HashMap<String, BlePeer>>>,
    pending: Mutex<Option<mpsc::Sender<Packet>>>,
    running: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl BleSender {
    pub fn new(node_id: String, adapter: Arc<dyn BleAdapter>, peers: Arc<Mutex<HashMap<String, BlePeer>>>) -> Self {
        Self {
            node_id,
            adapter,
            peers,
            pending: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
        }
    }
}

#[async_trait]
impl TransportSender for BleSender {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        let (tx, mut rx) = mpsc::channel::<Packet>(100);
        *self.pending.lock().await = Some(tx);
        self.running.store(true, Ordering::SeqCst);

        let adapter = self.adapter.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            info!(node = %node_id, "ble_send_loop_started");
            while let Some(packet) = rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(encoded) = packet.encode() else { continue };
                let connected: Vec<String> = {
                    let guard = peers.lock().await;
                    guard
                        .iter()
                        .filter(|(_, p)| p.state == PeerState::Connected)
                        .map(|(addr, _)| addr.clone())
                        .collect()
                };

                let fanout = connected.into_iter().map(|addr| {
                    let adapter = adapter.clone();
                    let data = encoded.clone();
                    async move { write_chunked(adapter.as_ref(), &addr, &data).await }
                });

                let result = tokio::time::timeout(BROADCAST_TIMEOUT, futures_join_all(fanout)).await;
                match result {
                    Ok(results) => {
                        for r in results {
                            match r {
                                Ok(()) => {
                                    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    warn!(error = %e, "ble_write_failed");
                                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                    Err(_) => {
                        warn!("ble_broadcast_timed_out");
                        stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            info!("ble_send_loop_stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.pending.lock().await = None;
    }

    async fn send(&self, packet: Packet) {
        if let Some(tx) = self.pending.lock().await.as_ref() {
            let _ = tx.send(packet).await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Minimal concurrent-future join without pulling in `futures` solely
/// for `join_all` on a handful of peer writes.
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

async fn write_chunked(adapter: &dyn BleAdapter, address: &str, data: &[u8]) -> Result<(), TransportError> {
    if data.len() <= MAX_CHUNK_SIZE {
        return tokio::time::timeout(PER_WRITE_TIMEOUT, adapter.write_rx(address, data))
            .await
            .map_err(|_| TransportError::SendError("write timed out".into()))?;
    }

    let xfer_id = uuid::Uuid::new_v4().simple().to_string();
    let body = String::from_utf8_lossy(data).into_owned();
    let payload_per_chunk = MAX_CHUNK_SIZE.saturating_sub(50).max(1);
    // Split on char boundaries, not raw bytes, so a multi-byte UTF-8
    // character is never torn across two chunks.
    let chars: Vec<char> = body.chars().collect();
    let chunks: Vec<String> = chars
        .chunks(payload_per_chunk)
        .map(|c| c.iter().collect())
        .collect();

    for (index, chunk) in chunks.iter().enumerate() {
        let message = format!("CHUNK:{xfer_id}:{index}:{chunk}");
        tokio::time::timeout(PER_WRITE_TIMEOUT, adapter.write_rx(address, message.as_bytes()))
            .await
            .map_err(|_| TransportError::SendError("chunk write timed out".into()))??;
    }
    let end = format!("END:{xfer_id}:{}", chunks.len());
    tokio::time::timeout(PER_WRITE_TIMEOUT, adapter.write_rx(address, end.as_bytes()))
        .await
        .map_err(|_| TransportError::SendError("end marker write timed out".into()))??;
    Ok(())
}

pub struct BleReceiver {
    node_id: String,
    adapter: Arc<dyn BleAdapter>,
    peers: Arc<Mutex<HashMap<String, BlePeer>>>,
    chunk_buffers: Arc<Mutex<HashMap<String, ChunkBuffer>>>,
    inbound: InboundSender,
    scan_interval: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl BleReceiver {
    pub fn new(
        node_id: String,
        adapter: Arc<dyn BleAdapter>,
        peers: Arc<Mutex<HashMap<String, BlePeer>>>,
        inbound: InboundSender,
        scan_interval: Duration,
    ) -> Self {
        Self {
            node_id,
            adapter,
            peers,
            chunk_buffers: Arc::new(Mutex::new(HashMap::new())),
            inbound,
            scan_interval,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Handles a single incoming write to `RX`/notification from `TX`,
    /// including chunk reassembly. Called by whatever adapter plumbing
    /// actually observes GATT traffic.
    pub async fn on_notification(&self, text: &str) {
        let reassembled = {
            let mut buffers = self.chunk_buffers.lock().await;
            match parse_wire_frame(text) {
                WireFrame::Chunk { xfer_id, index, data } => {
                    let buf = buffers.entry(xfer_id).or_insert_with(|| ChunkBuffer {
                        chunks: HashMap::new(),
                        created: Instant::now(),
                        ended: false,
                    });
                    buf.chunks.insert(index, data);
                    None
                }
                WireFrame::End { xfer_id, total_chunks } => match buffers.get_mut(&xfer_id) {
                    Some(buf) if !buf.ended && buf.chunks.len() == total_chunks => {
                        buf.ended = true;
                        let mut complete = true;
                        let mut out = String::new();
                        for i in 0..total_chunks {
                            match buf.chunks.get(&i) {
                                Some(part) => out.push_str(part),
                                None => {
                                    complete = false;
                                    break;
                                }
                            }
                        }
                        buffers.remove(&xfer_id);
                        if complete {
                            Some(out)
                        } else {
                            None
                        }
                    }
                    _ => {
                        buffers.remove(&xfer_id);
                        None
                    }
                },
                WireFrame::Whole(s) => Some(s),
            }
        };

        let Some(payload) = reassembled else { return };
        match Packet::decode(payload.as_bytes()) {
            Ok(mut packet) => {
                if super::is_loopback(&packet, &self.node_id) {
                    return;
                }
                self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                packet.received_via.push(TAG.to_string());
                super::queue_push(&self.inbound, &self.stats, packet);
            }
            Err(_) => {
                self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

enum WireFrame {
    Chunk { xfer_id: String, index: usize, data: String },
    End { xfer_id: String, total_chunks: usize },
    Whole(String),
}

fn parse_wire_frame(text: &str) -> WireFrame {
    if let Some(rest) = text.strip_prefix("CHUNK:") {
        let parts: Vec<&str> = rest.splitn(3, ':').collect();
        if parts.len() == 3 {
            if let Ok(index) = parts[1].parse::<usize>() {
                return WireFrame::Chunk {
                    xfer_id: parts[0].to_string(),
                    index,
                    data: parts[2].to_string(),
                };
            }
        }
    } else if let Some(rest) = text.strip_prefix("END:") {
        let parts: Vec<&str> = rest.splitn(2, ':').collect();
        if parts.len() == 2 {
            if let Ok(total_chunks) = parts[1].parse::<usize>() {
                return WireFrame::End {
                    xfer_id: parts[0].to_string(),
                    total_chunks,
                };
            }
        }
    }
    WireFrame::Whole(text.to_string())
}

#[async_trait]
impl TransportReceiver for BleReceiver {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.running.store(true, Ordering::SeqCst);

        let adapter = self.adapter.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();
        let scan_interval = self.scan_interval;
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            info!(node = %node_id, "ble_scan_loop_started");
            while running.load(Ordering::SeqCst) {
                let discovered = adapter.scan(Duration::from_secs(5)).await;
                let now = Instant::now();
                {
                    let mut guard = peers.lock().await;
                    for addr in discovered {
                        guard
                            .entry(addr)
                            .and_modify(|p| p.last_seen = now)
                            .or_insert(BlePeer {
                                state: PeerState::Discovered,
                                last_seen: now,
                                connection_failures: 0,
                            });
                    }
                    guard.retain(|_, p| now.duration_since(p.last_seen) <= PEER_STALE_AFTER);
                }
                tokio::time::sleep(scan_interval).await;
            }
            info!("ble_scan_loop_stopped");
        });

        let adapter = self.adapter.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let candidates: Vec<String> = {
                    let guard = peers.lock().await;
                    guard
                        .iter()
                        .filter(|(_, p)| p.state == PeerState::Discovered && p.connection_failures < MAX_CONNECTION_FAILURES)
                        .map(|(addr, _)| addr.clone())
                        .collect()
                };
                for addr in candidates {
                    {
                        let mut guard = peers.lock().await;
                        if let Some(p) = guard.get_mut(&addr) {
                            p.state = PeerState::Connecting;
                        }
                    }
                    match adapter.connect(&addr).await {
                        Ok(()) => {
                            let mut guard = peers.lock().await;
                            if let Some(p) = guard.get_mut(&addr) {
                                p.state = PeerState::Connected;
                                p.connection_failures = 0;
                            }
                        }
                        Err(_) => {
                            let mut guard = peers.lock().await;
                            if let Some(p) = guard.get_mut(&addr) {
                                p.state = PeerState::Disconnected;
                                p.connection_failures += 1;
                            }
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let chunk_buffers = self.chunk_buffers.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            while running.load(Ordering::SeqCst) {
                tick.tick().await;
                let now = Instant::now();
                chunk_buffers
                    .lock()
                    .await
                    .retain(|_, buf| now.duration_since(buf.created) <= CHUNK_BUFFER_TTL);
            }
        });

        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.peers.lock().await.clear();
        self.chunk_buffers.lock().await.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

pub fn new_peer_map() -> Arc<Mutex<HashMap<String, BlePeer>>> {
    Arc::new(Mutex::new(HashMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reassembles_chunks_delivered_in_order() {
        let (tx, mut rx) = mpsc::channel(10);
        let receiver = BleReceiver::new(
            "B".to_string(),
            Arc::new(NullBleAdapter),
            new_peer_map(),
            tx,
            Duration::from_secs(10),
        );

        let packet = Packet::new(
            "A",
            "x".repeat(600),
            crate::packet::PacketType::Sos,
            crate::packet::Urgency::High,
            None,
            None,
            None,
        );
        let encoded = packet.encode().unwrap();
        let body = String::from_utf8(encoded).unwrap();
        let chunk_size = MAX_CHUNK_SIZE - 50;
        let chunks: Vec<&str> = body.as_bytes().chunks(chunk_size).map(|c| std::str::from_utf8(c).unwrap()).collect();

        for (i, chunk) in chunks.iter().enumerate() {
            receiver.on_notification(&format!("CHUNK:xfer1:{i}:{chunk}")).await;
        }
        receiver.on_notification(&format!("END:xfer1:{}", chunks.len())).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.packet_id, packet.packet_id);
    }

    #[tokio::test]
    async fn missing_chunk_produces_no_reassembly() {
        let (tx, mut rx) = mpsc::channel(10);
        let receiver = BleReceiver::new(
            "B".to_string(),
            Arc::new(NullBleAdapter),
            new_peer_map(),
            tx,
            Duration::from_secs(10),
        );

        receiver.on_notification("CHUNK:xfer2:0:abc").await;
        receiver.on_notification("CHUNK:xfer2:2:ghi").await;
        receiver.on_notification("END:xfer2:3").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reordered_chunks_still_reassemble() {
        let (tx, mut rx) = mpsc::channel(10);
        let receiver = BleReceiver::new(
            "B".to_string(),
            Arc::new(NullBleAdapter),
            new_peer_map(),
            tx,
            Duration::from_secs(10),
        );
        let packet = Packet::new("A", "hi", crate::packet::PacketType::Sos, crate::packet::Urgency::Low, None, None, None);
        let encoded = packet.encode().unwrap();
        let body = String::from_utf8(encoded).unwrap();

        let chunk0 = &body[..body.len() / 2];
        let chunk1 = &body[body.len() / 2..];
        receiver.on_notification(&format!("CHUNK:xfer3:1:{chunk1}")).await;
        receiver.on_notification(&format!("CHUNK:xfer3:0:{chunk0}")).await;
        receiver.on_notification("END:xfer3:2").await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.packet_id, packet.packet_id);
    }
}
