//! Transport contract: a paired sender/receiver per medium, sharing only
//! the node's inbound queue. See `udp`, `ble`, and `acoustic` for the
//! concrete media.

pub mod acoustic;
pub mod ble;
pub mod udp;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::TransportError;
use crate::packet::Packet;

#[derive(Debug, Default)]
pub struct TransportStats {
    pub packets_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub packets_received: AtomicU64,
    pub receive_errors: AtomicU64,
    /// Incremented when the shared inbound queue is full; see
    /// `queue_push` for the drop policy this backs.
    pub queue_overflows: AtomicU64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TransportStatsSnapshot {
    pub packets_sent: u64,
    pub send_errors: u64,
    pub packets_received: u64,
    pub receive_errors: u64,
    pub queue_overflows: u64,
}

/// One physical medium's send half. Implementations must not block the
/// caller for more than a bounded time; long transmissions run on the
/// sender's own worker task.
#[async_trait]
pub trait TransportSender: Send + Sync {
    fn tag(&self) -> &'static str;
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    async fn send(&self, packet: Packet);
    fn is_running(&self) -> bool;
    fn stats(&self) -> TransportStatsSnapshot;
}

/// One physical medium's receive half. Decoded packets are pushed to the
/// shared inbound queue handed to it at construction; packets whose
/// `sender_id == self_node_id` are dropped here, never surfaced.
#[async_trait]
pub trait TransportReceiver: Send + Sync {
    fn tag(&self) -> &'static str;
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    fn is_running(&self) -> bool;
    fn stats(&self) -> TransportStatsSnapshot;
}

/// A sender/receiver pair bundled as one medium, matching the shape the
/// coordinator drives: start both, stop both, route `send` to the sender.
pub struct Transport {
    pub sender: Box<dyn TransportSender>,
    pub receiver: Box<dyn TransportReceiver>,
}

impl Transport {
    pub fn new(sender: Box<dyn TransportSender>, receiver: Box<dyn TransportReceiver>) -> Self {
        Self { sender, receiver }
    }

    pub fn tag(&self) -> &'static str {
        self.sender.tag()
    }

    pub async fn start(&self) -> Result<(), TransportError> {
        self.sender.start().await?;
        self.receiver.start().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.sender.stop().await;
        self.receiver.stop().await;
    }

    pub async fn send(&self, packet: Packet) {
        if self.sender.is_running() {
            self.sender.send(packet).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_running() && self.receiver.is_running()
    }
}

pub type InboundSender = mpsc::Sender<Packet>;
pub type InboundReceiver = mpsc::Receiver<Packet>;

/// Drops a packet that loops back to its own sender. The receiver
/// contract requires this check to be the single source of truth for
/// self-drop.
pub fn is_loopback(packet: &Packet, self_node_id: &str) -> bool {
    packet.sender_id == self_node_id
}

/// Pushes a freshly-decoded packet onto the shared inbound queue without
/// blocking the receive loop. Policy: drop newest — if the bounded queue
/// is full, this packet (not whatever is already queued) is dropped and
/// `stats.queue_overflows` is incremented. Returns `false` if the queue's
/// receiver half has been dropped, the signal to stop the receive loop.
pub fn queue_push(inbound: &InboundSender, stats: &TransportStats, packet: Packet) -> bool {
    match inbound.try_send(packet) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(packet_id = %dropped.packet_id, "inbound_queue_full_dropping_newest");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
