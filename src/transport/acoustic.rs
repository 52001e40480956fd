//! Acoustic (ggwave-style) transport: packets are modulated onto an
//! audio tone and played/recorded through whatever sound hardware is
//! present. The codec and audio I/O are out of scope here; this module
//! speaks only through the `AudioCodec` trait so a real ggwave/pyaudio
//! equivalent binding can be plugged in without touching the
//! send/receive loops below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{InboundSender, TransportReceiver, TransportSender, TransportStats, TransportStatsSnapshot};
use crate::error::TransportError;
use crate::packet::Packet;

const TAG: &str = "acoustic";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The capability this crate needs from a real audio modem: encode a
/// byte payload to a waveform and play it, or poll for a decoded
/// payload captured from the microphone. A conforming codec owns its
/// own PortAudio-equivalent device handles.
#[async_trait]
pub trait AudioCodec: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn samples_per_frame(&self) -> u32;
    async fn play(&self, payload: &[u8], volume: u8) -> Result<(), TransportError>;
    /// Returns one decoded payload if the codec has one buffered, else `None`.
    async fn poll_decoded(&self) -> Option<Vec<u8>>;
}

/// No-op codec used when no audio hardware/ggwave binding is wired in:
/// playback is a no-op success, and nothing is ever decoded.
#[derive(Default)]
pub struct NullAudioCodec {
    pub sample_rate: u32,
    pub samples_per_frame: u32,
}

#[async_trait]
impl AudioCodec for NullAudioCodec {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    async fn play(&self, _payload: &[u8], _volume: u8) -> Result<(), TransportError> {
        Ok(())
    }

    async fn poll_decoded(&self) -> Option<Vec<u8>> {
        None
    }
}

pub struct AcousticSender {
    node_id: String,
    codec: Arc<dyn AudioCodec>,
    volume: u8,
    running: AtomicBool,
    stats: TransportStats,
}

impl AcousticSender {
    pub fn new(node_id: String, codec: Arc<dyn AudioCodec>, volume: u8) -> Self {
        Self {
            node_id,
            codec,
            volume,
            running: AtomicBool::new(false),
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl TransportSender for AcousticSender {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.running.store(true, Ordering::SeqCst);
        info!(node = %self.node_id, "acoustic_sender_started");
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("acoustic_sender_stopped");
    }

    async fn send(&self, packet: Packet) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let encoded = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "acoustic_send_encode_failed");
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match self.codec.play(&encoded, self.volume).await {
            Ok(()) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "acoustic_play_failed");
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

pub struct AcousticReceiver {
    node_id: String,
    codec: Arc<dyn AudioCodec>,
    inbound: InboundSender,
    running: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AcousticReceiver {
    pub fn new(node_id: String, codec: Arc<dyn AudioCodec>, inbound: InboundSender) -> Self {
        Self {
            node_id,
            codec,
            inbound,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TransportReceiver for AcousticReceiver {
    fn tag(&self) -> &'static str {
        TAG
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.running.store(true, Ordering::SeqCst);

        let codec = self.codec.clone();
        let inbound = self.inbound.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let node_id = self.node_id.clone();

        let handle = tokio::spawn(async move {
            info!(node = %node_id, "acoustic_receive_loop_started");
            while running.load(Ordering::SeqCst) {
                if let Some(decoded) = codec.poll_decoded().await {
                    match Packet::decode(&decoded) {
                        Ok(mut packet) => {
                            if super::is_loopback(&packet, &node_id) {
                                continue;
                            }
                            stats.packets_received.fetch_add(1, Ordering::Relaxed);
                            packet.received_via.push(TAG.to_string());
                            if !super::queue_push(&inbound, &stats, packet) {
                                break;
                            }
                        }
                        Err(_) => {
                            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            info!("acoustic_receive_loop_stopped");
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
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
    use crate::packet::{PacketType, Urgency};
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct LoopbackCodec {
        queue: Mutex<VecDeque<Vec<u8>>>,
    }

    #[async_trait]
    impl AudioCodec for LoopbackCodec {
        fn sample_rate(&self) -> u32 {
            48000
        }
        fn samples_per_frame(&self) -> u32 {
            1024
        }
        async fn play(&self, payload: &[u8], _volume: u8) -> Result<(), TransportError> {
            self.queue.lock().await.push_back(payload.to_vec());
            Ok(())
        }
        async fn poll_decoded(&self) -> Option<Vec<u8>> {
            self.queue.lock().await.pop_front()
        }
    }

    #[tokio::test]
    async fn sent_packet_is_delivered_to_inbound_queue() {
        let codec = Arc::new(LoopbackCodec { queue: Mutex::new(VecDeque::new()) });
        let sender = AcousticSender::new("A".to_string(), codec.clone(), 50);
        sender.start().await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let receiver = AcousticReceiver::new("B".to_string(), codec, tx);
        receiver.start().await.unwrap();

        let packet = Packet::new("A", "help", PacketType::Sos, Urgency::High, None, None, None);
        sender.send(packet.clone()).await;

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("packet delivered before timeout")
            .expect("channel open");
        assert_eq!(received.packet_id, packet.packet_id);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn own_packets_are_not_delivered_back() {
        let codec = Arc::new(LoopbackCodec { queue: Mutex::new(VecDeque::new()) });
        let sender = AcousticSender::new("A".to_string(), codec.clone(), 50);
        sender.start().await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let receiver = AcousticReceiver::new("A".to_string(), codec, tx);
        receiver.start().await.unwrap();

        let packet = Packet::new("A", "help", PacketType::Sos, Urgency::High, None, None, None);
        sender.send(packet).await;

        let result = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "loopback packet should never reach inbound queue");
        receiver.stop().await;
    }
}
