//! Best-effort upload of cached packets to a collection server. Runs on
//! its own periodic loop; uploads never block the mesh's relay path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::manager::PacketManager;
use crate::packet::Packet;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Uploader {
    endpoint: String,
    interval: Duration,
    manager: Arc<PacketManager>,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Uploader {
    pub fn new(endpoint: String, interval: Duration, manager: Arc<PacketManager>) -> Self {
        Self {
            endpoint,
            interval,
            manager,
            client: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            info!(endpoint = %this.endpoint, "uploader_started");
            let mut tick = tokio::time::interval(this.interval);
            while this.running.load(Ordering::SeqCst) {
                tick.tick().await;
                this.run_cycle().await;
            }
            info!("uploader_stopped");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn run_cycle(&self) {
        for packet in self.manager.cached_packets() {
            match self.upload_one(&packet).await {
                Ok(()) => {
                    self.manager.remove(&packet.packet_id);
                    debug!(packet_id = %packet.packet_id, "packet_uploaded");
                }
                Err(e) => {
                    warn!(packet_id = %packet.packet_id, error = %e, "upload_failed");
                }
            }
        }
    }

    async fn upload_one(&self, packet: &Packet) -> Result<(), UploadError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(UPLOAD_TIMEOUT)
            .json(packet)
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        if response.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(UploadError::NonOkStatus(response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::packet::{PacketType, Urgency};

    #[tokio::test]
    async fn upload_to_unreachable_endpoint_leaves_packet_cached() {
        let manager = Arc::new(PacketManager::new(&Config::default()));
        let packet = Packet::new("A", "help", PacketType::Sos, Urgency::High, None, None, None);
        manager.add_packet(packet.clone(), None, None);

        let uploader = Uploader::new(
            "http://127.0.0.1:9/unreachable".to_string(),
            Duration::from_secs(3600),
            manager.clone(),
        );
        uploader.run_cycle().await;
        assert_eq!(manager.stats().cache_size, 1);
    }
}
