//! The packet manager: dedup, rate-limit, TTL bookkeeping, relay policy,
//! cache eviction, and ACK pairing. Every public method locks the same
//! `Mutex<Inner>`, so admission is atomic with the seen-id check and no
//! two concurrent admissions of the same `packet_id` can both succeed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::packet::Packet;
use crate::priority_queue::PriorityQueue;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    RateLimited,
}

#[derive(Debug)]
pub enum AdmitOutcome {
    Admitted(Packet),
    Dropped(DropReason),
}

#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_relayed: u64,
    pub duplicates_filtered: u64,
    pub rate_limited: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
}

#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub counters: Counters,
    pub cache_size: usize,
    pub active_neighbors: usize,
    pub pending_acks: usize,
    pub thread_count: usize,
    pub avg_reliability: f64,
}

struct RateWindow {
    count: u32,
    window_start: Instant,
}

struct Inner {
    cache: HashMap<String, Packet>,
    seen_ids: HashMap<String, Instant>,
    thread_index: HashMap<String, Vec<String>>,
    pending_acks: HashMap<String, Packet>,
    priority_q: PriorityQueue,
    topology: Topology,
    rate_windows: HashMap<String, RateWindow>,
    rate_violations: HashMap<String, u32>,
    counters: Counters,
}

pub struct PacketManager {
    inner: Mutex<Inner>,
    cache_limit: usize,
    cache_ttl: Duration,
    max_per_minute: u32,
}

impl PacketManager {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: HashMap::new(),
                seen_ids: HashMap::new(),
                thread_index: HashMap::new(),
                pending_acks: HashMap::new(),
                priority_q: PriorityQueue::new(),
                topology: Topology::new(),
                rate_windows: HashMap::new(),
                rate_violations: HashMap::new(),
                counters: Counters::default(),
            }),
            cache_limit: config.packet_cache_limit,
            cache_ttl: config.packet_expiration,
            max_per_minute: config.max_packets_per_minute,
        }
    }

    #[instrument(skip(self, packet), fields(packet_id = %packet.packet_id))]
    pub fn add_packet(
        &self,
        mut packet: Packet,
        transport_tag: Option<&str>,
        rssi: Option<f64>,
    ) -> AdmitOutcome {
        let mut inner = self.inner.lock().unwrap();

        if inner.seen_ids.contains_key(&packet.packet_id) {
            inner.counters.duplicates_filtered += 1;
            debug!("duplicate_filtered");
            return AdmitOutcome::Dropped(DropReason::Duplicate);
        }

        if !Self::check_rate_limit(&mut inner, &packet.sender_id, self.max_per_minute) {
            inner.counters.rate_limited += 1;
            warn!(sender = %packet.sender_id, "rate_limited");
            return AdmitOutcome::Dropped(DropReason::RateLimited);
        }

        // The receiver already recorded its tag on `received_via` before
        // handing the packet off; admission only needs it to feed topology.
        if let Some(tag) = transport_tag {
            inner.topology.observe(&packet.sender_id, tag);
        }
        if let Some(rssi) = rssi {
            packet.signal_strength.insert(packet.sender_id.clone(), rssi);
        }

        let now = Instant::now();
        inner.seen_ids.insert(packet.packet_id.clone(), now);
        inner
            .thread_index
            .entry(packet.thread_id.clone())
            .or_default()
            .push(packet.packet_id.clone());
        inner.cache.insert(packet.packet_id.clone(), packet.clone());
        inner.counters.packets_received += 1;

        if matches!(packet.packet_type, crate::packet::PacketType::Ack) {
            Self::reconcile_ack(&mut inner, &packet);
        } else if packet.requires_ack {
            inner.pending_acks.insert(packet.packet_id.clone(), packet.clone());
        }

        inner.priority_q.push(packet.clone());

        if inner.cache.len() > self.cache_limit {
            self.evict(&mut inner);
        }

        info!(sender = %packet.sender_id, kind = ?packet.packet_type, "packet_admitted");
        AdmitOutcome::Admitted(packet)
    }

    fn check_rate_limit(inner: &mut Inner, sender_id: &str, max_per_minute: u32) -> bool {
        let now = Instant::now();
        let window = inner.rate_windows.entry(sender_id.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) > Duration::from_secs(60) {
            window.count = 0;
            window.window_start = now;
        }
        window.count += 1;

        if window.count > max_per_minute {
            *inner.rate_violations.entry(sender_id.to_string()).or_insert(0) += 1;
            false
        } else {
            true
        }
    }

    fn reconcile_ack(inner: &mut Inner, ack: &Packet) {
        const PREFIX: &str = "ACK for ";
        let Some(original_id) = ack.message.strip_prefix(PREFIX) else {
            return;
        };
        if let Some(original) = inner.pending_acks.get_mut(original_id) {
            original.add_acknowledgment(ack.sender_id.clone());
            if let Some(cached) = inner.cache.get_mut(original_id) {
                cached.add_acknowledgment(ack.sender_id.clone());
            }
            inner.counters.acks_received += 1;
            info!(original_id, "ack_reconciled");
        }
    }

    fn evict(&self, inner: &mut Inner) {
        let now_wall = crate::packet::now_secs();
        let expired: Vec<String> = inner
            .cache
            .iter()
            .filter(|(_, p)| now_wall - p.timestamp > self.cache_ttl.as_secs_f64())
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            Self::remove_packet(inner, &id);
        }

        while inner.cache.len() > self.cache_limit {
            let victim = inner
                .cache
                .values()
                .min_by(|a, b| {
                    a.priority_score()
                        .cmp(&b.priority_score())
                        .then_with(|| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal))
                })
                .map(|p| p.packet_id.clone());
            match victim {
                Some(id) => Self::remove_packet(inner, &id),
                None => break,
            }
        }
    }

    fn remove_packet(inner: &mut Inner, packet_id: &str) {
        if let Some(packet) = inner.cache.remove(packet_id) {
            if let Some(ids) = inner.thread_index.get_mut(&packet.thread_id) {
                ids.retain(|id| id != packet_id);
            }
            inner.pending_acks.remove(packet_id);
        }
    }

    pub fn should_relay(&self, packet: &Packet, self_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        Self::should_relay_locked(&inner, packet, self_id)
    }

    fn should_relay_locked(inner: &Inner, packet: &Packet, self_id: &str) -> bool {
        if packet.sender_id == self_id {
            return false;
        }
        if packet.relay_path.iter().any(|n| n == self_id) {
            return false;
        }
        if !packet.can_relay() {
            return false;
        }
        if matches!(packet.urgency, crate::packet::Urgency::Critical) {
            return true;
        }
        if inner.topology.active(Duration::from_secs(300)).len() < 3 {
            return true;
        }
        if packet.hop_count > 5 && matches!(packet.urgency, crate::packet::Urgency::Low) {
            return false;
        }
        true
    }

    pub fn next_to_process(&self) -> Option<Packet> {
        self.inner.lock().unwrap().priority_q.pop()
    }

    pub fn create_ack(&self, original: &Packet, self_id: &str) -> Packet {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.acks_sent += 1;
        original.create_ack(self_id)
    }

    pub fn get_thread(&self, thread_id: &str) -> Vec<Packet> {
        let inner = self.inner.lock().unwrap();
        let mut packets: Vec<Packet> = inner
            .thread_index
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.cache.get(id).cloned())
            .collect();
        packets.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal));
        packets
    }

    /// Batch listing of still-relayable cached packets, highest priority
    /// first. Used by the maintenance loop to periodically re-offer
    /// unacknowledged local SOS packets for relay.
    pub fn relay_candidates(&self, max_count: usize) -> Vec<Packet> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&Packet> = inner.cache.values().filter(|p| p.can_relay()).collect();
        candidates.sort_by(|a, b| b.priority_score().cmp(&a.priority_score()));
        candidates.into_iter().take(max_count).cloned().collect()
    }

    pub fn mark_sent(&self) {
        self.inner.lock().unwrap().counters.packets_sent += 1;
    }

    pub fn mark_relayed(&self) {
        self.inner.lock().unwrap().counters.packets_relayed += 1;
    }

    pub fn remove(&self, packet_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_packet(&mut inner, packet_id);
    }

    pub fn cached_packets(&self) -> Vec<Packet> {
        self.inner.lock().unwrap().cache.values().cloned().collect()
    }

    /// Per-node rate-window and reliability bookkeeping for nodes not seen
    /// within `max_age`, plus the time-bounded sweep of `seen_ids` (see
    /// the packet-id GC decision recorded in DESIGN.md). Does not touch
    /// the packet cache; that is eviction's job.
    pub fn cleanup(&self, max_age: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.topology.forget_stale(max_age);

        let now = Instant::now();
        let stale_senders: Vec<String> = inner
            .rate_windows
            .iter()
            .filter(|(_, w)| now.duration_since(w.window_start) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for sender in stale_senders {
            inner.rate_windows.remove(&sender);
            inner.rate_violations.remove(&sender);
        }

        let seen_id_ttl = self.cache_ttl + Duration::from_secs(300);
        let stale_ids: Vec<String> = inner
            .seen_ids
            .iter()
            .filter(|(_, ts)| now.duration_since(**ts) > seen_id_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_ids {
            inner.seen_ids.remove(&id);
        }
    }

    pub fn stats(&self) -> NetworkStats {
        let inner = self.inner.lock().unwrap();
        NetworkStats {
            counters: inner.counters.clone(),
            cache_size: inner.cache.len(),
            active_neighbors: inner.topology.active(Duration::from_secs(300)).len(),
            pending_acks: inner.pending_acks.len(),
            thread_count: inner.thread_index.len(),
            avg_reliability: inner.topology.avg_reliability(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketType, Urgency};

    fn manager() -> PacketManager {
        PacketManager::new(&Config::default())
    }

    fn sos(sender: &str, msg: &str, urgency: Urgency) -> Packet {
        Packet::new(sender, msg, PacketType::Sos, urgency, None, None, None)
    }

    #[test]
    fn admission_is_idempotent_for_same_packet_id() {
        let m = manager();
        let p = sos("A", "help", Urgency::High);
        assert!(matches!(
            m.add_packet(p.clone(), Some("udp"), None),
            AdmitOutcome::Admitted(_)
        ));
        assert!(matches!(
            m.add_packet(p, Some("ble"), None),
            AdmitOutcome::Dropped(DropReason::Duplicate)
        ));
    }

    #[test]
    fn rate_limit_admits_at_most_the_configured_maximum() {
        let m = manager();
        let mut admitted = 0;
        for i in 0..12 {
            let p = Packet::new(
                "F",
                format!("update {i}"),
                PacketType::StatusUpdate,
                Urgency::Low,
                None,
                None,
                None,
            );
            if matches!(m.add_packet(p, None, None), AdmitOutcome::Admitted(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn should_relay_refuses_own_packets_and_loop_paths() {
        let m = manager();
        let p = sos("A", "help", Urgency::High);
        assert!(!m.should_relay(&p, "A"));

        let mut relayed_once = p.clone();
        relayed_once.increment_hop("B", Some("udp"), None);
        assert!(!m.should_relay(&relayed_once, "B"));
    }

    #[test]
    fn critical_packets_always_relay() {
        let m = manager();
        let p = sos("A", "help", Urgency::Critical);
        assert!(m.should_relay(&p, "other-node"));
    }

    #[test]
    fn ack_reconciliation_marks_pending_ack_received() {
        let m = manager();
        let sos_packet = sos("A", "help", Urgency::High);
        let AdmitOutcome::Admitted(admitted) = m.add_packet(sos_packet.clone(), None, None) else {
            panic!("expected admission");
        };
        let ack = admitted.create_ack("B");
        m.add_packet(ack, None, None);

        let thread = m.get_thread(&sos_packet.thread_id);
        let original = thread.iter().find(|p| p.packet_id == admitted.packet_id).unwrap();
        assert!(original.ack_received);
        assert_eq!(original.ack_nodes, vec!["B".to_string()]);
    }

    #[test]
    fn eviction_keeps_cache_at_or_under_limit() {
        let mut config = Config::default();
        config.packet_cache_limit = 3;
        let m = PacketManager::new(&config);
        for i in 0..10 {
            let p = Packet::new(
                "A",
                format!("msg{i}"),
                PacketType::StatusUpdate,
                Urgency::Low,
                Some(format!("thread{i}")),
                None,
                None,
            );
            m.add_packet(p, None, None);
        }
        assert!(m.stats().cache_size <= 3);
    }
}
