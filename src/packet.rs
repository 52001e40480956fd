//! The Packet value type and its canonical wire encoding.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::PacketError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    #[serde(rename = "SOS")]
    Sos,
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate,
    #[serde(rename = "ALL_CLEAR")]
    AllClear,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ACK")]
    Ack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Urgency {
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
}

impl Urgency {
    /// Initial TTL per §4.8. Callers that need a `Config`-overridden value
    /// should go through `Config::initial_ttl` instead; this is the fixed
    /// default used wherever no config is in scope (e.g. decoding a packet
    /// whose ttl field is absent).
    pub fn default_initial_ttl(self) -> u32 {
        match self {
            Urgency::Critical => 20,
            Urgency::High => 15,
            Urgency::Medium => 10,
            Urgency::Low => 5,
        }
    }

    fn base_priority(self) -> i64 {
        match self {
            Urgency::Critical => 1000,
            Urgency::High => 100,
            Urgency::Medium => 10,
            Urgency::Low => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    /// Informational only; never used for dedup or ids.
    pub timestamp: f64,
}

impl GpsLocation {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<f64>, accuracy: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            accuracy,
            timestamp: now_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub media_type: String,
    pub filename: String,
    pub checksum: String,
}

impl MediaAttachment {
    pub fn new(data: Vec<u8>, media_type: String, filename: Option<String>) -> Self {
        let checksum = format!("{:x}", md5::Md5::digest(&data));
        let filename = filename.unwrap_or_else(|| format!("attachment_{}", &Uuid::new_v4().simple().to_string()[..8]));
        Self {
            data,
            media_type,
            filename,
            checksum,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_id: String,
    pub sender_id: String,
    pub thread_id: String,
    pub packet_type: PacketType,
    pub urgency: Urgency,
    pub message: String,
    pub location_text: Option<String>,
    pub gps: Option<GpsLocation>,
    pub timestamp: f64,
    pub hop_count: u32,
    pub ttl: u32,
    pub relay_path: Vec<String>,
    pub requires_ack: bool,
    pub ack_received: bool,
    pub ack_nodes: Vec<String>,
    pub received_via: Vec<String>,
    pub battery_level: Option<f64>,
    pub signal_strength: HashMap<String, f64>,
    pub media_attachments: Vec<MediaAttachment>,
}

pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn packet_id_for(sender_id: &str, message: &str, timestamp: f64, thread_id: &str) -> String {
    let data = format!("{sender_id}:{message}:{timestamp}:{thread_id}");
    let digest = Sha256::digest(data.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(chars);
    out
}

impl Packet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender_id: impl Into<String>,
        message: impl Into<String>,
        packet_type: PacketType,
        urgency: Urgency,
        thread_id: Option<String>,
        location_text: Option<String>,
        gps: Option<GpsLocation>,
    ) -> Self {
        let sender_id = sender_id.into();
        let message = message.into();
        let thread_id = thread_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = now_secs();
        let packet_id = packet_id_for(&sender_id, &message, timestamp, &thread_id);
        let ttl = urgency.default_initial_ttl();
        let requires_ack = matches!(packet_type, PacketType::Sos);

        Self {
            packet_id,
            relay_path: vec![sender_id.clone()],
            sender_id,
            thread_id,
            packet_type,
            urgency,
            message,
            location_text,
            gps,
            timestamp,
            hop_count: 0,
            ttl,
            requires_ack,
            ack_received: false,
            ack_nodes: Vec::new(),
            received_via: Vec::new(),
            battery_level: None,
            signal_strength: HashMap::new(),
            media_attachments: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::MalformedEnvelope(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let packet: Self = serde_json::from_slice(bytes)
            .map_err(|e| PacketError::MalformedEnvelope(e.to_string()))?;
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.relay_path.is_empty() {
            return Err(PacketError::FieldDomain("relay_path must not be empty".into()));
        }
        if self.relay_path[0] != self.sender_id {
            return Err(PacketError::FieldDomain(
                "relay_path[0] must equal sender_id".into(),
            ));
        }
        Ok(())
    }

    /// `ttl` already decrements once per hop alongside `hop_count` (see
    /// `increment_hop`), so it alone is the relay budget; a separate
    /// `hop_count` vs. initial-ttl comparison here would just duplicate it
    /// while ignoring any `Config`-resolved initial ttl.
    pub fn can_relay(&self) -> bool {
        self.ttl > 0
    }

    pub fn increment_hop(&mut self, node_id: &str, transport_tag: Option<&str>, signal: Option<f64>) {
        self.hop_count += 1;
        self.ttl = self.ttl.saturating_sub(1);
        if !self.relay_path.iter().any(|n| n == node_id) {
            self.relay_path.push(node_id.to_string());
        }
        if let Some(tag) = transport_tag {
            if !self.received_via.iter().any(|t| t == tag) {
                self.received_via.push(tag.to_string());
            }
        }
        if let Some(signal) = signal {
            self.signal_strength.insert(node_id.to_string(), signal);
        }
    }

    pub fn priority_score(&self) -> i64 {
        let base = self.urgency.base_priority();
        let freshness = (20 - self.hop_count as i64).max(0);
        let ack_bonus = if self.requires_ack && !self.ack_received { 50 } else { 0 };
        base + freshness + ack_bonus
    }

    pub fn create_ack(&self, by_node: impl Into<String>) -> Packet {
        let mut ack = Packet::new(
            by_node,
            format!("ACK for {}", self.packet_id),
            PacketType::Ack,
            Urgency::Low,
            Some(self.thread_id.clone()),
            None,
            None,
        );
        ack.requires_ack = false;
        ack
    }

    pub fn add_acknowledgment(&mut self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        if !self.ack_nodes.iter().any(|n| *n == node_id) {
            self.ack_nodes.push(node_id);
        }
        if self.requires_ack && !self.ack_nodes.is_empty() {
            self.ack_received = true;
        }
    }

    pub fn add_media_attachment(&mut self, data: Vec<u8>, media_type: String, filename: Option<String>) {
        self.media_attachments
            .push(MediaAttachment::new(data, media_type, filename));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_given_same_inputs() {
        let a = packet_id_for("A", "help", 100.0, "T1");
        let b = packet_id_for("A", "help", 100.0, "T1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut p = Packet::new(
            "A",
            "help",
            PacketType::Sos,
            Urgency::High,
            None,
            Some("here".to_string()),
            None,
        );
        p.increment_hop("B", Some("udp"), Some(-42.0));
        let encoded = p.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn can_relay_respects_ttl_and_hop_bound() {
        let mut p = Packet::new("A", "x", PacketType::Sos, Urgency::Low, None, None, None);
        assert!(p.can_relay());
        for _ in 0..5 {
            p.increment_hop("relay", None, None);
        }
        assert!(!p.can_relay());
    }

    #[test]
    fn priority_score_matches_formula() {
        let p = Packet::new("A", "x", PacketType::Sos, Urgency::Critical, None, None, None);
        assert_eq!(p.priority_score(), 1000 + 20 + 50);
    }

    #[test]
    fn create_ack_inherits_thread_and_disables_ack_requirement() {
        let p = Packet::new("A", "help", PacketType::Sos, Urgency::High, None, None, None);
        let ack = p.create_ack("B");
        assert_eq!(ack.thread_id, p.thread_id);
        assert!(!ack.requires_ack);
        assert_eq!(ack.message, format!("ACK for {}", p.packet_id));
    }

    #[test]
    fn decode_rejects_relay_path_not_starting_with_sender() {
        let mut p = Packet::new("A", "help", PacketType::Sos, Urgency::High, None, None, None);
        p.relay_path = vec!["someone-else".to_string()];
        let encoded = p.encode().unwrap();
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn media_attachment_roundtrips_with_matching_checksum() {
        let mut p = Packet::new("A", "x", PacketType::Sos, Urgency::Low, None, None, None);
        p.add_media_attachment(vec![1, 2, 3, 4], "image/png".to_string(), None);
        let encoded = p.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.media_attachments.len(), 1);
        assert_eq!(decoded.media_attachments[0].data, vec![1, 2, 3, 4]);
    }
}
