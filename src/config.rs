//! Runtime configuration, overlaid from the environment.
//!
//! Mirrors the teacher's "env var with a typed default" pattern (its `PORT`
//! lookup in `main()`), generalized to every tunable in spec.md §6.

use std::time::Duration;

use crate::packet::Urgency;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_api_url: Option<String>,
    pub server_upload_interval: Duration,

    pub udp_multicast_group: String,
    pub udp_port: u16,

    pub ble_scan_interval: Duration,
    pub ble_connection_timeout: Duration,

    pub ggwave_sample_rate: u32,
    pub ggwave_samples_per_frame: u32,
    pub ggwave_volume: u32,

    pub packet_cache_limit: usize,
    pub packet_expiration: Duration,

    pub max_packets_per_minute: u32,
    pub heartbeat_interval: Duration,
    pub maintenance_interval: Duration,

    pub ttl_critical: u32,
    pub ttl_high: u32,
    pub ttl_medium: u32,
    pub ttl_low: u32,

    pub inbound_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_api_url: None,
            server_upload_interval: Duration::from_secs(10),

            udp_multicast_group: "224.1.1.1".to_string(),
            udp_port: 9999,

            ble_scan_interval: Duration::from_secs(10),
            ble_connection_timeout: Duration::from_secs(15),

            ggwave_sample_rate: 48_000,
            ggwave_samples_per_frame: 1024,
            ggwave_volume: 50,

            packet_cache_limit: 100,
            packet_expiration: Duration::from_secs(3_600),

            max_packets_per_minute: 10,
            heartbeat_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(300),

            ttl_critical: 20,
            ttl_high: 15,
            ttl_medium: 10,
            ttl_low: 5,

            inbound_queue_capacity: 100,
        }
    }
}

impl Config {
    /// Overlays environment variables onto the defaults. Unset or
    /// unparsable variables fall back silently to the existing value.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SERVER_API_URL") {
            cfg.server_api_url = Some(v);
        }
        env_secs(&mut cfg.server_upload_interval, "SERVER_UPLOAD_INTERVAL");
        env_string(&mut cfg.udp_multicast_group, "UDP_MULTICAST_GROUP");
        env_parse(&mut cfg.udp_port, "UDP_PORT");
        env_secs(&mut cfg.ble_scan_interval, "BLE_SCAN_INTERVAL");
        env_secs(&mut cfg.ble_connection_timeout, "BLE_CONNECTION_TIMEOUT");
        env_parse(&mut cfg.ggwave_sample_rate, "GGWAVE_SAMPLE_RATE");
        env_parse(&mut cfg.ggwave_samples_per_frame, "GGWAVE_SAMPLES_PER_FRAME");
        env_parse(&mut cfg.ggwave_volume, "GGWAVE_VOLUME");
        env_parse(&mut cfg.packet_cache_limit, "PACKET_CACHE_LIMIT");
        env_secs(&mut cfg.packet_expiration, "PACKET_EXPIRATION");
        env_parse(&mut cfg.max_packets_per_minute, "MAX_PACKETS_PER_MINUTE");
        env_secs(&mut cfg.heartbeat_interval, "HEARTBEAT_INTERVAL");
        env_parse(&mut cfg.ttl_critical, "TTL_CRITICAL");
        env_parse(&mut cfg.ttl_high, "TTL_HIGH");
        env_parse(&mut cfg.ttl_medium, "TTL_MEDIUM");
        env_parse(&mut cfg.ttl_low, "TTL_LOW");

        cfg
    }

    pub fn initial_ttl(&self, urgency: Urgency) -> u32 {
        match urgency {
            Urgency::Critical => self.ttl_critical,
            Urgency::High => self.ttl_high,
            Urgency::Medium => self.ttl_medium,
            Urgency::Low => self.ttl_low,
        }
    }
}

fn env_secs(field: &mut Duration, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(secs) = v.parse::<u64>() {
            *field = Duration::from_secs(secs);
        }
    }
}

fn env_string(field: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *field = v;
    }
}

fn env_parse<T: std::str::FromStr>(field: &mut T, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.udp_port, 9999);
        assert_eq!(cfg.udp_multicast_group, "224.1.1.1");
        assert_eq!(cfg.packet_cache_limit, 100);
        assert_eq!(cfg.max_packets_per_minute, 10);
        assert_eq!(cfg.initial_ttl(Urgency::Critical), 20);
        assert_eq!(cfg.initial_ttl(Urgency::High), 15);
        assert_eq!(cfg.initial_ttl(Urgency::Medium), 10);
        assert_eq!(cfg.initial_ttl(Urgency::Low), 5);
    }
}
