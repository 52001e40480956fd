//! Neighbor liveness and per-node reliability tracking.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct NodeEntry {
    transports: HashSet<String>,
    last_seen: Instant,
    reliability: f64,
}

#[derive(Debug, Default)]
pub struct Topology {
    nodes: HashMap<String, NodeEntry>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, node_id: &str, transport_tag: &str) {
        let entry = self.nodes.entry(node_id.to_string()).or_insert_with(|| NodeEntry {
            transports: HashSet::new(),
            last_seen: Instant::now(),
            reliability: 1.0,
        });
        entry.transports.insert(transport_tag.to_string());
        entry.last_seen = Instant::now();
    }

    pub fn active(&self, max_age: Duration) -> HashSet<String> {
        let now = Instant::now();
        self.nodes
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) <= max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn update_reliability(&mut self, node_id: &str, success: bool) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            let delta = if success { 0.1 } else { -0.1 };
            entry.reliability = (entry.reliability + delta).clamp(0.1, 1.0);
        }
    }

    pub fn reliability(&self, node_id: &str) -> Option<f64> {
        self.nodes.get(node_id).map(|e| e.reliability)
    }

    pub fn forget(&mut self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Drops any neighbor not seen within `max_age`. Used by maintenance.
    pub fn forget_stale(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.nodes.retain(|_, e| now.duration_since(e.last_seen) <= max_age);
    }

    pub fn avg_reliability(&self) -> f64 {
        if self.nodes.is_empty() {
            return 1.0;
        }
        let sum: f64 = self.nodes.values().map(|e| e.reliability).sum();
        sum / self.nodes.len() as f64
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_registers_neighbor_as_active() {
        let mut t = Topology::new();
        t.observe("B", "udp");
        assert!(t.active(Duration::from_secs(300)).contains("B"));
    }

    #[test]
    fn reliability_clamped_between_bounds() {
        let mut t = Topology::new();
        t.observe("B", "udp");
        for _ in 0..20 {
            t.update_reliability("B", true);
        }
        assert_eq!(t.reliability("B"), Some(1.0));
        for _ in 0..20 {
            t.update_reliability("B", false);
        }
        assert_eq!(t.reliability("B"), Some(0.1));
    }

    #[test]
    fn forget_removes_node() {
        let mut t = Topology::new();
        t.observe("B", "udp");
        t.forget("B");
        assert!(t.active(Duration::from_secs(300)).is_empty());
    }
}
