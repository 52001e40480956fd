//! Urgency-ordered pending-work structure. Max-heap on `priority_score()`,
//! ties broken by insertion order (stable FIFO among equal scores).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::packet::Packet;

#[derive(Debug)]
struct Entry {
    score: i64,
    insertion_index: u64,
    packet: Packet,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.insertion_index == other.insertion_index
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the highest score first, and for
        // equal scores the earliest insertion first, so reverse the index
        // comparison.
        self.score
            .cmp(&other.score)
            .then_with(|| other.insertion_index.cmp(&self.insertion_index))
    }
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_index: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet) {
        let score = packet.priority_score();
        let entry = Entry {
            score,
            insertion_index: self.next_index,
            packet,
        };
        self.next_index += 1;
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<Packet> {
        self.heap.pop().map(|e| e.packet)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketType, Urgency};

    fn packet(urgency: Urgency, label: &str) -> Packet {
        Packet::new("A", label, PacketType::Sos, urgency, None, None, None)
    }

    #[test]
    fn pops_by_priority_then_insertion_order() {
        let mut q = PriorityQueue::new();
        q.push(packet(Urgency::Low, "LOW#1"));
        q.push(packet(Urgency::Critical, "CRITICAL#2"));
        q.push(packet(Urgency::High, "HIGH#3"));
        q.push(packet(Urgency::Low, "LOW#4"));

        let order: Vec<String> = std::iter::from_fn(|| q.pop()).map(|p| p.message).collect();
        assert_eq!(order, vec!["CRITICAL#2", "HIGH#3", "LOW#1", "LOW#4"]);
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut q = PriorityQueue::new();
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }
}
