//! Bounded seen-set for exactly-once message processing

use std::collections::{HashMap, VecDeque};

use weft::types::PeerId;
use weft_net::types::MsgId;

/// Remembers which message IDs were already processed and which link
/// they first arrived on, so ACKs can travel the reverse path.
/// Oldest ids are forgotten once the capacity is reached.
pub struct SeenCache {
    arrivals: HashMap<MsgId, PeerId>,
    order: VecDeque<MsgId>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> SeenCache {
        SeenCache {
            arrivals: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record a message arrival. Returns false when the id was
    /// already seen, in which case the original arrival link is kept.
    pub fn insert(&mut self, id: MsgId, from: PeerId) -> bool {
        if self.arrivals.contains_key(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.arrivals.remove(&oldest);
            }
        }
        self.arrivals.insert(id, from);
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.arrivals.contains_key(id)
    }

    /// The link a message first arrived on
    pub fn arrival(&self, id: &MsgId) -> Option<&PeerId> {
        self.arrivals.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod test {
    use crate::dedup::*;
    use weft::utils::{fresh_gid, generate_keypair};

    #[test]
    pub fn test_exactly_once() {
        let peer_a = generate_keypair().1;
        let peer_b = generate_keypair().1;
        let id = fresh_gid();

        let mut seen = SeenCache::new(4);
        assert!(seen.insert(id, peer_a));
        assert!(!seen.insert(id, peer_b));
        assert_eq!(seen.arrival(&id), Some(&peer_a));
    }

    #[test]
    pub fn test_capacity_bound() {
        let peer = generate_keypair().1;
        let mut seen = SeenCache::new(3);
        let first = fresh_gid();
        seen.insert(first, peer);
        for _ in 0..3 {
            seen.insert(fresh_gid(), peer);
        }
        assert_eq!(seen.len(), 3);
        // the oldest id fell out and would be processed again
        assert!(!seen.contains(&first));
    }
}
