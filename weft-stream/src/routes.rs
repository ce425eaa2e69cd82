//! Per-neighbor shortest-path routing table
//!
//! Routes are learned from ACKs traveling back from their targets and
//! forgotten when the neighbor that owned them goes away or when the
//! entry outlives its time-to-live.

use debug_print::*;

use std::collections::HashMap;

use weft::types::*;

/// One learned way of reaching a target
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouteEntry {
    /// Directly connected peer the target is reachable through
    pub next_hop: PeerId,

    /// Observed round-trip time in milliseconds
    pub rtt: u64,

    pub learned_at: Timestamp,
}

/// Shortest-path map per target, primary next hop first
pub struct RoutingTable {
    routes: HashMap<PeerHash, Vec<RouteEntry>>,

    /// Entry lifetime in milliseconds
    ttl: u64,
}

impl RoutingTable {
    pub fn new(ttl: u64) -> RoutingTable {
        RoutingTable {
            routes: HashMap::new(),
            ttl,
        }
    }

    /// Record that `target` answered through `next_hop`
    ///
    /// An existing entry for the same next hop is replaced by the new
    /// observation. Entries stay sorted by round-trip time, so the
    /// primary route is always the first one.
    pub fn learn(&mut self, target: PeerHash, next_hop: PeerId, rtt: u64, now: Timestamp) {
        let entries = self.routes.entry(target).or_insert(vec![]);
        entries.retain(|e| e.next_hop != next_hop);
        entries.push(RouteEntry {
            next_hop,
            rtt,
            learned_at: now,
        });
        entries.sort_by_key(|e| (e.rtt, *e.next_hop.slice()));
        debug_println!(
            "route: {} via {} rtt {}ms ({} known)",
            target,
            next_hop,
            rtt,
            entries.len()
        );
    }

    /// Primary next hop towards a target
    pub fn next_hop(&self, target: &PeerHash, now: Timestamp) -> Option<PeerId> {
        self.routes.get(target).and_then(|entries| {
            entries
                .iter()
                .find(|e| now < e.learned_at + self.ttl)
                .map(|e| e.next_hop)
        })
    }

    /// Every fresh route towards a target, best first
    pub fn next_hops(&self, target: &PeerHash, now: Timestamp) -> Vec<PeerId> {
        match self.routes.get(target) {
            Some(entries) => entries
                .iter()
                .filter(|e| now < e.learned_at + self.ttl)
                .map(|e| e.next_hop)
                .collect(),
            None => vec![],
        }
    }

    /// Targets with at least one fresh route
    pub fn reachable(&self, now: Timestamp) -> Vec<PeerHash> {
        let mut targets: Vec<PeerHash> = self
            .routes
            .iter()
            .filter(|(_t, entries)| entries.iter().any(|e| now < e.learned_at + self.ttl))
            .map(|(t, _entries)| *t)
            .collect();
        targets.sort();
        targets
    }

    /// Forget every route through a disconnected neighbor
    ///
    /// The target may stay reachable through other next hops.
    pub fn evict_peer(&mut self, peer: &PeerId) {
        for entries in self.routes.values_mut() {
            entries.retain(|e| e.next_hop != *peer);
        }
        self.routes.retain(|_t, entries| !entries.is_empty());
    }

    /// Drop entries past their time-to-live
    pub fn expire(&mut self, now: Timestamp) {
        for entries in self.routes.values_mut() {
            entries.retain(|e| now < e.learned_at + self.ttl);
        }
        self.routes.retain(|_t, entries| !entries.is_empty());
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod test {
    use crate::routes::*;
    use weft::utils::{generate_keypair, peer_hash};

    fn peer() -> PeerId {
        generate_keypair().1
    }

    #[test]
    pub fn test_shortest_path_wins() {
        // line 0-1-2-3, then a direct link 0-2 shortens the path
        let p1 = peer();
        let p2 = peer();
        let p3 = peer();
        let h3 = peer_hash(&p3);

        let mut table = RoutingTable::new(600_000);
        table.learn(h3, p1, 30, 0);
        assert_eq!(table.next_hop(&h3, 1), Some(p1));

        table.learn(h3, p2, 20, 0);
        assert_eq!(table.next_hop(&h3, 1), Some(p2));
        assert_eq!(table.next_hops(&h3, 1), vec![p2, p1]);
    }

    #[test]
    pub fn test_relearn_replaces() {
        let p1 = peer();
        let target = peer_hash(&peer());
        let mut table = RoutingTable::new(600_000);
        table.learn(target, p1, 30, 0);
        table.learn(target, p1, 12, 5);
        assert_eq!(table.next_hops(&target, 6).len(), 1);
        assert_eq!(table.next_hop(&target, 6), Some(p1));
    }

    #[test]
    pub fn test_evict_and_expire() {
        let p1 = peer();
        let p2 = peer();
        let t_a = peer_hash(&peer());
        let t_b = peer_hash(&p1);

        let mut table = RoutingTable::new(100);
        table.learn(t_a, p1, 10, 0);
        table.learn(t_a, p2, 20, 0);
        table.learn(t_b, p2, 20, 0);

        table.evict_peer(&p1);
        // every route through p1 is gone, but p1 itself may stay
        // reachable through another hop
        assert_eq!(table.next_hop(&t_b, 1), Some(p2));
        assert_eq!(table.next_hop(&t_a, 1), Some(p2));

        // entries die past their ttl
        assert_eq!(table.next_hop(&t_a, 200), None);
        assert_eq!(table.reachable(200), vec![]);
    }
}
