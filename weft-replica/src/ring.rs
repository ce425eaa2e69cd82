//! Replication ring
//!
//! Every replicating peer owns an arc `[offset, offset + factor)` on
//! the unit circle, with the offset derived from its public key. The
//! ring answers two questions: which peers together cover a given
//! width (for queries and pruning checks), and which peers lead a
//! specific point (for per-group leader election).

use weft::types::*;

/// One peer's claim on the ring
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplicationRange {
    pub peer: PeerId,

    /// Position on the unit circle, derived from the peer key
    pub offset: f64,

    /// Width of the claimed arc
    pub factor: f64,

    /// When the peer assumed this width
    pub timestamp: Timestamp,
}

impl ReplicationRange {
    /// A range is mature once it held its width long enough
    pub fn is_mature(&self, now: Timestamp, min_age: u64) -> bool {
        now.saturating_sub(self.timestamp) >= min_age
    }

    /// Whether the arc covers a point of the unit circle
    pub fn covers(&self, point: f64) -> bool {
        let end = self.offset + self.factor;
        if end <= 1.0 {
            point >= self.offset && point < end
        } else {
            point >= self.offset || point < end - 1.0
        }
    }

    fn midpoint(&self) -> f64 {
        (self.offset + self.factor / 2.0) % 1.0
    }
}

/// Distance between two points of the unit circle
fn circular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs();
    d.min(1.0 - d)
}

/// The ordered set of replication ranges
pub struct Ring {
    /// Sorted by offset, then by peer key for equal offsets
    ranges: Vec<ReplicationRange>,
}

impl Ring {
    pub fn new() -> Ring {
        Ring { ranges: vec![] }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&ReplicationRange> {
        self.ranges.iter().find(|r| r.peer == *peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.ranges.iter().map(|r| r.peer).collect()
    }

    /// Sum of all claimed widths
    pub fn total_participation(&self) -> f64 {
        self.ranges.iter().map(|r| r.factor).sum()
    }

    /// Insert a range, or replace the peer's previous one
    ///
    /// Zero-width ranges are not kept; they are how observers leave.
    pub fn insert_or_update(&mut self, range: ReplicationRange) {
        self.ranges.retain(|r| r.peer != range.peer);
        if range.factor > 0.0 {
            let at = self
                .ranges
                .partition_point(|r| (r.offset, *r.peer.slice()) < (range.offset, *range.peer.slice()));
            self.ranges.insert(at, range);
        }
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.ranges.retain(|r| r.peer != *peer);
    }

    /// Peers that together cover `width`, walking forward from the
    /// range owned by `start_peer`
    ///
    /// The starting peer is always included. Immature ranges are
    /// skipped as long as the mature ones suffice; when they do not,
    /// immature peers are pulled in nearest-first until the width is
    /// covered or the ring is exhausted.
    pub fn cover_set(
        &self,
        width: f64,
        start_peer: &PeerId,
        now: Timestamp,
        min_age: u64,
    ) -> Vec<PeerId> {
        if self.ranges.is_empty() {
            return vec![];
        }
        let start = self
            .ranges
            .iter()
            .position(|r| r.peer == *start_peer)
            .unwrap_or(0);

        let mut cover = vec![self.ranges[start].peer];
        let mut total = self.ranges[start].factor;
        for step in 1..self.ranges.len() {
            if total >= width {
                break;
            }
            let range = &self.ranges[(start + step) % self.ranges.len()];
            if range.is_mature(now, min_age) {
                cover.push(range.peer);
                total += range.factor;
            }
        }
        if total >= width {
            return cover;
        }

        // not enough mature width: nearest immature ranges fill in
        let from = self.ranges[start].offset;
        let mut immature: Vec<&ReplicationRange> = self
            .ranges
            .iter()
            .filter(|r| !r.is_mature(now, min_age) && !cover.contains(&r.peer))
            .collect();
        immature.sort_by(|a, b| {
            circular_distance(a.offset, from)
                .partial_cmp(&circular_distance(b.offset, from))
                .unwrap()
        });
        for range in immature {
            if total >= width {
                break;
            }
            cover.push(range.peer);
            total += range.factor;
        }
        cover
    }

    /// Owner of a point: the covering range closest to it by arc
    /// midpoint, mature ranges first
    fn owner(&self, point: f64, now: Timestamp, min_age: u64, exclude: &[PeerId]) -> Option<PeerId> {
        let candidates = |mature: bool| {
            self.ranges
                .iter()
                .filter(|r| !exclude.contains(&r.peer))
                .filter(|r| r.is_mature(now, min_age) == mature)
                .filter(|r| r.covers(point))
                .min_by(|a, b| {
                    circular_distance(point, a.midpoint())
                        .partial_cmp(&circular_distance(point, b.midpoint()))
                        .unwrap()
                })
                .map(|r| r.peer)
        };
        match candidates(true).or_else(|| candidates(false)) {
            Some(peer) => Some(peer),
            // no arc covers the point, the nearest range takes it
            None => self
                .ranges
                .iter()
                .filter(|r| !exclude.contains(&r.peer))
                .min_by(|a, b| {
                    circular_distance(point, a.offset)
                        .partial_cmp(&circular_distance(point, b.offset))
                        .unwrap()
                })
                .map(|r| r.peer),
        }
    }

    /// Deterministic leader selection: probe `count` evenly spaced
    /// points starting at the cursor and collect their owners
    pub fn sample(
        &self,
        cursor: f64,
        count: u32,
        now: Timestamp,
        min_age: u64,
    ) -> Vec<PeerId> {
        let mut picked: Vec<PeerId> = vec![];
        for i in 0..count {
            let point = (cursor + i as f64 / count as f64) % 1.0;
            match self.owner(point, now, min_age, &picked) {
                Some(peer) => picked.push(peer),
                None => break,
            }
        }
        picked
    }
}

#[cfg(test)]
mod test {
    use crate::ring::*;
    use weft::utils::generate_keypair;

    fn range(peer: PeerId, offset: f64, factor: f64, timestamp: Timestamp) -> ReplicationRange {
        ReplicationRange {
            peer,
            offset,
            factor,
            timestamp,
        }
    }

    fn three_peer_ring(t_a: Timestamp, t_bc: Timestamp) -> (Ring, PeerId, PeerId, PeerId) {
        let a = generate_keypair().1;
        let b = generate_keypair().1;
        let c = generate_keypair().1;
        let mut ring = Ring::new();
        ring.insert_or_update(range(a, 0.0, 0.34, t_a));
        ring.insert_or_update(range(b, 0.333, 0.34, t_bc));
        ring.insert_or_update(range(c, 0.666, 0.34, t_bc));
        (ring, a, b, c)
    }

    #[test]
    pub fn test_insert_order_and_update() {
        let (mut ring, a, b, _c) = three_peer_ring(0, 0);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.peers()[0], a);
        assert!((ring.total_participation() - 1.02).abs() < 1e-9);

        ring.insert_or_update(range(b, 0.333, 0.5, 7));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(&b).unwrap().factor, 0.5);
        assert_eq!(ring.get(&b).unwrap().timestamp, 7);

        // a zero width removes the peer from the ring
        ring.insert_or_update(range(b, 0.333, 0.0, 9));
        assert_eq!(ring.len(), 2);

        ring.remove(&a);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    pub fn test_cover_with_maturity() {
        // A held its width for long, B and C just arrived
        let now = 1_000_000;
        let (ring, a, b, c) = three_peer_ring(0, now);

        // with everyone mature the walk stops after a full cover
        let cover = ring.cover_set(1.0, &a, now, 0);
        assert_eq!(cover, vec![a, b, c]);

        // a huge maturity bar: A alone cannot cover, so the nearest
        // immature peers are pulled in and the set is again everyone
        let cover = ring.cover_set(1.0, &a, now, u64::MAX);
        assert_eq!(cover.len(), 3);
        assert_eq!(cover[0], a);

        // a third of the ring is covered by the starting peer alone
        let cover = ring.cover_set(0.3, &a, now, 0);
        assert_eq!(cover, vec![a]);
    }

    #[test]
    pub fn test_cover_width_bound() {
        let now = 1_000;
        let (ring, a, _b, _c) = three_peer_ring(0, 0);
        let cover = ring.cover_set(1.0, &a, now, 0);
        let width: f64 = cover
            .iter()
            .map(|p| ring.get(p).unwrap().factor)
            .sum();
        assert!(width >= 1.0);
    }

    #[test]
    pub fn test_sample_deterministic_and_distinct() {
        let now = 1_000;
        let (ring, _a, _b, _c) = three_peer_ring(0, 0);

        let one = ring.sample(0.1, 2, now, 0);
        let two = ring.sample(0.1, 2, now, 0);
        assert_eq!(one, two);
        assert_eq!(one.len(), 2);
        assert_ne!(one[0], one[1]);

        // every peer owns the whole circle, still two distinct leaders
        let mut full = Ring::new();
        let x = generate_keypair().1;
        let y = generate_keypair().1;
        let z = generate_keypair().1;
        full.insert_or_update(range(x, 0.1, 1.0, 0));
        full.insert_or_update(range(y, 0.5, 1.0, 0));
        full.insert_or_update(range(z, 0.9, 1.0, 0));
        let leaders = full.sample(0.42, 2, now, 0);
        assert_eq!(leaders.len(), 2);
        assert_ne!(leaders[0], leaders[1]);
    }

    #[test]
    pub fn test_sample_prefers_mature() {
        let now = 1_000_000;
        let a = generate_keypair().1;
        let b = generate_keypair().1;
        let mut ring = Ring::new();
        ring.insert_or_update(range(a, 0.0, 1.0, 0));
        ring.insert_or_update(range(b, 0.5, 1.0, now));

        let leaders = ring.sample(0.25, 1, now, 5_000);
        assert_eq!(leaders, vec![a]);

        // the immature peer still serves once the mature one is taken
        let leaders = ring.sample(0.25, 2, now, 5_000);
        assert_eq!(leaders.len(), 2);
    }

    #[test]
    pub fn test_single_peer_ring() {
        let now = 10;
        let a = generate_keypair().1;
        let mut ring = Ring::new();
        ring.insert_or_update(range(a, 0.7, 0.1, now));

        // the lone peer is start, cover and owner at once, mature or not
        assert_eq!(ring.cover_set(1.0, &a, now, u64::MAX), vec![a]);
        assert_eq!(ring.sample(0.2, 2, now, u64::MAX), vec![a]);
    }
}
