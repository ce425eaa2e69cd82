//! Typed replica events
//!
//! A small pub-sub inside the shared log; every subscriber gets its
//! own broadcast receiver and slow subscribers lose the oldest
//! events instead of blocking the engine.

use weft::types::*;
use weft_net::types::Role;

#[derive(Clone, Debug)]
pub enum ReplicaEvent {
    /// A peer announced a role, ours included
    RoleChanged { peer: PeerId, role: Role },

    /// Entries made it into the local log
    Joined { entries: Vec<EntryId> },

    /// Entries were handed off and removed locally
    Pruned { entries: Vec<EntryId> },

    PeerUp { peer: PeerId },

    PeerDown { peer: PeerId },
}

pub struct EventBus {
    s: async_broadcast::Sender<ReplicaEvent>,

    /// Keeps the channel alive while nobody listens
    r: async_broadcast::Receiver<ReplicaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (mut s, r) = async_broadcast::broadcast(capacity);
        s.set_overflow(true);
        EventBus { s, r }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<ReplicaEvent> {
        self.r.clone()
    }

    pub fn emit(&self, event: ReplicaEvent) {
        let _ = self.s.try_broadcast(event);
    }
}

#[cfg(test)]
mod test {
    use crate::events::*;

    #[async_std::test]
    pub async fn test_subscribe_and_overflow() {
        let bus = EventBus::new(2);
        let mut r = bus.subscribe();

        let peer = weft::utils::generate_keypair().1;
        for _ in 0..3 {
            bus.emit(ReplicaEvent::PeerUp { peer });
        }
        // capacity 2 with overflow: the oldest event is gone
        let mut count = 0;
        while let Ok(_ev) = r.try_recv() {
            count += 1;
        }
        assert_eq!(count, 2);

        // events without any subscriber are simply dropped
        drop(r);
        bus.emit(ReplicaEvent::PeerUp { peer });
    }
}
