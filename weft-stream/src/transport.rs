//! Transport seam under the direct stream
//!
//! The lowest layer hands us duplex frame streams to directly
//! connected peers and peer-up/peer-down notifications. The in-memory
//! mesh below is the reference implementation used by tests and by
//! multi-peer demos; `weft-node` provides a WebSocket-backed one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_std::task;
use std::time::Duration;
use weft::types::*;
use weft_net::errors::*;

/// What the transport reports upwards
#[derive(Clone, Debug)]
pub enum TransportEvent {
    PeerUp(PeerId),
    PeerDown(PeerId),
    Frame(PeerId, Vec<u8>),
}

/// Duplex frame streams to directly connected peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to a directly connected peer
    async fn send(&self, to: &PeerId, frame: Vec<u8>) -> Result<(), ProtocolError>;

    /// Try to open a direct connection
    async fn dial(&self, to: &PeerId) -> Result<(), ProtocolError>;

    /// Currently connected peers
    fn neighbors(&self) -> Vec<PeerId>;

    /// Stream of transport events
    fn events(&self) -> async_channel::Receiver<TransportEvent>;
}

struct MemPeer {
    events: async_channel::Sender<TransportEvent>,

    /// Link latency towards each connected peer, in milliseconds
    links: HashMap<PeerId, u64>,
}

/// Shared state of an in-memory mesh
pub struct MemHub {
    peers: Arc<RwLock<HashMap<PeerId, MemPeer>>>,
}

impl MemHub {
    pub fn new() -> MemHub {
        MemHub {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a peer and get its transport end
    pub fn endpoint(&self, peer: PeerId) -> MemTransport {
        let (s, r) = async_channel::unbounded();
        let mut map = self.peers.write().expect("RwLock poisoned");
        map.insert(
            peer,
            MemPeer {
                events: s,
                links: HashMap::new(),
            },
        );
        MemTransport {
            peer,
            events_r: r,
            peers: Arc::clone(&self.peers),
        }
    }

    /// Connect two registered peers with the given link latency
    pub fn connect(&self, a: &PeerId, b: &PeerId, latency: u64) {
        let mut map = self.peers.write().expect("RwLock poisoned");
        if !map.contains_key(a) || !map.contains_key(b) {
            return;
        }
        map.get_mut(a).unwrap().links.insert(*b, latency);
        map.get_mut(b).unwrap().links.insert(*a, latency);
        let _ = map[a].events.try_send(TransportEvent::PeerUp(*b));
        let _ = map[b].events.try_send(TransportEvent::PeerUp(*a));
    }

    /// Tear a link down
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut map = self.peers.write().expect("RwLock poisoned");
        if let Some(pa) = map.get_mut(a) {
            pa.links.remove(b);
            let _ = pa.events.try_send(TransportEvent::PeerDown(*b));
        }
        if let Some(pb) = map.get_mut(b) {
            pb.links.remove(a);
            let _ = pb.events.try_send(TransportEvent::PeerDown(*a));
        }
    }

    /// Drop a peer and all of its links
    pub fn drop_peer(&self, peer: &PeerId) {
        let mut map = self.peers.write().expect("RwLock poisoned");
        let linked: Vec<PeerId> = match map.remove(peer) {
            Some(p) => p.links.keys().cloned().collect(),
            None => return,
        };
        for other in linked {
            if let Some(po) = map.get_mut(&other) {
                po.links.remove(peer);
                let _ = po.events.try_send(TransportEvent::PeerDown(*peer));
            }
        }
    }
}

/// One peer's end of the in-memory mesh
pub struct MemTransport {
    peer: PeerId,
    events_r: async_channel::Receiver<TransportEvent>,
    peers: Arc<RwLock<HashMap<PeerId, MemPeer>>>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, to: &PeerId, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let (sender, latency) = {
            let map = self.peers.read().expect("RwLock poisoned");
            let me = map.get(&self.peer).ok_or(ProtocolError::TransportFatal)?;
            let latency = *me.links.get(to).ok_or(ProtocolError::CannotSend)?;
            let target = map.get(to).ok_or(ProtocolError::CannotSend)?;
            (target.events.clone(), latency)
        };
        let from = self.peer;
        task::spawn(async move {
            if latency > 0 {
                task::sleep(Duration::from_millis(latency)).await;
            }
            let _ = sender.try_send(TransportEvent::Frame(from, frame));
        });
        Ok(())
    }

    async fn dial(&self, to: &PeerId) -> Result<(), ProtocolError> {
        let mut map = self.peers.write().expect("RwLock poisoned");
        if !map.contains_key(to) {
            return Err(ProtocolError::NoRoute);
        }
        if map[&self.peer].links.contains_key(to) {
            return Ok(());
        }
        let me = self.peer;
        map.get_mut(&me).unwrap().links.insert(*to, 1);
        map.get_mut(to).unwrap().links.insert(me, 1);
        let _ = map[&me].events.try_send(TransportEvent::PeerUp(*to));
        let _ = map[to].events.try_send(TransportEvent::PeerUp(me));
        Ok(())
    }

    fn neighbors(&self) -> Vec<PeerId> {
        let map = self.peers.read().expect("RwLock poisoned");
        match map.get(&self.peer) {
            Some(p) => {
                let mut linked: Vec<PeerId> = p.links.keys().cloned().collect();
                linked.sort();
                linked
            }
            None => vec![],
        }
    }

    fn events(&self) -> async_channel::Receiver<TransportEvent> {
        self.events_r.clone()
    }
}
