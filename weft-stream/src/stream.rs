//! Direct stream: signed message framing, source routing, dedup,
//! delivery modes, ACK aggregation
//!
//! One engine task per peer owns the routing table, the seen cache
//! and the sessions. Callers go through a `StreamHandle`, whose
//! publish requests are matched to incoming ACKs by per-request
//! continuation actors.

use async_oneshot::oneshot;
use async_std::task;
use debug_print::*;
use futures::{select, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use xactor::{message, Actor, Handler, WeakAddr};

use crate::dedup::*;
use crate::routes::*;
use crate::session::*;
use crate::transport::*;
use weft::types::*;
use weft::utils::{now_timestamp, peer_hash};
use weft_net::errors::*;
use weft_net::types::*;

/// How long a publish waits for its ACKs
pub const ACK_TIMEOUT: u64 = 10_000;

/// Relays drop seek messages this long after their creation
pub const SEEK_TTL: u64 = 10_000;

/// Minimum delay between two dial attempts towards the same peer
pub const AUTO_DIAL_RETRY: u64 = 5_000;

/// Bound of the seen-set
pub const SEEN_CAPACITY: usize = 8192;

/// Lifetime of a learned route
pub const ROUTE_TTL: u64 = 600_000;

#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    pub ack_timeout: u64,
    pub seek_ttl: u64,
    pub auto_dial_retry: u64,
    pub seen_capacity: usize,
    pub route_ttl: u64,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            ack_timeout: ACK_TIMEOUT,
            seek_ttl: SEEK_TTL,
            auto_dial_retry: AUTO_DIAL_RETRY,
            seen_capacity: SEEN_CAPACITY,
            route_ttl: ROUTE_TTL,
        }
    }
}

/// What a publish achieved
#[derive(Clone, Debug, PartialEq)]
pub struct PublishOutcome {
    /// Peers that confirmed delivery, or were sent to for silent
    /// deliveries
    pub delivered: Vec<PeerHash>,

    /// Sum of ACK seen counters: how many redundant paths delivered
    /// the message
    pub dupes: u64,
}

#[derive(Debug)]
pub enum PublishError {
    /// No way to move the message at all; carries the targets the
    /// routing table could reach at publish time
    NoRoute { reachable: Vec<PeerHash> },

    /// Some or all expected ACKs never arrived
    Timeout { acked: Vec<PeerHash> },

    Closed,

    Protocol(ProtocolError),
}

/// What the engine reports upwards
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A data payload addressed to this peer
    Data { from: PeerHash, payload: Vec<u8> },

    /// A session completed its handshake
    PeerEstablished { peer: PeerId },

    /// A session went away
    PeerLeft { peer: PeerId },
}

#[message]
struct AckXActor {
    from: PeerHash,
    seen_counter: u64,
}

#[message]
struct AckDeadlineXActor;

/// Per-publish continuation resolving once the expected ACKs arrived
/// or the deadline fired
struct AckActor {
    expected: Option<HashSet<PeerHash>>,
    acked: Vec<PeerHash>,
    dupes: u64,
    s: Option<async_oneshot::Sender<(Vec<PeerHash>, u64)>>,
    r: Option<async_oneshot::Receiver<(Vec<PeerHash>, u64)>>,
}

impl Actor for AckActor {}

impl AckActor {
    fn new(expected: Option<HashSet<PeerHash>>) -> AckActor {
        let (s, r) = oneshot::<(Vec<PeerHash>, u64)>();
        AckActor {
            expected,
            acked: vec![],
            dupes: 0,
            s: Some(s),
            r: Some(r),
        }
    }

    fn receiver(&mut self) -> async_oneshot::Receiver<(Vec<PeerHash>, u64)> {
        self.r.take().unwrap()
    }

    fn resolve(&mut self) {
        if let Some(mut s) = self.s.take() {
            let _ = s.send((self.acked.clone(), self.dupes));
        }
    }
}

#[async_trait::async_trait]
impl Handler<AckXActor> for AckActor {
    async fn handle(&mut self, ctx: &mut xactor::Context<Self>, msg: AckXActor) {
        self.dupes += msg.seen_counter;
        match &mut self.expected {
            Some(set) => {
                if set.remove(&msg.from) {
                    self.acked.push(msg.from);
                }
                if set.is_empty() {
                    self.resolve();
                    ctx.stop(None);
                }
            }
            None => {
                if !self.acked.contains(&msg.from) {
                    self.acked.push(msg.from);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler<AckDeadlineXActor> for AckActor {
    async fn handle(&mut self, ctx: &mut xactor::Context<Self>, _msg: AckDeadlineXActor) {
        self.resolve();
        ctx.stop(None);
    }
}

struct PendingAck {
    addr: WeakAddr<AckActor>,
    sent_at: Timestamp,
}

enum StreamCmd {
    Publish {
        payload: Vec<u8>,
        to: Option<Vec<PeerHash>>,
        mode: DeliveryMode,
        reply: async_oneshot::Sender<Result<PublishOutcome, PublishError>>,
    },

    /// Teach the engine a peer identity so it can auto-dial the hash
    IntroducePeer(PeerId),

    Established {
        reply: async_oneshot::Sender<Vec<PeerId>>,
    },

    NextHop {
        target: PeerHash,
        reply: async_oneshot::Sender<Option<PeerId>>,
    },

    Close {
        reply: async_oneshot::Sender<()>,
    },
}

/// Cheap clonable front of one peer's direct stream
#[derive(Clone)]
pub struct StreamHandle {
    peer: PeerId,
    hash: PeerHash,
    cmd_s: async_channel::Sender<StreamCmd>,
    events_r: async_channel::Receiver<StreamEvent>,
}

impl StreamHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn hash(&self) -> PeerHash {
        self.hash
    }

    /// Stream of data deliveries and session changes
    pub fn events(&self) -> async_channel::Receiver<StreamEvent> {
        self.events_r.clone()
    }

    /// Publish a payload
    ///
    /// With an explicit `to` the message travels only to those peers.
    /// Without one it reaches every peer the chosen mode can find.
    pub async fn publish(
        &self,
        payload: Vec<u8>,
        to: Option<Vec<PeerHash>>,
        mode: DeliveryMode,
    ) -> Result<PublishOutcome, PublishError> {
        let (s, r) = oneshot();
        self.cmd_s
            .send(StreamCmd::Publish {
                payload,
                to,
                mode,
                reply: s,
            })
            .await
            .map_err(|_e| PublishError::Closed)?;
        r.await.map_err(|_e| PublishError::Closed)?
    }

    pub async fn introduce_peer(&self, peer: PeerId) {
        let _ = self.cmd_s.send(StreamCmd::IntroducePeer(peer)).await;
    }

    /// Peers with a completed handshake
    pub async fn established(&self) -> Vec<PeerId> {
        let (s, r) = oneshot();
        if self
            .cmd_s
            .send(StreamCmd::Established { reply: s })
            .await
            .is_err()
        {
            return vec![];
        }
        r.await.unwrap_or(vec![])
    }

    /// Primary next hop towards a target, for diagnostics
    pub async fn next_hop(&self, target: PeerHash) -> Option<PeerId> {
        let (s, r) = oneshot();
        if self
            .cmd_s
            .send(StreamCmd::NextHop { target, reply: s })
            .await
            .is_err()
        {
            return None;
        }
        r.await.unwrap_or(None)
    }

    /// Say goodbye to every neighbor and stop the engine
    pub async fn close(&self) {
        let (s, r) = oneshot();
        if self.cmd_s.send(StreamCmd::Close { reply: s }).await.is_ok() {
            let _ = r.await;
        }
    }
}

enum PublishStart {
    Done(Result<PublishOutcome, PublishError>),
    Waiting {
        receiver: async_oneshot::Receiver<(Vec<PeerHash>, u64)>,
        expected: Vec<PeerHash>,
        reachable: Vec<PeerHash>,
    },
}

/// The engine behind a `StreamHandle`
pub struct DirectStream {
    identity: (PrivKey, PubKey),
    hash: PeerHash,
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    routes: RoutingTable,
    seen: SeenCache,
    sessions: HashMap<PeerId, PeerSession>,

    /// Peer identities learned from Hellos and introductions,
    /// needed to auto-dial a bare hash
    known_peers: HashMap<PeerHash, PeerId>,

    last_dial: HashMap<PeerHash, Timestamp>,
    pending_acks: Arc<RwLock<HashMap<[u8; 32], PendingAck>>>,
    events_s: async_channel::Sender<StreamEvent>,
}

impl DirectStream {
    /// Spawn the engine task and hand back its front
    pub fn start(
        identity: (PrivKey, PubKey),
        transport: Arc<dyn Transport>,
        config: StreamConfig,
    ) -> StreamHandle {
        let (cmd_s, cmd_r) = async_channel::unbounded();
        let (events_s, events_r) = async_channel::unbounded();
        let peer = identity.1;
        let hash = peer_hash(&peer);
        let engine = DirectStream {
            identity,
            hash,
            config,
            transport,
            routes: RoutingTable::new(config.route_ttl),
            seen: SeenCache::new(config.seen_capacity),
            sessions: HashMap::new(),
            known_peers: HashMap::new(),
            last_dial: HashMap::new(),
            pending_acks: Arc::new(RwLock::new(HashMap::new())),
            events_s,
        };
        task::spawn(engine.run(cmd_r));
        StreamHandle {
            peer,
            hash,
            cmd_s,
            events_r,
        }
    }

    async fn run(mut self, cmd_r: async_channel::Receiver<StreamCmd>) {
        let transport_r = self.transport.events();
        loop {
            select! {
                ev = transport_r.recv().fuse() => match ev {
                    Ok(ev) => self.handle_transport(ev).await,
                    Err(_e) => break,
                },
                cmd = cmd_r.recv().fuse() => match cmd {
                    Ok(StreamCmd::Close { mut reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Ok(cmd) => self.handle_cmd(cmd).await,
                    Err(_e) => break,
                },
            }
        }
        debug_println!("end of stream engine loop");
    }

    async fn shutdown(&mut self) {
        let neighbors: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_established())
            .map(|s| s.peer())
            .collect();
        let mut goodbye = Message::Goodbye(GoodbyeMessage::V0(GoodbyeMessageV0 {
            header: MessageHeader::new(Some(self.hash), vec![], 0),
            peer: self.identity.1,
        }));
        if goodbye.sign(self.identity.0, self.identity.1).is_ok() {
            let frame = serde_bare::to_vec(&goodbye).unwrap();
            for peer in neighbors {
                let _ = self.transport.send(&peer, frame.clone()).await;
            }
        }
        self.sessions.clear();
    }

    async fn handle_cmd(&mut self, cmd: StreamCmd) {
        match cmd {
            StreamCmd::Publish {
                payload,
                to,
                mode,
                mut reply,
            } => match self.start_publish(payload, to, mode).await {
                PublishStart::Done(res) => {
                    let _ = reply.send(res);
                }
                PublishStart::Waiting {
                    receiver,
                    expected,
                    reachable,
                } => {
                    task::spawn(async move {
                        let res = match receiver.await {
                            Err(_e) => Err(PublishError::Closed),
                            Ok((acked, dupes)) => match mode {
                                DeliveryMode::Acknowledged { .. } => {
                                    if !expected.is_empty() && acked.len() < expected.len() {
                                        Err(PublishError::Timeout { acked })
                                    } else {
                                        Ok(PublishOutcome {
                                            delivered: acked,
                                            dupes,
                                        })
                                    }
                                }
                                DeliveryMode::Seek { .. } => {
                                    if acked.is_empty() {
                                        Err(PublishError::NoRoute { reachable })
                                    } else {
                                        Ok(PublishOutcome {
                                            delivered: acked,
                                            dupes,
                                        })
                                    }
                                }
                                DeliveryMode::Silent { .. } => Ok(PublishOutcome {
                                    delivered: acked,
                                    dupes,
                                }),
                            },
                        };
                        let _ = reply.send(res);
                    });
                }
            },
            StreamCmd::IntroducePeer(peer) => {
                self.known_peers.insert(peer_hash(&peer), peer);
            }
            StreamCmd::Established { mut reply } => {
                let mut peers: Vec<PeerId> = self
                    .sessions
                    .values()
                    .filter(|s| s.is_established())
                    .map(|s| s.peer())
                    .collect();
                peers.sort();
                let _ = reply.send(peers);
            }
            StreamCmd::NextHop { target, mut reply } => {
                let _ = reply.send(self.routes.next_hop(&target, now_timestamp()));
            }
            StreamCmd::Close { .. } => unreachable!(),
        }
    }

    fn established_neighbors(&self, except: Option<&PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_established() && Some(&s.peer()) != except)
            .map(|s| s.peer())
            .collect();
        peers.sort();
        peers
    }

    async fn send_message(&self, to: &PeerId, msg: &Message) -> Result<(), ProtocolError> {
        let frame = serde_bare::to_vec(msg)?;
        self.transport.send(to, frame).await
    }

    async fn start_publish(
        &mut self,
        payload: Vec<u8>,
        to: Option<Vec<PeerHash>>,
        mode: DeliveryMode,
    ) -> PublishStart {
        let now = now_timestamp();
        let ttl = match mode {
            DeliveryMode::Seek { .. } => self.config.seek_ttl,
            _ => self.config.ack_timeout,
        };
        let to_list = to.unwrap_or(vec![]);
        let mut msg = Message::Data(DataMessage::V0(DataMessageV0 {
            header: MessageHeader::new(Some(self.hash), to_list.clone(), now + ttl),
            mode,
            payload,
        }));
        if let Err(e) = msg.sign(self.identity.0, self.identity.1) {
            return PublishStart::Done(Err(PublishError::Protocol(e.into())));
        }
        // our own fanout must not come back to us
        self.seen.insert(msg.msg_id(), self.identity.1);

        let links: Vec<PeerId> = match mode {
            DeliveryMode::Seek { .. } => self.established_neighbors(None),
            _ => {
                if to_list.is_empty() {
                    let all = self.established_neighbors(None);
                    all.into_iter()
                        .take((mode.redundancy() as usize).max(1))
                        .collect()
                } else {
                    self.routed_links(&to_list, mode.redundancy(), now).await
                }
            }
        };
        if links.is_empty() {
            return PublishStart::Done(Err(PublishError::NoRoute {
                reachable: self.routes.reachable(now),
            }));
        }
        for link in &links {
            if let Err(e) = self.send_message(link, &msg).await {
                debug_println!("publish: send to {} failed: {:?}", link, e);
            }
        }

        if !mode.expects_acks() {
            return PublishStart::Done(Ok(PublishOutcome {
                delivered: to_list,
                dupes: 0,
            }));
        }

        let expected_set = if to_list.is_empty() {
            None
        } else {
            Some(to_list.into_iter().collect::<HashSet<PeerHash>>())
        };
        let expected: Vec<PeerHash> = expected_set
            .as_ref()
            .map_or(vec![], |set| set.iter().cloned().collect());
        let mut actor = AckActor::new(expected_set);
        let receiver = actor.receiver();
        let addr = match actor.start().await {
            Ok(addr) => addr,
            Err(_e) => return PublishStart::Done(Err(PublishError::Protocol(ProtocolError::ActorError))),
        };

        let ack_id = *msg.header().id();
        {
            let mut map = self.pending_acks.write().expect("RwLock poisoned");
            map.insert(
                ack_id,
                PendingAck {
                    addr: addr.downgrade(),
                    sent_at: now,
                },
            );
        }
        let pending_in_task = Arc::clone(&self.pending_acks);
        let mut addr_for_cleanup = addr.clone();
        task::spawn(async move {
            addr_for_cleanup.wait_for_stop().await;
            let mut map = pending_in_task.write().expect("RwLock poisoned");
            map.remove(&ack_id);
        });

        let deadline = self.config.ack_timeout;
        task::spawn(async move {
            task::sleep(Duration::from_millis(deadline)).await;
            let _ = addr.send(AckDeadlineXActor);
        });

        PublishStart::Waiting {
            receiver,
            expected,
            reachable: self.routes.reachable(now),
        }
    }

    /// Pick the links for a routed delivery: known targets through
    /// their best next hop, unknown ones broadcast to up to
    /// `redundancy` neighbors, dialing the ones we can identify
    async fn routed_links(
        &mut self,
        to_list: &[PeerHash],
        redundancy: u8,
        now: Timestamp,
    ) -> Vec<PeerId> {
        let mut links: Vec<PeerId> = vec![];
        let mut unknown = 0usize;
        for target in to_list {
            // a direct session always beats the routing table
            if let Some(peer) = self.known_peers.get(target) {
                if self
                    .sessions
                    .get(peer)
                    .map_or(false, |s| s.is_established())
                {
                    if !links.contains(peer) {
                        links.push(*peer);
                    }
                    continue;
                }
            }
            match self.routes.next_hop(target, now) {
                Some(hop) => {
                    if !links.contains(&hop) {
                        links.push(hop);
                    }
                }
                None => {
                    unknown += 1;
                    self.auto_dial(target, now).await;
                }
            }
        }
        if unknown > 0 {
            for peer in self.established_neighbors(None) {
                if links.len() >= to_list.len() + redundancy as usize {
                    break;
                }
                if !links.contains(&peer) {
                    links.push(peer);
                }
            }
        }
        links
    }

    /// Try a direct connection towards a target we cannot route to,
    /// bounded by the retry delay
    async fn auto_dial(&mut self, target: &PeerHash, now: Timestamp) {
        let peer = match self.known_peers.get(target) {
            Some(peer) => *peer,
            None => return,
        };
        match self.last_dial.get(target) {
            Some(last) if now < *last + self.config.auto_dial_retry => return,
            _ => (),
        }
        self.last_dial.insert(*target, now);
        debug_println!("auto-dialing {}", target);
        let _ = self.transport.dial(&peer).await;
    }

    async fn handle_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::PeerUp(peer) => {
                let mut session = PeerSession::new(peer);
                self.known_peers.insert(*session.hash(), peer);
                if self.send_hello(&peer).await.is_ok() {
                    let _ = session.hello_sent();
                }
                self.sessions.insert(peer, session);
            }
            TransportEvent::PeerDown(peer) => {
                self.drop_session(&peer);
            }
            TransportEvent::Frame(from, frame) => match serde_bare::from_slice::<Message>(&frame) {
                Ok(msg) => self.handle_message(from, msg).await,
                Err(_e) => {
                    debug_println!("dropping undecodable frame from {}", from);
                }
            },
        }
    }

    async fn send_hello(&self, to: &PeerId) -> Result<(), ProtocolError> {
        let mut hello = Message::Hello(HelloMessage::V0(HelloMessageV0 {
            header: MessageHeader::new(Some(self.hash), vec![], 0),
            peer: self.identity.1,
        }));
        hello
            .sign(self.identity.0, self.identity.1)
            .map_err(|e| ProtocolError::from(e))?;
        self.send_message(to, &hello).await
    }

    fn drop_session(&mut self, peer: &PeerId) {
        let was_established = self
            .sessions
            .remove(peer)
            .map_or(false, |s| s.is_established());
        self.routes.evict_peer(peer);
        if was_established {
            let _ = self
                .events_s
                .try_send(StreamEvent::PeerLeft { peer: *peer });
        }
    }

    fn is_local_target(&self, to: &[PeerHash]) -> bool {
        to.is_empty() || to.contains(&self.hash)
    }

    async fn handle_message(&mut self, from: PeerId, msg: Message) {
        let now = now_timestamp();
        if msg.header().expires() > 0 && now > msg.header().expires() {
            debug_println!("dropping expired message from {}", from);
            return;
        }
        if !self.seen.insert(msg.msg_id(), from) {
            // the origin still learns about the redundant path
            if let Message::Data(DataMessage::V0(m)) = &msg {
                if m.mode.expects_acks() && self.is_local_target(m.header.to()) {
                    let _ = self.send_ack(&from, &m.header, 1).await;
                }
            }
            return;
        }
        if msg.verify_sigs().is_err() {
            debug_println!("dropping message with invalid signature from {}", from);
            return;
        }
        match msg {
            Message::Hello(HelloMessage::V0(h)) => self.handle_hello(from, h),
            Message::Goodbye(GoodbyeMessage::V0(g)) => self.handle_goodbye(from, g),
            Message::Ack(AckMessage::V0(a)) => self.handle_ack(from, a, now).await,
            Message::Data(DataMessage::V0(d)) => self.handle_data(from, d, now).await,
        }
    }

    fn handle_hello(&mut self, from: PeerId, hello: HelloMessageV0) {
        let session = match self.sessions.get_mut(&from) {
            Some(s) => s,
            None => {
                debug_println!("hello from unknown link {}", from);
                return;
            }
        };
        if session.is_established() {
            return;
        }
        match session.hello_received(&hello.peer) {
            Ok(()) => {
                if session.is_established() {
                    let _ = self
                        .events_s
                        .try_send(StreamEvent::PeerEstablished { peer: from });
                }
            }
            Err(e) => {
                debug_println!("rejecting hello from {}: {:?}", from, e);
                self.sessions.remove(&from);
            }
        }
    }

    fn handle_goodbye(&mut self, from: PeerId, goodbye: GoodbyeMessageV0) {
        if goodbye.peer != from {
            debug_println!("goodbye for {} relayed by {}, ignoring", goodbye.peer, from);
            return;
        }
        if let Some(session) = self.sessions.get_mut(&from) {
            let _ = session.goodbye_received();
        }
        self.drop_session(&from);
    }

    async fn handle_ack(&mut self, from: PeerId, ack: AckMessageV0, now: Timestamp) {
        let origin = match ack.header.origin() {
            Some(origin) => *origin,
            None => {
                debug_println!("ack without origin from {}", from);
                return;
            }
        };

        let (addr, sent_at) = {
            let map = self.pending_acks.read().expect("RwLock poisoned");
            match map.get(&ack.ack_for) {
                Some(p) => (p.addr.upgrade(), Some(p.sent_at)),
                None => (None, None),
            }
        };

        // the ACK teaches us a route towards the acking peer
        let rtt = match sent_at {
            Some(sent_at) => now.saturating_sub(sent_at),
            None => now.saturating_sub(ack.header.timestamp()),
        };
        self.routes.learn(origin, from, rtt.max(1), now);

        match (addr, sent_at) {
            (Some(addr), _) => {
                let _ = addr.send(AckXActor {
                    from: origin,
                    seen_counter: ack.seen_counter,
                });
            }
            (None, Some(_)) => {
                debug_println!("ack for a finished publish, dropping");
            }
            (None, None) => {
                // not ours: relay towards the origin of the acked
                // message, preferring the reverse of the arrival path
                let data_id = data_msg_id(&ack.ack_for);
                let link = match self.seen.arrival(&data_id) {
                    Some(link) => Some(*link),
                    None => match ack.header.to().first() {
                        Some(target) => self.routes.next_hop(target, now),
                        None => None,
                    },
                };
                match link {
                    Some(link) => {
                        let _ = self
                            .send_message(&link, &Message::Ack(AckMessage::V0(ack)))
                            .await;
                    }
                    None => {
                        debug_println!("no reverse path for ack, dropping");
                    }
                }
            }
        }
    }

    async fn handle_data(&mut self, from: PeerId, data: DataMessageV0, now: Timestamp) {
        match self.sessions.get(&from) {
            Some(s) if s.is_established() => (),
            _ => {
                debug_println!("data on a session without handshake, dropping");
                return;
            }
        }

        let to = data.header.to().clone();
        if self.is_local_target(&to) {
            let origin = match data.header.origin() {
                Some(origin) => *origin,
                None => peer_hash(&from),
            };
            let _ = self.events_s.try_send(StreamEvent::Data {
                from: origin,
                payload: data.payload.clone(),
            });
            if data.mode.expects_acks() {
                let _ = self.send_ack(&from, &data.header, 0).await;
            }
        }

        self.relay(from, data, to, now).await;
    }

    /// Source-routed relaying: split the target list by next hop,
    /// fan unknown targets out bounded by the redundancy, flood seeks
    /// and broadcasts
    async fn relay(&mut self, from: PeerId, data: DataMessageV0, to: Vec<PeerHash>, now: Timestamp) {
        let flood = to.is_empty() || matches!(data.mode, DeliveryMode::Seek { .. });
        if flood {
            let msg = Message::Data(DataMessage::V0(data));
            for peer in self.established_neighbors(Some(&from)) {
                let _ = self.send_message(&peer, &msg).await;
            }
            return;
        }

        let remaining: Vec<PeerHash> = to.into_iter().filter(|t| *t != self.hash).collect();
        if remaining.is_empty() {
            return;
        }

        let mut by_hop: HashMap<PeerId, Vec<PeerHash>> = HashMap::new();
        let mut unknown: Vec<PeerHash> = vec![];
        for target in remaining {
            // a direct session short-circuits the routing table
            let hop = match self.known_peers.get(&target) {
                Some(peer)
                    if self
                        .sessions
                        .get(peer)
                        .map_or(false, |s| s.is_established()) =>
                {
                    Some(*peer)
                }
                _ => self.routes.next_hop(&target, now),
            };
            match hop {
                Some(hop) if hop != from => by_hop.entry(hop).or_insert(vec![]).push(target),
                _ => unknown.push(target),
            }
        }

        for (hop, targets) in by_hop {
            let mut branch = data.clone();
            branch.header.set_to(targets);
            let _ = self
                .send_message(&hop, &Message::Data(DataMessage::V0(branch)))
                .await;
        }

        if !unknown.is_empty() {
            let mut branch = data.clone();
            branch.header.set_to(unknown);
            let msg = Message::Data(DataMessage::V0(branch));
            for peer in self
                .established_neighbors(Some(&from))
                .into_iter()
                .take((data.mode.redundancy() as usize).max(1))
            {
                let _ = self.send_message(&peer, &msg).await;
            }
        }
    }

    async fn send_ack(
        &mut self,
        link: &PeerId,
        acked: &MessageHeader,
        seen_counter: u64,
    ) -> Result<(), ProtocolError> {
        let to = match acked.origin() {
            Some(origin) => vec![*origin],
            None => vec![],
        };
        let mut ack = Message::Ack(AckMessage::V0(AckMessageV0 {
            header: MessageHeader::new(Some(self.hash), to, acked.expires()),
            ack_for: *acked.id(),
            seen_counter,
        }));
        ack.sign(self.identity.0, self.identity.1)
            .map_err(ProtocolError::from)?;
        self.seen.insert(ack.msg_id(), self.identity.1);
        self.send_message(link, &ack).await
    }
}

/// Dedup key of the data message a given header id belongs to
fn data_msg_id(id: &[u8; 32]) -> MsgId {
    let mut bytes = Vec::with_capacity(33);
    bytes.push(0u8);
    bytes.extend_from_slice(id);
    Digest::Blake3Digest32(*blake3::hash(bytes.as_slice()).as_bytes())
}

#[cfg(test)]
mod test {
    use crate::stream::*;
    use crate::transport::MemHub;
    use async_std::task;
    use std::sync::Arc;
    use std::time::Duration;
    use weft::types::*;
    use weft::utils::{generate_keypair, peer_hash};

    async fn wait_established(handle: &StreamHandle, count: usize) {
        for _ in 0..200 {
            if handle.established().await.len() >= count {
                return;
            }
            task::sleep(Duration::from_millis(5)).await;
        }
        panic!("sessions never established");
    }

    fn quick() -> StreamConfig {
        StreamConfig {
            ack_timeout: 2_000,
            seek_ttl: 2_000,
            ..StreamConfig::default()
        }
    }

    #[async_std::test]
    pub async fn test_acknowledged_delivery() {
        let hub = MemHub::new();
        let id_a = generate_keypair();
        let id_b = generate_keypair();
        let (a, b) = (id_a.1, id_b.1);

        let sa = DirectStream::start(id_a, Arc::new(hub.endpoint(a)), quick());
        let sb = DirectStream::start(id_b, Arc::new(hub.endpoint(b)), quick());
        hub.connect(&a, &b, 0);
        wait_established(&sa, 1).await;
        wait_established(&sb, 1).await;

        let events_b = sb.events();
        let outcome = sa
            .publish(
                b"ping".to_vec(),
                Some(vec![sb.hash()]),
                DeliveryMode::Acknowledged { redundancy: 1 },
            )
            .await
            .expect("delivery should be acknowledged");
        assert_eq!(outcome.delivered, vec![sb.hash()]);

        loop {
            match events_b.recv().await.unwrap() {
                StreamEvent::Data { from, payload } => {
                    assert_eq!(from, sa.hash());
                    assert_eq!(payload, b"ping".to_vec());
                    break;
                }
                _ => continue,
            }
        }
    }

    #[async_std::test]
    pub async fn test_silent_needs_route() {
        let hub = MemHub::new();
        let id_a = generate_keypair();
        let a = id_a.1;
        let sa = DirectStream::start(id_a, Arc::new(hub.endpoint(a)), quick());

        let target = peer_hash(&generate_keypair().1);
        let res = sa
            .publish(
                b"void".to_vec(),
                Some(vec![target]),
                DeliveryMode::Silent { redundancy: 1 },
            )
            .await;
        match res {
            Err(PublishError::NoRoute { reachable }) => assert!(reachable.is_empty()),
            other => panic!("expected NoRoute, got {:?}", other),
        }
    }

    #[async_std::test]
    pub async fn test_seek_learns_shortest_path() {
        let hub = MemHub::new();
        let ids: Vec<(PrivKey, PubKey)> = (0..4).map(|_i| generate_keypair()).collect();
        let peers: Vec<PeerId> = ids.iter().map(|id| id.1).collect();
        let handles: Vec<StreamHandle> = ids
            .iter()
            .map(|id| DirectStream::start(*id, Arc::new(hub.endpoint(id.1)), quick()))
            .collect();

        // a line: 0 - 1 - 2 - 3
        hub.connect(&peers[0], &peers[1], 10);
        hub.connect(&peers[1], &peers[2], 10);
        hub.connect(&peers[2], &peers[3], 10);
        wait_established(&handles[0], 1).await;
        wait_established(&handles[1], 2).await;
        wait_established(&handles[2], 2).await;
        wait_established(&handles[3], 1).await;

        let target = handles[3].hash();
        let outcome = handles[0]
            .publish(
                b"find".to_vec(),
                Some(vec![target]),
                DeliveryMode::Seek { redundancy: 1 },
            )
            .await
            .expect("seek should reach the end of the line");
        assert_eq!(outcome.delivered, vec![target]);
        assert_eq!(handles[0].next_hop(target).await, Some(peers[1]));

        // a shortcut 0 - 2 makes the two-hop path win the next seek
        hub.connect(&peers[0], &peers[2], 10);
        wait_established(&handles[0], 2).await;
        handles[0]
            .publish(
                b"again".to_vec(),
                Some(vec![target]),
                DeliveryMode::Seek { redundancy: 1 },
            )
            .await
            .expect("seek should still reach the target");
        assert_eq!(handles[0].next_hop(target).await, Some(peers[2]));
    }

    #[async_std::test]
    pub async fn test_routed_delivery_after_seek() {
        let hub = MemHub::new();
        let ids: Vec<(PrivKey, PubKey)> = (0..3).map(|_i| generate_keypair()).collect();
        let peers: Vec<PeerId> = ids.iter().map(|id| id.1).collect();
        let handles: Vec<StreamHandle> = ids
            .iter()
            .map(|id| DirectStream::start(*id, Arc::new(hub.endpoint(id.1)), quick()))
            .collect();

        hub.connect(&peers[0], &peers[1], 5);
        hub.connect(&peers[1], &peers[2], 5);
        wait_established(&handles[0], 1).await;
        wait_established(&handles[1], 2).await;
        wait_established(&handles[2], 1).await;

        let target = handles[2].hash();
        handles[0]
            .publish(
                b"hello".to_vec(),
                Some(vec![target]),
                DeliveryMode::Seek { redundancy: 1 },
            )
            .await
            .expect("seek failed");

        // with the route known, an acknowledged delivery goes through
        // the middle peer without flooding
        let outcome = handles[0]
            .publish(
                b"routed".to_vec(),
                Some(vec![target]),
                DeliveryMode::Acknowledged { redundancy: 1 },
            )
            .await
            .expect("routed delivery failed");
        assert_eq!(outcome.delivered, vec![target]);

        let events = handles[2].events();
        let mut payloads = vec![];
        while let Ok(ev) = events.try_recv() {
            if let StreamEvent::Data { payload, .. } = ev {
                payloads.push(payload);
            }
        }
        assert!(payloads.contains(&b"hello".to_vec()));
        assert!(payloads.contains(&b"routed".to_vec()));
    }

    #[async_std::test]
    pub async fn test_goodbye_drops_session() {
        let hub = MemHub::new();
        let id_a = generate_keypair();
        let id_b = generate_keypair();
        let (a, b) = (id_a.1, id_b.1);
        let sa = DirectStream::start(id_a, Arc::new(hub.endpoint(a)), quick());
        let sb = DirectStream::start(id_b, Arc::new(hub.endpoint(b)), quick());
        hub.connect(&a, &b, 0);
        wait_established(&sa, 1).await;
        wait_established(&sb, 1).await;

        sb.close().await;
        for _ in 0..200 {
            if sa.established().await.is_empty() {
                return;
            }
            task::sleep(Duration::from_millis(5)).await;
        }
        panic!("goodbye never dropped the session");
    }
}
