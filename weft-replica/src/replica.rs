//! Shared log: the replication engine
//!
//! One engine task per log owns the log, the ring, the per-group
//! leader history and every outstanding continuation. External
//! callers go through a `SharedLogHandle`; everything else arrives
//! through the direct stream.

use async_oneshot::oneshot;
use async_std::task;
use debug_print::*;
use futures::{select, FutureExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::*;
use crate::events::*;
use crate::pid::PidController;
use crate::ring::{ReplicationRange, Ring};
use weft::log::{Log, LogOptions};
use weft::store::BlockStore;
use weft::types::*;
use weft::utils::{hash_to_unit, now_timestamp, peer_hash};
use weft_net::errors::*;
use weft_net::types::*;
use weft_stream::stream::{StreamEvent, StreamHandle};

/// Engine housekeeping cadence
const TICK_INTERVAL: u64 = 250;

/// Point on the unit circle electing the leaders of a group
fn gid_cursor(gid: &GroupId) -> f64 {
    hash_to_unit(gid)
}

/// Ring position of a peer
fn ring_offset(peer: &PeerId) -> f64 {
    hash_to_unit(&peer_hash(peer))
}

/// A consistent view of one replica, for callers and tests
#[derive(Clone, Debug)]
pub struct ReplicaSnapshot {
    pub len: usize,
    pub heads: Vec<EntryId>,
    pub role: Role,
    pub ring_peers: usize,
    pub status: ReplicationInfoV0,
    pub stored_bytes: usize,
}

enum ReplicaCmd {
    Append {
        payload: Vec<u8>,
        reply: async_oneshot::Sender<Result<Entry, ProtocolError>>,
    },
    UpdateRole {
        role: RoleConfig,
        reply: async_oneshot::Sender<()>,
    },
    Snapshot {
        reply: async_oneshot::Sender<ReplicaSnapshot>,
    },
    Subscribe {
        reply: async_oneshot::Sender<async_broadcast::Receiver<ReplicaEvent>>,
    },
    Close {
        reply: async_oneshot::Sender<()>,
    },
}

/// Cheap clonable front of one shared log
#[derive(Clone)]
pub struct SharedLogHandle {
    log_id: LogId,
    peer: PeerId,
    cmd_s: async_channel::Sender<ReplicaCmd>,
}

impl SharedLogHandle {
    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Append a payload to the log and disseminate it to the leaders
    /// of its group
    pub async fn append(&self, payload: Vec<u8>) -> Result<Entry, ProtocolError> {
        let (s, r) = oneshot();
        self.cmd_s
            .send(ReplicaCmd::Append { payload, reply: s })
            .await
            .map_err(|_e| ProtocolError::Closed)?;
        r.await.map_err(|_e| ProtocolError::Closed)?
    }

    /// Switch between observing and replicating
    pub async fn update_role(&self, role: RoleConfig) -> Result<(), ProtocolError> {
        let (s, r) = oneshot();
        self.cmd_s
            .send(ReplicaCmd::UpdateRole { role, reply: s })
            .await
            .map_err(|_e| ProtocolError::Closed)?;
        r.await.map_err(|_e| ProtocolError::Closed)
    }

    pub async fn snapshot(&self) -> Option<ReplicaSnapshot> {
        let (s, r) = oneshot();
        self.cmd_s
            .send(ReplicaCmd::Snapshot { reply: s })
            .await
            .ok()?;
        r.await.ok()
    }

    pub async fn replication_status(&self) -> ReplicationInfoV0 {
        match self.snapshot().await {
            Some(snapshot) => snapshot.status,
            None => ReplicationInfoV0 {
                progress: 0,
                max: 0,
            },
        }
    }

    pub async fn subscribe(&self) -> Option<async_broadcast::Receiver<ReplicaEvent>> {
        let (s, r) = oneshot();
        self.cmd_s
            .send(ReplicaCmd::Subscribe { reply: s })
            .await
            .ok()?;
        r.await.ok()
    }

    /// Hand pending work off and stop the engine
    pub async fn close(&self) {
        let (s, r) = oneshot();
        if self.cmd_s.send(ReplicaCmd::Close { reply: s }).await.is_ok() {
            let _ = r.await;
        }
    }
}

/// Incoming heads waiting for this peer to become their leader
struct LeaderWait {
    gid: GroupId,
    entries: Vec<Entry>,
    min_replicas: u32,
    deadline: Timestamp,
}

/// One entry negotiating its removal
struct PruneState {
    confirmed: HashSet<PeerHash>,
    required: u32,
    deadline: Timestamp,
    retries: u8,
}

/// A prune inquiry for an entry we did not hold at the time
struct PendingIHave {
    from: PeerHash,
    deadline: Timestamp,
}

/// The engine behind a `SharedLogHandle`
pub struct SharedLog {
    identity: (PrivKey, PubKey),
    hash: PeerHash,
    config: ReplicaConfig,
    log: Log,
    store: Box<dyn BlockStore + Send>,
    stream: StreamHandle,
    ring: Ring,
    role: Role,

    /// Latest role timestamp seen per peer, stale announcements lose
    role_timestamps: HashMap<PeerId, Timestamp>,

    /// Leader set of the previous distribution pass, per group
    gid_peers_history: HashMap<GroupId, HashSet<PeerHash>>,

    leader_waits: Vec<LeaderWait>,
    pending_prunes: HashMap<EntryId, PruneState>,
    pending_ihave: HashMap<EntryId, PendingIHave>,

    /// Every entry this replica ever learned about, pruned or not
    known_entries: HashSet<EntryId>,

    pid: Option<PidController>,
    last_rebalance: Timestamp,

    events: EventBus,
}

impl SharedLog {
    /// Open a shared log over a direct stream and spawn its engine
    pub fn open(
        log_id: LogId,
        identity: (PrivKey, PubKey),
        store: Box<dyn BlockStore + Send>,
        stream: StreamHandle,
        config: ReplicaConfig,
    ) -> SharedLogHandle {
        let now = now_timestamp();
        let mut config = config;
        let mut options = LogOptions::new(identity);
        options.min_replicas = config.replicas.min;
        options.can_append = config.can_append.take();
        let log = Log::new(log_id, options);

        let role = config.role.to_role(now);
        let pid = match config.role {
            RoleConfig::Adaptive { memory_limit } => Some(PidController::new(memory_limit)),
            _ => None,
        };

        let mut engine = SharedLog {
            identity,
            hash: peer_hash(&identity.1),
            config,
            log,
            store,
            stream,
            ring: Ring::new(),
            role,
            role_timestamps: HashMap::new(),
            gid_peers_history: HashMap::new(),
            leader_waits: vec![],
            pending_prunes: HashMap::new(),
            pending_ihave: HashMap::new(),
            known_entries: HashSet::new(),
            pid,
            last_rebalance: now,
            events: EventBus::new(256),
        };
        engine.apply_own_role(now);

        let (cmd_s, cmd_r) = async_channel::unbounded();
        let handle = SharedLogHandle {
            log_id,
            peer: identity.1,
            cmd_s,
        };
        task::spawn(engine.run(cmd_r));
        handle
    }

    fn apply_own_role(&mut self, now: Timestamp) {
        let peer = self.identity.1;
        self.role_timestamps.insert(peer, self.role.timestamp());
        if self.role.is_replicator() {
            self.ring.insert_or_update(ReplicationRange {
                peer,
                offset: ring_offset(&peer),
                factor: self.role.factor(),
                timestamp: now,
            });
        } else {
            self.ring.remove(&peer);
        }
    }

    async fn run(mut self, cmd_r: async_channel::Receiver<ReplicaCmd>) {
        self.announce_role(None);
        self.send_replica_msg(
            ReplicaMessageContentV0::RequestRole(RequestRole::V0()),
            None,
            DeliveryMode::Seek { redundancy: 1 },
        );

        let (tick_s, tick_r) = async_channel::bounded::<()>(1);
        task::spawn(async move {
            loop {
                task::sleep(Duration::from_millis(TICK_INTERVAL)).await;
                if tick_s.send(()).await.is_err() {
                    break;
                }
            }
        });

        let stream_events = self.stream.events();
        loop {
            select! {
                ev = stream_events.recv().fuse() => match ev {
                    Ok(ev) => self.handle_stream_event(ev),
                    Err(_e) => break,
                },
                cmd = cmd_r.recv().fuse() => match cmd {
                    Ok(ReplicaCmd::Close { mut reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Ok(cmd) => self.handle_cmd(cmd),
                    Err(_e) => break,
                },
                _ = tick_r.recv().fuse() => self.tick(),
            }
        }
        debug_println!("end of replica engine loop");
    }

    /// On close every pending hand-off resolves as "our own
    /// responsibility": entries stay, nothing cascades
    async fn shutdown(&mut self) {
        self.pending_prunes.clear();
        self.pending_ihave.clear();
        self.leader_waits.clear();
        self.role = Role::Observer {
            timestamp: now_timestamp(),
        };
        self.announce_role(None);
        self.ring = Ring::new();
        self.stream.close().await;
    }

    fn handle_cmd(&mut self, cmd: ReplicaCmd) {
        match cmd {
            ReplicaCmd::Append { payload, mut reply } => {
                let res = self.append(payload);
                let _ = reply.send(res);
            }
            ReplicaCmd::UpdateRole { role, mut reply } => {
                self.update_role(role);
                let _ = reply.send(());
            }
            ReplicaCmd::Snapshot { mut reply } => {
                let _ = reply.send(self.snapshot());
            }
            ReplicaCmd::Subscribe { mut reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            ReplicaCmd::Close { .. } => unreachable!(),
        }
    }

    fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            len: self.log.len(),
            heads: self.log.heads(),
            role: self.role,
            ring_peers: self.ring.len(),
            status: ReplicationInfoV0 {
                progress: self.log.len() as u64,
                max: self.known_entries.len() as u64,
            },
            stored_bytes: self.store.size_bytes(),
        }
    }

    //
    // LEADER SELECTION
    //

    fn leaders(&self, gid: &GroupId, replicas: u32) -> Vec<PeerId> {
        self.ring.sample(
            gid_cursor(gid),
            replicas,
            now_timestamp(),
            self.config.role_maturity,
        )
    }

    fn is_leader(&self, gid: &GroupId, replicas: u32) -> bool {
        self.leaders(gid, replicas).contains(&self.identity.1)
    }

    /// The replication requirement of a group: the strongest hint
    /// among its current heads, clamped by the configured bounds
    fn effective_min_for_gid(&self, gid: &GroupId) -> u32 {
        let min = self
            .log
            .head_entries()
            .iter()
            .filter(|e| e.gid() == *gid)
            .map(|e| e.min_replicas())
            .max()
            .unwrap_or(self.config.replicas.min);
        match self.config.replicas.max {
            Some(max) => min.min(max),
            None => min,
        }
    }

    fn entries_for_gid(&self, gid: &GroupId) -> Vec<Entry> {
        self.log
            .values_sorted()
            .into_iter()
            .filter(|e| e.gid() == *gid)
            .collect()
    }

    //
    // OUTBOUND
    //

    fn send_replica_msg(
        &self,
        content: ReplicaMessageContentV0,
        to: Option<Vec<PeerHash>>,
        mode: DeliveryMode,
    ) {
        let msg = ReplicaMessage::new(self.log.id(), content);
        let payload = serde_bare::to_vec(&msg).unwrap();
        let stream = self.stream.clone();
        task::spawn(async move {
            if let Err(e) = stream.publish(payload, to, mode).await {
                debug_println!("replica publish failed: {:?}", e);
            }
        });
    }

    /// Seek the network with our role so every ring follows
    fn announce_role(&self, to: Option<Vec<PeerHash>>) {
        let content = ReplicaMessageContentV0::ResponseRole(ResponseRole::V0(ResponseRoleV0 {
            peer: self.identity.1,
            role: self.role,
        }));
        let mode = match to {
            Some(_) => DeliveryMode::Silent { redundancy: 1 },
            None => DeliveryMode::Seek { redundancy: 1 },
        };
        self.send_replica_msg(content, to, mode);
    }

    //
    // APPEND PATH
    //

    fn append(&mut self, payload: Vec<u8>) -> Result<Entry, ProtocolError> {
        let entry = self.log.append(payload)?;
        let id = entry.id().unwrap();
        self.store.put(&entry)?;
        self.known_entries.insert(id);

        let gid = entry.gid();
        let leaders = self.leaders(&gid, entry.min_replicas());
        let others: Vec<PeerHash> = leaders
            .iter()
            .filter(|p| **p != self.identity.1)
            .map(|p| peer_hash(p))
            .collect();
        self.gid_peers_history
            .insert(gid, leaders.iter().map(|p| peer_hash(p)).collect());

        if !others.is_empty() {
            let content = ReplicaMessageContentV0::ExchangeHeads(ExchangeHeads::V0(
                ExchangeHeadsV0 {
                    entries: vec![entry.clone()],
                },
            ));
            // a leader forwards quietly, a non-leader must see the
            // entry stored by at least one leader
            let mode = if leaders.contains(&self.identity.1) {
                DeliveryMode::Silent { redundancy: 1 }
            } else {
                DeliveryMode::Acknowledged { redundancy: 1 }
            };
            self.send_replica_msg(content, Some(others), mode);
        }
        Ok(entry)
    }

    //
    // INBOUND
    //

    fn handle_stream_event(&mut self, ev: StreamEvent) {
        match ev {
            StreamEvent::PeerEstablished { peer } => {
                self.events.emit(ReplicaEvent::PeerUp { peer });
                let to = Some(vec![peer_hash(&peer)]);
                self.send_replica_msg(
                    ReplicaMessageContentV0::RequestRole(RequestRole::V0()),
                    to.clone(),
                    DeliveryMode::Silent { redundancy: 1 },
                );
                self.announce_role(to);
            }
            StreamEvent::PeerLeft { peer } => {
                self.events.emit(ReplicaEvent::PeerDown { peer });
                self.ring.remove(&peer);
                self.role_timestamps.remove(&peer);
                self.distribution_pass();
            }
            StreamEvent::Data { from, payload } => {
                let msg = match serde_bare::from_slice::<ReplicaMessage>(&payload) {
                    Ok(msg) => msg,
                    Err(_e) => {
                        debug_println!("undecodable replica message from {}", from);
                        return;
                    }
                };
                if msg.log() != self.log.id() {
                    debug_println!("replica message for another log, dropping");
                    return;
                }
                match msg.content().clone() {
                    ReplicaMessageContentV0::ExchangeHeads(ExchangeHeads::V0(m)) => {
                        self.handle_exchange_heads(m.entries)
                    }
                    ReplicaMessageContentV0::RequestIPrune(RequestIPrune::V0(m)) => {
                        self.handle_request_iprune(from, m.hashes)
                    }
                    ReplicaMessageContentV0::ResponseIPrune(ResponseIPrune::V0(m)) => {
                        self.handle_response_iprune(from, m.hashes)
                    }
                    ReplicaMessageContentV0::RequestRole(RequestRole::V0()) => {
                        self.announce_role(Some(vec![from]));
                    }
                    ReplicaMessageContentV0::ResponseRole(ResponseRole::V0(m)) => {
                        self.handle_response_role(from, m.peer, m.role)
                    }
                    ReplicaMessageContentV0::RequestReplicationInfo(
                        RequestReplicationInfo::V0(),
                    ) => {
                        let info = ReplicationInfo::V0(ReplicationInfoV0 {
                            progress: self.log.len() as u64,
                            max: self.known_entries.len() as u64,
                        });
                        self.send_replica_msg(
                            ReplicaMessageContentV0::ReplicationInfo(info),
                            Some(vec![from]),
                            DeliveryMode::Silent { redundancy: 1 },
                        );
                    }
                    ReplicaMessageContentV0::ReplicationInfo(_) => (),
                }
            }
        }
    }

    //
    // ROLES & RING
    //

    fn handle_response_role(&mut self, from: PeerHash, peer: PeerId, role: Role) {
        if peer == self.identity.1 {
            return;
        }
        if peer_hash(&peer) != from {
            debug_println!("role announcement relayed under a foreign origin, dropping");
            return;
        }
        let latest = self.role_timestamps.get(&peer).copied().unwrap_or(0);
        if role.timestamp() < latest {
            debug_println!("stale role from {}, ignoring", peer);
            return;
        }
        if let Some(can_replicate) = &self.config.can_replicate {
            if role.is_replicator() && !can_replicate(&peer, &role) {
                debug_println!("replication denied for {}", peer);
                return;
            }
        }

        // a re-announcement of an unchanged role must not reset the
        // range's maturity
        if role.timestamp() == latest && self.role_timestamps.contains_key(&peer) {
            let unchanged = match self.ring.get(&peer) {
                Some(range) => range.factor == role.factor(),
                None => !role.is_replicator(),
            };
            if unchanged {
                return;
            }
        }
        self.role_timestamps.insert(peer, role.timestamp());

        if role.is_replicator() {
            self.ring.insert_or_update(ReplicationRange {
                peer,
                offset: ring_offset(&peer),
                factor: role.factor(),
                timestamp: now_timestamp(),
            });
            task::spawn({
                let stream = self.stream.clone();
                async move { stream.introduce_peer(peer).await }
            });
        } else {
            self.ring.remove(&peer);
        }
        self.events.emit(ReplicaEvent::RoleChanged { peer, role });

        self.drain_leader_waits();
        self.distribution_pass();
    }

    fn update_role(&mut self, role: RoleConfig) {
        let now = now_timestamp();
        self.role = role.to_role(now);
        self.pid = match role {
            RoleConfig::Adaptive { memory_limit } => Some(PidController::new(memory_limit)),
            _ => None,
        };
        self.apply_own_role(now);
        self.events.emit(ReplicaEvent::RoleChanged {
            peer: self.identity.1,
            role: self.role,
        });
        self.announce_role(None);
        self.distribution_pass();
    }

    //
    // EXCHANGE HEADS
    //

    fn handle_exchange_heads(&mut self, entries: Vec<Entry>) {
        let mut by_gid: HashMap<GroupId, Vec<Entry>> = HashMap::new();
        for mut entry in entries {
            if entry.id().is_none() {
                let id = entry.compute_id();
                entry.set_id(id);
            }
            self.known_entries.insert(entry.id().unwrap());
            by_gid.entry(entry.gid()).or_insert(vec![]).push(entry);
        }

        let now = now_timestamp();
        for (gid, group) in by_gid {
            let incoming_min = group.iter().map(|e| e.min_replicas()).max().unwrap();
            let min = incoming_min.max(self.effective_min_for_gid(&gid));

            if self.is_leader(&gid, min) {
                self.join_group(&gid, group);
            } else if self.has_ancestor_of(&group) {
                // keep the causal history, the hand-off follows
                self.join_group(&gid, group);
            } else {
                debug_println!("not (yet) a leader for {}, waiting", gid);
                self.leader_waits.push(LeaderWait {
                    gid,
                    entries: group,
                    min_replicas: min,
                    deadline: now + self.config.wait_for_replicator_timeout,
                });
            }
        }
    }

    fn has_ancestor_of(&self, entries: &[Entry]) -> bool {
        entries
            .iter()
            .any(|e| e.next().iter().any(|parent| self.log.has(parent)))
    }

    fn join_group(&mut self, gid: &GroupId, entries: Vec<Entry>) {
        let joined = match self.log.join(entries) {
            Ok(joined) => joined,
            Err(e) => {
                debug_println!("join failed for group {}: {:?}", gid, e);
                return;
            }
        };
        if joined.is_empty() {
            return;
        }
        for id in &joined {
            if let Some(entry) = self.log.get(id) {
                let entry = entry.clone();
                if let Err(e) = self.store.put(&entry) {
                    debug_println!("store put failed: {:?}", e);
                }
            }
        }
        self.events.emit(ReplicaEvent::Joined {
            entries: joined.clone(),
        });
        self.answer_pending_ihave(&joined);

        if !self.is_leader(gid, self.effective_min_for_gid(gid)) {
            // we only joined for the causal history, or a lowered
            // replication hint uncovered the group
            let ids: Vec<EntryId> = self
                .entries_for_gid(gid)
                .iter()
                .map(|e| e.id().unwrap())
                .collect();
            self.schedule_prune(ids);
        }
    }

    //
    // DISTRIBUTION PASS
    //

    /// After any membership change: recompute the leaders per group,
    /// feed the newly elected ones and hand off what we no longer own
    fn distribution_pass(&mut self) {
        for gid in self.log.head_gids() {
            let min = self.effective_min_for_gid(&gid);
            let leaders = self.leaders(&gid, min);
            let leader_hashes: HashSet<PeerHash> = leaders.iter().map(|p| peer_hash(p)).collect();
            let previous = self
                .gid_peers_history
                .get(&gid)
                .cloned()
                .unwrap_or_default();

            let newcomers: Vec<PeerHash> = leaders
                .iter()
                .filter(|p| **p != self.identity.1)
                .map(|p| peer_hash(p))
                .filter(|h| !previous.contains(h))
                .collect();
            if !newcomers.is_empty() {
                let entries = self.entries_for_gid(&gid);
                if !entries.is_empty() {
                    self.send_replica_msg(
                        ReplicaMessageContentV0::ExchangeHeads(ExchangeHeads::V0(
                            ExchangeHeadsV0 { entries },
                        )),
                        Some(newcomers),
                        DeliveryMode::Silent { redundancy: 1 },
                    );
                }
            }
            self.gid_peers_history.insert(gid, leader_hashes);

            if !leaders.contains(&self.identity.1) {
                let ids: Vec<EntryId> = self
                    .entries_for_gid(&gid)
                    .iter()
                    .map(|e| e.id().unwrap())
                    .collect();
                self.schedule_prune(ids);
            }
        }
    }

    //
    // PRUNING
    //

    /// Negotiated removal: nothing is dropped before enough leaders
    /// confirmed their copy
    fn schedule_prune(&mut self, ids: Vec<EntryId>) {
        let now = now_timestamp();
        let mut request: Vec<EntryId> = vec![];
        for id in ids {
            if !self.log.has(&id) || self.pending_prunes.contains_key(&id) {
                continue;
            }
            let required = self.log.get(&id).unwrap().min_replicas();
            self.pending_prunes.insert(
                id,
                PruneState {
                    confirmed: HashSet::new(),
                    required,
                    deadline: now + self.config.prune_confirm_timeout,
                    retries: 0,
                },
            );
            request.push(id);
        }
        if !request.is_empty() {
            debug_println!("requesting prune hand-off for {} entries", request.len());
            self.send_replica_msg(
                ReplicaMessageContentV0::RequestIPrune(RequestIPrune::V0(RequestIPruneV0 {
                    hashes: request,
                })),
                None,
                DeliveryMode::Seek { redundancy: 1 },
            );
        }
    }

    fn handle_request_iprune(&mut self, from: PeerHash, hashes: Vec<EntryId>) {
        let now = now_timestamp();
        let mut confirmed: Vec<EntryId> = vec![];
        for id in hashes {
            match self.log.get(&id) {
                Some(entry) => {
                    let gid = entry.gid();
                    let min = entry.min_replicas();
                    if self.is_leader(&gid, min) {
                        confirmed.push(id);
                    }
                }
                None => {
                    // remember the inquiry, the entry may still reach us
                    self.pending_ihave.insert(
                        id,
                        PendingIHave {
                            from,
                            deadline: now + self.config.respond_to_ihave_timeout,
                        },
                    );
                }
            }
        }
        if !confirmed.is_empty() {
            self.send_replica_msg(
                ReplicaMessageContentV0::ResponseIPrune(ResponseIPrune::V0(ResponseIPruneV0 {
                    hashes: confirmed,
                })),
                Some(vec![from]),
                DeliveryMode::Silent { redundancy: 1 },
            );
        }
    }

    /// A freshly joined entry may answer an earlier prune inquiry
    fn answer_pending_ihave(&mut self, joined: &[EntryId]) {
        let mut by_requester: HashMap<PeerHash, Vec<EntryId>> = HashMap::new();
        for id in joined {
            if let Some(pending) = self.pending_ihave.remove(id) {
                let entry = self.log.get(id).unwrap();
                if self.is_leader(&entry.gid(), entry.min_replicas()) {
                    by_requester.entry(pending.from).or_insert(vec![]).push(*id);
                }
            }
        }
        for (requester, hashes) in by_requester {
            self.send_replica_msg(
                ReplicaMessageContentV0::ResponseIPrune(ResponseIPrune::V0(ResponseIPruneV0 {
                    hashes,
                })),
                Some(vec![requester]),
                DeliveryMode::Silent { redundancy: 1 },
            );
        }
    }

    fn handle_response_iprune(&mut self, from: PeerHash, hashes: Vec<EntryId>) {
        let mut pruned: Vec<EntryId> = vec![];
        for id in hashes {
            // only a current leader's confirmation counts
            let required = match self.pending_prunes.get(&id) {
                Some(state) => state.required,
                None => continue,
            };
            let leader_confirmation = match self.log.get(&id) {
                Some(entry) => self
                    .leaders(&entry.gid(), required)
                    .iter()
                    .any(|p| peer_hash(p) == from),
                None => false,
            };
            let done = match self.pending_prunes.get_mut(&id) {
                Some(state) => {
                    if leader_confirmation {
                        state.confirmed.insert(from);
                    }
                    state.confirmed.len() as u32 >= state.required
                }
                None => false,
            };
            if done {
                self.pending_prunes.remove(&id);
                if self.log.remove(&id).is_some() {
                    let _ = self.store.del(&id);
                    pruned.push(id);
                }
            }
        }
        if !pruned.is_empty() {
            debug_println!("pruned {} entries after hand-off", pruned.len());
            self.events.emit(ReplicaEvent::Pruned { entries: pruned });
        }
    }

    //
    // HOUSEKEEPING
    //

    fn tick(&mut self) {
        let now = now_timestamp();
        self.drain_leader_waits();
        self.expire_leader_waits(now);

        // a ring change may have made us a leader again for entries
        // we were about to hand off
        let regained: Vec<EntryId> = self
            .pending_prunes
            .keys()
            .filter(|id| match self.log.get(id) {
                Some(entry) => self.is_leader(&entry.gid(), entry.min_replicas()),
                None => false,
            })
            .cloned()
            .collect();
        for id in regained {
            self.pending_prunes.remove(&id);
        }

        self.retry_prunes(now);
        self.pending_ihave.retain(|_id, p| now < p.deadline);
        self.log.expire_pending(now);
        self.rebalance(now);
    }

    /// Waiting heads join as soon as the ring makes us their leader
    fn drain_leader_waits(&mut self) {
        let waits: Vec<LeaderWait> = self.leader_waits.drain(..).collect();
        let mut ready: Vec<(GroupId, Vec<Entry>)> = vec![];
        let mut keep: Vec<LeaderWait> = vec![];
        for wait in waits {
            if self.is_leader(&wait.gid, wait.min_replicas) {
                ready.push((wait.gid, wait.entries));
            } else {
                keep.push(wait);
            }
        }
        self.leader_waits = keep;
        for (gid, entries) in ready {
            self.join_group(&gid, entries);
        }
    }

    fn expire_leader_waits(&mut self, now: Timestamp) {
        let mut ancestors: Vec<(GroupId, Vec<Entry>)> = vec![];
        self.leader_waits.retain(|wait| {
            if now < wait.deadline {
                return true;
            }
            debug_println!("leadership never arrived for {}", wait.gid);
            ancestors.push((wait.gid, wait.entries.clone()));
            false
        });
        for (gid, entries) in ancestors {
            // last resort: keep the causal history if it extends ours
            if self.has_ancestor_of(&entries) {
                self.join_group(&gid, entries);
            }
        }
    }

    fn retry_prunes(&mut self, now: Timestamp) {
        let mut retry: Vec<EntryId> = vec![];
        let max_retries = self.config.prune_retries;
        let timeout = self.config.prune_confirm_timeout;
        self.pending_prunes.retain(|id, state| {
            if now < state.deadline {
                return true;
            }
            if state.retries < max_retries {
                state.retries += 1;
                state.deadline = now + timeout;
                retry.push(*id);
                true
            } else {
                debug_println!("prune hand-off timed out for {}", id);
                false
            }
        });
        if !retry.is_empty() {
            self.send_replica_msg(
                ReplicaMessageContentV0::RequestIPrune(RequestIPrune::V0(RequestIPruneV0 {
                    hashes: retry,
                })),
                None,
                DeliveryMode::Seek { redundancy: 1 },
            );
        }
    }

    /// Debounced controller step, the interval scales with the peer
    /// count to avoid chatter in large clusters
    fn rebalance(&mut self, now: Timestamp) {
        let pid = match &mut self.pid {
            Some(pid) => pid,
            None => return,
        };
        let debounce = self.config.rebalance_debounce * self.ring.len().max(1) as u64;
        if now < self.last_rebalance + debounce {
            return;
        }
        self.last_rebalance = now;

        let current = self.role.factor();
        let factor = pid.tick(
            self.store.size_bytes() as u64,
            current,
            self.ring.total_participation(),
            self.ring.len(),
        );
        if (factor - current).abs() <= REBALANCE_MIN_CHANGE * current.max(f64::EPSILON) {
            return;
        }
        let memory_limit = pid.memory_limit();
        debug_println!("rebalanced factor {} -> {}", current, factor);
        self.role = Role::AdaptiveReplicator {
            factor,
            memory_limit,
            timestamp: now,
        };
        self.apply_own_role(now);
        self.events.emit(ReplicaEvent::RoleChanged {
            peer: self.identity.1,
            role: self.role,
        });
        self.announce_role(None);
        self.distribution_pass();
    }
}

#[cfg(test)]
mod test {
    use crate::config::*;
    use crate::replica::*;
    use async_std::task;
    use std::sync::Arc;
    use std::time::Duration;
    use weft::store::HashMapBlockStore;
    use weft::types::*;
    use weft::utils::{fresh_gid, generate_keypair};
    use weft_stream::stream::{DirectStream, StreamConfig};
    use weft_stream::transport::MemHub;

    fn quick_stream() -> StreamConfig {
        StreamConfig {
            ack_timeout: 2_000,
            seek_ttl: 2_000,
            ..StreamConfig::default()
        }
    }

    fn quick_replica(role: RoleConfig) -> ReplicaConfig {
        ReplicaConfig {
            role,
            role_maturity: 0,
            wait_for_replicator_timeout: 2_000,
            prune_confirm_timeout: 400,
            prune_retries: 5,
            rebalance_debounce: 100,
            ..ReplicaConfig::default()
        }
    }

    fn spawn_peer(
        hub: &MemHub,
        log_id: LogId,
        role: RoleConfig,
    ) -> (SharedLogHandle, PeerId) {
        let identity = generate_keypair();
        let peer = identity.1;
        let stream = DirectStream::start(identity, Arc::new(hub.endpoint(peer)), quick_stream());
        let handle = SharedLog::open(
            log_id,
            identity,
            Box::new(HashMapBlockStore::new()),
            stream,
            quick_replica(role),
        );
        (handle, peer)
    }

    async fn wait_for<F>(what: &str, mut check: F)
    where
        F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            task::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[async_std::test]
    pub async fn test_two_replicators_exchange() {
        let hub = MemHub::new();
        let log_id = fresh_gid();
        let (a, pa) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        let (b, pb) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        hub.connect(&pa, &pb, 0);

        {
            let a = a.clone();
            wait_for("rings to converge", move || {
                let a = a.clone();
                Box::pin(async move {
                    a.snapshot().await.map_or(false, |s| s.ring_peers == 2)
                })
            })
            .await;
        }

        a.append(b"hello".to_vec()).await.unwrap();

        {
            let b = b.clone();
            wait_for("entry to reach the second peer", move || {
                let b = b.clone();
                Box::pin(async move { b.snapshot().await.map_or(false, |s| s.len == 1) })
            })
            .await;
        }

        let status = a.replication_status().await;
        assert_eq!(status.progress, 1);
        assert_eq!(status.max, 1);

        a.close().await;
        b.close().await;
    }

    #[async_std::test]
    pub async fn test_observer_writes_without_replicating() {
        let hub = MemHub::new();
        let log_id = fresh_gid();
        let (a, pa) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        let (b, pb) = spawn_peer(&hub, log_id, RoleConfig::Observer);
        hub.connect(&pa, &pb, 0);

        {
            let b = b.clone();
            wait_for("observer to see the replicator", move || {
                let b = b.clone();
                Box::pin(async move {
                    b.snapshot().await.map_or(false, |s| s.ring_peers == 1)
                })
            })
            .await;
        }

        a.append(b"hello".to_vec()).await.unwrap();
        b.append(b"world".to_vec()).await.unwrap();

        {
            let a = a.clone();
            wait_for("the write to land on the replicator", move || {
                let a = a.clone();
                Box::pin(async move { a.snapshot().await.map_or(false, |s| s.len == 2) })
            })
            .await;
        }

        // the observer never receives entries it did not author
        task::sleep(Duration::from_millis(500)).await;
        let sb = b.snapshot().await.unwrap();
        assert_eq!(sb.len, 1);

        a.close().await;
        b.close().await;
    }

    #[async_std::test]
    pub async fn test_prune_after_role_change() {
        let hub = MemHub::new();
        let log_id = fresh_gid();
        let (a, pa) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        let (b, pb) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        let (c, pc) = spawn_peer(&hub, log_id, RoleConfig::Replicator { factor: 1.0 });
        hub.connect(&pa, &pb, 0);
        hub.connect(&pa, &pc, 0);
        hub.connect(&pb, &pc, 0);

        {
            let c = c.clone();
            wait_for("all rings to converge", move || {
                let c = c.clone();
                Box::pin(async move {
                    c.snapshot().await.map_or(false, |s| s.ring_peers == 3)
                })
            })
            .await;
        }

        c.append(b"handed-off".to_vec()).await.unwrap();
        let bytes_before = c.snapshot().await.unwrap().stored_bytes;
        assert!(bytes_before > 0);

        c.update_role(RoleConfig::Observer).await.unwrap();

        // the entry first travels to the remaining leaders, then the
        // observer collects its confirmations and lets go
        {
            let c = c.clone();
            wait_for("the observer to prune after hand-off", move || {
                let c = c.clone();
                Box::pin(async move { c.snapshot().await.map_or(false, |s| s.len == 0) })
            })
            .await;
        }
        {
            let a = a.clone();
            let b = b.clone();
            wait_for("both remaining leaders to hold the entry", move || {
                let a = a.clone();
                let b = b.clone();
                Box::pin(async move {
                    let la = a.snapshot().await.map_or(0, |s| s.len);
                    let lb = b.snapshot().await.map_or(0, |s| s.len);
                    la == 1 && lb == 1
                })
            })
            .await;
        }

        let after = c.snapshot().await.unwrap();
        assert_eq!(after.stored_bytes, 0);
        // the pruned entry is still known, just no longer ours
        assert_eq!(after.status.max, 1);

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[async_std::test]
    pub async fn test_adaptive_factor_drops_under_pressure() {
        let hub = MemHub::new();
        let log_id = fresh_gid();
        let (a, pa) = spawn_peer(&hub, log_id, RoleConfig::Adaptive { memory_limit: 512 });
        let (b, pb) = spawn_peer(
            &hub,
            log_id,
            RoleConfig::Adaptive {
                memory_limit: 64 * 1024 * 1024,
            },
        );
        hub.connect(&pa, &pb, 0);

        {
            let a = a.clone();
            wait_for("rings to converge", move || {
                let a = a.clone();
                Box::pin(async move {
                    a.snapshot().await.map_or(false, |s| s.ring_peers == 2)
                })
            })
            .await;
        }

        for i in 0..32u8 {
            a.append(vec![i; 64]).await.unwrap();
        }

        {
            let a = a.clone();
            wait_for("the controller to shed load", move || {
                let a = a.clone();
                Box::pin(async move {
                    a.snapshot()
                        .await
                        .map_or(false, |s| s.role.factor() < 0.5)
                })
            })
            .await;
        }

        a.close().await;
        b.close().await;
    }
}
