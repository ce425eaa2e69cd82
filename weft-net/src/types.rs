//! Weft network common data types
//!
//! Corresponds to the BARE schema

use serde::{Deserialize, Serialize};
use weft::errors::WeftError;
use weft::types::*;
use weft::utils::{now_timestamp, sign, verify};

/// Dedup key of a message: BLAKE3 over a per-variant discriminator
/// and the 32-byte header id
pub type MsgId = Digest;

/// Topic string for a log, peers subscribe to it to discover
/// participants
pub fn topic_string(log: &LogId) -> String {
    format!("{}", log)
}

/// Message delivery mode
///
/// Wire layout: tag `u8` (0 = Silent, 1 = Acknowledged, 2 = Seek)
/// followed by the fanout redundancy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum DeliveryMode {
    /// Best-effort forward along known routes, no ACKs expected
    Silent { redundancy: u8 },

    /// Every target sends an ACK back
    Acknowledged { redundancy: u8 },

    /// Greedy fanout to all direct neighbors with limited TTL,
    /// ACKs reveal previously unknown routes
    Seek { redundancy: u8 },
}

impl DeliveryMode {
    pub fn redundancy(&self) -> u8 {
        match self {
            DeliveryMode::Silent { redundancy } => *redundancy,
            DeliveryMode::Acknowledged { redundancy } => *redundancy,
            DeliveryMode::Seek { redundancy } => *redundancy,
        }
    }

    pub fn expects_acks(&self) -> bool {
        !matches!(self, DeliveryMode::Silent { .. })
    }
}

/// Header carried on every transport message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageHeaderV0 {
    /// Random message ID
    pub id: [u8; 32],

    /// Creation time of the message
    pub timestamp: Timestamp,

    /// Relays drop the message after this time
    pub expires: Timestamp,

    /// Hash of the originating peer
    pub origin: Option<PeerHash>,

    /// Target peers; empty means every reachable peer
    pub to: Vec<PeerHash>,

    /// Signatures over the header with `to` and `sigs` cleared,
    /// followed by the body bytes
    pub sigs: Vec<SigPair>,
}

/// Header carried on every transport message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageHeader {
    V0(MessageHeaderV0),
}

impl MessageHeader {
    /// New header with a random ID
    pub fn new(origin: Option<PeerHash>, to: Vec<PeerHash>, expires: Timestamp) -> MessageHeader {
        let mut id = [0u8; 32];
        getrandom::getrandom(&mut id).unwrap();
        MessageHeader::V0(MessageHeaderV0 {
            id,
            timestamp: now_timestamp(),
            expires,
            origin,
            to,
            sigs: vec![],
        })
    }

    fn v0(&self) -> &MessageHeaderV0 {
        match self {
            MessageHeader::V0(h) => h,
        }
    }

    fn v0_mut(&mut self) -> &mut MessageHeaderV0 {
        match self {
            MessageHeader::V0(h) => h,
        }
    }

    pub fn id(&self) -> &[u8; 32] {
        &self.v0().id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.v0().timestamp
    }

    pub fn expires(&self) -> Timestamp {
        self.v0().expires
    }

    pub fn origin(&self) -> Option<&PeerHash> {
        self.v0().origin.as_ref()
    }

    pub fn to(&self) -> &Vec<PeerHash> {
        &self.v0().to
    }

    pub fn set_to(&mut self, to: Vec<PeerHash>) {
        self.v0_mut().to = to;
    }

    pub fn sigs(&self) -> &Vec<SigPair> {
        &self.v0().sigs
    }

    /// Serialization for signing, with `to` and `sigs` cleared so
    /// relays may rewrite the target list without breaking signatures
    pub fn signable_bytes(&self, body: &[u8]) -> Vec<u8> {
        let mut header = self.v0().clone();
        header.to = vec![];
        header.sigs = vec![];
        let mut ser = serde_bare::to_vec(&MessageHeader::V0(header)).unwrap();
        ser.extend_from_slice(body);
        ser
    }
}

/// Carrier of replica payloads
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataMessageV0 {
    pub header: MessageHeader,

    /// How relays forward the message and whether targets ACK it
    pub mode: DeliveryMode,

    /// A BARE-serialized ReplicaMessage
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Carrier of replica payloads
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DataMessage {
    V0(DataMessageV0),
}

/// Delivery acknowledgement, travels back towards the origin of the
/// acknowledged message and teaches routes on the way
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AckMessageV0 {
    pub header: MessageHeader,

    /// Header ID of the acknowledged message
    pub ack_for: [u8; 32],

    /// Incremented by peers that had already seen the acknowledged
    /// message, revealing redundant delivery paths. Zeroed during
    /// signing and verification so relays can bump it without
    /// invalidating the signature.
    pub seen_counter: u64,
}

/// Delivery acknowledgement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum AckMessage {
    V0(AckMessageV0),
}

/// First message on a session, announces the peer identity
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HelloMessageV0 {
    pub header: MessageHeader,

    pub peer: PeerId,
}

/// First message on a session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum HelloMessage {
    V0(HelloMessageV0),
}

/// Orderly departure of a peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GoodbyeMessageV0 {
    pub header: MessageHeader,

    pub peer: PeerId,
}

/// Orderly departure of a peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum GoodbyeMessage {
    V0(GoodbyeMessageV0),
}

/// Transport message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Message {
    Data(DataMessage),
    Ack(AckMessage),
    Hello(HelloMessage),
    Goodbye(GoodbyeMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Data(DataMessage::V0(m)) => &m.header,
            Message::Ack(AckMessage::V0(m)) => &m.header,
            Message::Hello(HelloMessage::V0(m)) => &m.header,
            Message::Goodbye(GoodbyeMessage::V0(m)) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Message::Data(DataMessage::V0(m)) => &mut m.header,
            Message::Ack(AckMessage::V0(m)) => &mut m.header,
            Message::Hello(HelloMessage::V0(m)) => &mut m.header,
            Message::Goodbye(GoodbyeMessage::V0(m)) => &mut m.header,
        }
    }

    fn discriminator(&self) -> u8 {
        match self {
            Message::Data(_) => 0,
            Message::Ack(_) => 1,
            Message::Hello(_) => 2,
            Message::Goodbye(_) => 3,
        }
    }

    /// Dedup key: per-variant discriminator and the header id hashed
    /// together, so a message and its ACK never collide
    pub fn msg_id(&self) -> MsgId {
        let mut bytes = Vec::with_capacity(33);
        bytes.push(self.discriminator());
        bytes.extend_from_slice(self.header().id());
        Digest::Blake3Digest32(*blake3::hash(bytes.as_slice()).as_bytes())
    }

    /// Body bytes covered by the header signatures
    ///
    /// The ACK seen counter is zeroed here, which is what lets relays
    /// increment it in flight.
    pub fn body_bytes(&self) -> Vec<u8> {
        match self {
            Message::Data(DataMessage::V0(m)) => {
                serde_bare::to_vec(&(&m.mode, &m.payload)).unwrap()
            }
            Message::Ack(AckMessage::V0(m)) => {
                let zeroed_counter: u64 = 0;
                serde_bare::to_vec(&(&m.ack_for, zeroed_counter)).unwrap()
            }
            Message::Hello(HelloMessage::V0(m)) => serde_bare::to_vec(&m.peer).unwrap(),
            Message::Goodbye(GoodbyeMessage::V0(m)) => serde_bare::to_vec(&m.peer).unwrap(),
        }
    }

    /// Sign the header and body, appending to the signature list
    pub fn sign(&mut self, privkey: PrivKey, pubkey: PubKey) -> Result<(), WeftError> {
        let signable = self.header().signable_bytes(&self.body_bytes());
        let sig = sign(privkey, pubkey, signable.as_slice())?;
        self.header_mut()
            .v0_mut()
            .sigs
            .push(SigPair { key: pubkey, sig });
        Ok(())
    }

    /// Verify every header signature over header and body
    pub fn verify_sigs(&self) -> Result<(), WeftError> {
        if self.header().sigs().is_empty() {
            return Err(WeftError::InvalidSignature);
        }
        let signable = self.header().signable_bytes(&self.body_bytes());
        for pair in self.header().sigs() {
            verify(signable.as_slice(), pair.sig, pair.key)?;
        }
        Ok(())
    }
}

//
// REPLICA MESSAGES carried in DataMessage payloads
//

/// New head entries of a log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExchangeHeadsV0 {
    pub entries: Vec<Entry>,
}

/// New head entries of a log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ExchangeHeads {
    V0(ExchangeHeadsV0),
}

/// Ask the leaders holding the listed entries to confirm their copy
/// before the sender drops its own
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequestIPruneV0 {
    pub hashes: Vec<EntryId>,
}

/// Ask the leaders holding the listed entries to confirm their copy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RequestIPrune {
    V0(RequestIPruneV0),
}

/// Confirmation by a leader that it persists the listed entries
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResponseIPruneV0 {
    pub hashes: Vec<EntryId>,
}

/// Confirmation by a leader that it persists the listed entries
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ResponseIPrune {
    V0(ResponseIPruneV0),
}

/// Role of a peer for one log
///
/// Wire layout: variant `u8`, then factor and limits when present,
/// then the timestamp the role was assumed at.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Role {
    Observer {
        timestamp: Timestamp,
    },

    Replicator {
        /// Unit-interval segment width the peer replicates
        factor: f64,
        timestamp: Timestamp,
    },

    AdaptiveReplicator {
        factor: f64,
        /// Memory budget driving the factor controller
        memory_limit: u64,
        timestamp: Timestamp,
    },
}

impl Role {
    pub fn factor(&self) -> f64 {
        match self {
            Role::Observer { .. } => 0.0,
            Role::Replicator { factor, .. } => *factor,
            Role::AdaptiveReplicator { factor, .. } => *factor,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Role::Observer { timestamp } => *timestamp,
            Role::Replicator { timestamp, .. } => *timestamp,
            Role::AdaptiveReplicator { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_replicator(&self) -> bool {
        !matches!(self, Role::Observer { .. })
    }
}

/// Ask a peer for its current role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum RequestRole {
    V0(),
}

/// Announce a role, sent on every role change and in response to
/// RequestRole
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResponseRoleV0 {
    /// The announcing peer; ring offsets derive from this key
    pub peer: PeerId,

    pub role: Role,
}

/// Announce a role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum ResponseRole {
    V0(ResponseRoleV0),
}

/// Entries stored locally versus entries known to exist
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplicationInfoV0 {
    pub progress: u64,
    pub max: u64,
}

/// Entries stored locally versus entries known to exist
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum ReplicationInfo {
    V0(ReplicationInfoV0),
}

/// Ask a peer how far its replica is
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum RequestReplicationInfo {
    V0(),
}

/// Content of ReplicaMessageV0
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ReplicaMessageContentV0 {
    ExchangeHeads(ExchangeHeads),
    RequestIPrune(RequestIPrune),
    ResponseIPrune(ResponseIPrune),
    RequestRole(RequestRole),
    ResponseRole(ResponseRole),
    RequestReplicationInfo(RequestReplicationInfo),
    ReplicationInfo(ReplicationInfo),
}

/// Replica message for one log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplicaMessageV0 {
    /// Log the message belongs to
    pub log: LogId,

    pub content: ReplicaMessageContentV0,
}

/// Replica message for one log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ReplicaMessage {
    V0(ReplicaMessageV0),
}

impl ReplicaMessage {
    pub fn new(log: LogId, content: ReplicaMessageContentV0) -> ReplicaMessage {
        ReplicaMessage::V0(ReplicaMessageV0 { log, content })
    }

    pub fn log(&self) -> LogId {
        match self {
            ReplicaMessage::V0(m) => m.log,
        }
    }

    pub fn content(&self) -> &ReplicaMessageContentV0 {
        match self {
            ReplicaMessage::V0(m) => &m.content,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::types::*;
    use weft::utils::{generate_keypair, now_timestamp, peer_hash};

    #[test]
    pub fn test_message_roundtrip() {
        let (priv_key, pub_key) = generate_keypair();
        let to = vec![peer_hash(&pub_key)];
        let mut msg = Message::Data(DataMessage::V0(DataMessageV0 {
            header: MessageHeader::new(Some(peer_hash(&pub_key)), to, now_timestamp() + 10_000),
            mode: DeliveryMode::Acknowledged { redundancy: 1 },
            payload: vec![1, 2, 3],
        }));
        msg.sign(priv_key, pub_key).unwrap();
        msg.verify_sigs().expect("signature should verify");

        let ser = serde_bare::to_vec(&msg).unwrap();
        let de: Message = serde_bare::from_slice(&ser).unwrap();
        assert_eq!(de, msg);
        de.verify_sigs().expect("decoded message should verify");
        assert_eq!(de.msg_id(), msg.msg_id());
        assert_eq!(serde_bare::to_vec(&de).unwrap(), ser);
    }

    #[test]
    pub fn test_rewriting_to_keeps_signature() {
        let (priv_key, pub_key) = generate_keypair();
        let mut msg = Message::Data(DataMessage::V0(DataMessageV0 {
            header: MessageHeader::new(None, vec![peer_hash(&pub_key)], 0),
            mode: DeliveryMode::Silent { redundancy: 1 },
            payload: vec![9; 16],
        }));
        msg.sign(priv_key, pub_key).unwrap();

        msg.header_mut().set_to(vec![]);
        msg.verify_sigs()
            .expect("signature must survive a rewritten target list");
    }

    #[test]
    pub fn test_ack_seen_counter_not_signed() {
        let (priv_key, pub_key) = generate_keypair();
        let mut ack = Message::Ack(AckMessage::V0(AckMessageV0 {
            header: MessageHeader::new(Some(peer_hash(&pub_key)), vec![], 0),
            ack_for: [7; 32],
            seen_counter: 0,
        }));
        ack.sign(priv_key, pub_key).unwrap();

        match &mut ack {
            Message::Ack(AckMessage::V0(a)) => a.seen_counter += 1,
            _ => unreachable!(),
        }
        ack.verify_sigs()
            .expect("bumping the seen counter must not invalidate the signature");
    }

    #[test]
    pub fn test_msg_id_discriminates_variants() {
        let header = MessageHeader::new(None, vec![], 0);
        let data = Message::Data(DataMessage::V0(DataMessageV0 {
            header: header.clone(),
            mode: DeliveryMode::Silent { redundancy: 1 },
            payload: vec![],
        }));
        let ack = Message::Ack(AckMessage::V0(AckMessageV0 {
            header,
            ack_for: [0; 32],
            seen_counter: 0,
        }));
        assert_ne!(data.msg_id(), ack.msg_id());
    }

    #[test]
    pub fn test_tampered_payload_fails() {
        let (priv_key, pub_key) = generate_keypair();
        let mut msg = Message::Data(DataMessage::V0(DataMessageV0 {
            header: MessageHeader::new(None, vec![], 0),
            mode: DeliveryMode::Silent { redundancy: 1 },
            payload: vec![1, 2, 3],
        }));
        msg.sign(priv_key, pub_key).unwrap();
        match &mut msg {
            Message::Data(DataMessage::V0(m)) => m.payload = vec![3, 2, 1],
            _ => unreachable!(),
        }
        assert!(msg.verify_sigs().is_err());
    }

    #[test]
    pub fn test_replica_message_roundtrip() {
        let log = weft::utils::fresh_gid();
        let msg = ReplicaMessage::new(
            log,
            ReplicaMessageContentV0::RequestIPrune(RequestIPrune::V0(RequestIPruneV0 {
                hashes: vec![weft::utils::fresh_gid()],
            })),
        );
        let ser = serde_bare::to_vec(&msg).unwrap();
        let de: ReplicaMessage = serde_bare::from_slice(&ser).unwrap();
        assert_eq!(de, msg);
        assert_eq!(de.log(), log);
    }
}
