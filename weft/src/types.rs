//! Weft common data types
//!
//! Corresponds to the BARE schema

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 32-byte BLAKE3 hash digest
pub type Blake3Digest32 = [u8; 32];

/// Hash digest
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Digest {
    Blake3Digest32(Blake3Digest32),
}

impl Digest {
    pub fn slice(&self) -> &[u8; 32] {
        match self {
            Digest::Blake3Digest32(d) => d,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.slice() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// ChaCha20 symmetric key
pub type ChaCha20Key = [u8; 32];

/// Symmetric cryptographic key
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum SymKey {
    ChaCha20Key(ChaCha20Key),
}

/// Ed25519 public key
pub type Ed25519PubKey = [u8; 32];

/// Ed25519 private key
pub type Ed25519PrivKey = [u8; 32];

/// Public key for signatures and peer identity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PubKey {
    Ed25519PubKey(Ed25519PubKey),
}

impl PubKey {
    pub fn slice(&self) -> &[u8; 32] {
        match self {
            PubKey::Ed25519PubKey(pk) => pk,
        }
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.slice() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Private key
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum PrivKey {
    Ed25519PrivKey(Ed25519PrivKey),
}

impl PrivKey {
    pub fn slice(&self) -> &[u8; 32] {
        match self {
            PrivKey::Ed25519PrivKey(sk) => sk,
        }
    }
}

/// X25519 public key
pub type X25519PubKey = [u8; 32];

/// X25519 private key
pub type X25519PrivKey = [u8; 32];

/// Public key for box encryption
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum BoxPubKey {
    X25519PubKey(X25519PubKey),
}

impl BoxPubKey {
    pub fn slice(&self) -> &[u8; 32] {
        match self {
            BoxPubKey::X25519PubKey(pk) => pk,
        }
    }
}

/// Private key for box encryption
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum BoxPrivKey {
    X25519PrivKey(X25519PrivKey),
}

impl BoxPrivKey {
    pub fn slice(&self) -> &[u8; 32] {
        match self {
            BoxPrivKey::X25519PrivKey(sk) => sk,
        }
    }
}

/// Ed25519 signature
pub type Ed25519Sig = [[u8; 32]; 2];

/// Cryptographic signature
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Signature {
    Ed25519Sig(Ed25519Sig),
}

/// A public key together with a signature it produced
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SigPair {
    pub key: PubKey,
    pub sig: Signature,
}

/// Timestamp: milliseconds since the UNIX epoch
pub type Timestamp = u64;

/// Peer identity
pub type PeerId = PubKey;

/// BLAKE3 hash over the serialized peer public key,
/// used to address peers in message `to` lists
pub type PeerHash = Digest;

/// Entry ID
/// BLAKE3 hash over the canonical serialization of the entry
pub type EntryId = Digest;

/// Log ID, also the pub/sub topic the log's peers subscribe to
pub type LogId = Digest;

/// Group ID labeling a causal chain of entries
///
/// Freshly derived for root entries, inherited as the lexicographic
/// maximum of the parents' group IDs otherwise.
pub type GroupId = Digest;

/// Lamport clock stamped on every entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LamportClock {
    /// Creator's public key
    pub id: PubKey,

    /// Logical time, strictly greater than the time of every parent
    pub time: u64,
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.slice().cmp(other.id.slice()))
    }
}

/// Content that may be sealed to a recipient box key
///
/// The sealed form is `ephemeral_pubkey(32) ‖ nonce(12) ‖ ciphertext`,
/// see `utils::seal_box`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MaybeEncrypted<T> {
    Plain(T),

    #[serde(with = "serde_bytes")]
    Encrypted(Vec<u8>),
}

impl<T> MaybeEncrypted<T> {
    pub fn is_encrypted(&self) -> bool {
        match self {
            MaybeEncrypted::Plain(_) => false,
            MaybeEncrypted::Encrypted(_) => true,
        }
    }

    pub fn plain(&self) -> Option<&T> {
        match self {
            MaybeEncrypted::Plain(t) => Some(t),
            MaybeEncrypted::Encrypted(_) => None,
        }
    }
}

/// Metadata carried with every entry, never encrypted
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntryMetaV0 {
    /// Causal chain the entry belongs to
    pub gid: GroupId,

    /// Replication hint: how many peers must persist this entry
    pub min_replicas: u32,

    /// App-specific metadata
    #[serde(with = "serde_bytes")]
    pub extra: Vec<u8>,
}

/// Content-addressed log entry
///
/// The author, clock and payload may each be sealed to a recipient
/// box key independently. The trailing `id` and the `sigs` are
/// excluded from the canonical bytes used for hashing and signing,
/// so the ID is stable across re-signing by relays.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntryV0 {
    /// Entry author
    pub author: MaybeEncrypted<PubKey>,

    /// Group ID and replication hint
    pub meta: EntryMetaV0,

    /// Lamport clock of the author at creation
    pub clock: MaybeEncrypted<LamportClock>,

    /// Application payload
    pub payload: MaybeEncrypted<Vec<u8>>,

    /// Direct parents: the heads at the time of creation
    pub next: Vec<EntryId>,

    /// Secondary ancestors for traversal amortization
    pub refs: Vec<EntryId>,

    /// Signatures over the canonical bytes,
    /// the first one by the author, further ones by relays
    pub sigs: Vec<SigPair>,

    /// ID of this entry, trailing and optional
    pub id: Option<EntryId>,
}

/// Content-addressed log entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Entry {
    V0(EntryV0),
}
