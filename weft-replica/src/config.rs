//! Replica configuration

use weft::types::*;
use weft_net::types::Role;

/// How long a peer must have held its ring range before it is
/// trusted as a leader
pub const WAIT_FOR_ROLE_MATURITY: u64 = 5_000;

/// How long incoming heads wait for this peer to become their leader
pub const WAIT_FOR_REPLICATOR_TIMEOUT: u64 = 9_000;

/// How long a peer keeps answering prune inquiries for an entry
pub const RESPOND_TO_IHAVE_TIMEOUT: u64 = 10_000;

/// One round of prune confirmations
pub const PRUNE_CONFIRM_TIMEOUT: u64 = 10_000;

/// Rounds of prune confirmations before giving up
pub const PRUNE_RETRIES: u8 = 3;

/// Base rebalance debounce, scaled by the peer count
pub const REBALANCE_DEBOUNCE_INTERVAL: u64 = 1_000;

/// Relative factor change below which a rebalance is not announced
pub const REBALANCE_MIN_CHANGE: f64 = 0.0001;

pub const DEFAULT_MIN_REPLICAS: u32 = 2;

/// Default memory budget of an adaptive replicator
pub const DEFAULT_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

/// Initial role of a peer
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RoleConfig {
    Observer,

    /// Fixed-width replicator
    Replicator { factor: f64 },

    /// Controller-driven replicator, starts at factor 1
    Adaptive { memory_limit: u64 },
}

impl RoleConfig {
    pub fn to_role(&self, timestamp: Timestamp) -> Role {
        match self {
            RoleConfig::Observer => Role::Observer { timestamp },
            RoleConfig::Replicator { factor } => Role::Replicator {
                factor: *factor,
                timestamp,
            },
            RoleConfig::Adaptive { memory_limit } => Role::AdaptiveReplicator {
                factor: 1.0,
                memory_limit: *memory_limit,
                timestamp,
            },
        }
    }
}

/// Replication bounds carried as hints on appended entries
#[derive(Clone, Copy, Debug)]
pub struct ReplicasConfig {
    pub min: u32,
    pub max: Option<u32>,
}

/// Admission gate for replicating peers
pub type CanReplicate = Box<dyn Fn(&PeerId, &Role) -> bool + Send + Sync>;

/// Per-log replica options, all timeouts in milliseconds
pub struct ReplicaConfig {
    pub role: RoleConfig,

    pub replicas: ReplicasConfig,

    pub respond_to_ihave_timeout: u64,
    pub wait_for_replicator_timeout: u64,
    pub role_maturity: u64,
    pub prune_confirm_timeout: u64,
    pub prune_retries: u8,
    pub rebalance_debounce: u64,

    /// Admission gate for replicating peers
    pub can_replicate: Option<CanReplicate>,

    /// Admission gate for entries arriving through the log's join
    pub can_append: Option<weft::log::CanAppend>,
}

impl Default for ReplicaConfig {
    fn default() -> ReplicaConfig {
        ReplicaConfig {
            role: RoleConfig::Adaptive {
                memory_limit: DEFAULT_MEMORY_LIMIT,
            },
            replicas: ReplicasConfig {
                min: DEFAULT_MIN_REPLICAS,
                max: None,
            },
            respond_to_ihave_timeout: RESPOND_TO_IHAVE_TIMEOUT,
            wait_for_replicator_timeout: WAIT_FOR_REPLICATOR_TIMEOUT,
            role_maturity: WAIT_FOR_ROLE_MATURITY,
            prune_confirm_timeout: PRUNE_CONFIRM_TIMEOUT,
            prune_retries: PRUNE_RETRIES,
            rebalance_debounce: REBALANCE_DEBOUNCE_INTERVAL,
            can_replicate: None,
            can_append: None,
        }
    }
}
