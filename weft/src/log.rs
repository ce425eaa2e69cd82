//! Entry DAG log

use debug_print::*;

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::entry::*;
use crate::types::*;
use crate::utils::*;

/// How long a parent-less entry is kept around before it is dropped
pub const PENDING_ENTRY_TTL: u64 = 60_000;

#[derive(Debug, PartialEq)]
pub enum LogError {
    InvalidSignature,
    PermissionDenied,
    Undecodable,
    SerializationError,
}

impl From<serde_bare::error::Error> for LogError {
    fn from(_e: serde_bare::error::Error) -> Self {
        LogError::SerializationError
    }
}

/// Admission gate for entries arriving through `join`
pub type CanAppend = Box<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Per-log options
pub struct LogOptions {
    /// Signing identity used by `append`
    pub identity: (PrivKey, PubKey),

    /// Replication hint stamped on appended entries
    pub min_replicas: u32,

    /// Maximum length, oldest entries are cut beyond it
    pub recycle: Option<usize>,

    /// Box key for opening sealed clocks and payloads
    pub box_key: Option<BoxPrivKey>,

    /// Recipient keys for sealing appended entries
    pub encryption: EntryEncryption,

    /// Admission gate for entries arriving through `join`
    pub can_append: Option<CanAppend>,
}

impl LogOptions {
    pub fn new(identity: (PrivKey, PubKey)) -> LogOptions {
        LogOptions {
            identity,
            min_replicas: 2,
            recycle: None,
            box_key: None,
            encryption: EntryEncryption::default(),
            can_append: None,
        }
    }
}

/// DAG of entries with head and clock tracking
///
/// Heads are exactly the entries not referenced as `next` by any
/// other entry currently in the log. Sort order is Lamport time with
/// a tie-break on the clock id bytes, then on the entry ID.
pub struct Log {
    id: LogId,

    entries: HashMap<EntryId, Entry>,

    /// Resolved clock per entry, opened from the sealed box if needed
    clocks: HashMap<EntryId, LamportClock>,

    /// How many in-log entries reference the key as `next`
    ref_count: HashMap<EntryId, u32>,

    heads: HashSet<EntryId>,

    /// Entries waiting for their parents, by arrival time
    pending: HashMap<EntryId, (Entry, Timestamp)>,

    clock_time: u64,

    options: LogOptions,
}

impl Log {
    pub fn new(id: LogId, options: LogOptions) -> Log {
        Log {
            id,
            entries: HashMap::new(),
            clocks: HashMap::new(),
            ref_count: HashMap::new(),
            heads: HashSet::new(),
            pending: HashMap::new(),
            clock_time: 0,
            options,
        }
    }

    pub fn id(&self) -> LogId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn clock_time(&self) -> u64 {
        self.clock_time
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    fn sort_key(&self, id: &EntryId) -> (LamportClock, EntryId) {
        (self.clocks[id], *id)
    }

    /// Head IDs in ascending sort order
    pub fn heads(&self) -> Vec<EntryId> {
        let mut heads: Vec<EntryId> = self.heads.iter().cloned().collect();
        heads.sort_by_key(|id| self.sort_key(id));
        heads
    }

    /// Head entries in ascending sort order
    pub fn head_entries(&self) -> Vec<Entry> {
        self.heads()
            .iter()
            .map(|id| self.entries[id].clone())
            .collect()
    }

    /// All entries in ascending sort order
    pub fn values_sorted(&self) -> Vec<Entry> {
        let mut ids: Vec<EntryId> = self.entries.keys().cloned().collect();
        ids.sort_by_key(|id| self.sort_key(id));
        ids.iter().map(|id| self.entries[id].clone()).collect()
    }

    /// Group IDs present among the current heads
    pub fn head_gids(&self) -> Vec<GroupId> {
        let mut gids: Vec<GroupId> = self
            .heads
            .iter()
            .map(|id| self.entries[id].gid())
            .collect();
        gids.sort();
        gids.dedup();
        gids
    }

    fn insert_resolved(&mut self, entry: Entry, clock: LamportClock) {
        let id = entry.id().unwrap();
        for parent in entry.next().clone() {
            *self.ref_count.entry(parent).or_insert(0) += 1;
            self.heads.remove(&parent);
        }
        if *self.ref_count.get(&id).unwrap_or(&0) == 0 {
            self.heads.insert(id);
        }
        self.clocks.insert(id, clock);
        self.entries.insert(id, entry);
        if clock.time > self.clock_time {
            self.clock_time = clock.time;
        }
    }

    /// Remove a single entry, promoting its parents to heads
    /// when they become unreferenced
    pub fn remove(&mut self, id: &EntryId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.clocks.remove(id);
        self.heads.remove(id);
        for parent in entry.next() {
            match self.ref_count.get_mut(parent) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.ref_count.remove(parent);
                        if self.entries.contains_key(parent) {
                            self.heads.insert(*parent);
                        }
                    }
                }
                None => (),
            }
        }
        Some(entry)
    }

    /// Select secondary ancestor references on a power-of-two
    /// distance schedule over the sorted traversal from the heads
    fn select_refs(&self, next: &[EntryId]) -> Vec<EntryId> {
        let total = self.entries.len();
        if total < 2 {
            return vec![];
        }
        let mut ordered: Vec<EntryId> = self.entries.keys().cloned().collect();
        ordered.sort_by_key(|id| self.sort_key(id));
        ordered.reverse();

        let mut refs = vec![];
        let mut k: u32 = 1;
        loop {
            let distance = (1usize << k) - 1;
            let pos = distance.min(total - 1);
            let id = ordered[pos];
            if !next.contains(&id) && !refs.contains(&id) {
                refs.push(id);
            }
            if distance >= total - 1 {
                break;
            }
            k += 1;
        }
        refs
    }

    /// Append a payload as a new entry on top of the current heads
    pub fn append(&mut self, payload: Vec<u8>) -> Result<Entry, LogError> {
        let (priv_key, pub_key) = self.options.identity;
        let next = self.heads();
        let gid = match next.last() {
            None => fresh_gid(),
            Some(_) => next
                .iter()
                .map(|id| self.entries[id].gid())
                .max()
                .unwrap(),
        };
        let time = self.clock_time + 1;
        let clock = LamportClock { id: pub_key, time };
        let refs = self.select_refs(&next);
        let entry = Entry::new(
            priv_key,
            pub_key,
            clock,
            gid,
            self.options.min_replicas,
            payload,
            next,
            refs,
            &self.options.encryption,
        )
        .map_err(|_e| LogError::SerializationError)?;

        self.insert_resolved(entry.clone(), clock);

        if let Some(max) = self.options.recycle {
            if self.entries.len() > max {
                self.cut(max);
            }
        }
        Ok(entry)
    }

    /// Check one incoming entry, returns its resolved clock
    fn admit(&self, entry: &mut Entry) -> Result<LamportClock, LogError> {
        if entry.id().is_none() {
            let id = entry.compute_id();
            entry.set_id(id);
        }
        entry.verify().map_err(|e| match e {
            EntryError::Undecodable => LogError::Undecodable,
            _ => LogError::InvalidSignature,
        })?;
        if let Some(can_append) = &self.options.can_append {
            if !can_append(entry) {
                return Err(LogError::PermissionDenied);
            }
        }
        entry
            .clock_resolved(self.options.box_key.as_ref())
            .map_err(|_e| LogError::Undecodable)
    }

    /// The group ID of a child must be the maximum of its parents'.
    /// Only checked once every parent is present.
    fn gid_consistent(&self, entry: &Entry) -> bool {
        if entry.next().is_empty() {
            return true;
        }
        let mut max: Option<GroupId> = None;
        for parent in entry.next() {
            match self.entries.get(parent) {
                Some(p) => {
                    let gid = p.gid();
                    if max.map_or(true, |m| gid > m) {
                        max = Some(gid);
                    }
                }
                None => return true,
            }
        }
        max == Some(entry.gid())
    }

    /// A parent is required to be newer than every one of its children
    fn clock_consistent(&self, entry: &Entry, clock: &LamportClock) -> bool {
        entry.next().iter().all(|parent| {
            self.clocks
                .get(parent)
                .map_or(true, |parent_clock| clock.time > parent_clock.time)
        })
    }

    /// Join a set of entries into the log
    ///
    /// Invalid entries are dropped with a trace log, entries with
    /// unresolved parents are deferred until the parents arrive or
    /// their time-to-live expires. Returns the IDs that made it in.
    /// Joining is commutative and idempotent.
    pub fn join(&mut self, others: Vec<Entry>) -> Result<Vec<EntryId>, LogError> {
        let now = now_timestamp();
        let mut staged: Vec<(Entry, LamportClock)> = vec![];
        for mut entry in others {
            let id = match entry.id() {
                Some(id) => id,
                None => entry.compute_id(),
            };
            if self.entries.contains_key(&id) || self.pending.contains_key(&id) {
                continue;
            }
            match self.admit(&mut entry) {
                Ok(clock) => staged.push((entry, clock)),
                Err(e) => {
                    debug_println!("join: dropping entry {} : {:?}", id, e);
                }
            }
        }

        let mut joined = vec![];
        // settle entries whose parents are all present, round by round
        loop {
            let mut progress = false;
            let mut deferred = vec![];
            for (entry, clock) in staged {
                let resolved = entry.next().iter().all(|p| self.entries.contains_key(p));
                if resolved {
                    if !self.clock_consistent(&entry, &clock) {
                        debug_println!("join: entry {} older than a parent", entry.id().unwrap());
                        progress = true;
                        continue;
                    }
                    if !self.gid_consistent(&entry) {
                        debug_println!("join: entry {} carries a wrong gid", entry.id().unwrap());
                        progress = true;
                        continue;
                    }
                    joined.push(entry.id().unwrap());
                    self.insert_resolved(entry, clock);
                    progress = true;
                } else {
                    deferred.push((entry, clock));
                }
            }
            staged = deferred;

            // a settled parent may unblock a previously pending entry
            let pending_ids: Vec<EntryId> = self.pending.keys().cloned().collect();
            for id in pending_ids {
                let resolved = self.pending[&id]
                    .0
                    .next()
                    .iter()
                    .all(|p| self.entries.contains_key(p));
                if resolved {
                    let (entry, _since) = self.pending.remove(&id).unwrap();
                    let clock = entry
                        .clock_resolved(self.options.box_key.as_ref())
                        .map_err(|_e| LogError::Undecodable)?;
                    staged.push((entry, clock));
                    progress = true;
                }
            }

            if !progress {
                break;
            }
        }

        for (entry, _clock) in staged {
            let id = entry.id().unwrap();
            debug_println!("join: deferring entry {} until its parents arrive", id);
            self.pending.insert(id, (entry, now));
        }
        self.expire_pending(now);

        if let Some(max) = self.options.recycle {
            if self.entries.len() > max {
                self.cut(max);
            }
        }
        Ok(joined)
    }

    /// Drop deferred entries whose parents never arrived
    pub fn expire_pending(&mut self, now: Timestamp) {
        self.pending
            .retain(|_id, (_entry, since)| now < *since + PENDING_ENTRY_TTL);
    }

    /// Breadth-first traversal through `next` links, newest first
    ///
    /// Deterministic for a given log state. Stops after `amount`
    /// entries or at `end` (inclusive).
    pub fn traverse(
        &self,
        roots: &[EntryId],
        amount: usize,
        end: Option<&EntryId>,
    ) -> Vec<Entry> {
        let mut frontier: BinaryHeap<(LamportClock, EntryId)> = BinaryHeap::new();
        let mut visited: HashSet<EntryId> = HashSet::new();
        for root in roots {
            if self.entries.contains_key(root) && visited.insert(*root) {
                frontier.push(self.sort_key(root));
            }
        }

        let mut out = vec![];
        while let Some((_clock, id)) = frontier.pop() {
            let entry = &self.entries[&id];
            out.push(entry.clone());
            if out.len() == amount || end == Some(&id) {
                break;
            }
            for parent in entry.next() {
                if self.entries.contains_key(parent) && visited.insert(*parent) {
                    frontier.push(self.sort_key(parent));
                }
            }
        }
        out
    }

    /// Retain the newest `size` entries and rebuild the heads
    pub fn cut(&mut self, size: usize) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.entries.keys().cloned().collect();
        ids.sort_by_key(|id| self.sort_key(id));
        ids.reverse();

        let removed: Vec<EntryId> = ids.split_off(size.min(ids.len()));
        let kept: HashSet<EntryId> = ids.into_iter().collect();

        self.entries.retain(|id, _e| kept.contains(id));
        self.clocks.retain(|id, _c| kept.contains(id));
        self.ref_count.clear();
        for entry in self.entries.values() {
            for parent in entry.next() {
                if kept.contains(parent) {
                    *self.ref_count.entry(*parent).or_insert(0) += 1;
                }
            }
        }
        self.heads = self
            .entries
            .keys()
            .filter(|id| !self.ref_count.contains_key(*id))
            .cloned()
            .collect();
        removed
    }
}

#[cfg(test)]
mod test {
    use crate::log::*;
    use crate::types::*;
    use crate::utils::*;

    fn new_log(identity: (PrivKey, PubKey)) -> Log {
        Log::new(fresh_gid(), LogOptions::new(identity))
    }

    #[test]
    pub fn test_append_heads() {
        let identity = generate_keypair();
        let mut log = new_log(identity);
        let a = log.append(b"a".to_vec()).unwrap();
        let b = log.append(b"b".to_vec()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.heads(), vec![b.id().unwrap()]);
        assert_eq!(b.next(), &vec![a.id().unwrap()]);
        assert_eq!(b.gid(), a.gid());
        assert!(b.clock().unwrap().time > a.clock().unwrap().time);
    }

    #[test]
    pub fn test_join_commutative_idempotent() {
        let id_a = generate_keypair();
        let id_b = generate_keypair();
        let log_id = fresh_gid();

        let mut a = Log::new(log_id, LogOptions::new(id_a));
        let mut b = Log::new(log_id, LogOptions::new(id_b));
        let e1 = a.append(b"one".to_vec()).unwrap();
        let e2 = a.append(b"two".to_vec()).unwrap();
        let e3 = b.append(b"three".to_vec()).unwrap();

        let mut ab = Log::new(log_id, LogOptions::new(id_a));
        ab.join(vec![e1.clone(), e2.clone()]).unwrap();
        ab.join(vec![e3.clone()]).unwrap();

        let mut ba = Log::new(log_id, LogOptions::new(id_a));
        ba.join(vec![e3.clone()]).unwrap();
        ba.join(vec![e1.clone(), e2.clone()]).unwrap();

        // joining again must not change anything
        ba.join(vec![e2.clone(), e3.clone()]).unwrap();

        assert_eq!(ab.len(), 3);
        assert_eq!(ab.len(), ba.len());
        assert_eq!(ab.heads(), ba.heads());
        assert_eq!(ab.clock_time(), ba.clock_time());

        // both logs hold two heads: e2 and e3 are unreferenced
        assert_eq!(ab.heads().len(), 2);
        assert!(ab.heads().contains(&e2.id().unwrap()));
        assert!(ab.heads().contains(&e3.id().unwrap()));
    }

    #[test]
    pub fn test_join_defers_orphans() {
        let identity = generate_keypair();
        let mut origin = new_log(identity);
        let parent = origin.append(b"parent".to_vec()).unwrap();
        let child = origin.append(b"child".to_vec()).unwrap();

        let mut log = new_log(generate_keypair());
        log.join(vec![child.clone()]).unwrap();
        assert_eq!(log.len(), 0);

        log.join(vec![parent.clone()]).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.heads(), vec![child.id().unwrap()]);
    }

    #[test]
    pub fn test_join_rejects_tampered() {
        let identity = generate_keypair();
        let mut origin = new_log(identity);
        let entry = origin.append(b"payload".to_vec()).unwrap();

        let tampered = match entry {
            Entry::V0(mut e) => {
                e.payload = MaybeEncrypted::Plain(b"changed".to_vec());
                Entry::V0(e)
            }
        };
        let mut log = new_log(generate_keypair());
        let joined = log.join(vec![tampered]).unwrap();
        assert!(joined.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    pub fn test_can_append_gate() {
        let allowed = generate_keypair();
        let denied = generate_keypair();
        let log_id = fresh_gid();

        let mut a = Log::new(log_id, LogOptions::new(allowed));
        let mut d = Log::new(log_id, LogOptions::new(denied));
        let ok = a.append(b"ok".to_vec()).unwrap();
        let not_ok = d.append(b"never".to_vec()).unwrap();

        let gate_key = allowed.1;
        let mut options = LogOptions::new(generate_keypair());
        options.can_append = Some(Box::new(move |entry: &Entry| {
            entry.author() == Some(&gate_key)
        }));
        let mut log = Log::new(log_id, options);
        let joined = log.join(vec![ok.clone(), not_ok]).unwrap();
        assert_eq!(joined, vec![ok.id().unwrap()]);
        assert_eq!(log.len(), 1);
    }

    #[test]
    pub fn test_traverse() {
        let identity = generate_keypair();
        let mut log = new_log(identity);
        let mut ids = vec![];
        for i in 0..10u8 {
            ids.push(log.append(vec![i]).unwrap().id().unwrap());
        }

        let heads = log.heads();
        let newest_two = log.traverse(&heads, 2, None);
        assert_eq!(newest_two.len(), 2);
        assert_eq!(newest_two[0].id().unwrap(), ids[9]);
        assert_eq!(newest_two[1].id().unwrap(), ids[8]);

        let until = log.traverse(&heads, usize::MAX, Some(&ids[7]));
        assert_eq!(until.len(), 3);
        assert_eq!(until.last().unwrap().id().unwrap(), ids[7]);

        let all = log.traverse(&heads, usize::MAX, None);
        assert_eq!(all.len(), 10);
    }

    #[test]
    pub fn test_cut_and_recycle() {
        let identity = generate_keypair();
        let mut log = new_log(identity);
        let mut ids = vec![];
        for i in 0..10u8 {
            ids.push(log.append(vec![i]).unwrap().id().unwrap());
        }
        let removed = log.cut(4);
        assert_eq!(removed.len(), 6);
        assert_eq!(log.len(), 4);
        assert!(log.has(&ids[9]));
        assert!(!log.has(&ids[5]));
        assert_eq!(log.heads(), vec![ids[9]]);

        let mut options = LogOptions::new(generate_keypair());
        options.recycle = Some(3);
        let mut recycled = Log::new(fresh_gid(), options);
        for i in 0..10u8 {
            recycled.append(vec![i]).unwrap();
        }
        assert_eq!(recycled.len(), 3);
    }

    #[test]
    pub fn test_remove_promotes_parents() {
        let identity = generate_keypair();
        let mut log = new_log(identity);
        let a = log.append(b"a".to_vec()).unwrap();
        let b = log.append(b"b".to_vec()).unwrap();
        log.remove(&b.id().unwrap());
        assert_eq!(log.len(), 1);
        assert_eq!(log.heads(), vec![a.id().unwrap()]);
    }

    #[test]
    pub fn test_power_of_two_refs() {
        let identity = generate_keypair();
        let mut log = new_log(identity);
        for i in 0..64u8 {
            log.append(vec![i]).unwrap();
        }
        let entry = log.append(b"last".to_vec()).unwrap();
        // positions 1, 3, 7, 15, 31, 63 of the reverse-sorted traversal
        assert_eq!(entry.refs().len(), 6);
        for r in entry.refs() {
            assert!(log.has(r));
        }
    }
}
