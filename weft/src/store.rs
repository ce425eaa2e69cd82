//! Entry block store

use crate::types::*;

use std::collections::{hash_map::Iter, HashMap};

/// Content-addressed storage for serialized entries
///
/// Backends are externally synchronized; the in-memory store below is
/// the reference implementation and the default for tests.
pub trait BlockStore {
    /// Load an entry from the store.
    fn get(&self, id: &EntryId) -> Result<Entry, StoreGetError>;

    /// Save an entry to the store.
    fn put(&mut self, entry: &Entry) -> Result<EntryId, StorePutError>;

    /// Delete an entry from the store, returns it with its serialized size.
    fn del(&mut self, id: &EntryId) -> Result<(Entry, usize), StoreDelError>;

    /// Number of entries stored.
    fn len(&self) -> usize;

    /// Total serialized size of the stored entries.
    fn size_bytes(&self) -> usize;
}

#[derive(Debug, PartialEq)]
pub enum StoreGetError {
    NotFound,
    InvalidValue,
    BackendError,
    SerializationError,
}

impl From<serde_bare::error::Error> for StoreGetError {
    fn from(_e: serde_bare::error::Error) -> Self {
        StoreGetError::SerializationError
    }
}

#[derive(Debug, PartialEq)]
pub enum StorePutError {
    BackendError,
    SerializationError,
    InvalidValue,
}

impl From<serde_bare::error::Error> for StorePutError {
    fn from(_e: serde_bare::error::Error) -> Self {
        StorePutError::SerializationError
    }
}

#[derive(Debug, PartialEq)]
pub enum StoreDelError {
    NotFound,
    InvalidValue,
    BackendError,
    SerializationError,
}

impl From<serde_bare::error::Error> for StoreDelError {
    fn from(_e: serde_bare::error::Error) -> Self {
        StoreDelError::SerializationError
    }
}

/// Store with a HashMap backend
pub struct HashMapBlockStore {
    entries: HashMap<EntryId, Entry>,
    bytes: usize,
}

impl HashMapBlockStore {
    pub fn new() -> HashMapBlockStore {
        HashMapBlockStore {
            entries: HashMap::new(),
            bytes: 0,
        }
    }

    pub fn get_all(&self) -> Iter<EntryId, Entry> {
        self.entries.iter()
    }
}

impl BlockStore for HashMapBlockStore {
    fn get(&self, id: &EntryId) -> Result<Entry, StoreGetError> {
        match self.entries.get(id) {
            Some(entry) => Ok(entry.clone()),
            None => Err(StoreGetError::NotFound),
        }
    }

    fn put(&mut self, entry: &Entry) -> Result<EntryId, StorePutError> {
        let id = entry.compute_id();
        let size = serde_bare::to_vec(entry)?.len();
        if self.entries.insert(id, entry.clone()).is_none() {
            self.bytes += size;
        }
        Ok(id)
    }

    fn del(&mut self, id: &EntryId) -> Result<(Entry, usize), StoreDelError> {
        let entry = self.entries.remove(id).ok_or(StoreDelError::NotFound)?;
        let size = serde_bare::to_vec(&entry)?.len();
        self.bytes -= size;
        Ok((entry, size))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn size_bytes(&self) -> usize {
        self.bytes
    }
}
