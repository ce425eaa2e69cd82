//! Log entry

use debug_print::*;

use crate::errors::*;
use crate::types::*;
use crate::utils::*;

#[derive(Debug, PartialEq)]
pub enum EntryError {
    InvalidSignature,
    HashMismatch,
    Undecodable,
    MissingSignature,
}

/// Recipient box keys for the independently sealable parts of an entry
#[derive(Clone, Copy, Debug, Default)]
pub struct EntryEncryption {
    pub payload: Option<BoxPubKey>,
    pub clock: Option<BoxPubKey>,
    pub author: Option<BoxPubKey>,
}

impl EntryV0 {
    /// New signed entry
    ///
    /// Seals the requested parts first, then signs and hashes, so the
    /// ID and signature cover ciphertext and stay stable across
    /// recipients holding different box keys.
    pub fn new(
        author_privkey: PrivKey,
        author_pubkey: PubKey,
        clock: LamportClock,
        gid: GroupId,
        min_replicas: u32,
        payload: Vec<u8>,
        next: Vec<EntryId>,
        refs: Vec<EntryId>,
        encryption: &EntryEncryption,
    ) -> Result<EntryV0, WeftError> {
        fn seal<T: serde::Serialize>(
            value: T,
            recipient: Option<BoxPubKey>,
        ) -> Result<MaybeEncrypted<T>, WeftError> {
            match recipient {
                None => Ok(MaybeEncrypted::Plain(value)),
                Some(key) => {
                    let ser = serde_bare::to_vec(&value)?;
                    Ok(MaybeEncrypted::Encrypted(seal_box(&key, &ser)))
                }
            }
        }

        let mut entry = EntryV0 {
            author: seal(author_pubkey, encryption.author)?,
            meta: EntryMetaV0 {
                gid,
                min_replicas,
                extra: vec![],
            },
            clock: seal(clock, encryption.clock)?,
            payload: seal(payload, encryption.payload)?,
            next,
            refs,
            sigs: vec![],
            id: None,
        };

        // the same bytes Entry::canonical_bytes will reproduce
        let canonical = serde_bare::to_vec(&Entry::V0(entry.clone()))?;
        let sig = sign(author_privkey, author_pubkey, canonical.as_slice())?;
        entry.sigs.push(SigPair {
            key: author_pubkey,
            sig,
        });
        entry.id = Some(Digest::Blake3Digest32(
            *blake3::hash(canonical.as_slice()).as_bytes(),
        ));
        Ok(entry)
    }
}

impl Entry {
    /// New signed entry
    pub fn new(
        author_privkey: PrivKey,
        author_pubkey: PubKey,
        clock: LamportClock,
        gid: GroupId,
        min_replicas: u32,
        payload: Vec<u8>,
        next: Vec<EntryId>,
        refs: Vec<EntryId>,
        encryption: &EntryEncryption,
    ) -> Result<Entry, WeftError> {
        EntryV0::new(
            author_privkey,
            author_pubkey,
            clock,
            gid,
            min_replicas,
            payload,
            next,
            refs,
            encryption,
        )
        .map(|e| Entry::V0(e))
    }

    fn v0(&self) -> &EntryV0 {
        match self {
            Entry::V0(e) => e,
        }
    }

    /// Reproducible serialization for hashing and signing,
    /// with the trailing ID and the signatures cleared
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut entry = self.v0().clone();
        entry.sigs = vec![];
        entry.id = None;
        serde_bare::to_vec(&Entry::V0(entry)).unwrap()
    }

    /// Recompute the ID from the canonical bytes
    pub fn compute_id(&self) -> EntryId {
        Digest::Blake3Digest32(*blake3::hash(self.canonical_bytes().as_slice()).as_bytes())
    }

    /// Get the trailing ID
    pub fn id(&self) -> Option<EntryId> {
        self.v0().id
    }

    /// Set the trailing ID
    pub fn set_id(&mut self, id: EntryId) {
        match self {
            Entry::V0(e) => e.id = Some(id),
        }
    }

    /// Get the group ID
    pub fn gid(&self) -> GroupId {
        self.v0().meta.gid
    }

    /// Get the replication hint
    pub fn min_replicas(&self) -> u32 {
        self.v0().meta.min_replicas
    }

    /// Get the direct parents
    pub fn next(&self) -> &Vec<EntryId> {
        &self.v0().next
    }

    /// Get the secondary ancestor references
    pub fn refs(&self) -> &Vec<EntryId> {
        &self.v0().refs
    }

    /// Get the signatures
    pub fn sigs(&self) -> &Vec<SigPair> {
        &self.v0().sigs
    }

    /// Get the clock if it is not sealed
    pub fn clock(&self) -> Option<&LamportClock> {
        self.v0().clock.plain()
    }

    /// Get the author if not sealed
    pub fn author(&self) -> Option<&PubKey> {
        self.v0().author.plain()
    }

    /// Get the clock, opening the sealed box if a key is given
    pub fn clock_resolved(&self, box_key: Option<&BoxPrivKey>) -> Result<LamportClock, EntryError> {
        match &self.v0().clock {
            MaybeEncrypted::Plain(c) => Ok(*c),
            MaybeEncrypted::Encrypted(sealed) => {
                let key = box_key.ok_or(EntryError::Undecodable)?;
                let ser = open_box(key, sealed).map_err(|_e| EntryError::Undecodable)?;
                serde_bare::from_slice(ser.as_slice()).map_err(|_e| EntryError::Undecodable)
            }
        }
    }

    /// Get the author, opening the sealed box if a key is given
    pub fn author_resolved(&self, box_key: Option<&BoxPrivKey>) -> Result<PubKey, EntryError> {
        match &self.v0().author {
            MaybeEncrypted::Plain(a) => Ok(*a),
            MaybeEncrypted::Encrypted(sealed) => {
                let key = box_key.ok_or(EntryError::Undecodable)?;
                let ser = open_box(key, sealed).map_err(|_e| EntryError::Undecodable)?;
                serde_bare::from_slice(ser.as_slice()).map_err(|_e| EntryError::Undecodable)
            }
        }
    }

    /// Get the payload, opening the sealed box if a key is given
    pub fn payload_resolved(&self, box_key: Option<&BoxPrivKey>) -> Result<Vec<u8>, EntryError> {
        match &self.v0().payload {
            MaybeEncrypted::Plain(p) => Ok(p.clone()),
            MaybeEncrypted::Encrypted(sealed) => {
                let key = box_key.ok_or(EntryError::Undecodable)?;
                let ser = open_box(key, sealed).map_err(|_e| EntryError::Undecodable)?;
                serde_bare::from_slice(ser.as_slice()).map_err(|_e| EntryError::Undecodable)
            }
        }
    }

    /// Append a relay signature over the canonical bytes
    ///
    /// Does not change the ID.
    pub fn sign_as_relay(&mut self, privkey: PrivKey, pubkey: PubKey) -> Result<(), WeftError> {
        let canonical = self.canonical_bytes();
        let sig = sign(privkey, pubkey, canonical.as_slice())?;
        match self {
            Entry::V0(e) => e.sigs.push(SigPair { key: pubkey, sig }),
        }
        Ok(())
    }

    /// Verify signatures and structural well-formedness
    ///
    /// Checks that every signature pair verifies over the canonical
    /// bytes, that a plain author produced the first signature, and
    /// that the trailing ID, when set, matches the canonical hash.
    pub fn verify(&self) -> Result<(), EntryError> {
        let e = self.v0();
        if e.sigs.is_empty() {
            return Err(EntryError::MissingSignature);
        }
        let canonical = self.canonical_bytes();
        for pair in &e.sigs {
            verify(canonical.as_slice(), pair.sig, pair.key).map_err(|_e| {
                debug_println!("entry signature verification failed");
                EntryError::InvalidSignature
            })?;
        }
        if let Some(author) = e.author.plain() {
            if e.sigs[0].key != *author {
                return Err(EntryError::InvalidSignature);
            }
        }
        match e.id {
            Some(id) => {
                let computed =
                    Digest::Blake3Digest32(*blake3::hash(canonical.as_slice()).as_bytes());
                if id != computed {
                    return Err(EntryError::HashMismatch);
                }
            }
            None => (),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::entry::*;
    use crate::types::*;
    use crate::utils::*;

    fn new_entry(payload: &[u8], encryption: &EntryEncryption) -> Entry {
        let (priv_key, pub_key) = generate_keypair();
        let clock = LamportClock {
            id: pub_key,
            time: 1,
        };
        Entry::new(
            priv_key,
            pub_key,
            clock,
            fresh_gid(),
            2,
            payload.to_vec(),
            vec![],
            vec![],
            encryption,
        )
        .ok()
        .unwrap()
    }

    #[test]
    pub fn test_create_verify() {
        let entry = new_entry(b"hello", &EntryEncryption::default());
        entry.verify().expect("entry should verify");
        assert_eq!(entry.id().unwrap(), entry.compute_id());
        assert_eq!(entry.payload_resolved(None).unwrap(), b"hello".to_vec());
        assert_eq!(entry.min_replicas(), 2);

        let ser = serde_bare::to_vec(&entry).unwrap();
        let de: Entry = serde_bare::from_slice(&ser).unwrap();
        de.verify().expect("decoded entry should verify");
        assert_eq!(de, entry);
    }

    #[test]
    pub fn test_tamper() {
        let entry = new_entry(b"hello", &EntryEncryption::default());
        let mut tampered = match entry.clone() {
            Entry::V0(mut e) => {
                e.payload = MaybeEncrypted::Plain(b"tampered".to_vec());
                Entry::V0(e)
            }
        };
        assert_eq!(tampered.verify(), Err(EntryError::InvalidSignature));
        tampered.set_id(entry.id().unwrap());
        assert_eq!(tampered.verify(), Err(EntryError::InvalidSignature));
    }

    #[test]
    pub fn test_wrong_id() {
        let entry = new_entry(b"hello", &EntryEncryption::default());
        let other = new_entry(b"other", &EntryEncryption::default());
        let mut wrong = entry.clone();
        wrong.set_id(other.id().unwrap());
        assert_eq!(wrong.verify(), Err(EntryError::HashMismatch));
    }

    #[test]
    pub fn test_sealed_parts() {
        let (box_priv, box_pub) = generate_box_keypair();
        let encryption = EntryEncryption {
            payload: Some(box_pub),
            clock: Some(box_pub),
            author: Some(box_pub),
        };
        let entry = new_entry(b"secret", &encryption);
        entry.verify().expect("sealed entry should verify");

        assert!(entry.clock().is_none());
        assert!(entry.author().is_none());
        assert_eq!(entry.payload_resolved(None), Err(EntryError::Undecodable));

        let clock = entry.clock_resolved(Some(&box_priv)).unwrap();
        assert_eq!(clock.time, 1);
        assert_eq!(
            entry.payload_resolved(Some(&box_priv)).unwrap(),
            b"secret".to_vec()
        );
        assert_eq!(
            entry.author_resolved(Some(&box_priv)).unwrap(),
            entry.sigs()[0].key
        );
    }

    #[test]
    pub fn test_relay_signature_keeps_id() {
        let mut entry = new_entry(b"hello", &EntryEncryption::default());
        let id = entry.id().unwrap();
        let (relay_priv, relay_pub) = generate_keypair();
        entry.sign_as_relay(relay_priv, relay_pub).unwrap();
        assert_eq!(entry.sigs().len(), 2);
        assert_eq!(entry.compute_id(), id);
        entry.verify().expect("relayed entry should verify");
    }
}
