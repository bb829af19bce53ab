//! Content-addressed store for ownership records.
//!
//! Tokens carry only their hash-linked history; this store keeps the
//! records keyed by their BLAKE3 hash so history can be archived and
//! looked up independently of any token copy.

use std::collections::HashMap;

use pakt_core::token::{OwnershipRecord, Token};
use pakt_core::types::Digest;

use crate::engine::record_hash;

#[derive(Default)]
pub struct RecordStore {
    records: HashMap<Digest, OwnershipRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one record; returns its content hash.
    pub fn insert(&mut self, record: OwnershipRecord) -> Digest {
        let hash = record_hash(&record);
        self.records.insert(hash, record);
        hash
    }

    pub fn get(&self, hash: &Digest) -> Option<&OwnershipRecord> {
        self.records.get(hash)
    }

    pub fn contains(&self, hash: &Digest) -> bool {
        self.records.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Archive a token's full history. Idempotent: records are keyed by
    /// content, so re-archiving changes nothing.
    pub fn archive(&mut self, token: &Token) -> Vec<Digest> {
        token
            .telomere
            .history
            .iter()
            .map(|r| self.insert(r.clone()))
            .collect()
    }

    /// Walk a hash-link chain backwards from `head` as far as the store
    /// holds records.
    pub fn chain_back(&self, head: &Digest) -> Vec<&OwnershipRecord> {
        let mut out = Vec::new();
        let mut cursor = *head;
        while let Some(record) = self.records.get(&cursor) {
            out.push(record);
            if record.prev_record_hash == Digest::ZERO {
                break;
            }
            cursor = record.prev_record_hash;
        }
        out
    }
}
