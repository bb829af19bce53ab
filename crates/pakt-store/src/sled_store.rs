//! Durable token store backed by sled (pure-Rust, no C dependencies).
//!
//! Named trees:
//!   tokens       — token id utf8 bytes → bincode(Token)
//!   attestations — subject bytes ++ issued_at be bytes → bincode(Attestation)

use std::path::Path;

use pakt_core::error::PaktError;
use pakt_core::token::Token;
use pakt_core::types::{PublicKey, TokenId};

use crate::traits::{Attestation, AttestationStore, TokenStore};

pub struct SledTokenStore {
    _db: sled::Db,
    tokens: sled::Tree,
    attestations: sled::Tree,
}

fn storage_err(e: sled::Error) -> PaktError {
    PaktError::Storage(e.to_string())
}

fn codec_err(e: bincode::Error) -> PaktError {
    PaktError::Serialization(e.to_string())
}

impl SledTokenStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PaktError> {
        let db = sled::open(path).map_err(storage_err)?;
        let tokens = db.open_tree("tokens").map_err(storage_err)?;
        let attestations = db.open_tree("attestations").map_err(storage_err)?;
        Ok(Self {
            _db: db,
            tokens,
            attestations,
        })
    }

    fn key(id: &TokenId) -> Vec<u8> {
        id.to_string().into_bytes()
    }
}

impl TokenStore for SledTokenStore {
    fn get(&self, id: &TokenId) -> Result<Option<Token>, PaktError> {
        match self.tokens.get(Self::key(id)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    fn put(&self, token: &Token) -> Result<(), PaktError> {
        let bytes = bincode::serialize(token).map_err(codec_err)?;
        self.tokens
            .insert(Self::key(&token.id), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    fn remove(&self, id: &TokenId) -> Result<Option<Token>, PaktError> {
        match self.tokens.remove(Self::key(id)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, id: &TokenId) -> bool {
        self.tokens.contains_key(Self::key(id)).unwrap_or(false)
    }

    fn portfolio(&self, owner: &PublicKey) -> Result<Vec<Token>, PaktError> {
        let mut out = Vec::new();
        for item in self.tokens.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let token: Token = bincode::deserialize(&bytes).map_err(codec_err)?;
            if token.owner() == owner {
                out.push(token);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn flush(&self) -> Result<(), PaktError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }
}

impl AttestationStore for SledTokenStore {
    fn put_attestation(&self, attestation: &Attestation) -> Result<(), PaktError> {
        let mut key = attestation.subject.as_bytes().to_vec();
        key.extend_from_slice(&attestation.issued_at_ms.to_be_bytes());
        let bytes = bincode::serialize(attestation).map_err(codec_err)?;
        self.attestations.insert(key, bytes).map_err(storage_err)?;
        Ok(())
    }

    fn attestations_for(&self, subject: &PublicKey) -> Result<Vec<Attestation>, PaktError> {
        let mut out = Vec::new();
        for item in self.attestations.scan_prefix(subject.as_bytes()) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(bincode::deserialize(&bytes).map_err(codec_err)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::types::Denomination;
    use pakt_crypto::keypair::KeyPair;
    use pakt_telomere::genesis::issue_batch;

    #[test]
    fn tokens_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let alice = KeyPair::generate();
        let tokens =
            issue_batch(&alice, "nyc", "batch1", Denomination::new(20).unwrap(), 2, 1_000).unwrap();
        let id = tokens[0].id.clone();

        {
            let store = SledTokenStore::open(dir.path()).unwrap();
            for t in &tokens {
                store.put(t).unwrap();
            }
            store.flush().unwrap();
        }

        let store = SledTokenStore::open(dir.path()).unwrap();
        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded, tokens[0]);
        assert_eq!(store.portfolio(&alice.public_key).unwrap().len(), 2);
    }

    #[test]
    fn attestations_scan_by_subject() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledTokenStore::open(dir.path()).unwrap();
        let issuer = KeyPair::generate();
        let subject = KeyPair::generate();

        let attestation = Attestation {
            subject: subject.public_key.clone(),
            issuer: issuer.public_key.clone(),
            claim: "reliable-peer".to_string(),
            signature: issuer.sign(b"reliable-peer"),
            issued_at_ms: 1_000,
        };
        store.put_attestation(&attestation).unwrap();

        let found = store.attestations_for(&subject.public_key).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].claim, "reliable-peer");
        assert!(store
            .attestations_for(&issuer.public_key)
            .unwrap()
            .is_empty());
    }
}
