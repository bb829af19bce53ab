//! Volatile stores for tests and embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use pakt_core::error::PaktError;
use pakt_core::token::Token;
use pakt_core::types::{PublicKey, TokenId};

use crate::traits::{Attestation, AttestationStore, TokenStore};

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<TokenId, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a whole portfolio at once.
    pub fn with_tokens(tokens: impl IntoIterator<Item = Token>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tokens.write().expect("token map");
            for t in tokens {
                map.insert(t.id.clone(), t);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.tokens.read().expect("token map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, id: &TokenId) -> Result<Option<Token>, PaktError> {
        Ok(self.tokens.read().expect("token map").get(id).cloned())
    }

    fn put(&self, token: &Token) -> Result<(), PaktError> {
        self.tokens
            .write()
            .expect("token map")
            .insert(token.id.clone(), token.clone());
        Ok(())
    }

    fn remove(&self, id: &TokenId) -> Result<Option<Token>, PaktError> {
        Ok(self.tokens.write().expect("token map").remove(id))
    }

    fn contains(&self, id: &TokenId) -> bool {
        self.tokens.read().expect("token map").contains_key(id)
    }

    fn portfolio(&self, owner: &PublicKey) -> Result<Vec<Token>, PaktError> {
        let mut out: Vec<Token> = self
            .tokens
            .read()
            .expect("token map")
            .values()
            .filter(|t| t.owner() == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryAttestationStore {
    attestations: RwLock<Vec<Attestation>>,
}

impl MemoryAttestationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttestationStore for MemoryAttestationStore {
    fn put_attestation(&self, attestation: &Attestation) -> Result<(), PaktError> {
        self.attestations
            .write()
            .expect("attestation list")
            .push(attestation.clone());
        Ok(())
    }

    fn attestations_for(&self, subject: &PublicKey) -> Result<Vec<Attestation>, PaktError> {
        Ok(self
            .attestations
            .read()
            .expect("attestation list")
            .iter()
            .filter(|a| &a.subject == subject)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::types::Denomination;
    use pakt_crypto::keypair::KeyPair;
    use pakt_telomere::genesis::issue_batch;

    #[test]
    fn portfolio_filters_by_owner_and_sorts() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut tokens =
            issue_batch(&alice, "nyc", "batch1", Denomination::new(10).unwrap(), 3, 1_000).unwrap();
        tokens.extend(
            issue_batch(&bob, "nyc", "batch2", Denomination::new(5).unwrap(), 2, 1_000).unwrap(),
        );
        let store = MemoryTokenStore::with_tokens(tokens);

        let mine = store.portfolio(&alice.public_key).unwrap();
        assert_eq!(mine.len(), 3);
        for pair in mine.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn remove_round_trip() {
        let alice = KeyPair::generate();
        let tokens =
            issue_batch(&alice, "nyc", "batch1", Denomination::new(10).unwrap(), 1, 1_000).unwrap();
        let id = tokens[0].id.clone();
        let store = MemoryTokenStore::with_tokens(tokens);
        assert!(store.contains(&id));
        assert!(store.remove(&id).unwrap().is_some());
        assert!(store.get(&id).unwrap().is_none());
    }
}
