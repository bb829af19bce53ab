use serde::{Deserialize, Serialize};

use pakt_core::error::PaktError;
use pakt_core::token::Token;
use pakt_core::types::{PublicKey, Signature, TimestampMs, TokenId};

/// Abstract token persistence. The exchange core only ever talks to this
/// trait; concrete back-ends live behind it.
pub trait TokenStore: Send + Sync {
    fn get(&self, id: &TokenId) -> Result<Option<Token>, PaktError>;

    /// Insert or overwrite a token.
    fn put(&self, token: &Token) -> Result<(), PaktError>;

    fn remove(&self, id: &TokenId) -> Result<Option<Token>, PaktError>;

    fn contains(&self, id: &TokenId) -> bool;

    /// All tokens currently owned by `owner`.
    fn portfolio(&self, owner: &PublicKey) -> Result<Vec<Token>, PaktError>;

    /// Flush pending writes to durable storage. No-op for volatile stores.
    fn flush(&self) -> Result<(), PaktError> {
        Ok(())
    }
}

/// A signed statement about a peer, produced by the external trust layer.
/// The core only reads these; issuing and scoring live elsewhere.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Attestation {
    pub subject: PublicKey,
    pub issuer: PublicKey,
    pub claim: String,
    pub signature: Signature,
    pub issued_at_ms: TimestampMs,
}

/// Narrow lookup contract over stored attestations.
pub trait AttestationStore: Send + Sync {
    fn put_attestation(&self, attestation: &Attestation) -> Result<(), PaktError>;

    fn attestations_for(&self, subject: &PublicKey) -> Result<Vec<Attestation>, PaktError>;
}
