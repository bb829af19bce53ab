//! Core token model: immutable identity, mutable telomere, denomination.
//!
//! This module defines the fundamental exchange data structures:
//! - [`Token`] — a discrete value-bearing token with its ownership chain
//! - [`Telomere`] — the per-token tamper-evident ownership suffix
//! - [`OwnershipRecord`] — one closed tenure in the ownership history
//! - [`WisselToken`] — the per-user exchange token carrying the
//!   afrondingsbuffer for absorbing sub-unit remainders
//!
//! The telomere is mutated only by the telomere engine, and only as part of
//! a committed transaction.

use serde::{Deserialize, Serialize};

use crate::constants::AFRONDING_BUFFER_MAX;
use crate::error::PaktError;
use crate::types::{Amount, Denomination, Digest, PublicKey, Signature, TimestampMs, TokenId};

// ── TokenType ────────────────────────────────────────────────────────────────

/// Functional class of a token.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenType {
    /// Ordinary value-bearing token.
    Regular,
    /// The per-user exchange token; carries the afrondingsbuffer.
    Wissel,
    /// Fractional-buffer bookkeeping token.
    Afronding,
}

// ── TokenState ───────────────────────────────────────────────────────────────

/// Lifecycle state of a token. The exchange core moves tokens between
/// Active and Pending; Revoked marks a quarantined token whose ownership
/// chain failed verification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Frozen,
    Expired,
    Revoked,
    Pending,
    Split,
    Merged,
}

// ── Chain of custody ─────────────────────────────────────────────────────────

/// Outcome of a deterministic telomere verification from genesis.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChainOfCustody {
    Verified,
    VerificationFailed,
}

// ── OwnershipRecord ──────────────────────────────────────────────────────────

/// One closed ownership tenure. Records form a hash-linked sequence; the
/// Merkle root over their hashes is the chain-of-custody root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OwnershipRecord {
    /// The party whose tenure this record closes.
    pub owner: PublicKey,
    /// Tenure start (previous transfer timestamp, or issuance time).
    pub start_ms: TimestampMs,
    /// Tenure end (the transfer that closed it).
    pub end_ms: TimestampMs,
    /// The ownership proof that was current during this tenure: a signature
    /// by the preceding owner naming `owner` over the then-current root.
    pub proof: Signature,
    /// BLAKE3 of the preceding record; zero for the issuance record.
    pub prev_record_hash: Digest,
    /// The transaction that closed this tenure (`genesis` for issuance).
    pub transfer_method: String,
}

// ── Telomere ─────────────────────────────────────────────────────────────────

/// The tamper-evident ownership suffix of a token.
///
/// Invariant: `transfer_count == history.len()`, strictly increasing; the
/// issuance record counts as the first transfer. `history_root` is the
/// Merkle root over the ordered record hashes and is recomputed on every
/// transfer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Telomere {
    /// Current owner.
    pub owner: PublicKey,
    /// Signature by the previous owner over `(token_id, owner, history_root)`;
    /// self-signed at issuance.
    pub ownership_proof: Signature,
    pub previous_owner: Option<PublicKey>,
    /// Timestamp of the most recent transfer (issuance time initially).
    pub transfer_at_ms: TimestampMs,
    /// Ordered, hash-linked tenure records from genesis.
    pub history: Vec<OwnershipRecord>,
    /// Merkle root over the record hashes (chain-of-custody root).
    pub history_root: Digest,
    pub transfer_count: u64,
}

// ── Token ────────────────────────────────────────────────────────────────────

/// A discrete value-bearing token. Identity fields are immutable after
/// construction; only `telomere`, `state`, `updated_at_ms` and `version`
/// change, and only through the exchange core.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub id: TokenId,
    pub denomination: Denomination,
    /// Value in subunits; always `denomination × 100`.
    pub value: Amount,
    pub token_type: TokenType,
    pub state: TokenState,
    pub telomere: Telomere,
    pub created_at_ms: TimestampMs,
    pub updated_at_ms: TimestampMs,
    /// Optimistic-concurrency version; bumped on every mutation.
    pub version: u64,
}

impl Token {
    /// Assemble a token, checking the value/denomination coupling. The
    /// telomere is produced by the telomere engine's issuance path.
    pub fn new(
        id: TokenId,
        token_type: TokenType,
        telomere: Telomere,
        now_ms: TimestampMs,
    ) -> Result<Self, PaktError> {
        let denomination = id.denomination;
        Ok(Self {
            id,
            denomination,
            value: denomination.value(),
            token_type,
            state: TokenState::Active,
            telomere,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            version: 1,
        })
    }

    pub fn owner(&self) -> &PublicKey {
        &self.telomere.owner
    }

    pub fn is_active(&self) -> bool {
        self.state == TokenState::Active
    }

    /// Record a mutation: bump version and touch the update timestamp.
    pub fn touch(&mut self, now_ms: TimestampMs) {
        self.version += 1;
        self.updated_at_ms = now_ms;
    }

    /// Check the value/denomination coupling on a token received from a peer.
    pub fn check_value(&self) -> Result<(), PaktError> {
        let expected = self.denomination.value();
        if self.value != expected || self.id.denomination != self.denomination {
            return Err(PaktError::TokenValueMismatch {
                denomination: self.denomination.units(),
                expected,
                got: self.value,
            });
        }
        Ok(())
    }
}

// ── WisselToken ──────────────────────────────────────────────────────────────

/// The single per-user exchange token. Its `afronding_buffer` absorbs
/// sub-unit remainders (0–99 subunits) when a payment cannot be met exactly
/// with whole denominations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WisselToken {
    pub token: Token,
    /// Fractional buffer in subunits, always within `0..=99`.
    pub afronding_buffer: Amount,
}

impl WisselToken {
    pub fn new(token: Token) -> Result<Self, PaktError> {
        if token.token_type != TokenType::Wissel {
            return Err(PaktError::Internal(format!(
                "token {} is not a wissel token",
                token.id
            )));
        }
        Ok(Self {
            token,
            afronding_buffer: 0,
        })
    }

    /// Issuance prefix used by the minimum-balance rule.
    pub fn issuance(&self) -> String {
        self.token.id.issuance()
    }

    /// Pay `delta` subunits out of the buffer.
    pub fn consume(&mut self, delta: Amount) -> Result<(), PaktError> {
        if delta > self.afronding_buffer {
            return Err(PaktError::BufferExceeded {
                delta,
                max: self.afronding_buffer,
            });
        }
        self.afronding_buffer -= delta;
        Ok(())
    }

    /// Credit `delta` subunits into the buffer; the result may not exceed
    /// the 0.99-unit bound.
    pub fn credit(&mut self, delta: Amount) -> Result<(), PaktError> {
        let next = self.afronding_buffer + delta;
        if next > AFRONDING_BUFFER_MAX {
            return Err(PaktError::BufferExceeded {
                delta,
                max: AFRONDING_BUFFER_MAX,
            });
        }
        self.afronding_buffer = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Denomination;

    fn stub_telomere(owner: Vec<u8>) -> Telomere {
        Telomere {
            owner: PublicKey(owner),
            ownership_proof: Signature(vec![0]),
            previous_owner: None,
            transfer_at_ms: 0,
            history: Vec::new(),
            history_root: Digest::ZERO,
            transfer_count: 0,
        }
    }

    fn stub_token(token_type: TokenType) -> Token {
        let id = TokenId::new("nyc", "batch1", Denomination::new(10).unwrap(), 0).unwrap();
        Token::new(id, token_type, stub_telomere(vec![1]), 1000).unwrap()
    }

    #[test]
    fn token_value_follows_denomination() {
        let t = stub_token(TokenType::Regular);
        assert_eq!(t.value, 1000);
        assert!(t.check_value().is_ok());
    }

    #[test]
    fn tampered_value_is_detected() {
        let mut t = stub_token(TokenType::Regular);
        t.value = 900;
        assert!(t.check_value().is_err());
    }

    #[test]
    fn touch_bumps_version() {
        let mut t = stub_token(TokenType::Regular);
        let v = t.version;
        t.touch(2000);
        assert_eq!(t.version, v + 1);
        assert_eq!(t.updated_at_ms, 2000);
    }

    #[test]
    fn wissel_requires_wissel_type() {
        assert!(WisselToken::new(stub_token(TokenType::Regular)).is_err());
        assert!(WisselToken::new(stub_token(TokenType::Wissel)).is_ok());
    }

    #[test]
    fn buffer_bounds_are_enforced() {
        let mut w = WisselToken::new(stub_token(TokenType::Wissel)).unwrap();
        assert!(w.credit(99).is_ok());
        assert!(w.credit(1).is_err());
        assert!(w.consume(50).is_ok());
        assert_eq!(w.afronding_buffer, 49);
        assert!(w.consume(50).is_err());
    }
}
