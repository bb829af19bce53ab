use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pakt_core::token::Token;
use pakt_core::types::{Amount, Digest, Signature, TimestampMs};

/// Lifecycle of a package within its transaction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PakStatus {
    Created,
    Sent,
    Received,
    Verified,
    Committed,
    RolledBack,
    Failed,
}

/// Which way the packaged tokens move.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PakDirection {
    SenderToReceiver,
    ReceiverToSender,
}

/// Outbound package: the tokens one party gives up in a transaction.
///
/// `merkle_root` is computed over the ordered token-id hashes and is the
/// root named by both commitment proofs; `proof` signs the id set, the
/// direction and the transaction id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExoPak {
    pub id: Uuid,
    pub status: PakStatus,
    pub direction: PakDirection,
    pub tokens: Vec<Token>,
    pub merkle_root: Digest,
    pub proof: Signature,
}

impl ExoPak {
    pub fn total_value(&self) -> Amount {
        self.tokens.iter().map(|t| t.value).sum()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// A single rollback action. Restore puts the listed tokens back to Active
/// with their pre-transaction telomere.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollbackKind {
    Restore,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RollbackStep {
    pub step: u32,
    pub kind: RollbackKind,
    /// Signature over the retro package root and step number.
    pub proof: Signature,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RollbackInstructions {
    pub steps: Vec<RollbackStep>,
    pub timeout_ms: TimestampMs,
    /// Signature over the retro root and timeout.
    pub proof: Signature,
}

/// Rollback insurance: the tokens a party retains, pre-committed as the
/// state to restore if the transaction dies after PREPARED.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetroPak {
    pub id: Uuid,
    pub status: PakStatus,
    pub direction: PakDirection,
    pub tokens: Vec<Token>,
    pub merkle_root: Digest,
    pub rollback: RollbackInstructions,
    pub proof: Signature,
}

impl RetroPak {
    pub fn total_value(&self) -> Amount {
        self.tokens.iter().map(|t| t.value).sum()
    }
}
