//! Transaction lifecycle: states, timestamps, proofs.

use serde::{Deserialize, Serialize};
use std::fmt;

use pakt_core::error::PaktError;
use pakt_core::types::{Digest, Signature, TimestampMs, TransactionId};
use pakt_pak::{ExoPak, RetroPak};

use crate::context::TransactionContext;

// ── TransactionState ─────────────────────────────────────────────────────────

/// Monotonic commit path with Aborting/Aborted and Failed exits.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionState {
    Unspecified,
    Initiated,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Failed
        )
    }

    /// Abort is allowed at any state up to and including COMMITTING.
    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            TransactionState::Unspecified
                | TransactionState::Initiated
                | TransactionState::Preparing
                | TransactionState::Prepared
                | TransactionState::Committing
                | TransactionState::Aborting
        )
    }

    /// Legal direct transitions, exhaustively.
    pub fn may_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (*self, next),
            (Unspecified, Initiated)
                | (Initiated, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Initiated, Aborting)
                | (Preparing, Aborting)
                | (Prepared, Aborting)
                | (Committing, Aborting)
                | (Aborting, Aborted)
                | (Committing, Failed)
                | (Aborting, Failed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Unspecified => "UNSPECIFIED",
            TransactionState::Initiated => "INITIATED",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborting => "ABORTING",
            TransactionState::Aborted => "ABORTED",
            TransactionState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

// ── Timestamps / proofs ──────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionTimestamps {
    pub created_at_ms: TimestampMs,
    pub initiated_at_ms: Option<TimestampMs>,
    pub prepared_at_ms: Option<TimestampMs>,
    pub committed_at_ms: Option<TimestampMs>,
    pub completed_at_ms: Option<TimestampMs>,
    /// Hard deadline: `initiated_at + constraints.max_duration_ms`.
    pub timeout_at_ms: TimestampMs,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionProofs {
    pub transaction_signature: Option<Signature>,
    pub sender_commitment: Option<Signature>,
    pub receiver_commitment: Option<Signature>,
    /// Hash witness that both sides committed to the same package roots.
    pub atomic_commitment: Option<Digest>,
}

// ── Transaction ──────────────────────────────────────────────────────────────

/// One side's view of an in-flight or completed exchange.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub context: TransactionContext,
    pub sender_exopak: Option<ExoPak>,
    pub receiver_exopak: Option<ExoPak>,
    pub sender_retropak: Option<RetroPak>,
    pub receiver_retropak: Option<RetroPak>,
    pub timestamps: TransactionTimestamps,
    pub proofs: TransactionProofs,
    /// Afrondingsbuffer adjustment owed by the sender at commit (positive =
    /// credit, negative = consume).
    pub sender_buffer_delta: i64,
    pub abort_reason: Option<String>,
}

impl Transaction {
    pub fn new(id: TransactionId, context: TransactionContext, now_ms: TimestampMs) -> Self {
        let timeout_at_ms = now_ms + context.constraints.max_duration_ms;
        Self {
            id,
            state: TransactionState::Unspecified,
            context,
            sender_exopak: None,
            receiver_exopak: None,
            sender_retropak: None,
            receiver_retropak: None,
            timestamps: TransactionTimestamps {
                created_at_ms: now_ms,
                timeout_at_ms,
                ..Default::default()
            },
            proofs: TransactionProofs::default(),
            sender_buffer_delta: 0,
            abort_reason: None,
        }
    }

    /// Step the state machine, refusing any transition the diagram does not
    /// allow.
    pub fn transition(&mut self, next: TransactionState) -> Result<(), PaktError> {
        if !self.state.may_transition_to(next) {
            return Err(PaktError::InvalidState {
                expected: format!("state able to reach {next}"),
                got: self.state.to_string(),
            });
        }
        tracing::debug!(tx = %self.id, from = %self.state, to = %next, "transition");
        self.state = next;
        Ok(())
    }

    pub fn is_expired(&self, now_ms: TimestampMs) -> bool {
        !self.state.is_terminal() && now_ms > self.timestamps.timeout_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransactionConstraints;
    use pakt_core::types::PublicKey;

    fn tx() -> Transaction {
        Transaction::new(
            TransactionId::generate(),
            TransactionContext {
                sender: PublicKey(vec![1]),
                receiver: None,
                amount: 1_000,
                purpose: "test".to_string(),
                constraints: TransactionConstraints::default(),
            },
            1_000,
        )
    }

    #[test]
    fn commit_path_is_monotonic() {
        let mut t = tx();
        for next in [
            TransactionState::Initiated,
            TransactionState::Preparing,
            TransactionState::Prepared,
            TransactionState::Committing,
            TransactionState::Committed,
        ] {
            t.transition(next).unwrap();
        }
        assert!(t.state.is_terminal());
    }

    #[test]
    fn committed_cannot_abort() {
        assert!(!TransactionState::Committed.can_abort());
        assert!(!TransactionState::Committed.may_transition_to(TransactionState::Aborting));
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut t = tx();
        t.transition(TransactionState::Initiated).unwrap();
        let err = t.transition(TransactionState::Committing).unwrap_err();
        assert!(matches!(err, PaktError::InvalidState { .. }));
    }

    #[test]
    fn timeout_uses_max_duration() {
        let t = tx();
        assert_eq!(t.timestamps.timeout_at_ms, 1_000 + 30_000);
        assert!(t.is_expired(31_001));
        assert!(!t.is_expired(31_000));
    }
}
