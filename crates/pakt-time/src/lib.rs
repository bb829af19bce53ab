//! Time-integrity gate.
//!
//! The exchange core never trusts a bare wall clock at the commit boundary:
//! it asks a [`TimeAuthority`] for a consensus status and refuses to
//! finalize when that status is Inadequate. This is the only point where an
//! external time source can veto a commit.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use pakt_core::error::PaktError;
use pakt_core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Confidence in the local clock, as judged by the external time layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeStatus {
    /// Clock verified against a trusted source.
    Verified,
    /// Clock agrees with peer consensus.
    Consensus,
    /// No adequate agreement; commits must be refused.
    Inadequate,
}

impl TimeStatus {
    pub fn is_adequate(&self) -> bool {
        !matches!(self, TimeStatus::Inadequate)
    }
}

/// Narrow contract the core consumes from the time-source layer.
pub trait TimeAuthority: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
    fn status(&self) -> TimeStatus;
}

/// Pass the commit gate: returns the consensus timestamp, or refuses when
/// the status is Inadequate.
pub fn commit_gate(authority: &dyn TimeAuthority) -> Result<TimestampMs, PaktError> {
    let status = authority.status();
    if !status.is_adequate() {
        warn!(?status, "time-integrity gate refused commit");
        return Err(PaktError::TimeInadequate);
    }
    Ok(authority.now_ms())
}

// ── Implementations ──────────────────────────────────────────────────────────

/// Wall-clock authority. Reports Consensus: a lone system clock is never
/// Verified.
#[derive(Default)]
pub struct SystemTimeAuthority;

impl TimeAuthority for SystemTimeAuthority {
    fn now_ms(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }

    fn status(&self) -> TimeStatus {
        TimeStatus::Consensus
    }
}

/// Settable authority for tests: fix the clock, advance it, flip the status.
pub struct FixedTimeAuthority {
    now_ms: AtomicI64,
    status: Mutex<TimeStatus>,
}

impl FixedTimeAuthority {
    pub fn new(now_ms: TimestampMs, status: TimeStatus) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
            status: Mutex::new(status),
        }
    }

    pub fn set_now(&self, now_ms: TimestampMs) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: TimestampMs) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: TimeStatus) {
        *self.status.lock().expect("time status lock") = status;
    }
}

impl TimeAuthority for FixedTimeAuthority {
    fn now_ms(&self) -> TimestampMs {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn status(&self) -> TimeStatus {
        *self.status.lock().expect("time status lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_passes_on_verified_and_consensus() {
        let auth = FixedTimeAuthority::new(42, TimeStatus::Verified);
        assert_eq!(commit_gate(&auth).unwrap(), 42);
        auth.set_status(TimeStatus::Consensus);
        assert_eq!(commit_gate(&auth).unwrap(), 42);
    }

    #[test]
    fn gate_refuses_inadequate() {
        let auth = FixedTimeAuthority::new(42, TimeStatus::Inadequate);
        assert!(matches!(commit_gate(&auth), Err(PaktError::TimeInadequate)));
    }

    #[test]
    fn fixed_clock_advances() {
        let auth = FixedTimeAuthority::new(1_000, TimeStatus::Consensus);
        auth.advance(500);
        assert_eq!(auth.now_ms(), 1_500);
    }
}
