//! Per-denomination status codes and the ideal distribution they are
//! measured against.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use pakt_core::constants::{IDEAL_BASE_COUNT, IDEAL_DECAY_DEN, IDEAL_DECAY_NUM};
use pakt_core::token::Token;
use pakt_core::types::{Amount, Denomination, PublicKey, TimestampMs};

// ── StatusCode ───────────────────────────────────────────────────────────────

/// 2-bit supply status for one denomination, ordered from scarcest to most
/// plentiful.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusCode {
    Lack,
    SlightlyWanting,
    Good,
    Abundance,
}

impl StatusCode {
    /// Wire encoding: 00, 01, 10, 11.
    pub fn bits(&self) -> u8 {
        match self {
            StatusCode::Lack => 0b00,
            StatusCode::SlightlyWanting => 0b01,
            StatusCode::Good => 0b10,
            StatusCode::Abundance => 0b11,
        }
    }

    /// Classify an actual count against an ideal count. Thresholds are ¼,
    /// ¾ and 1.5 of the ideal, evaluated in integer arithmetic.
    pub fn classify(actual: u32, ideal: u32) -> StatusCode {
        if ideal == 0 {
            return if actual == 0 {
                StatusCode::Good
            } else {
                StatusCode::Abundance
            };
        }
        if 4 * actual <= ideal {
            StatusCode::Lack
        } else if 4 * actual <= 3 * ideal {
            StatusCode::SlightlyWanting
        } else if 2 * actual <= 3 * ideal {
            StatusCode::Good
        } else {
            StatusCode::Abundance
        }
    }
}

// ── Ideal distribution ───────────────────────────────────────────────────────

/// Target token count per denomination for a holder of `total_value`
/// subunits: five of the smallest denomination, each next-higher receiving
/// ×0.8 of the previous allocation (minimum 1), capped so the allocated
/// value never exceeds the total.
pub fn ideal_distribution(total_value: Amount) -> BTreeMap<Denomination, u32> {
    let mut counts = BTreeMap::new();
    let mut remaining = total_value;
    let mut target = IDEAL_BASE_COUNT;
    for d in Denomination::ALL {
        let affordable = (remaining / d.value()) as u32;
        let count = target.min(affordable);
        if count > 0 {
            counts.insert(d, count);
            remaining -= count as Amount * d.value();
        }
        target = (target.max(1) * IDEAL_DECAY_NUM / IDEAL_DECAY_DEN).max(1);
    }
    counts
}

// ── DenominationVectorClock ──────────────────────────────────────────────────

/// A user's per-denomination supply snapshot. The wire representation is
/// the status map alone; peers reconstruct ideal distributions locally.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DenominationVectorClock {
    pub statuses: BTreeMap<Denomination, StatusCode>,
    pub owner: PublicKey,
    pub timestamp_ms: TimestampMs,
}

impl DenominationVectorClock {
    /// Compute the clock for a portfolio of active tokens.
    pub fn from_portfolio(
        owner: PublicKey,
        tokens: &[Token],
        now_ms: TimestampMs,
    ) -> Self {
        let active: Vec<&Token> = tokens.iter().filter(|t| t.is_active()).collect();
        let total: Amount = active.iter().map(|t| t.value).sum();
        let ideal = ideal_distribution(total);

        let mut counts: BTreeMap<Denomination, u32> = BTreeMap::new();
        for t in &active {
            *counts.entry(t.denomination).or_insert(0) += 1;
        }

        let statuses = Denomination::ALL
            .iter()
            .map(|d| {
                let actual = counts.get(d).copied().unwrap_or(0);
                let target = ideal.get(d).copied().unwrap_or(0);
                (*d, StatusCode::classify(actual, target))
            })
            .collect();

        Self {
            statuses,
            owner,
            timestamp_ms: now_ms,
        }
    }

    /// Status for one denomination; absent entries read as Lack.
    pub fn status(&self, d: Denomination) -> StatusCode {
        self.statuses.get(&d).copied().unwrap_or(StatusCode::Lack)
    }

    /// Pointwise maximum of two clocks; the newer timestamp wins.
    pub fn merge(&self, other: &DenominationVectorClock) -> DenominationVectorClock {
        let statuses = Denomination::ALL
            .iter()
            .map(|d| (*d, self.status(*d).max(other.status(*d))))
            .collect();
        DenominationVectorClock {
            statuses,
            owner: self.owner.clone(),
            timestamp_ms: self.timestamp_ms.max(other.timestamp_ms),
        }
    }
}
