use serde::{Deserialize, Serialize};

use pakt_core::constants::DEFAULT_MAX_DURATION_MS;
use pakt_core::types::{Amount, Denomination, PublicKey, TimestampMs};

/// Caller-imposed bounds on a transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionConstraints {
    /// The transaction must reach COMMITTED within this window or abort.
    pub max_duration_ms: TimestampMs,
    /// Sender portfolio value (subunits) that must survive the exchange.
    pub min_balance_after: Amount,
    /// When set, only these denominations may be spent.
    pub allowed_denominations: Option<Vec<Denomination>>,
    /// May the selection spend the WisselToken itself?
    pub use_wissel_token: bool,
    /// May the afrondingsbuffer absorb a sub-unit remainder?
    pub use_afronding_buffer: bool,
}

impl Default for TransactionConstraints {
    fn default() -> Self {
        Self {
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
            min_balance_after: 0,
            allowed_denominations: None,
            use_wissel_token: false,
            use_afronding_buffer: true,
        }
    }
}

/// Who exchanges what, and under which constraints.
///
/// The receiver key is unknown to the sender until the Response names it —
/// the Initiation travels without it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionContext {
    pub sender: PublicKey,
    pub receiver: Option<PublicKey>,
    /// Amount in subunits flowing sender → receiver.
    pub amount: Amount,
    pub purpose: String,
    pub constraints: TransactionConstraints,
}
