use thiserror::Error;

/// The six-code taxonomy exposed to callers of the exchange API. Every
/// [`PaktError`] variant maps onto exactly one code via [`PaktError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidState,
    Timeout,
    ValidationFailed,
    InsufficientTokens,
    PeerRejected,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InsufficientTokens => "INSUFFICIENT_TOKENS",
            ErrorCode::PeerRejected => "PEER_REJECTED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum PaktError {
    // ── Model errors ─────────────────────────────────────────────────────────
    #[error("invalid denomination: {units} (legal: 1,2,5,10,20,50,100,200,500)")]
    InvalidDenomination { units: u16 },

    #[error("invalid token id: {id}")]
    InvalidTokenId { id: String },

    #[error("token value mismatch: denomination {denomination} implies {expected} subunits, got {got}")]
    TokenValueMismatch {
        denomination: u16,
        expected: u64,
        got: u64,
    },

    // ── Transaction state machine ────────────────────────────────────────────
    #[error("invalid state: expected {expected}, got {got}")]
    InvalidState { expected: String, got: String },

    #[error("transaction {0} already initiated")]
    DuplicateInitiation(String),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("out-of-order packet {packet} in state {state}")]
    OutOfOrderPacket { packet: String, state: String },

    #[error("transaction {0} timed out")]
    TransactionTimeout(String),

    #[error("abort rejected: transaction {0} already committed")]
    AbortAfterCommit(String),

    // ── Validation ───────────────────────────────────────────────────────────
    #[error("invalid signature")]
    InvalidSignature,

    #[error("bad telomere on token {token_id}: {detail}")]
    BadTelomere { token_id: String, detail: String },

    #[error("commitment proof does not verify")]
    BadCommitmentProof,

    #[error("package root mismatch")]
    PackageRootMismatch,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    // ── Token selection ──────────────────────────────────────────────────────
    #[error("insufficient tokens: need {need} subunits, coverable {have}")]
    InsufficientTokens { need: u64, have: u64 },

    #[error("token {0} is locked by another transaction")]
    TokenLocked(String),

    #[error("wissel token is unspendable: fewer than {min} tokens of issuance {issuance} would remain")]
    WisselUnspendable { issuance: String, min: usize },

    #[error("afrondingsbuffer bound exceeded: {delta} subunits (max {max})")]
    BufferExceeded { delta: u64, max: u64 },

    #[error("reverse-direction afrondingsbuffer merging is not supported")]
    BufferMergeUnsupported,

    #[error("selection would drop balance below minimum: {min_after} subunits required")]
    MinBalanceViolated { min_after: u64 },

    // ── Peer / time ──────────────────────────────────────────────────────────
    #[error("peer rejected transaction: {0}")]
    PeerRejected(String),

    #[error("time consensus inadequate; refusing to finalize")]
    TimeInadequate,

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl PaktError {
    /// Collapse this error into the caller-facing six-code taxonomy.
    pub fn code(&self) -> ErrorCode {
        use PaktError::*;
        match self {
            InvalidState { .. }
            | DuplicateInitiation(_)
            | UnknownTransaction(_)
            | OutOfOrderPacket { .. }
            | AbortAfterCommit(_) => ErrorCode::InvalidState,

            TransactionTimeout(_) => ErrorCode::Timeout,

            InvalidDenomination { .. }
            | InvalidTokenId { .. }
            | TokenValueMismatch { .. }
            | InvalidSignature
            | BadTelomere { .. }
            | BadCommitmentProof
            | PackageRootMismatch
            | MalformedPacket(_) => ErrorCode::ValidationFailed,

            InsufficientTokens { .. }
            | TokenLocked(_)
            | WisselUnspendable { .. }
            | BufferExceeded { .. }
            | BufferMergeUnsupported
            | MinBalanceViolated { .. } => ErrorCode::InsufficientTokens,

            PeerRejected(_) | TimeInadequate => ErrorCode::PeerRejected,

            Serialization(_) | Storage(_) | Internal(_) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_renders_as_screaming_snake() {
        assert_eq!(ErrorCode::InvalidState.to_string(), "INVALID_STATE");
        assert_eq!(ErrorCode::InsufficientTokens.to_string(), "INSUFFICIENT_TOKENS");
    }

    #[test]
    fn taxonomy_mapping() {
        assert_eq!(
            PaktError::TokenLocked("a".into()).code(),
            ErrorCode::InsufficientTokens
        );
        assert_eq!(PaktError::TimeInadequate.code(), ErrorCode::PeerRejected);
        assert_eq!(
            PaktError::Storage("disk".into()).code(),
            ErrorCode::InternalError
        );
    }
}
