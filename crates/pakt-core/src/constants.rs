//! ─── Pakt Protocol Constants ────────────────────────────────────────────────
//!
//! Discrete value-bearing tokens, exchanged atomically between two peers.
//! Base unit: the subunit (1 denomination unit = 100 subunits).

// ── Value model ──────────────────────────────────────────────────────────────

/// Subunits per denomination unit. A token of denomination 10 carries
/// 10 × 100 = 1000 subunits of value.
pub const SUBUNIT_SCALE: u64 = 100;

/// The fixed denomination set, in units. Any other value is rejected at
/// construction time.
pub const DENOMINATION_UNITS: [u16; 9] = [1, 2, 5, 10, 20, 50, 100, 200, 500];

/// Upper bound of the afrondingsbuffer, in subunits (0.99 units).
pub const AFRONDING_BUFFER_MAX: u64 = 99;

/// Spending the WisselToken must leave at least this many tokens of its
/// originating issuance in the portfolio.
pub const WISSEL_MIN_ISSUANCE_TOKENS: usize = 2;

// ── Ideal denomination distribution ──────────────────────────────────────────

/// Target count for the smallest denomination when total value permits.
pub const IDEAL_BASE_COUNT: u32 = 5;

/// Decay applied per denomination step: next = prev × 4 / 5 (= 0.8), min 1.
pub const IDEAL_DECAY_NUM: u32 = 4;
pub const IDEAL_DECAY_DEN: u32 = 5;

// ── Transaction timing ───────────────────────────────────────────────────────

/// Default `max_duration_ms` for a transaction when the context does not
/// override it. Also the default rollback-instruction timeout.
pub const DEFAULT_MAX_DURATION_MS: i64 = 30_000;

// ── Reliability layer ────────────────────────────────────────────────────────

/// Base delay for frame retransmission backoff.
pub const RETRY_BASE_DELAY_MS: u64 = 5_000;

/// Backoff cap.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Attempts per frame before the link reports a timeout.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Payload bytes per chunk before a frame is split for partial retransmission.
pub const MAX_CHUNK_BYTES: usize = 32 * 1024;

/// Wire protocol version carried in every frame.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Default session lifetime: 24 hours.
pub const SESSION_LIFETIME_MS: i64 = 24 * 3600 * 1000;
