use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::{DENOMINATION_UNITS, SUBUNIT_SCALE};
use crate::error::PaktError;

/// Value in subunits (1 denomination unit = 100 subunits). u64 comfortably
/// covers any realistic two-party portfolio.
pub type Amount = u64;

/// Unix timestamp in milliseconds, UTC.
pub type TimestampMs = i64;

// ── Denomination ─────────────────────────────────────────────────────────────

/// One of the nine legal token denominations {1, 2, 5, 10, 20, 50, 100, 200,
/// 500}. Construction and deserialization both reject anything else.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Denomination(u16);

impl Denomination {
    /// All legal denominations, ascending.
    pub const ALL: [Denomination; 9] = [
        Denomination(1),
        Denomination(2),
        Denomination(5),
        Denomination(10),
        Denomination(20),
        Denomination(50),
        Denomination(100),
        Denomination(200),
        Denomination(500),
    ];

    pub fn new(units: u16) -> Result<Self, PaktError> {
        if DENOMINATION_UNITS.contains(&units) {
            Ok(Self(units))
        } else {
            Err(PaktError::InvalidDenomination { units })
        }
    }

    /// Face value in units.
    pub fn units(&self) -> u16 {
        self.0
    }

    /// Face value in subunits.
    pub fn value(&self) -> Amount {
        self.0 as Amount * SUBUNIT_SCALE
    }
}

impl TryFrom<u16> for Denomination {
    type Error = PaktError;

    fn try_from(units: u16) -> Result<Self, Self::Error> {
        Denomination::new(units)
    }
}

impl From<Denomination> for u16 {
    fn from(d: Denomination) -> u16 {
        d.0
    }
}

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Denomination({})", self.0)
    }
}

// ── TokenId ──────────────────────────────────────────────────────────────────

/// Deterministic token identifier, rendered as ASCII
/// `LOCATION-REFERENCE-VALUE-INDEX` (e.g. `nyc-batch123-10-1`).
///
/// Location and reference are non-empty lowercase-alphanumeric segments and
/// may not contain `-`; value must be a legal denomination.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    pub location: String,
    pub reference: String,
    pub denomination: Denomination,
    pub index: u32,
}

impl TokenId {
    pub fn new(
        location: &str,
        reference: &str,
        denomination: Denomination,
        index: u32,
    ) -> Result<Self, PaktError> {
        for segment in [location, reference] {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(PaktError::InvalidTokenId {
                    id: format!("{location}-{reference}-{denomination}-{index}"),
                });
            }
        }
        Ok(Self {
            location: location.to_string(),
            reference: reference.to_string(),
            denomination,
            index,
        })
    }

    /// The `LOCATION-REFERENCE` prefix identifying the originating issuance.
    pub fn issuance(&self) -> String {
        format!("{}-{}", self.location, self.reference)
    }
}

impl FromStr for TokenId {
    type Err = PaktError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PaktError::InvalidTokenId { id: s.to_string() };
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(bad());
        }
        let units: u16 = parts[2].parse().map_err(|_| bad())?;
        let index: u32 = parts[3].parse().map_err(|_| bad())?;
        TokenId::new(parts[0], parts[1], Denomination::new(units)?, index)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.location, self.reference, self.denomination, self.index
        )
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({self})")
    }
}

// ── TransactionId ────────────────────────────────────────────────────────────

/// Unique transaction identifier (UUID v4).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({}…)", &self.0.to_string()[..8])
    }
}

// ── PublicKey / Signature ────────────────────────────────────────────────────

/// Dilithium2 public key (1312 bytes per NIST FIPS 204). Identifies a party.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base-58 rendering, truncated for logs.
    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b58 = self.to_b58();
        write!(f, "{}", &b58[..b58.len().min(12)])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// Dilithium2 detached signature (2420 bytes per NIST FIPS 204).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}b)", self.0.len())
    }
}

// ── Hash digest ──────────────────────────────────────────────────────────────

/// 32-byte BLAKE3 digest: record hashes, Merkle roots, chunk hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denomination_rejects_invalid_units() {
        assert!(Denomination::new(3).is_err());
        assert!(Denomination::new(0).is_err());
        assert!(Denomination::new(1000).is_err());
        for units in DENOMINATION_UNITS {
            assert!(Denomination::new(units).is_ok());
        }
    }

    #[test]
    fn denomination_value_is_scaled() {
        let d = Denomination::new(10).unwrap();
        assert_eq!(d.value(), 1000);
    }

    #[test]
    fn token_id_round_trips_through_display() {
        let id = TokenId::new("nyc", "batch123", Denomination::new(10).unwrap(), 1).unwrap();
        assert_eq!(id.to_string(), "nyc-batch123-10-1");
        let parsed: TokenId = "nyc-batch123-10-1".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.issuance(), "nyc-batch123");
    }

    #[test]
    fn token_id_rejects_bad_segments() {
        assert!("nyc-batch-3-1".parse::<TokenId>().is_err()); // 3 is not a denomination
        assert!("NYC-batch-10-1".parse::<TokenId>().is_err()); // uppercase
        assert!("nyc-10-1".parse::<TokenId>().is_err()); // missing segment
        assert!(TokenId::new("", "batch", Denomination::new(10).unwrap(), 0).is_err());
    }

    #[test]
    fn denomination_serde_rejects_invalid() {
        let ok: Result<Denomination, _> = serde_json::from_str("50");
        assert!(ok.is_ok());
        let bad: Result<Denomination, _> = serde_json::from_str("7");
        assert!(bad.is_err());
    }
}
