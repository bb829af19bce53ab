use pakt_core::types::Digest;

/// Compute BLAKE3 hash of arbitrary bytes → 32-byte array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 digest of arbitrary bytes.
pub fn digest(data: &[u8]) -> Digest {
    Digest::from_bytes(blake3_hash(data))
}

/// Digest of the canonical bincode serialization of `value`.
pub fn digest_of<T: serde::Serialize>(value: &T) -> Digest {
    let bytes = bincode::serialize(value).expect("bincode serialization is infallible");
    digest(&bytes)
}
