//! Storage contracts consumed by the exchange core, with in-memory and
//! sled-backed implementations, plus the per-token lock registry that
//! serializes concurrent transactions over the same tokens.

pub mod locks;
pub mod memory;
pub mod sled_store;
pub mod traits;

pub use locks::TokenLocks;
pub use memory::{MemoryAttestationStore, MemoryTokenStore};
pub use sled_store::SledTokenStore;
pub use traits::{Attestation, AttestationStore, TokenStore};
