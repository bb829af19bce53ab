pub mod hash;
pub mod keypair;
pub mod merkle;

pub use hash::digest;
pub use keypair::{verify, KeyError, KeyPair};
pub use merkle::{merkle_proof, merkle_root, MerkleProof};
