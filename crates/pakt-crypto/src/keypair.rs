//! Dilithium2 identity keys and detached-signature verification.
//!
//! A party's public key is its identity throughout the protocol, so all
//! signing lives on [`KeyPair`] and verification is a standalone predicate:
//! proofs name their signer, and a proof that fails to parse is simply not
//! a valid proof. Key material is validated once, at construction, which
//! keeps `sign` infallible; the secret bytes are wiped on drop.

use pakt_core::types::{PublicKey, Signature};
use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("public key must be {expected} bytes per FIPS 204, got {got}")]
    BadPublicKey { expected: usize, got: usize },

    #[error("secret key must be {expected} bytes per FIPS 204, got {got}")]
    BadSecretKey { expected: usize, got: usize },
}

/// A pakt keypair: Dilithium2 public + secret key.
#[derive(Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: PublicKey,
    secret_key: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh Dilithium2 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium2::keypair();
        Self {
            public_key: PublicKey(pk.as_bytes().to_vec()),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    /// Restore a keypair from raw bytes (e.g. loaded from a wallet file).
    /// Lengths are checked here so that [`KeyPair::sign`] never fails.
    pub fn from_raw(pk_bytes: Vec<u8>, sk_bytes: Vec<u8>) -> Result<Self, KeyError> {
        if pk_bytes.len() != dilithium2::public_key_bytes() {
            return Err(KeyError::BadPublicKey {
                expected: dilithium2::public_key_bytes(),
                got: pk_bytes.len(),
            });
        }
        if sk_bytes.len() != dilithium2::secret_key_bytes() {
            return Err(KeyError::BadSecretKey {
                expected: dilithium2::secret_key_bytes(),
                got: sk_bytes.len(),
            });
        }
        Ok(Self {
            public_key: PublicKey(pk_bytes),
            secret_key: sk_bytes,
        })
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = dilithium2::SecretKey::from_bytes(&self.secret_key)
            .expect("secret key length checked at construction");
        Signature(dilithium2::detached_sign(message, &sk).as_bytes().to_vec())
    }

    /// Read-only view of the secret key bytes (wallet export).
    pub fn secret_key_bytes(&self) -> &[u8] {
        &self.secret_key
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.secret_key.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ public_key: {:?} }}", self.public_key)
    }
}

/// True when `signature` is `signer`'s detached signature over `message`.
///
/// Undersized or otherwise malformed keys and signatures verify as false
/// rather than erroring: callers treat "could not possibly be valid" and
/// "cryptographically wrong" the same way.
pub fn verify(signer: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(pk) = dilithium2::PublicKey::from_bytes(&signer.0) else {
        return false;
    };
    let Ok(sig) = dilithium2::DetachedSignature::from_bytes(&signature.0) else {
        return false;
    };
    dilithium2::verify_detached_signature(&sig, message, &pk).is_ok()
}
