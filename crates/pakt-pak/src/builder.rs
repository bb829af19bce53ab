use uuid::Uuid;

use pakt_core::constants::DEFAULT_MAX_DURATION_MS;
use pakt_core::error::PaktError;
use pakt_core::token::{ChainOfCustody, Token};
use pakt_core::types::{Digest, PublicKey, TimestampMs, TransactionId};
use pakt_crypto::hash::digest;
use pakt_crypto::keypair::KeyPair;
use pakt_crypto::merkle::merkle_root;
use pakt_crypto::verify as verify_sig;
use tracing::debug;

use crate::types::{
    ExoPak, PakDirection, PakStatus, RetroPak, RollbackInstructions, RollbackKind, RollbackStep,
};

/// Merkle root over the ordered token-id hashes. This is the "package root"
/// named by commitment proofs.
pub fn token_root(tokens: &[Token]) -> Digest {
    let leaves: Vec<Digest> = tokens
        .iter()
        .map(|t| digest(t.id.to_string().as_bytes()))
        .collect();
    merkle_root(&leaves)
}

/// Canonical bytes covered by a package proof: the token-id set, the
/// direction, and the owning transaction.
fn pak_message(tokens: &[Token], direction: PakDirection, tx: &TransactionId) -> Vec<u8> {
    let ids: Vec<String> = tokens.iter().map(|t| t.id.to_string()).collect();
    bincode::serialize(&(ids, direction, tx.to_string()))
        .expect("package message serialization is infallible")
}

fn rollback_message(root: &Digest, step: u32) -> Vec<u8> {
    bincode::serialize(&(root.as_bytes(), step))
        .expect("rollback message serialization is infallible")
}

/// Build an outbound package over `tokens`, signed by the giving party.
pub fn build_exopak(
    tokens: Vec<Token>,
    direction: PakDirection,
    tx: &TransactionId,
    signer: &KeyPair,
) -> ExoPak {
    let merkle_root = token_root(&tokens);
    let proof = signer.sign(&pak_message(&tokens, direction, tx));
    debug!(tx = %tx, count = tokens.len(), root = %merkle_root, "built exopak");
    ExoPak {
        id: Uuid::new_v4(),
        status: PakStatus::Created,
        direction,
        tokens,
        merkle_root,
        proof,
    }
}

/// Build the rollback-insurance package over the tokens a party retains.
/// A single pre-signed Restore step puts them back to their
/// pre-transaction state if the exchange dies after PREPARED.
pub fn build_retropak(
    retained: Vec<Token>,
    direction: PakDirection,
    tx: &TransactionId,
    signer: &KeyPair,
    timeout_ms: Option<TimestampMs>,
) -> RetroPak {
    let merkle_root = token_root(&retained);
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_MAX_DURATION_MS);
    let steps = vec![RollbackStep {
        step: 1,
        kind: RollbackKind::Restore,
        proof: signer.sign(&rollback_message(&merkle_root, 1)),
    }];
    let rollback = RollbackInstructions {
        steps,
        timeout_ms,
        proof: signer.sign(&rollback_message(&merkle_root, 0)),
    };
    let proof = signer.sign(&pak_message(&retained, direction, tx));
    RetroPak {
        id: Uuid::new_v4(),
        status: PakStatus::Created,
        direction,
        tokens: retained,
        merkle_root,
        rollback,
        proof,
    }
}

/// Verify a package received from a peer: the proof must be the named
/// party's signature over this exact id set, the root must match, and
/// every token must carry a sound value and ownership chain.
pub fn verify_exopak(
    pak: &ExoPak,
    expected_signer: &PublicKey,
    tx: &TransactionId,
) -> Result<(), PaktError> {
    if token_root(&pak.tokens) != pak.merkle_root {
        return Err(PaktError::PackageRootMismatch);
    }
    if !verify_sig(
        expected_signer,
        &pak_message(&pak.tokens, pak.direction, tx),
        &pak.proof,
    ) {
        return Err(PaktError::InvalidSignature);
    }

    for token in &pak.tokens {
        token.check_value()?;
        if pakt_telomere::verify(token) == ChainOfCustody::VerificationFailed {
            return Err(PaktError::BadTelomere {
                token_id: token.id.to_string(),
                detail: "chain of custody failed at package verification".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::token::TokenType;
    use pakt_core::types::Denomination;
    use pakt_telomere::genesis::issue_batch;

    fn batch(owner: &KeyPair, n: u32) -> Vec<Token> {
        issue_batch(owner, "nyc", "batch1", Denomination::new(10).unwrap(), n, 1_000).unwrap()
    }

    #[test]
    fn built_exopak_verifies() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let pak = build_exopak(batch(&owner, 3), PakDirection::SenderToReceiver, &tx, &owner);
        assert_eq!(pak.total_value(), 3_000);
        assert!(verify_exopak(&pak, &owner.public_key, &tx).is_ok());
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let owner = KeyPair::generate();
        let other = KeyPair::generate();
        let tx = TransactionId::generate();
        let pak = build_exopak(batch(&owner, 2), PakDirection::SenderToReceiver, &tx, &owner);
        assert!(matches!(
            verify_exopak(&pak, &other.public_key, &tx),
            Err(PaktError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_transaction_is_rejected() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let pak = build_exopak(batch(&owner, 2), PakDirection::SenderToReceiver, &tx, &owner);
        assert!(verify_exopak(&pak, &owner.public_key, &TransactionId::generate()).is_err());
    }

    #[test]
    fn tampered_token_set_is_rejected() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let mut pak = build_exopak(batch(&owner, 3), PakDirection::SenderToReceiver, &tx, &owner);
        pak.tokens.pop();
        assert!(matches!(
            verify_exopak(&pak, &owner.public_key, &tx),
            Err(PaktError::PackageRootMismatch)
        ));
    }

    #[test]
    fn bad_telomere_inside_package_is_rejected() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let mut tokens = batch(&owner, 2);
        // Corrupt one chain: point the head proof at a different root.
        tokens[1].telomere.history_root = pakt_crypto::hash::digest(b"elsewhere");
        let pak = build_exopak(tokens, PakDirection::SenderToReceiver, &tx, &owner);
        assert!(matches!(
            verify_exopak(&pak, &owner.public_key, &tx),
            Err(PaktError::BadTelomere { .. })
        ));
    }

    #[test]
    fn retropak_carries_signed_restore_step() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let pak = build_retropak(
            batch(&owner, 2),
            PakDirection::SenderToReceiver,
            &tx,
            &owner,
            None,
        );
        assert_eq!(pak.rollback.steps.len(), 1);
        assert_eq!(pak.rollback.steps[0].kind, RollbackKind::Restore);
        assert_eq!(pak.rollback.timeout_ms, DEFAULT_MAX_DURATION_MS);

        let msg = rollback_message(&pak.merkle_root, 1);
        assert!(verify_sig(&owner.public_key, &msg, &pak.rollback.steps[0].proof));
    }

    #[test]
    fn empty_package_has_zero_root_and_verifies() {
        let owner = KeyPair::generate();
        let tx = TransactionId::generate();
        let pak = build_exopak(Vec::new(), PakDirection::ReceiverToSender, &tx, &owner);
        assert_eq!(pak.merkle_root, Digest::ZERO);
        assert!(verify_exopak(&pak, &owner.public_key, &tx).is_ok());
    }
}
