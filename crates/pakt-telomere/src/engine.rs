//! Ownership transformation and deterministic chain verification.
//!
//! Signature chain: `record_i.proof` (i ≥ 1) is the ownership proof that was
//! current during the tenure it closes — produced by `record_{i-1}.owner`,
//! naming `record_i.owner`, over the Merkle root of records `0..i`. The
//! issuance record is self-signed over the zero root, and the live
//! `ownership_proof` is produced by the last record's owner, naming the
//! current owner, over the full history root.

use pakt_core::error::PaktError;
use pakt_core::token::{ChainOfCustody, OwnershipRecord, Token};
use pakt_core::types::{Digest, PublicKey, TimestampMs, TokenId, TransactionId};
use pakt_crypto::hash::digest_of;
use pakt_crypto::keypair::KeyPair;
use pakt_crypto::merkle::{merkle_proof, merkle_root, MerkleProof};
use pakt_crypto::verify as verify_sig;
use tracing::warn;

/// BLAKE3 of the canonical serialized record. Links records and feeds the
/// chain-of-custody Merkle root.
pub fn record_hash(record: &OwnershipRecord) -> Digest {
    digest_of(record)
}

/// Canonical bytes covered by an ownership proof: `(token_id, next_owner,
/// history_root)`.
pub fn ownership_message(token_id: &TokenId, next_owner: &PublicKey, root: &Digest) -> Vec<u8> {
    bincode::serialize(&(token_id.to_string(), next_owner.as_bytes(), root.as_bytes()))
        .expect("ownership message serialization is infallible")
}

fn history_hashes(token: &Token) -> Vec<Digest> {
    token.telomere.history.iter().map(record_hash).collect()
}

// ── Transform ────────────────────────────────────────────────────────────────

/// Transfer `token` to `new_owner`, closing the current owner's tenure.
///
/// `signer` must hold the current owner's key: the outgoing owner authorizes
/// the transfer by signing the new ownership proof. `transaction` names the
/// committed transaction that carries this transfer.
pub fn transform(
    token: &mut Token,
    new_owner: &PublicKey,
    signer: &KeyPair,
    transaction: &TransactionId,
    now_ms: TimestampMs,
) -> Result<(), PaktError> {
    if signer.public_key != token.telomere.owner {
        return Err(PaktError::BadTelomere {
            token_id: token.id.to_string(),
            detail: "signer is not the current owner".to_string(),
        });
    }

    let telomere = &mut token.telomere;
    let prev_record_hash = telomere
        .history
        .last()
        .map(record_hash)
        .unwrap_or(Digest::ZERO);

    telomere.history.push(OwnershipRecord {
        owner: telomere.owner.clone(),
        start_ms: telomere.transfer_at_ms,
        end_ms: now_ms,
        proof: telomere.ownership_proof.clone(),
        prev_record_hash,
        transfer_method: transaction.to_string(),
    });

    let hashes: Vec<Digest> = telomere.history.iter().map(record_hash).collect();
    telomere.history_root = merkle_root(&hashes);
    telomere.previous_owner = Some(telomere.owner.clone());
    telomere.owner = new_owner.clone();
    telomere.transfer_at_ms = now_ms;
    telomere.transfer_count += 1;
    telomere.ownership_proof =
        signer.sign(&ownership_message(&token.id, new_owner, &telomere.history_root));

    token.touch(now_ms);
    Ok(())
}

// ── Verify ───────────────────────────────────────────────────────────────────

/// Replay the full ownership chain from genesis. Returns the first defect
/// found as an error; `Ok(())` means the chain is intact.
pub fn verify_checked(token: &Token) -> Result<(), PaktError> {
    let bad = |detail: &str| PaktError::BadTelomere {
        token_id: token.id.to_string(),
        detail: detail.to_string(),
    };

    token.check_value()?;

    let telomere = &token.telomere;
    if telomere.history.is_empty() {
        return Err(bad("empty ownership history"));
    }
    if telomere.transfer_count != telomere.history.len() as u64 {
        return Err(bad("transfer count does not match history length"));
    }

    let hashes = history_hashes(token);

    // Hash-link chain.
    if telomere.history[0].prev_record_hash != Digest::ZERO {
        return Err(bad("issuance record has a non-zero predecessor hash"));
    }
    for i in 1..telomere.history.len() {
        if telomere.history[i].prev_record_hash != hashes[i - 1] {
            return Err(bad("broken record hash link"));
        }
    }

    // Chain-of-custody root.
    if merkle_root(&hashes) != telomere.history_root {
        return Err(bad("history root does not match records"));
    }

    // Issuance record is self-signed over the zero root.
    let first = &telomere.history[0];
    let msg = ownership_message(&token.id, &first.owner, &Digest::ZERO);
    if !verify_sig(&first.owner, &msg, &first.proof) {
        return Err(bad("bad issuance proof"));
    }

    // Each later record carries the proof produced by its predecessor's
    // owner over the partial root current at signing time.
    for i in 1..telomere.history.len() {
        let record = &telomere.history[i];
        let signer = &telomere.history[i - 1].owner;
        let partial_root = merkle_root(&hashes[..i]);
        let msg = ownership_message(&token.id, &record.owner, &partial_root);
        if !verify_sig(signer, &msg, &record.proof) {
            return Err(bad("bad tenure proof"));
        }
    }

    // Live proof: the last record's owner handed the token to the current
    // owner over the full root.
    let last_owner = &telomere.history[telomere.history.len() - 1].owner;
    let msg = ownership_message(&token.id, &telomere.owner, &telomere.history_root);
    if !verify_sig(last_owner, &msg, &telomere.ownership_proof) {
        return Err(bad("bad ownership proof"));
    }

    Ok(())
}

/// Chain-of-custody status of a token. Logs the defect on failure.
pub fn verify(token: &Token) -> ChainOfCustody {
    match verify_checked(token) {
        Ok(()) => ChainOfCustody::Verified,
        Err(e) => {
            warn!(token_id = %token.id, error = %e, "chain of custody verification failed");
            ChainOfCustody::VerificationFailed
        }
    }
}

/// Inclusion proof for record `index` under the current history root.
/// Regenerated on demand; stored proofs would go stale at the next transfer.
pub fn record_inclusion_proof(token: &Token, index: usize) -> Option<MerkleProof> {
    merkle_proof(&history_hashes(token), index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::issue;
    use pakt_core::token::TokenType;
    use pakt_core::types::Denomination;

    fn issued() -> (KeyPair, Token) {
        let owner = KeyPair::generate();
        let token = issue(
            &owner,
            "nyc",
            "batch1",
            Denomination::new(10).unwrap(),
            0,
            TokenType::Regular,
            1_000,
        )
        .unwrap();
        (owner, token)
    }

    #[test]
    fn issued_token_verifies() {
        let (_, token) = issued();
        assert_eq!(verify(&token), ChainOfCustody::Verified);
        assert_eq!(token.telomere.transfer_count, 1);
        assert_eq!(token.telomere.history.len(), 1);
    }

    #[test]
    fn chain_survives_multiple_transfers() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let tx1 = TransactionId::generate();
        let tx2 = TransactionId::generate();

        transform(&mut token, &bob.public_key, &alice, &tx1, 2_000).unwrap();
        assert_eq!(verify(&token), ChainOfCustody::Verified);

        transform(&mut token, &carol.public_key, &bob, &tx2, 3_000).unwrap();
        assert_eq!(verify(&token), ChainOfCustody::Verified);

        assert_eq!(token.telomere.owner, carol.public_key);
        assert_eq!(token.telomere.previous_owner, Some(bob.public_key.clone()));
        assert_eq!(token.telomere.transfer_count, 3);
        assert_eq!(token.telomere.history.len(), 3);
        assert_eq!(
            token.telomere.history[2].transfer_method,
            tx2.to_string()
        );
    }

    #[test]
    fn only_current_owner_may_transform() {
        let (_, mut token) = issued();
        let mallory = KeyPair::generate();
        let err = transform(
            &mut token,
            &mallory.public_key,
            &mallory,
            &TransactionId::generate(),
            2_000,
        )
        .unwrap_err();
        assert!(matches!(err, PaktError::BadTelomere { .. }));
    }

    #[test]
    fn tampered_record_owner_fails_verification() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        transform(&mut token, &bob.public_key, &alice, &TransactionId::generate(), 2_000).unwrap();

        let mallory = KeyPair::generate();
        token.telomere.history[1].owner = mallory.public_key.clone();
        assert_eq!(verify(&token), ChainOfCustody::VerificationFailed);
    }

    #[test]
    fn dropped_record_fails_verification() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        transform(&mut token, &bob.public_key, &alice, &TransactionId::generate(), 2_000).unwrap();
        transform(&mut token, &carol.public_key, &bob, &TransactionId::generate(), 3_000).unwrap();

        token.telomere.history.remove(1);
        token.telomere.transfer_count -= 1;
        assert_eq!(verify(&token), ChainOfCustody::VerificationFailed);
    }

    #[test]
    fn stale_root_fails_verification() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        let before = token.telomere.history_root;
        transform(&mut token, &bob.public_key, &alice, &TransactionId::generate(), 2_000).unwrap();
        token.telomere.history_root = before;
        assert_eq!(verify(&token), ChainOfCustody::VerificationFailed);
    }

    #[test]
    fn foreign_ownership_proof_fails_verification() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        transform(&mut token, &bob.public_key, &alice, &TransactionId::generate(), 2_000).unwrap();

        // Mallory re-signs the head proof with her own key.
        let mallory = KeyPair::generate();
        token.telomere.ownership_proof = mallory.sign(&ownership_message(
            &token.id,
            &bob.public_key,
            &token.telomere.history_root,
        ));
        assert_eq!(verify(&token), ChainOfCustody::VerificationFailed);
    }

    #[test]
    fn record_inclusion_proofs_reconstruct_root() {
        let (alice, mut token) = issued();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        transform(&mut token, &bob.public_key, &alice, &TransactionId::generate(), 2_000).unwrap();
        transform(&mut token, &carol.public_key, &bob, &TransactionId::generate(), 3_000).unwrap();

        for (i, record) in token.telomere.history.iter().enumerate() {
            let proof = record_inclusion_proof(&token, i).unwrap();
            assert!(proof.verify(&record_hash(record), &token.telomere.history_root));
        }
    }
}
