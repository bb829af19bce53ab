//! Token issuance: minting tokens with a valid one-record ownership chain.
//!
//! Issuance is the first transfer — the genesis record is self-signed by the
//! first owner over the zero root, so every chain has a verifiable anchor.

use pakt_core::error::PaktError;
use pakt_core::token::{OwnershipRecord, Telomere, Token, TokenType, WisselToken};
use pakt_core::types::{Denomination, Digest, TimestampMs, TokenId};
use pakt_crypto::keypair::KeyPair;
use pakt_crypto::merkle::merkle_root;

use crate::engine::{ownership_message, record_hash};

/// Mint a single token owned by `owner`.
pub fn issue(
    owner: &KeyPair,
    location: &str,
    reference: &str,
    denomination: Denomination,
    index: u32,
    token_type: TokenType,
    now_ms: TimestampMs,
) -> Result<Token, PaktError> {
    let id = TokenId::new(location, reference, denomination, index)?;

    let genesis_proof = owner.sign(&ownership_message(&id, &owner.public_key, &Digest::ZERO));
    let genesis_record = OwnershipRecord {
        owner: owner.public_key.clone(),
        start_ms: now_ms,
        end_ms: now_ms,
        proof: genesis_proof,
        prev_record_hash: Digest::ZERO,
        transfer_method: "genesis".to_string(),
    };

    let history_root = merkle_root(&[record_hash(&genesis_record)]);
    let ownership_proof = owner.sign(&ownership_message(&id, &owner.public_key, &history_root));

    let telomere = Telomere {
        owner: owner.public_key.clone(),
        ownership_proof,
        previous_owner: None,
        transfer_at_ms: now_ms,
        history: vec![genesis_record],
        history_root,
        transfer_count: 1,
    };

    Token::new(id, token_type, telomere, now_ms)
}

/// Mint `count` regular tokens of one denomination, indexed from 0.
pub fn issue_batch(
    owner: &KeyPair,
    location: &str,
    reference: &str,
    denomination: Denomination,
    count: u32,
    now_ms: TimestampMs,
) -> Result<Vec<Token>, PaktError> {
    (0..count)
        .map(|index| {
            issue(
                owner,
                location,
                reference,
                denomination,
                index,
                TokenType::Regular,
                now_ms,
            )
        })
        .collect()
}

/// Mint the per-user exchange token with an empty afrondingsbuffer.
pub fn issue_wissel(
    owner: &KeyPair,
    location: &str,
    reference: &str,
    index: u32,
    now_ms: TimestampMs,
) -> Result<WisselToken, PaktError> {
    let token = issue(
        owner,
        location,
        reference,
        Denomination::new(1)?,
        index,
        TokenType::Wissel,
        now_ms,
    )?;
    WisselToken::new(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::verify;
    use pakt_core::token::ChainOfCustody;

    #[test]
    fn batch_tokens_have_distinct_ids_and_verify() {
        let owner = KeyPair::generate();
        let batch = issue_batch(
            &owner,
            "nyc",
            "batch1",
            Denomination::new(5).unwrap(),
            3,
            1_000,
        )
        .unwrap();
        assert_eq!(batch.len(), 3);
        for (i, t) in batch.iter().enumerate() {
            assert_eq!(t.id.index, i as u32);
            assert_eq!(t.value, 500);
            assert_eq!(verify(t), ChainOfCustody::Verified);
        }
    }

    #[test]
    fn wissel_starts_with_empty_buffer() {
        let owner = KeyPair::generate();
        let w = issue_wissel(&owner, "nyc", "batch1", 99, 1_000).unwrap();
        assert_eq!(w.afronding_buffer, 0);
        assert_eq!(verify(&w.token), ChainOfCustody::Verified);
    }
}
