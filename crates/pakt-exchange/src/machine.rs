//! The exchange engine: one party's half of the four-packet protocol.
//!
//! Each public method consumes one inbound packet (or an API call) and
//! produces the outbound reply, mutating the transaction it belongs to.
//! Validation happens before any side effect; side effects past PREPARED
//! are insured by the RetroPak and undone by [`ExchangeEngine::abort`].
//! Re-delivered packets return the previously computed reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use pakt_core::constants::AFRONDING_BUFFER_MAX;
use pakt_core::error::PaktError;
use pakt_core::token::{Token, TokenState, WisselToken};
use pakt_core::types::{Digest, PublicKey, TimestampMs, TokenId, TransactionId};
use pakt_crypto::hash::{digest, digest_of};
use pakt_crypto::keypair::KeyPair;
use pakt_crypto::verify as verify_sig;
use pakt_denom::{optimize, DenominationVectorClock, SelectionConstraints};
use pakt_pak::{build_exopak, build_retropak, verify_exopak, PakDirection, PakStatus};
use pakt_store::{TokenLocks, TokenStore};
use pakt_telomere::engine as telomere;
use pakt_time::{commit_gate, TimeAuthority, TimeStatus};

use crate::context::{TransactionConstraints, TransactionContext};
use crate::packets::{
    AcknowledgementPacket, ConfirmationPacket, InitiationPacket, Packet, ResponsePacket,
};
use crate::state::{Transaction, TransactionState};

/// Canonical bytes covered by a commitment proof: transaction id, both
/// package roots, both parties, and the signer's time-consensus status.
fn commitment_message(
    tx: &TransactionId,
    sender_root: &Digest,
    receiver_root: &Digest,
    sender: &PublicKey,
    receiver: &PublicKey,
    time_status: TimeStatus,
) -> Vec<u8> {
    bincode::serialize(&(
        tx.to_string(),
        sender_root.as_bytes(),
        receiver_root.as_bytes(),
        sender.as_bytes(),
        receiver.as_bytes(),
        time_status,
    ))
    .expect("commitment message serialization is infallible")
}

/// Witness that both sides committed to the same roots.
fn atomic_commitment(
    sender_commitment: &[u8],
    receiver_commitment: &[u8],
    sender_root: &Digest,
    receiver_root: &Digest,
) -> Digest {
    let mut buf = Vec::with_capacity(sender_commitment.len() + receiver_commitment.len() + 64);
    buf.extend_from_slice(sender_commitment);
    buf.extend_from_slice(receiver_commitment);
    buf.extend_from_slice(sender_root.as_bytes());
    buf.extend_from_slice(receiver_root.as_bytes());
    digest(&buf)
}

fn selection_constraints(c: &TransactionConstraints) -> SelectionConstraints {
    SelectionConstraints {
        min_balance_after: c.min_balance_after,
        allowed_denominations: c.allowed_denominations.clone(),
        use_wissel_token: c.use_wissel_token,
        use_afronding_buffer: c.use_afronding_buffer,
    }
}

// ── ExchangeEngine ───────────────────────────────────────────────────────────

pub struct ExchangeEngine {
    keypair: Arc<KeyPair>,
    store: Arc<dyn TokenStore>,
    time: Arc<dyn TimeAuthority>,
    locks: TokenLocks,
    wissel: Mutex<Option<WisselToken>>,
    pending: Mutex<HashMap<TransactionId, Transaction>>,
    completed: Mutex<HashMap<TransactionId, Transaction>>,
    /// Previously computed replies, keyed by (transaction, packet kind) and
    /// guarded by a fingerprint of the packet that produced them: a true
    /// re-delivery is answered from here without side effects, while a
    /// *different* packet reusing the same transaction id falls through to
    /// the duplicate checks.
    replies: Mutex<HashMap<(TransactionId, u8), (Digest, Packet)>>,
}

impl ExchangeEngine {
    pub fn new(
        keypair: Arc<KeyPair>,
        store: Arc<dyn TokenStore>,
        time: Arc<dyn TimeAuthority>,
    ) -> Self {
        Self {
            keypair,
            store,
            time,
            locks: TokenLocks::new(),
            wissel: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key.clone()
    }

    pub fn now_ms(&self) -> TimestampMs {
        self.time.now_ms()
    }

    pub fn set_wissel(&self, wissel: Option<WisselToken>) {
        *self.wissel.lock().expect("wissel slot") = wissel;
    }

    pub fn wissel(&self) -> Option<WisselToken> {
        self.wissel.lock().expect("wissel slot").clone()
    }

    /// Recompute this party's denomination vector clock from its stored
    /// portfolio.
    pub fn update_vector_clock(&self) -> Result<DenominationVectorClock, PaktError> {
        let portfolio = self.store.portfolio(&self.keypair.public_key)?;
        Ok(DenominationVectorClock::from_portfolio(
            self.keypair.public_key.clone(),
            &portfolio,
            self.time.now_ms(),
        ))
    }

    /// Look up a transaction by id, pending or completed.
    pub fn get_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        if let Some(tx) = self.pending.lock().expect("pending map").get(id) {
            return Some(tx.clone());
        }
        self.completed.lock().expect("completed map").get(id).cloned()
    }

    fn cached_reply(&self, id: TransactionId, kind: u8, fingerprint: &Digest) -> Option<Packet> {
        self.replies
            .lock()
            .expect("reply cache")
            .get(&(id, kind))
            .filter(|(fp, _)| fp == fingerprint)
            .map(|(_, packet)| packet.clone())
    }

    fn cache_reply(&self, id: TransactionId, kind: u8, fingerprint: Digest, packet: Packet) {
        self.replies
            .lock()
            .expect("reply cache")
            .insert((id, kind), (fingerprint, packet));
    }

    /// Spendable candidates: active, owned here, not locked by another
    /// transaction.
    fn candidate_tokens(&self) -> Result<Vec<Token>, PaktError> {
        let portfolio = self.store.portfolio(&self.keypair.public_key)?;
        Ok(portfolio
            .into_iter()
            .filter(|t| t.is_active() && !self.locks.is_locked(&t.id))
            .collect())
    }

    // ── Packet 1: Initiation (sender) ────────────────────────────────────────

    /// Open a transaction and build the Initiation packet. Transaction ids
    /// are always minted here, never accepted from callers, so the
    /// duplicate-initiation rule is enforced where foreign ids actually
    /// arrive: at the responder.
    pub fn initiate_transaction(
        &self,
        amount: u64,
        purpose: &str,
        constraints: TransactionConstraints,
    ) -> Result<InitiationPacket, PaktError> {
        let now = self.time.now_ms();
        let id = TransactionId::generate();

        let sender_tokens = self.candidate_tokens()?;
        let sender_wissel = self.wissel();
        let sender_clock = DenominationVectorClock::from_portfolio(
            self.keypair.public_key.clone(),
            &sender_tokens,
            now,
        );

        let context = TransactionContext {
            sender: self.keypair.public_key.clone(),
            receiver: None,
            amount,
            purpose: purpose.to_string(),
            constraints: constraints.clone(),
        };
        let mut tx = Transaction::new(id, context, now);
        tx.transition(TransactionState::Initiated)?;
        tx.timestamps.initiated_at_ms = Some(now);
        tx.proofs.transaction_signature = Some(self.keypair.sign(
            &bincode::serialize(&(id.to_string(), amount, purpose))
                .expect("transaction signature message serialization is infallible"),
        ));
        self.pending.lock().expect("pending map").insert(id, tx);

        info!(tx = %id, amount, "transaction initiated");
        Ok(InitiationPacket {
            transaction_id: id,
            sender: self.keypair.public_key.clone(),
            amount,
            purpose: purpose.to_string(),
            constraints,
            sender_tokens,
            sender_wissel,
            sender_clock,
            timestamp_ms: now,
        })
    }

    // ── Packet 2: Response (receiver) ────────────────────────────────────────

    /// Consume an Initiation: validate the candidate tokens, run the
    /// optimizer, and answer with the computed packages or a rejection.
    /// Rejection happens before any side effect.
    pub fn respond_to_transaction(
        &self,
        packet: &InitiationPacket,
    ) -> Result<ResponsePacket, PaktError> {
        let id = packet.transaction_id;
        let fingerprint = digest_of(packet);
        if let Some(Packet::Response(cached)) = self.cached_reply(id, 1, &fingerprint) {
            return Ok(cached);
        }
        let now = self.time.now_ms();

        if self.pending.lock().expect("pending map").contains_key(&id)
            || self.completed.lock().expect("completed map").contains_key(&id)
        {
            return Err(PaktError::DuplicateInitiation(id.to_string()));
        }

        let context = TransactionContext {
            sender: packet.sender.clone(),
            receiver: Some(self.keypair.public_key.clone()),
            amount: packet.amount,
            purpose: packet.purpose.clone(),
            constraints: packet.constraints.clone(),
        };
        let mut tx = Transaction::new(id, context, now);
        tx.transition(TransactionState::Initiated)?;
        tx.timestamps.initiated_at_ms = Some(now);
        tx.transition(TransactionState::Preparing)?;

        // Refuse tainted or foreign tokens before anything is at stake.
        for token in &packet.sender_tokens {
            if token.owner() != &packet.sender {
                return self.reject(
                    tx,
                    "VALIDATION_FAILED: token not owned by sender",
                    fingerprint,
                    now,
                );
            }
            if telomere::verify_checked(token).is_err() {
                return self.reject(tx, "VALIDATION_FAILED: bad telomere", fingerprint, now);
            }
        }

        let receiver_clock = self.update_vector_clock()?;
        let selection = match optimize(
            &packet.sender_tokens,
            packet.sender_wissel.as_ref(),
            packet.amount,
            &packet.sender_clock,
            Some(&receiver_clock),
            &selection_constraints(&packet.constraints),
        ) {
            Ok(sel) => sel,
            Err(e) => {
                let reason = format!("{}: {e}", e.code());
                return self.reject(tx, &reason, fingerprint, now);
            }
        };

        let sender_exopak = build_exopak(
            selection.tokens,
            PakDirection::SenderToReceiver,
            &id,
            &self.keypair,
        );
        // One-way transfer: nothing flows back.
        let receiver_exopak = build_exopak(
            Vec::new(),
            PakDirection::ReceiverToSender,
            &id,
            &self.keypair,
        );
        let retained = self.store.portfolio(&self.keypair.public_key)?;
        let receiver_retropak = build_retropak(
            retained,
            PakDirection::ReceiverToSender,
            &id,
            &self.keypair,
            Some(packet.constraints.max_duration_ms),
        );

        tx.sender_exopak = Some(sender_exopak.clone());
        tx.receiver_exopak = Some(receiver_exopak.clone());
        tx.receiver_retropak = Some(receiver_retropak);
        tx.sender_buffer_delta = selection.buffer_delta;
        tx.transition(TransactionState::Prepared)?;
        tx.timestamps.prepared_at_ms = Some(now);
        self.pending.lock().expect("pending map").insert(id, tx);

        let response = ResponsePacket {
            transaction_id: id,
            accepted: true,
            reason: None,
            receiver: Some(self.keypair.public_key.clone()),
            sender_exopak: Some(sender_exopak),
            receiver_exopak: Some(receiver_exopak),
            sender_buffer_delta: selection.buffer_delta,
            receiver_clock: Some(receiver_clock),
            timestamp_ms: now,
        };
        self.cache_reply(id, 1, fingerprint, Packet::Response(response.clone()));
        info!(tx = %id, "transaction accepted");
        Ok(response)
    }

    /// Reject at Response time: no side effects, transaction goes straight
    /// to ABORTED.
    fn reject(
        &self,
        mut tx: Transaction,
        reason: &str,
        fingerprint: Digest,
        now: TimestampMs,
    ) -> Result<ResponsePacket, PaktError> {
        warn!(tx = %tx.id, reason, "rejecting transaction");
        let id = tx.id;
        tx.transition(TransactionState::Aborting)?;
        tx.transition(TransactionState::Aborted)?;
        tx.abort_reason = Some(reason.to_string());
        self.completed.lock().expect("completed map").insert(id, tx);
        let response = ResponsePacket::reject(id, reason.to_string(), now);
        self.cache_reply(id, 1, fingerprint, Packet::Response(response.clone()));
        Ok(response)
    }

    // ── Packet 3: Confirmation (sender) ──────────────────────────────────────

    /// Consume the Response: verify packages, lock the outgoing tokens,
    /// build the RetroPak, pass the time gate, and emit the Confirmation
    /// with transformed telomeres.
    pub fn process_response(
        &self,
        packet: &ResponsePacket,
    ) -> Result<ConfirmationPacket, PaktError> {
        let id = packet.transaction_id;
        let fingerprint = digest_of(packet);
        if let Some(Packet::Confirmation(cached)) = self.cached_reply(id, 2, &fingerprint) {
            return Ok(cached);
        }
        let now = self.time.now_ms();

        let mut pending = self.pending.lock().expect("pending map");
        let mut tx = pending
            .remove(&id)
            .ok_or_else(|| PaktError::UnknownTransaction(id.to_string()))?;
        drop(pending);

        if tx.state != TransactionState::Initiated {
            let state = tx.state;
            self.pending.lock().expect("pending map").insert(id, tx);
            return Err(PaktError::OutOfOrderPacket {
                packet: "Response".to_string(),
                state: state.to_string(),
            });
        }

        if !packet.accepted {
            let reason = packet
                .reason
                .clone()
                .unwrap_or_else(|| "peer rejected".to_string());
            self.abort_tx(&mut tx, &reason);
            self.completed.lock().expect("completed map").insert(id, tx);
            return Err(PaktError::PeerRejected(reason));
        }

        let result = self.accept_response(&mut tx, packet, now);
        match result {
            Ok(confirmation) => {
                self.pending.lock().expect("pending map").insert(id, tx);
                self.cache_reply(id, 2, fingerprint, Packet::Confirmation(confirmation.clone()));
                Ok(confirmation)
            }
            Err(e) => {
                self.abort_tx(&mut tx, &e.to_string());
                self.completed.lock().expect("completed map").insert(id, tx);
                Err(e)
            }
        }
    }

    fn accept_response(
        &self,
        tx: &mut Transaction,
        packet: &ResponsePacket,
        now: TimestampMs,
    ) -> Result<ConfirmationPacket, PaktError> {
        let id = tx.id;
        let receiver = packet
            .receiver
            .clone()
            .ok_or_else(|| PaktError::MalformedPacket("accept without receiver identity".into()))?;
        let sender_exopak = packet
            .sender_exopak
            .clone()
            .ok_or_else(|| PaktError::MalformedPacket("accept without sender exopak".into()))?;
        let receiver_exopak = packet
            .receiver_exopak
            .clone()
            .ok_or_else(|| PaktError::MalformedPacket("accept without receiver exopak".into()))?;

        // Packages are composed and signed by the responder.
        verify_exopak(&sender_exopak, &receiver, &id)?;
        verify_exopak(&receiver_exopak, &receiver, &id)?;

        for token in &sender_exopak.tokens {
            if token.owner() != &self.keypair.public_key {
                return Err(PaktError::MalformedPacket(format!(
                    "exopak names token {} we do not own",
                    token.id
                )));
            }
            if !self.store.contains(&token.id) {
                return Err(PaktError::MalformedPacket(format!(
                    "exopak names unknown token {}",
                    token.id
                )));
            }
        }
        for token in &receiver_exopak.tokens {
            if token.owner() != &receiver {
                return Err(PaktError::MalformedPacket(format!(
                    "reverse exopak token {} not owned by receiver",
                    token.id
                )));
            }
        }

        // Value conservation, modulo the afrondingsbuffer.
        let delta = packet.sender_buffer_delta;
        if delta.unsigned_abs() > AFRONDING_BUFFER_MAX {
            return Err(PaktError::BufferExceeded {
                delta: delta.unsigned_abs(),
                max: AFRONDING_BUFFER_MAX,
            });
        }
        let total = sender_exopak.total_value() as i64;
        if total - delta != tx.context.amount as i64 {
            return Err(PaktError::MalformedPacket(format!(
                "exopak value {total} and buffer delta {delta} do not settle amount {}",
                tx.context.amount
            )));
        }
        if delta != 0 {
            if !tx.context.constraints.use_afronding_buffer {
                return Err(PaktError::MalformedPacket(
                    "buffer delta despite disabled afrondingsbuffer".into(),
                ));
            }
            let wissel = self.wissel();
            let buffer = wissel.map(|w| w.afronding_buffer).ok_or_else(|| {
                PaktError::MalformedPacket("buffer delta without a wissel token".into())
            })?;
            let adjusted = buffer as i64 + delta;
            if adjusted < 0 || adjusted as u64 > AFRONDING_BUFFER_MAX {
                return Err(PaktError::BufferExceeded {
                    delta: delta.unsigned_abs(),
                    max: AFRONDING_BUFFER_MAX,
                });
            }
        }

        // Double-spend guard: a token in another pending transaction cannot
        // be given away twice.
        let exo_ids: Vec<TokenId> = sender_exopak.tokens.iter().map(|t| t.id.clone()).collect();
        self.locks.try_lock_all(&exo_ids, id)?;

        // Side effects begin: outgoing tokens go Pending, the RetroPak
        // snapshots everything needed to restore this exact state. The
        // exopak lands on the transaction first so an abort at any later
        // point can restore the staged tokens.
        tx.sender_exopak = Some(sender_exopak.clone());
        for token in &sender_exopak.tokens {
            let mut held = token.clone();
            held.state = TokenState::Pending;
            held.touch(now);
            self.store.put(&held)?;
        }
        let retained: Vec<Token> = self
            .store
            .portfolio(&self.keypair.public_key)?
            .into_iter()
            .filter(|t| !exo_ids.contains(&t.id))
            .collect();
        let sender_retropak = build_retropak(
            retained,
            PakDirection::SenderToReceiver,
            &id,
            &self.keypair,
            Some(tx.context.constraints.max_duration_ms),
        );

        tx.context.receiver = Some(receiver.clone());
        tx.receiver_exopak = Some(receiver_exopak);
        tx.sender_retropak = Some(sender_retropak);
        tx.sender_buffer_delta = delta;
        tx.transition(TransactionState::Preparing)?;
        tx.transition(TransactionState::Prepared)?;
        tx.timestamps.prepared_at_ms = Some(now);

        // The only point where external time authority can veto the commit.
        commit_gate(self.time.as_ref())?;
        let time_status = self.time.status();

        // Precompute the transformations: the outgoing owner signs each
        // token over to the receiver. Persisted copies stay untouched until
        // the acknowledgement lands.
        let mut transferred = Vec::with_capacity(sender_exopak.tokens.len());
        for token in &sender_exopak.tokens {
            let mut moved = token.clone();
            telomere::transform(&mut moved, &receiver, &self.keypair, &id, now)?;
            transferred.push(moved);
        }

        let receiver_root = tx
            .receiver_exopak
            .as_ref()
            .map(|p| p.merkle_root)
            .unwrap_or(Digest::ZERO);
        let message = commitment_message(
            &id,
            &sender_exopak.merkle_root,
            &receiver_root,
            &self.keypair.public_key,
            &receiver,
            time_status,
        );
        let sender_commitment = self.keypair.sign(&message);
        tx.proofs.sender_commitment = Some(sender_commitment.clone());
        tx.transition(TransactionState::Committing)?;

        Ok(ConfirmationPacket {
            transaction_id: id,
            sender_commitment,
            time_status,
            transferred_tokens: transferred,
            timestamp_ms: now,
        })
    }

    // ── Packet 4: Acknowledgement (receiver) ─────────────────────────────────

    /// Consume the Confirmation: verify the sender's commitment and the
    /// transformed telomeres, pass the time gate, commit receiver-side, and
    /// emit the Acknowledgement.
    pub fn process_confirmation(
        &self,
        packet: &ConfirmationPacket,
    ) -> Result<AcknowledgementPacket, PaktError> {
        let id = packet.transaction_id;
        let fingerprint = digest_of(packet);
        if let Some(Packet::Acknowledgement(cached)) = self.cached_reply(id, 3, &fingerprint) {
            return Ok(cached);
        }
        let now = self.time.now_ms();

        let mut pending = self.pending.lock().expect("pending map");
        let mut tx = pending
            .remove(&id)
            .ok_or_else(|| PaktError::UnknownTransaction(id.to_string()))?;
        drop(pending);

        if tx.state != TransactionState::Prepared {
            let state = tx.state;
            self.pending.lock().expect("pending map").insert(id, tx);
            return Err(PaktError::OutOfOrderPacket {
                packet: "Confirmation".to_string(),
                state: state.to_string(),
            });
        }

        match self.commit_receiver_side(&mut tx, packet, now) {
            Ok(ack) => {
                self.completed.lock().expect("completed map").insert(id, tx);
                self.cache_reply(id, 3, fingerprint, Packet::Acknowledgement(ack.clone()));
                Ok(ack)
            }
            Err(e) => {
                self.abort_tx(&mut tx, &e.to_string());
                self.completed.lock().expect("completed map").insert(id, tx);
                Err(e)
            }
        }
    }

    fn commit_receiver_side(
        &self,
        tx: &mut Transaction,
        packet: &ConfirmationPacket,
        now: TimestampMs,
    ) -> Result<AcknowledgementPacket, PaktError> {
        let id = tx.id;
        let sender = tx.context.sender.clone();
        let sender_exopak = tx
            .sender_exopak
            .as_ref()
            .ok_or_else(|| PaktError::Internal("prepared transaction lost its exopak".into()))?;
        let sender_root = sender_exopak.merkle_root;
        let receiver_root = tx
            .receiver_exopak
            .as_ref()
            .map(|p| p.merkle_root)
            .unwrap_or(Digest::ZERO);

        // A sender that could not pass its own gate must not commit us.
        if !packet.time_status.is_adequate() {
            return Err(PaktError::TimeInadequate);
        }

        let message = commitment_message(
            &id,
            &sender_root,
            &receiver_root,
            &sender,
            &self.keypair.public_key,
            packet.time_status,
        );
        if !verify_sig(&sender, &message, &packet.sender_commitment) {
            return Err(PaktError::BadCommitmentProof);
        }

        // The transformed tokens must be exactly the promised set, each
        // chain intact and handed to us by the sender.
        let mut expected: Vec<&TokenId> = sender_exopak.tokens.iter().map(|t| &t.id).collect();
        expected.sort();
        let mut got: Vec<&TokenId> = packet.transferred_tokens.iter().map(|t| &t.id).collect();
        got.sort();
        if expected != got {
            return Err(PaktError::MalformedPacket(
                "transferred tokens do not match the exopak".into(),
            ));
        }
        for token in &packet.transferred_tokens {
            telomere::verify_checked(token)?;
            if token.owner() != &self.keypair.public_key {
                return Err(PaktError::BadTelomere {
                    token_id: token.id.to_string(),
                    detail: "transferred token does not name us as owner".to_string(),
                });
            }
            if token.telomere.previous_owner.as_ref() != Some(&sender) {
                return Err(PaktError::BadTelomere {
                    token_id: token.id.to_string(),
                    detail: "transferred token does not name the sender as previous owner"
                        .to_string(),
                });
            }
        }

        // Our own gate, before emitting the Acknowledgement.
        commit_gate(self.time.as_ref())?;
        let time_status = self.time.status();

        tx.transition(TransactionState::Committing)?;

        let receiver_commitment = self.keypair.sign(&commitment_message(
            &id,
            &sender_root,
            &receiver_root,
            &sender,
            &self.keypair.public_key,
            time_status,
        ));

        // Commit: the transferred tokens are ours now.
        for token in &packet.transferred_tokens {
            let mut owned = token.clone();
            owned.state = TokenState::Active;
            owned.touch(now);
            self.store.put(&owned)?;
        }
        self.store.flush()?;

        tx.proofs.sender_commitment = Some(packet.sender_commitment.clone());
        tx.proofs.receiver_commitment = Some(receiver_commitment.clone());
        tx.proofs.atomic_commitment = Some(atomic_commitment(
            packet.sender_commitment.as_bytes(),
            receiver_commitment.as_bytes(),
            &sender_root,
            &receiver_root,
        ));
        if let Some(pak) = tx.sender_exopak.as_mut() {
            pak.status = PakStatus::Committed;
        }
        tx.transition(TransactionState::Committed)?;
        tx.timestamps.committed_at_ms = Some(now);
        tx.timestamps.completed_at_ms = Some(now);

        info!(tx = %id, "committed (receiver side)");
        Ok(AcknowledgementPacket {
            transaction_id: id,
            receiver_commitment,
            time_status,
            transferred_tokens: Vec::new(),
            timestamp_ms: now,
        })
    }

    // ── Finalize (sender) ────────────────────────────────────────────────────

    /// Consume the Acknowledgement: verify the receiver's commitment,
    /// commit sender-side, and seal the atomic commitment proof.
    pub fn finalize_transaction(&self, packet: &AcknowledgementPacket) -> Result<(), PaktError> {
        let id = packet.transaction_id;
        if let Some(tx) = self.completed.lock().expect("completed map").get(&id) {
            if tx.state == TransactionState::Committed {
                // Re-delivered acknowledgement after commit: nothing to do.
                return Ok(());
            }
        }
        let now = self.time.now_ms();

        let mut pending = self.pending.lock().expect("pending map");
        let mut tx = pending
            .remove(&id)
            .ok_or_else(|| PaktError::UnknownTransaction(id.to_string()))?;
        drop(pending);

        if tx.state != TransactionState::Committing {
            let state = tx.state;
            self.pending.lock().expect("pending map").insert(id, tx);
            return Err(PaktError::OutOfOrderPacket {
                packet: "Acknowledgement".to_string(),
                state: state.to_string(),
            });
        }

        match self.commit_sender_side(&mut tx, packet, now) {
            Ok(()) => {
                self.completed.lock().expect("completed map").insert(id, tx);
                Ok(())
            }
            Err(e) => {
                // Past PREPARED: the RetroPak undoes the staged state.
                self.abort_tx(&mut tx, &e.to_string());
                self.completed.lock().expect("completed map").insert(id, tx);
                Err(e)
            }
        }
    }

    fn commit_sender_side(
        &self,
        tx: &mut Transaction,
        packet: &AcknowledgementPacket,
        now: TimestampMs,
    ) -> Result<(), PaktError> {
        let id = tx.id;
        let receiver = tx
            .context
            .receiver
            .clone()
            .ok_or_else(|| PaktError::Internal("committing transaction without receiver".into()))?;
        let sender_root = tx
            .sender_exopak
            .as_ref()
            .map(|p| p.merkle_root)
            .unwrap_or(Digest::ZERO);
        let receiver_root = tx
            .receiver_exopak
            .as_ref()
            .map(|p| p.merkle_root)
            .unwrap_or(Digest::ZERO);

        if !packet.time_status.is_adequate() {
            return Err(PaktError::TimeInadequate);
        }
        let message = commitment_message(
            &id,
            &sender_root,
            &receiver_root,
            &self.keypair.public_key,
            &receiver,
            packet.time_status,
        );
        if !verify_sig(&receiver, &message, &packet.receiver_commitment) {
            return Err(PaktError::BadCommitmentProof);
        }

        // One-way exchange: the acknowledgement carries no reverse tokens.
        let reverse_expected = tx
            .receiver_exopak
            .as_ref()
            .map(|p| p.tokens.len())
            .unwrap_or(0);
        if packet.transferred_tokens.len() != reverse_expected {
            return Err(PaktError::MalformedPacket(
                "unexpected reverse-direction tokens".into(),
            ));
        }

        // Commit: the outgoing tokens leave our store for good.
        let exo_ids: Vec<TokenId> = tx
            .sender_exopak
            .as_ref()
            .map(|p| p.tokens.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default();
        for token_id in &exo_ids {
            self.store.remove(token_id)?;
        }
        if tx.sender_buffer_delta != 0 {
            let mut slot = self.wissel.lock().expect("wissel slot");
            if let Some(w) = slot.as_mut() {
                if tx.sender_buffer_delta > 0 {
                    w.credit(tx.sender_buffer_delta as u64)?;
                } else {
                    w.consume(tx.sender_buffer_delta.unsigned_abs())?;
                }
            }
        }
        self.store.flush()?;
        self.locks.unlock_all(&exo_ids, id);

        let sender_commitment = tx
            .proofs
            .sender_commitment
            .clone()
            .ok_or_else(|| PaktError::Internal("committing without our own commitment".into()))?;
        tx.proofs.receiver_commitment = Some(packet.receiver_commitment.clone());
        tx.proofs.atomic_commitment = Some(atomic_commitment(
            sender_commitment.as_bytes(),
            packet.receiver_commitment.as_bytes(),
            &sender_root,
            &receiver_root,
        ));
        if let Some(pak) = tx.sender_exopak.as_mut() {
            pak.status = PakStatus::Committed;
        }
        if let Some(pak) = tx.sender_retropak.as_mut() {
            pak.status = PakStatus::Committed;
        }
        tx.transition(TransactionState::Committed)?;
        tx.timestamps.committed_at_ms = Some(now);
        tx.timestamps.completed_at_ms = Some(now);

        info!(tx = %id, "committed (sender side)");
        Ok(())
    }

    // ── Abort / rollback ─────────────────────────────────────────────────────

    /// Abort a transaction. Allowed at any state up to COMMITTING; from
    /// COMMITTED on, abort is rejected. Idempotent on already-aborted
    /// transactions.
    pub fn abort_transaction(&self, id: &TransactionId, reason: &str) -> Result<(), PaktError> {
        if let Some(tx) = self.completed.lock().expect("completed map").get(id) {
            return match tx.state {
                TransactionState::Committed => Err(PaktError::AbortAfterCommit(id.to_string())),
                _ => Ok(()),
            };
        }

        let mut pending = self.pending.lock().expect("pending map");
        let mut tx = pending
            .remove(id)
            .ok_or_else(|| PaktError::UnknownTransaction(id.to_string()))?;
        drop(pending);

        self.abort_tx(&mut tx, reason);
        self.completed.lock().expect("completed map").insert(*id, tx);
        Ok(())
    }

    /// Execute the abort path: run our RetroPak if one was built (we are
    /// past PREPARED), release locks, and land in ABORTED. Restore is
    /// idempotent: it rewrites the pre-transaction snapshots.
    fn abort_tx(&self, tx: &mut Transaction, reason: &str) {
        if tx.state.is_terminal() {
            return;
        }
        warn!(tx = %tx.id, reason, state = %tx.state, "aborting transaction");
        let _ = tx.transition(TransactionState::Aborting);

        let we_are_sender = tx.context.sender == self.keypair.public_key;
        let rollback_result = if we_are_sender {
            self.execute_sender_rollback(tx)
        } else {
            Ok(())
        };

        tx.abort_reason = Some(reason.to_string());
        match rollback_result {
            Ok(()) => {
                let _ = tx.transition(TransactionState::Aborted);
            }
            Err(e) => {
                // Storage failure mid-rollback: surface for the operator,
                // keep the retro instructions for a retry.
                warn!(tx = %tx.id, error = %e, "rollback failed");
                let _ = tx.transition(TransactionState::Failed);
            }
        }
    }

    fn execute_sender_rollback(&self, tx: &mut Transaction) -> Result<(), PaktError> {
        let now = self.time.now_ms();
        let exo_ids: Vec<TokenId> = tx
            .sender_exopak
            .as_ref()
            .map(|p| p.tokens.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default();

        // Restore the staged Pending tokens to their pre-transaction
        // snapshots (held, untransformed, in the exopak); the RetroPak
        // rewrites the retained set.
        if let Some(exopak) = tx.sender_exopak.as_ref() {
            for token in &exopak.tokens {
                let mut restored = token.clone();
                restored.state = TokenState::Active;
                restored.touch(now);
                self.store.put(&restored)?;
            }
        }
        if let Some(retropak) = tx.sender_retropak.as_mut() {
            for token in &retropak.tokens {
                self.store.put(token)?;
            }
            retropak.status = PakStatus::RolledBack;
        }
        self.store.flush()?;
        self.locks.unlock_all(&exo_ids, tx.id);
        info!(tx = %tx.id, restored = exo_ids.len(), "rollback executed");
        Ok(())
    }

    // ── Timeouts / recovery ──────────────────────────────────────────────────

    /// Abort every pending transaction past its deadline. Returns the ids
    /// rolled back. The driver calls this on an interval.
    pub fn check_timeouts(&self) -> Vec<TransactionId> {
        let now = self.time.now_ms();
        let expired: Vec<TransactionId> = self
            .pending
            .lock()
            .expect("pending map")
            .values()
            .filter(|tx| tx.is_expired(now))
            .map(|tx| tx.id)
            .collect();
        for id in &expired {
            let _ = self.abort_transaction(id, "TIMEOUT");
        }
        expired
    }

    /// A reconnecting peer tells us it rolled a transaction back; do the
    /// same on our side unless we already committed (which is an incident
    /// for the operator, not something to silently unwind).
    pub fn process_recovery_request(&self, id: &TransactionId) -> Result<(), PaktError> {
        if let Some(tx) = self.completed.lock().expect("completed map").get(id) {
            if tx.state == TransactionState::Committed {
                warn!(tx = %id, "peer rolled back a transaction we committed");
            }
            return Ok(());
        }
        if self.pending.lock().expect("pending map").contains_key(id) {
            return self.abort_transaction(id, "peer requested rollback");
        }
        Ok(())
    }

    /// Quarantine a locally held token whose chain of custody fails:
    /// state goes Revoked and the incident is logged.
    pub fn quarantine_token(&self, id: &TokenId) -> Result<bool, PaktError> {
        let Some(mut token) = self.store.get(id)? else {
            return Ok(false);
        };
        if telomere::verify_checked(&token).is_ok() {
            return Ok(false);
        }
        warn!(token = %id, "quarantining token with broken chain of custody");
        token.state = TokenState::Revoked;
        token.touch(self.time.now_ms());
        self.store.put(&token)?;
        Ok(true)
    }
}
