//! The four transaction payloads. Each carries its transaction id so
//! receivers can route it to the correct state machine instance.

use serde::{Deserialize, Serialize};

use pakt_core::error::PaktError;
use pakt_core::token::{Token, WisselToken};
use pakt_core::types::{Amount, PublicKey, Signature, TimestampMs, TransactionId};
use pakt_denom::DenominationVectorClock;
use pakt_pak::ExoPak;
use pakt_time::TimeStatus;

use crate::context::TransactionConstraints;

/// Packet 1, S→R: announce the exchange and expose the candidate portfolio
/// the receiver will select from. The receiver key is deliberately absent —
/// the responder names itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InitiationPacket {
    pub transaction_id: TransactionId,
    pub sender: PublicKey,
    pub amount: Amount,
    pub purpose: String,
    pub constraints: TransactionConstraints,
    /// Spendable candidates, full telomeres included so the receiver can
    /// refuse tainted tokens before anything is at stake.
    pub sender_tokens: Vec<Token>,
    pub sender_wissel: Option<WisselToken>,
    pub sender_clock: DenominationVectorClock,
    pub timestamp_ms: TimestampMs,
}

/// Packet 2, R→S: accept with the computed packages, or reject with a
/// reason.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResponsePacket {
    pub transaction_id: TransactionId,
    pub accepted: bool,
    pub reason: Option<String>,
    pub receiver: Option<PublicKey>,
    pub sender_exopak: Option<ExoPak>,
    pub receiver_exopak: Option<ExoPak>,
    /// Afrondingsbuffer adjustment the selection requires of the sender
    /// (positive = credit, negative = consume). Zero for exact selections.
    pub sender_buffer_delta: i64,
    pub receiver_clock: Option<DenominationVectorClock>,
    pub timestamp_ms: TimestampMs,
}

impl ResponsePacket {
    pub fn reject(transaction_id: TransactionId, reason: String, now_ms: TimestampMs) -> Self {
        Self {
            transaction_id,
            accepted: false,
            reason: Some(reason),
            receiver: None,
            sender_exopak: None,
            receiver_exopak: None,
            sender_buffer_delta: 0,
            receiver_clock: None,
            timestamp_ms: now_ms,
        }
    }
}

/// Packet 3, S→R: the sender's commitment proof plus the outbound tokens
/// with their telomeres already transformed to name the receiver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationPacket {
    pub transaction_id: TransactionId,
    pub sender_commitment: Signature,
    pub time_status: TimeStatus,
    pub transferred_tokens: Vec<Token>,
    pub timestamp_ms: TimestampMs,
}

/// Packet 4, R→S: the receiver's commitment proof; carries reverse-direction
/// tokens when the exchange is two-way (empty for one-way transfers).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AcknowledgementPacket {
    pub transaction_id: TransactionId,
    pub receiver_commitment: Signature,
    pub time_status: TimeStatus,
    pub transferred_tokens: Vec<Token>,
    pub timestamp_ms: TimestampMs,
}

/// Envelope routed over the transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Packet {
    Initiation(InitiationPacket),
    Response(ResponsePacket),
    Confirmation(ConfirmationPacket),
    Acknowledgement(AcknowledgementPacket),
}

impl Packet {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Packet::Initiation(p) => p.transaction_id,
            Packet::Response(p) => p.transaction_id,
            Packet::Confirmation(p) => p.transaction_id,
            Packet::Acknowledgement(p) => p.transaction_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Initiation(_) => "Initiation",
            Packet::Response(_) => "Response",
            Packet::Confirmation(_) => "Confirmation",
            Packet::Acknowledgement(_) => "Acknowledgement",
        }
    }

    /// Discriminant used as the idempotence cache key.
    pub fn kind(&self) -> u8 {
        match self {
            Packet::Initiation(_) => 1,
            Packet::Response(_) => 2,
            Packet::Confirmation(_) => 3,
            Packet::Acknowledgement(_) => 4,
        }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("packet serialization is infallible")
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PaktError> {
        bincode::deserialize(bytes).map_err(|e| PaktError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_packet_round_trips() {
        let packet = Packet::Response(ResponsePacket::reject(
            TransactionId::generate(),
            "VALIDATION_FAILED: bad telomere".to_string(),
            1_000,
        ));
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.name(), "Response");
    }
}
