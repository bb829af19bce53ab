//! The four-packet atomic commitment protocol.
//!
//! A transaction exchanges tokens between two parties with all-or-nothing
//! semantics: Initiation (S→R) → Response (R→S) → Confirmation (S→R) →
//! Acknowledgement (R→S). The state machine here is synchronous and
//! packet-driven; the async [`driver`] pumps packets between a reliable
//! link and the engine.

pub mod context;
pub mod driver;
pub mod machine;
pub mod packets;
pub mod state;

pub use context::{TransactionConstraints, TransactionContext};
pub use driver::{sweep_timeouts, ExchangeDriver};
pub use machine::ExchangeEngine;
pub use packets::{
    AcknowledgementPacket, ConfirmationPacket, InitiationPacket, Packet, ResponsePacket,
};
pub use state::{Transaction, TransactionState};
