//! Async pump between a [`ReliableLink`] and the synchronous engine.
//!
//! The state machine suspends only here: awaiting the next packet, the
//! time gate, or a storage flush — the engine itself never blocks on the
//! network.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

use pakt_core::error::PaktError;
use pakt_core::types::TransactionId;
use pakt_transport::frame::{Compression, ControlPayload, TransportError};
use pakt_transport::reliability::{LinkEvent, ReliableLink};
use pakt_transport::MessageChannel;

use crate::context::TransactionConstraints;
use crate::machine::ExchangeEngine;
use crate::packets::Packet;

fn transport_err(e: TransportError) -> PaktError {
    match e {
        TransportError::DeliveryFailed(frame, attempts) => {
            PaktError::TransactionTimeout(format!("frame {frame} undelivered after {attempts} attempts"))
        }
        TransportError::ReceiveTimeout => {
            PaktError::TransactionTimeout("peer went silent".to_string())
        }
        other => PaktError::Internal(other.to_string()),
    }
}

pub struct ExchangeDriver<C: MessageChannel> {
    engine: Arc<ExchangeEngine>,
    link: ReliableLink<C>,
    /// Bound on each wait for the peer's next packet.
    receive_window: Duration,
}

impl<C: MessageChannel> ExchangeDriver<C> {
    pub fn new(engine: Arc<ExchangeEngine>, link: ReliableLink<C>) -> Self {
        Self {
            engine,
            link,
            receive_window: Duration::from_millis(
                pakt_core::constants::DEFAULT_MAX_DURATION_MS as u64,
            ),
        }
    }

    pub fn with_receive_window(mut self, window: Duration) -> Self {
        self.receive_window = window;
        self
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), PaktError> {
        let now = self.engine_now();
        self.link
            .send_data(&packet.to_bytes(), Compression::Gzip, now)
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    /// Await the next transaction packet, servicing recovery controls on
    /// the way.
    async fn recv_packet(&mut self) -> Result<Packet, PaktError> {
        loop {
            let now = self.engine_now();
            match self
                .link
                .recv(Some(self.receive_window), now)
                .await
                .map_err(transport_err)?
            {
                LinkEvent::Data { payload, .. } => return Packet::from_bytes(&payload),
                LinkEvent::Control(ControlPayload::TransactionRecovery { transaction_id }) => {
                    if let Ok(uuid) = Uuid::parse_str(&transaction_id) {
                        let _ = self.engine.process_recovery_request(&TransactionId(uuid));
                    }
                    continue;
                }
                LinkEvent::Control(_) => continue,
            }
        }
    }

    fn engine_now(&self) -> i64 {
        self.engine.now_ms()
    }

    // ── Sender side ──────────────────────────────────────────────────────────

    /// Drive one outbound transaction through all four packets. On failure
    /// the transaction is aborted locally and the peer is told to roll
    /// back.
    pub async fn run_sender(
        &mut self,
        amount: u64,
        purpose: &str,
        constraints: TransactionConstraints,
    ) -> Result<TransactionId, PaktError> {
        let initiation = self.engine.initiate_transaction(amount, purpose, constraints)?;
        let id = initiation.transaction_id;

        let outcome = self.drive_sender(Packet::Initiation(initiation)).await;
        match outcome {
            Ok(()) => {
                info!(tx = %id, "exchange complete");
                Ok(id)
            }
            Err(e) => {
                warn!(tx = %id, error = %e, "sender run failed, rolling back");
                if let Err(PaktError::AbortAfterCommit(_)) =
                    self.engine.abort_transaction(&id, &e.to_string())
                {
                    // Already committed: the failure is post-commit noise.
                    return Ok(id);
                }
                let recovery = ControlPayload::TransactionRecovery {
                    transaction_id: id.to_string(),
                };
                let now = self.engine_now();
                let _ = self.link.send_control(&recovery, now).await;
                Err(e)
            }
        }
    }

    async fn drive_sender(&mut self, initiation: Packet) -> Result<(), PaktError> {
        self.send_packet(&initiation).await?;

        let response = match self.recv_packet().await? {
            Packet::Response(r) => r,
            other => {
                return Err(PaktError::OutOfOrderPacket {
                    packet: other.name().to_string(),
                    state: "awaiting Response".to_string(),
                })
            }
        };
        let confirmation = self.engine.process_response(&response)?;
        self.send_packet(&Packet::Confirmation(confirmation)).await?;

        let acknowledgement = match self.recv_packet().await? {
            Packet::Acknowledgement(a) => a,
            other => {
                return Err(PaktError::OutOfOrderPacket {
                    packet: other.name().to_string(),
                    state: "awaiting Acknowledgement".to_string(),
                })
            }
        };
        self.engine.finalize_transaction(&acknowledgement)
    }

    // ── Receiver side ────────────────────────────────────────────────────────

    /// Serve one inbound transaction to completion. Returns the id on
    /// commit; a rejection or failure surfaces as the error that caused it
    /// (the rejection Response has already been sent either way).
    pub async fn serve_one(&mut self) -> Result<TransactionId, PaktError> {
        let initiation = match self.recv_packet().await? {
            Packet::Initiation(p) => p,
            other => {
                return Err(PaktError::OutOfOrderPacket {
                    packet: other.name().to_string(),
                    state: "awaiting Initiation".to_string(),
                })
            }
        };
        let id = initiation.transaction_id;

        let response = self.engine.respond_to_transaction(&initiation)?;
        let accepted = response.accepted;
        let reason = response.reason.clone();
        self.send_packet(&Packet::Response(response)).await?;
        if !accepted {
            return Err(PaktError::PeerRejected(
                reason.unwrap_or_else(|| "rejected".to_string()),
            ));
        }

        let confirmation = match self.recv_packet().await? {
            Packet::Confirmation(p) => p,
            other => {
                return Err(PaktError::OutOfOrderPacket {
                    packet: other.name().to_string(),
                    state: "awaiting Confirmation".to_string(),
                })
            }
        };
        let acknowledgement = self.engine.process_confirmation(&confirmation)?;
        self.send_packet(&Packet::Acknowledgement(acknowledgement))
            .await?;
        info!(tx = %id, "exchange served");
        Ok(id)
    }
}

/// Periodic timeout sweep; spawn alongside the drivers.
pub async fn sweep_timeouts(engine: Arc<ExchangeEngine>, every: Duration) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        for id in engine.check_timeouts() {
            warn!(tx = %id, "transaction timed out and rolled back");
        }
    }
}
