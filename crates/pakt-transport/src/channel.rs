//! The `MessageChannel` abstraction: an opaque byte pipe to the peer.
//!
//! QR, NFC, BLE and direct-socket transports all reduce to this trait;
//! the variant in use is selected at runtime by the embedding application.
//! The in-memory pair here backs tests and same-process exchanges.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::frame::TransportError;

#[async_trait]
pub trait MessageChannel: Send {
    /// Deliver one framed message to the peer.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Await the next framed message. `None` means the peer closed.
    async fn receive(&mut self) -> Option<Vec<u8>>;

    fn close(&mut self);
}

/// One endpoint of an in-memory duplex pair.
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Build two connected endpoints.
pub fn memory_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(bytes)
                .await
                .map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::ChannelClosed),
        }
    }

    async fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (mut a, mut b) = memory_pair(8);
        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), b"ping");
        b.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.receive().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn closed_channel_reports_closed() {
        let (mut a, mut b) = memory_pair(1);
        a.close();
        assert!(matches!(
            a.send(b"x".to_vec()).await,
            Err(TransportError::ChannelClosed)
        ));
        assert!(b.receive().await.is_none());
    }
}
