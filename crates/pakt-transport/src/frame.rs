//! Wire-level framing.
//!
//! Every message on a channel is one [`WireMessage`]: a data frame carrying
//! an opaque payload with a chunk table for partial recovery, an
//! acknowledgement, or a control record. Encoding is canonical bincode;
//! payloads may be gzip-compressed.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use uuid::Uuid;

use pakt_core::constants::{MAX_CHUNK_BYTES, PROTOCOL_VERSION};
use pakt_core::types::{Digest, TimestampMs};
use pakt_crypto::hash::digest;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unsupported compression: {0:?}")]
    UnsupportedCompression(Compression),

    #[error("chunk {index} failed its hash check")]
    ChunkMismatch { index: u32 },

    #[error("frame {0} not acknowledged after {1} attempts")]
    DeliveryFailed(Uuid, u32),

    #[error("no frame received within the receive window")]
    ReceiveTimeout,

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
}

// ── Enums ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ack,
    Control,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    /// Declared on the wire but not implemented here; frames marked Lz4 are
    /// refused.
    Lz4,
}

// ── Chunk table ──────────────────────────────────────────────────────────────

/// Describes one slice of a frame's (compressed) payload, enabling
/// chunk-level integrity checks and partial retransmission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub total: u32,
    pub size: u32,
    pub chunk_hash: Digest,
    pub complete_hash: Digest,
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A data or control frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub frame_id: Uuid,
    pub frame_type: FrameType,
    /// Compressed payload bytes (whole, even when chunked — the chunk table
    /// describes slices of this buffer).
    pub payload: Vec<u8>,
    pub timestamp_ms: TimestampMs,
    pub compression: Compression,
    pub chunks: Vec<ChunkInfo>,
    pub protocol_version: u32,
    /// Per-session monotonic.
    pub sequence_number: u64,
}

impl Frame {
    /// Build a DATA frame around `payload`, compressing and chunking it.
    pub fn data(
        payload: &[u8],
        compression: Compression,
        sequence_number: u64,
        now_ms: TimestampMs,
    ) -> Result<Self, TransportError> {
        let compressed = compress(payload, compression)?;
        let chunks = chunk_table(&compressed);
        Ok(Self {
            frame_id: Uuid::new_v4(),
            frame_type: FrameType::Data,
            payload: compressed,
            timestamp_ms: now_ms,
            compression,
            chunks,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
        })
    }

    /// Build a CONTROL frame. Control payloads are small; never compressed.
    pub fn control(
        payload: &ControlPayload,
        sequence_number: u64,
        now_ms: TimestampMs,
    ) -> Self {
        let bytes =
            bincode::serialize(payload).expect("control payload serialization is infallible");
        let chunks = chunk_table(&bytes);
        Self {
            frame_id: Uuid::new_v4(),
            frame_type: FrameType::Control,
            payload: bytes,
            timestamp_ms: now_ms,
            compression: Compression::None,
            chunks,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
        }
    }

    /// Decompress and return the application payload.
    pub fn open_payload(&self) -> Result<Vec<u8>, TransportError> {
        decompress(&self.payload, self.compression)
    }

    pub fn control_payload(&self) -> Result<ControlPayload, TransportError> {
        bincode::deserialize(&self.payload).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Indices of chunks whose hash matches the payload slice. A fully
    /// intact frame returns every index.
    pub fn sound_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| {
                self.chunk_bytes(c.index)
                    .map(|slice| digest(slice) == c.chunk_hash)
                    .unwrap_or(false)
            })
            .map(|c| c.index)
            .collect()
    }

    /// Verify the chunk table end-to-end: every chunk hash plus the
    /// complete-payload hash.
    pub fn verify_chunks(&self) -> Result<(), TransportError> {
        let whole = digest(&self.payload);
        for c in &self.chunks {
            let slice = self
                .chunk_bytes(c.index)
                .ok_or(TransportError::ChunkMismatch { index: c.index })?;
            if digest(slice) != c.chunk_hash || c.complete_hash != whole {
                return Err(TransportError::ChunkMismatch { index: c.index });
            }
        }
        Ok(())
    }

    /// The payload slice described by chunk `index`.
    pub fn chunk_bytes(&self, index: u32) -> Option<&[u8]> {
        let start = (index as usize) * MAX_CHUNK_BYTES;
        if start >= self.payload.len() && !(start == 0 && self.payload.is_empty()) {
            return None;
        }
        let end = (start + MAX_CHUNK_BYTES).min(self.payload.len());
        Some(&self.payload[start..end])
    }

    /// Patch chunk `index` with retransmitted bytes.
    pub fn patch_chunk(&mut self, index: u32, bytes: &[u8]) {
        let start = (index as usize) * MAX_CHUNK_BYTES;
        let end = (start + bytes.len()).min(self.payload.len());
        if start < self.payload.len() {
            self.payload[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }
}

fn chunk_table(payload: &[u8]) -> Vec<ChunkInfo> {
    let complete_hash = digest(payload);
    let total = payload.len().div_ceil(MAX_CHUNK_BYTES).max(1) as u32;
    (0..total)
        .map(|index| {
            let start = (index as usize) * MAX_CHUNK_BYTES;
            let end = (start + MAX_CHUNK_BYTES).min(payload.len());
            let slice = &payload[start..end];
            ChunkInfo {
                index,
                total,
                size: slice.len() as u32,
                chunk_hash: digest(slice),
                complete_hash,
            }
        })
        .collect()
}

// ── Ack / control records ────────────────────────────────────────────────────

/// Acknowledgement for one frame. A failed ack lists the chunk indices that
/// arrived intact so the sender retransmits only the missing ones.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckFrame {
    pub frame_id: Uuid,
    pub success: bool,
    pub error_message: Option<String>,
    pub received_chunks: Vec<u32>,
}

/// Receiver-initiated request for chunk-level retransmission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub frame_id: Uuid,
    pub missing_chunks: Vec<u32>,
    pub session_id: Uuid,
}

/// Control-frame payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ControlPayload {
    Recovery(RecoveryRequest),
    /// Sender's answer to a partial ack or recovery request.
    ChunkRetransmit {
        frame_id: Uuid,
        chunks: Vec<(u32, Vec<u8>)>,
    },
    /// A reconnecting peer asks its counterpart to re-evaluate a
    /// transaction that may have aborted while the link was down.
    TransactionRecovery {
        transaction_id: String,
    },
}

// ── Wire message ─────────────────────────────────────────────────────────────

/// Everything that travels over a channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    Frame(Frame),
    Ack(AckFrame),
}

impl WireMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("wire message serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

// ── Compression ──────────────────────────────────────────────────────────────

fn compress(payload: &[u8], compression: Compression) -> Result<Vec<u8>, TransportError> {
    match compression {
        Compression::None => Ok(payload.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(payload)
                .and_then(|_| encoder.finish())
                .map_err(|e| TransportError::Codec(e.to_string()))
        }
        Compression::Lz4 => Err(TransportError::UnsupportedCompression(compression)),
    }
}

fn decompress(payload: &[u8], compression: Compression) -> Result<Vec<u8>, TransportError> {
    match compression {
        Compression::None => Ok(payload.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| TransportError::Codec(e.to_string()))?;
            Ok(out)
        }
        Compression::Lz4 => Err(TransportError::UnsupportedCompression(compression)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::data(b"hello pakt", Compression::None, 7, 1_000).unwrap();
        let bytes = WireMessage::Frame(frame.clone()).to_bytes();
        match WireMessage::from_bytes(&bytes).unwrap() {
            WireMessage::Frame(decoded) => {
                assert_eq!(decoded, frame);
                assert_eq!(decoded.open_payload().unwrap(), b"hello pakt");
            }
            other => panic!("unexpected wire message: {other:?}"),
        }
    }

    #[test]
    fn gzip_round_trips_and_shrinks_repetitive_payloads() {
        let payload = vec![0xAB; 200_000];
        let frame = Frame::data(&payload, Compression::Gzip, 0, 0).unwrap();
        assert!(frame.payload.len() < payload.len());
        assert_eq!(frame.open_payload().unwrap(), payload);
    }

    #[test]
    fn lz4_is_refused() {
        assert!(matches!(
            Frame::data(b"x", Compression::Lz4, 0, 0),
            Err(TransportError::UnsupportedCompression(Compression::Lz4))
        ));
    }

    #[test]
    fn chunk_table_covers_large_payloads() {
        let payload = vec![1u8; MAX_CHUNK_BYTES * 2 + 10];
        let frame = Frame::data(&payload, Compression::None, 0, 0).unwrap();
        assert_eq!(frame.chunks.len(), 3);
        assert_eq!(frame.chunks[2].size, 10);
        frame.verify_chunks().unwrap();
        assert_eq!(frame.sound_chunks(), vec![0, 1, 2]);
    }

    #[test]
    fn corrupted_chunk_is_detected_and_patchable() {
        let payload: Vec<u8> = (0..(MAX_CHUNK_BYTES * 2)).map(|i| i as u8).collect();
        let mut frame = Frame::data(&payload, Compression::None, 0, 0).unwrap();
        let original = frame.chunk_bytes(1).unwrap().to_vec();

        frame.payload[MAX_CHUNK_BYTES + 5] ^= 0xFF;
        assert!(matches!(
            frame.verify_chunks(),
            Err(TransportError::ChunkMismatch { index: 1 })
        ));
        assert_eq!(frame.sound_chunks(), vec![0]);

        frame.patch_chunk(1, &original);
        frame.verify_chunks().unwrap();
    }

    #[test]
    fn ack_round_trips() {
        let ack = AckFrame {
            frame_id: Uuid::new_v4(),
            success: false,
            error_message: Some("chunk 2 missing".to_string()),
            received_chunks: vec![0, 1],
        };
        let bytes = WireMessage::Ack(ack.clone()).to_bytes();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), WireMessage::Ack(ack));
    }

    #[test]
    fn empty_payload_has_single_empty_chunk() {
        let frame = Frame::data(b"", Compression::None, 0, 0).unwrap();
        assert_eq!(frame.chunks.len(), 1);
        assert_eq!(frame.chunks[0].size, 0);
        frame.verify_chunks().unwrap();
    }
}
