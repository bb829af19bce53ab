//! Transport: wire framing, the `MessageChannel` abstraction over opaque
//! transports (QR, NFC, BLE, direct), and the reliability layer providing
//! acknowledged, duplicate-suppressed, chunk-recoverable delivery.

pub mod channel;
pub mod frame;
pub mod reliability;
pub mod session;

pub use channel::{memory_pair, MemoryChannel, MessageChannel};
pub use frame::{
    AckFrame, ChunkInfo, Compression, ControlPayload, Frame, FrameType, RecoveryRequest,
    TransportError, WireMessage,
};
pub use reliability::{ReliableLink, RetryConfig};
pub use session::{Session, SessionManager};
