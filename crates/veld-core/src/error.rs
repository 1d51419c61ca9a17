//! Error kinds shared by the transport, dispatcher, and cache.
//!
//! Transport errors fail the whole connection and are never retried here.
//! Protocol errors additionally trigger a best-effort GOAWAY to the peer.
//! StreamClosed and WouldBlock surface to the caller of `send` and never
//! escalate. NotFound is a normal cache outcome. Cancelled is silent.
//! Invariant violations are bugs and panic.

use crate::wire::MAX_PAYLOAD;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on an underlying pipe. Fatal for the connection.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer violated the framing or control protocol. Fatal for the
    /// connection, reported to the peer as GOAWAY when possible.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stream or connection is closed for new work.
    #[error("stream closed")]
    StreamClosed,

    /// Transient backpressure: the outbound queue is at its high-water
    /// mark. The sender may retry later.
    #[error("outbound queue at high-water mark")]
    WouldBlock,

    /// The requested bytes exist in no cache tier.
    #[error("not found in any cache tier")]
    NotFound,

    /// The request was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
}

/// Framing and control violations observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame length {frame_len} shorter than its stream id encoding of {sid_len} bytes")]
    FrameTooShort { frame_len: u64, sid_len: usize },

    #[error("payload length {0} exceeds maximum {max}", max = MAX_PAYLOAD)]
    PayloadTooLarge(u64),

    #[error("unknown control op-code {0}")]
    UnknownControlOp(u64),

    #[error("truncated control frame")]
    TruncatedControl,

    #[error("data frame on the reserved control stream")]
    DataOnControlStream,
}

impl Error {
    /// Transient errors may be retried by the caller; everything else is
    /// terminal for the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}
