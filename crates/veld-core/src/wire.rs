//! Wire format — framing and control frames for multiplexed connections.
//!
//! These encodings ARE the protocol. Every frame on a pipe is
//! `varint frame_length || varint stream_id || payload`, where
//! `frame_length` counts the stream-id encoding plus the payload but not
//! its own bytes. Stream id 0 is reserved for connection-level control.

use crate::chunk::Chunk;
use crate::error::ProtocolError;
use crate::varint;

/// Length of the fixed scratch region each read buffer parses into.
pub const SCRATCH_LEN: usize = 1440;

/// Below this many trailing bytes, a partial frame is moved to the front
/// of the scratch region instead of switching to a dedicated chunk.
pub const LOW_WATER_MARK: usize = 256;

/// Default ceiling on queued outbound bytes per connection. Sends past it
/// fail with WouldBlock until the queues drain.
pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;

/// Maximum payload bytes in a single frame.
pub const MAX_PAYLOAD: u64 = u32::MAX as u64;

/// Default handshake timeout in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Default keepalive ping interval in seconds. 0 disables keepalive.
pub const PING_INTERVAL_SECS: u64 = 15;

// ── Stream ids ───────────────────────────────────────────────────────────────

/// Varint-encoded logical stream identifier. Zero is the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// The reserved connection-level control stream.
    pub const CONTROL: StreamId = StreamId(0);

    pub fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Append one complete frame for `sid` carrying `payload`.
pub fn encode_frame(sid: StreamId, payload: &[u8], out: &mut Vec<u8>) {
    encode_frame_header(sid, payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Append just the two header varints for a frame whose payload is
/// `payload_len` bytes. The payload follows as its own segment.
pub fn encode_frame_header(sid: StreamId, payload_len: u64, out: &mut Vec<u8>) {
    let sid_len = varint::encoded_len(sid.0) as u64;
    varint::encode(sid_len + payload_len, out);
    varint::encode(sid.0, out);
}

/// A frame header parsed off the front of a byte run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sid: StreamId,
    /// Payload bytes that follow the header.
    pub payload_len: u64,
    /// Bytes the two varints occupy.
    pub header_len: usize,
}

impl FrameHeader {
    /// Total wire length of the frame this header announces.
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Parse a frame header from the front of `buf`.
///
/// `Ok(None)` means the header is not complete yet — read more bytes.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    let Some((frame_len, len_width)) = varint::decode(buf) else {
        return Ok(None);
    };
    let Some((sid, sid_width)) = varint::decode(&buf[len_width..]) else {
        return Ok(None);
    };
    if frame_len < sid_width as u64 {
        return Err(ProtocolError::FrameTooShort {
            frame_len,
            sid_len: sid_width,
        });
    }
    let payload_len = frame_len - sid_width as u64;
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }
    Ok(Some(FrameHeader {
        sid: StreamId(sid),
        payload_len,
        header_len: len_width + sid_width,
    }))
}

/// Decode every complete frame at the front of `buf`.
///
/// Returns the parsed `(StreamId, Chunk)` pairs and the number of bytes
/// consumed; trailing bytes belong to an incomplete frame.
pub fn decode_frames(buf: &[u8]) -> Result<(Vec<(StreamId, Chunk)>, usize), ProtocolError> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while let Some(header) = decode_header(&buf[pos..])? {
        let total = header.header_len + header.payload_len as usize;
        if buf.len() - pos < total {
            break;
        }
        let start = pos + header.header_len;
        frames.push((header.sid, Chunk::copy_from_slice(&buf[start..pos + total])));
        pos += total;
    }
    Ok((frames, pos))
}

// ── Control frames ───────────────────────────────────────────────────────────

const OP_OPEN: u64 = 1;
const OP_CLOSE: u64 = 2;
const OP_PING: u64 = 3;
const OP_PONG: u64 = 4;
const OP_GOAWAY: u64 = 5;

/// Connection-level control operations carried on stream 0.
///
/// Each is a varint op-code followed by op-specific varint fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// The peer opened a stream.
    Open(StreamId),
    /// The peer half-closed a stream.
    Close(StreamId),
    /// Liveness probe; doubles as the connection handshake.
    Ping(u64),
    /// Reply to a ping, echoing its nonce.
    Pong(u64),
    /// The peer is going away; no further streams will be accepted.
    GoAway(u64),
}

impl ControlOp {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            ControlOp::Open(sid) => {
                varint::encode(OP_OPEN, out);
                varint::encode(sid.0, out);
            }
            ControlOp::Close(sid) => {
                varint::encode(OP_CLOSE, out);
                varint::encode(sid.0, out);
            }
            ControlOp::Ping(nonce) => {
                varint::encode(OP_PING, out);
                varint::encode(nonce, out);
            }
            ControlOp::Pong(nonce) => {
                varint::encode(OP_PONG, out);
                varint::encode(nonce, out);
            }
            ControlOp::GoAway(reason) => {
                varint::encode(OP_GOAWAY, out);
                varint::encode(reason, out);
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<ControlOp, ProtocolError> {
        let (op, consumed) = varint::decode(payload).ok_or(ProtocolError::TruncatedControl)?;
        let (field, _) =
            varint::decode(&payload[consumed..]).ok_or(ProtocolError::TruncatedControl)?;
        match op {
            OP_OPEN => Ok(ControlOp::Open(StreamId(field))),
            OP_CLOSE => Ok(ControlOp::Close(StreamId(field))),
            OP_PING => Ok(ControlOp::Ping(field)),
            OP_PONG => Ok(ControlOp::Pong(field)),
            OP_GOAWAY => Ok(ControlOp::GoAway(field)),
            other => Err(ProtocolError::UnknownControlOp(other)),
        }
    }

    /// The encoded control frame, ready to enqueue on a pipe.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode(&mut payload);
        let mut frame = Vec::new();
        encode_frame(StreamId::CONTROL, &payload, &mut frame);
        frame
    }
}
