//! Incremental frame parsing off one pipe.
//!
//! Bytes land in a fixed 1440-byte scratch region. Every completed read
//! scans from offset zero, producing a chunk per complete frame. A
//! partial trailing frame under 256 bytes (the low-water mark) moves to
//! the front of the scratch region; a larger one switches the buffer to
//! reading directly into a chunk sized for the whole frame, avoiding a
//! second copy of a large payload.

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc;

use veld_core::wire::{self, StreamId, LOW_WATER_MARK, SCRATCH_LEN};
use veld_core::{Chunk, ProtocolError};

use crate::connection::{ConnEvent, PipeFailure};
use crate::pipe::BoxPipe;

/// Which region the next read lands in. Exposed to instrumentation so
/// large-frame handling is observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Scratch,
    LargeChunk,
}

/// Observes transitions between read modes.
pub type ModeHook = Box<dyn FnMut(ReadMode) + Send>;

pub(crate) struct ReadBuffer {
    scratch: Box<[u8; SCRATCH_LEN]>,
    filled: usize,
    large: Option<LargeRead>,
    hook: Option<ModeHook>,
}

struct LargeRead {
    sid: StreamId,
    buf: Vec<u8>,
    filled: usize,
}

impl ReadBuffer {
    pub(crate) fn new(hook: Option<ModeHook>) -> Self {
        ReadBuffer {
            scratch: Box::new([0u8; SCRATCH_LEN]),
            filled: 0,
            large: None,
            hook,
        }
    }

    /// Where the next read goes: the free tail of the scratch region, or
    /// the unfilled remainder of the large chunk.
    pub(crate) fn read_target(&mut self) -> &mut [u8] {
        match &mut self.large {
            Some(large) => {
                let filled = large.filled;
                &mut large.buf[filled..]
            }
            None => &mut self.scratch[self.filled..],
        }
    }

    /// Record `n` freshly read bytes; returns the frames they completed.
    pub(crate) fn advance(&mut self, n: usize) -> Result<Vec<(StreamId, Chunk)>, ProtocolError> {
        if let Some(large) = &mut self.large {
            large.filled += n;
            if large.filled < large.buf.len() {
                return Ok(Vec::new());
            }
            let LargeRead { sid, buf, .. } = self.large.take().expect("large read present");
            if let Some(hook) = self.hook.as_mut() {
                hook(ReadMode::Scratch);
            }
            return Ok(vec![(sid, Chunk::from_vec(buf))]);
        }
        self.filled += n;
        self.scan_scratch()
    }

    fn scan_scratch(&mut self) -> Result<Vec<(StreamId, Chunk)>, ProtocolError> {
        let mut frames = Vec::new();
        let mut pos = 0;
        let mut pending_large = None;
        while pos < self.filled {
            let avail = &self.scratch[pos..self.filled];
            let Some(header) = wire::decode_header(avail)? else {
                break;
            };
            let total = header.header_len + header.payload_len as usize;
            if avail.len() < total {
                if avail.len() >= LOW_WATER_MARK {
                    pending_large = Some(header);
                }
                break;
            }
            frames.push((
                header.sid,
                Chunk::copy_from_slice(&avail[header.header_len..total]),
            ));
            pos += total;
        }

        if let Some(header) = pending_large {
            // enough trailing bytes to justify a dedicated chunk: copy the
            // received payload prefix and read the rest straight into it
            let avail = &self.scratch[pos..self.filled];
            let partial = avail.len() - header.header_len;
            let mut buf = vec![0u8; header.payload_len as usize];
            buf[..partial].copy_from_slice(&avail[header.header_len..]);
            self.large = Some(LargeRead {
                sid: header.sid,
                buf,
                filled: partial,
            });
            self.filled = 0;
            if let Some(hook) = self.hook.as_mut() {
                hook(ReadMode::LargeChunk);
            }
        } else {
            let trailing = self.filled - pos;
            if trailing > 0 && pos > 0 {
                self.scratch.copy_within(pos..self.filled, 0);
            }
            self.filled = trailing;
        }
        Ok(frames)
    }
}

/// Read loop for one pipe. Parsed frames go to the connection driver;
/// the loop reports EOF or failure exactly once and stops. If the driver
/// is gone the loop simply exits — the buffer dies with its pipe.
pub(crate) async fn run_read_loop(
    pipe: usize,
    mut reader: ReadHalf<BoxPipe>,
    mut buffer: ReadBuffer,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    loop {
        let n = match reader.read(buffer.read_target()).await {
            Ok(0) => {
                let _ = events.send(ConnEvent::PipeFailed {
                    pipe,
                    failure: PipeFailure::Eof,
                });
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(ConnEvent::PipeFailed {
                    pipe,
                    failure: PipeFailure::Io(e),
                });
                return;
            }
        };
        match buffer.advance(n) {
            Ok(frames) => {
                for (sid, chunk) in frames {
                    if events.send(ConnEvent::Frame { pipe, sid, chunk }).is_err() {
                        return;
                    }
                }
            }
            Err(violation) => {
                let _ = events.send(ConnEvent::PipeFailed {
                    pipe,
                    failure: PipeFailure::Protocol(violation),
                });
                return;
            }
        }
    }
}
