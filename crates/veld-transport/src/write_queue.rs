//! Per-pipe outbound queue.
//!
//! Segments (a header per frame plus its payload) drain strictly FIFO
//! through a single writer task, which is what makes framing atomic:
//! once a frame's first byte reaches the pipe, nothing else is written
//! until the frame completes. A partial write retains its byte offset
//! and the next writable turn resumes there. The shared queued-bytes
//! counter feeds the connection's high-water backpressure check.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Notify};

use veld_core::wire::StreamId;

use crate::connection::{ConnEvent, PipeFailure};
use crate::pipe::BoxPipe;

/// Reported when a frame's last byte reaches the pipe.
pub(crate) struct FrameCompletion {
    pub(crate) sid: StreamId,
    /// The owning stream's count of frames still queued for it.
    pub(crate) pending: Option<Arc<AtomicUsize>>,
}

struct Segment {
    bytes: Bytes,
    completion: Option<FrameCompletion>,
}

pub(crate) struct WriteQueue {
    segments: VecDeque<Segment>,
    front_offset: usize,
    queued: Arc<AtomicUsize>,
    shutdown: bool,
}

impl WriteQueue {
    pub(crate) fn new(queued: Arc<AtomicUsize>) -> Self {
        WriteQueue {
            segments: VecDeque::new(),
            front_offset: 0,
            queued,
            shutdown: false,
        }
    }

    /// Enqueue one whole frame. The completion rides on the frame's last
    /// segment.
    pub(crate) fn push_frame(
        &mut self,
        header: Bytes,
        payload: Option<Bytes>,
        completion: Option<FrameCompletion>,
    ) {
        let mut added = header.len();
        if let Some(p) = &payload {
            added += p.len();
        }
        self.queued.fetch_add(added, Ordering::Release);
        match payload {
            Some(p) if !p.is_empty() => {
                self.segments.push_back(Segment {
                    bytes: header,
                    completion: None,
                });
                self.segments.push_back(Segment {
                    bytes: p,
                    completion,
                });
            }
            _ => self.segments.push_back(Segment {
                bytes: header,
                completion,
            }),
        }
    }

    /// The unwritten remainder of the front segment.
    fn front(&self) -> Option<(Bytes, usize)> {
        self.segments
            .front()
            .map(|s| (s.bytes.clone(), self.front_offset))
    }

    /// Record `n` bytes accepted by the pipe. Returns completions for
    /// every frame whose final byte just flushed.
    pub(crate) fn advance(&mut self, mut n: usize) -> Vec<FrameCompletion> {
        let mut done = Vec::new();
        while n > 0 {
            let Some(front) = self.segments.front() else {
                break;
            };
            let remaining = front.bytes.len() - self.front_offset;
            let consumed = remaining.min(n);
            self.queued.fetch_sub(consumed, Ordering::Release);
            n -= consumed;
            if consumed == remaining {
                self.front_offset = 0;
                let segment = self.segments.pop_front().expect("front exists");
                if let Some(completion) = segment.completion {
                    done.push(completion);
                }
            } else {
                self.front_offset += consumed;
            }
        }
        done
    }

    /// Stop accepting work; the writer drains what is queued, then exits.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown = true;
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Writer task for one pipe.
pub(crate) async fn run_write_loop(
    pipe: usize,
    mut writer: WriteHalf<BoxPipe>,
    queue: Arc<Mutex<WriteQueue>>,
    notify: Arc<Notify>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    loop {
        let notified = notify.notified();
        let front = {
            let q = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if q.is_empty() && q.is_shutdown() {
                return;
            }
            q.front()
        };
        let Some((bytes, offset)) = front else {
            notified.await;
            continue;
        };
        match writer.write(&bytes[offset..]).await {
            Ok(0) => {
                let _ = events.send(ConnEvent::PipeFailed {
                    pipe,
                    failure: PipeFailure::Eof,
                });
                return;
            }
            Ok(n) => {
                let done = {
                    let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
                    q.advance(n)
                };
                for completion in done {
                    if let Some(pending) = &completion.pending {
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                    let _ = events.send(ConnEvent::Flushed {
                        sid: completion.sid,
                    });
                }
            }
            Err(e) => {
                let _ = events.send(ConnEvent::PipeFailed {
                    pipe,
                    failure: PipeFailure::Io(e),
                });
                return;
            }
        }
    }
}
