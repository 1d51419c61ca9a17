//! Per-stream facade over a connection.

use std::fmt;
use std::sync::Arc;

use veld_core::wire::StreamId;
use veld_core::{Chunk, Result};

use crate::connection::{ReceiverFn, Shared};

/// A logical stream. Thin: every operation resolves through the owning
/// connection's table by id, so a handle never outlives its entry's
/// validity. Dropping the handle cancels pending inbound delivery; the
/// table entry itself lives until both sides closed and the outbound
/// queue holds nothing for it.
pub struct Stream {
    shared: Arc<Shared>,
    id: StreamId,
}

impl Stream {
    pub(crate) fn new(shared: Arc<Shared>, id: StreamId) -> Self {
        Stream { shared, id }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hand a chunk to the connection for framing. Ownership transfers;
    /// `Err(WouldBlock)` means try again once the queue drains.
    pub fn send(&self, chunk: Chunk) -> Result<()> {
        self.shared.send_on(self.id, chunk)
    }

    /// Half-close: a CLOSE control frame goes out and further sends
    /// return StreamClosed. Inbound data may still arrive until the peer
    /// closes its side.
    pub fn close(&self) -> Result<()> {
        self.shared.close_stream(self.id)
    }

    /// Install (or replace) the delivery target.
    pub fn set_receiver(&self, receiver: ReceiverFn) {
        self.shared.set_receiver(self.id, receiver);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // cancel pending inbound delivery; the entry stays for cleanup
        self.shared.clear_receiver(self.id);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({})", self.id)
    }
}
