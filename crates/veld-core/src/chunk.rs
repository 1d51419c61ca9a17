//! Owned byte buffers used throughout framing and the cache.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

/// An owned, contiguous, immutable byte sequence.
///
/// Chunks are created by the read path or by clients, sealed on
/// construction, and handed off by value on send and cache insertion.
/// Cloning is cheap — clones share the underlying storage, which is how
/// cache tiers hold read access to the same bytes concurrently.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Chunk(Bytes);

impl Chunk {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Chunk(Bytes::from(data))
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Chunk(Bytes::from_static(data))
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Chunk(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A sub-chunk sharing the same storage.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Chunk {
        Chunk(self.0.slice(range))
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Chunk::from_vec(data)
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Chunk(data)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({} bytes)", self.len())
    }
}

/// Free-list of fixed-size scratch buffers.
///
/// Frame encoding acquires a buffer, fills it, and the buffer returns to
/// the pool on drop. When the pool is empty a fresh allocation is handed
/// out instead of blocking.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buf_len: usize,
    max_free: usize,
}

impl BufferPool {
    pub fn new(buf_len: usize, max_free: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buf_len,
                max_free,
            }),
        }
    }

    /// Take a cleared buffer of the pool's size.
    pub fn acquire(&self) -> PooledBuf {
        let buf = {
            let mut free = self
                .inner
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            free.pop()
        }
        .unwrap_or_else(|| Vec::with_capacity(self.inner.buf_len));
        PooledBuf {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn buf_len(&self) -> usize {
        self.inner.buf_len
    }
}

/// RAII handle to a pooled buffer; returns to the pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    /// Seal the buffer's contents into a [`Chunk`]. The backing storage
    /// leaves the pool permanently.
    pub fn into_chunk(mut self) -> Chunk {
        Chunk::from_vec(std::mem::take(&mut self.buf))
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.buf.capacity() == 0 {
            return;
        }
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = self.pool.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.pool.max_free {
            free.push(buf);
        }
    }
}
