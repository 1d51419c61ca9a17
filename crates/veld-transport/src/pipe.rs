//! The byte-pipe abstraction a connection multiplexes over.

use tokio::io::{AsyncRead, AsyncWrite};

/// One reliable, ordered byte pipe to the remote peer. TCP streams
/// qualify, and so do `tokio::io::duplex` halves, which is what the
/// tests run over.
pub trait Pipe: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Pipe for T {}

pub type BoxPipe = Box<dyn Pipe>;

/// Box a concrete pipe for the connection's fixed pool.
pub fn boxed(pipe: impl Pipe) -> BoxPipe {
    Box::new(pipe)
}
