pub mod chunk;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod time;
pub mod varint;
pub mod wire;

pub use chunk::{BufferPool, Chunk};
pub use error::{Error, ProtocolError, Result};
pub use fingerprint::Fingerprint;
pub use time::{AbsTime, TimeSource};
pub use wire::StreamId;
