pub mod connection;
pub mod pipe;
pub mod read_buffer;
pub mod stream;
pub mod write_queue;

pub use connection::{
    reject_inbound, AcceptFn, ConnState, ConnectionOptions, MultiplexedConnection, ReceiverFn,
    StreamEvent,
};
pub use pipe::{BoxPipe, Pipe};
pub use read_buffer::{ModeHook, ReadMode};
pub use stream::Stream;
