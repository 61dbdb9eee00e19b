//! Network Module Implementation
//!
//! Socket transport for device connections, built on tokio's readiness-based I/O.
//!
//! # Architecture
//!
//! - `SocketTransport`: the seam to the socket, implemented for `TcpStream`
//! - `SocketEventSource`: reusable completion slot behind every socket operation
//! - `Receiver` / `Sender`: receive and (vectored) send operations
//! - `SenderPool`: bounded, lock-free pool of senders shared across connections
//! - `pipe`: byte pipes with flush backpressure
//! - `SocketConnection`: couples a socket with an input and an output pipe
//! - `SocketFrameCodec`, `FrameReader`, `FrameWriter`: STX/ETX framing of socket records

pub use connection::{
    Connection, ConnectionEvent, ConnectionState, ShutdownHandle, SocketConnection,
    MIN_RECEIVE_BUFFER,
};
pub use event_source::{SocketEventSource, SocketOperation};
pub use frame::{FrameReader, FrameWriter, SocketFrameCodec};
pub use pipe::{
    pipe, FlushResult, PipeHandle, PipeOptions, PipeReader, PipeWriter, ReadBuffer, ReadResult,
};
pub use pool::{ObjectPool, Poolable, SenderPool, MAX_QUEUE_SIZE};
pub use receiver::Receiver;
pub use sender::{SendBuffer, Sender, MAX_IO_SEGMENTS};
pub use transport::{SocketInterest, SocketTransport};

mod connection;
mod event_source;
mod frame;
mod pipe;
mod pool;
mod receiver;
mod sender;
mod transport;
