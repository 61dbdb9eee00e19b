use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::task::{Context, Poll};

use socket2::SockRef;
use tokio::net::TcpStream;

/// Which readiness a pending socket operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    Receive,
    Send,
}

/// The non-blocking operations the transport core performs on an already connected
/// stream socket.
///
/// `try_*` calls must return `WouldBlock` instead of waiting; `poll_ready` registers the
/// task for wakeup once the socket can make progress again. `shutdown` closes both
/// directions of the native socket and wakes any task parked on it.
pub trait SocketTransport: Send + Sync + 'static {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: SocketInterest) -> Poll<io::Result<()>>;

    fn try_receive(&self, buffer: &mut [u8]) -> io::Result<usize>;

    fn try_send(&self, buffer: &[u8]) -> io::Result<usize>;

    fn try_send_vectored(&self, buffers: &[IoSlice<'_>]) -> io::Result<usize>;

    fn shutdown(&self) -> io::Result<()>;
}

impl SocketTransport for TcpStream {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: SocketInterest) -> Poll<io::Result<()>> {
        match interest {
            SocketInterest::Receive => self.poll_read_ready(cx),
            SocketInterest::Send => self.poll_write_ready(cx),
        }
    }

    fn try_receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.try_read(buffer)
    }

    fn try_send(&self, buffer: &[u8]) -> io::Result<usize> {
        self.try_write(buffer)
    }

    fn try_send_vectored(&self, buffers: &[IoSlice<'_>]) -> io::Result<usize> {
        self.try_write_vectored(buffers)
    }

    fn shutdown(&self) -> io::Result<()> {
        SockRef::from(self).shutdown(Shutdown::Both)
    }
}
