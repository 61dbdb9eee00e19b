use tracing::trace;

use crate::network::event_source::SocketEventSource;
use crate::network::transport::{SocketInterest, SocketTransport};
use crate::{AppError, AppResult};

/// Issues receives for one connection, reusing a single completion slot.
#[derive(Debug, Default)]
pub struct Receiver {
    source: SocketEventSource,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives once into `buffer`. `Ok(0)` means the peer closed its side.
    pub async fn receive<S>(&mut self, socket: &S, buffer: &mut [u8]) -> AppResult<usize>
    where
        S: SocketTransport + ?Sized,
    {
        if buffer.is_empty() {
            // a zero-length receive would be indistinguishable from a peer close
            return Err(AppError::InvalidOperation(
                "receive buffer must not be empty".to_string(),
            ));
        }
        self.source
            .operate(socket, SocketInterest::Receive, move |s| {
                s.try_receive(buffer)
            })
            .await
    }

    pub fn release(self) {
        trace!("receiver released at token {}", self.source.token());
    }
}
