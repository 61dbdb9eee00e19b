use std::io::{self, IoSlice};

use bytes::Bytes;
use tracing::trace;

use crate::network::event_source::SocketEventSource;
use crate::network::pool::Poolable;
use crate::network::transport::{SocketInterest, SocketTransport};
use crate::{AppError, AppResult};

/// Most slices handed to a single vectored send.
pub const MAX_IO_SEGMENTS: usize = 64;

/// Data for one [`Sender::send`].
#[derive(Debug, Clone, Copy)]
pub enum SendBuffer<'a> {
    Single(&'a Bytes),
    Sequence(&'a [Bytes]),
}

/// Sends a buffer or a segment sequence on a socket.
///
/// Senders are pooled: between two sends the owner must call [`Sender::reset`], which
/// the [`ObjectPool`](super::ObjectPool) does on return. After a send exactly one of the
/// single-buffer slot or the scatter-gather list is populated.
#[derive(Debug, Default)]
pub struct Sender {
    source: SocketEventSource,
    buffer: Option<Bytes>,
    buffer_list: Vec<Bytes>,
}

impl Sender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reset(&self) -> bool {
        self.buffer.is_none() && self.buffer_list.is_empty()
    }

    /// Sends all of `data`, returning the number of bytes written.
    pub async fn send<S>(&mut self, socket: &S, data: SendBuffer<'_>) -> AppResult<usize>
    where
        S: SocketTransport + ?Sized,
    {
        if !self.is_reset() {
            return Err(AppError::InvalidOperation(
                "sender reused without reset".to_string(),
            ));
        }
        match data {
            SendBuffer::Single(buffer) => {
                self.buffer = Some(buffer.clone());
                self.send_buffer(socket).await
            }
            SendBuffer::Sequence([segment]) => {
                self.buffer = Some(segment.clone());
                self.send_buffer(socket).await
            }
            SendBuffer::Sequence(segments) => {
                self.buffer_list.extend(
                    segments
                        .iter()
                        .filter(|segment| !segment.is_empty())
                        .cloned(),
                );
                self.send_buffer_list(socket).await
            }
        }
    }

    async fn send_buffer<S>(&mut self, socket: &S) -> AppResult<usize>
    where
        S: SocketTransport + ?Sized,
    {
        let Sender { source, buffer, .. } = self;
        let buffer: &[u8] = buffer.as_deref().unwrap_or_default();
        let mut sent = 0;
        while sent < buffer.len() {
            let remaining = &buffer[sent..];
            let written = source
                .operate(socket, SocketInterest::Send, move |s| s.try_send(remaining))
                .await?;
            if written == 0 {
                return Err(AppError::socket(io::ErrorKind::WriteZero.into()));
            }
            sent += written;
        }
        Ok(sent)
    }

    async fn send_buffer_list<S>(&mut self, socket: &S) -> AppResult<usize>
    where
        S: SocketTransport + ?Sized,
    {
        let Sender {
            source,
            buffer_list,
            ..
        } = self;
        let mut sent = 0;
        // cursor into buffer_list: segment index and offset inside it
        let mut index = 0;
        let mut offset = 0;
        while index < buffer_list.len() {
            let written = {
                let mut slices = [IoSlice::new(&[]); MAX_IO_SEGMENTS];
                let count = (buffer_list.len() - index).min(MAX_IO_SEGMENTS);
                slices[0] = IoSlice::new(&buffer_list[index][offset..]);
                for (slot, segment) in slices[1..count]
                    .iter_mut()
                    .zip(&buffer_list[index + 1..])
                {
                    *slot = IoSlice::new(segment);
                }
                let slices = &slices[..count];
                source
                    .operate(socket, SocketInterest::Send, move |s| {
                        s.try_send_vectored(slices)
                    })
                    .await?
            };
            if written == 0 {
                return Err(AppError::socket(io::ErrorKind::WriteZero.into()));
            }
            sent += written;

            let mut remaining = written;
            while remaining > 0 && index < buffer_list.len() {
                let available = buffer_list[index].len() - offset;
                if remaining >= available {
                    remaining -= available;
                    index += 1;
                    offset = 0;
                } else {
                    offset += remaining;
                    remaining = 0;
                }
            }
        }
        Ok(sent)
    }
}

impl Poolable for Sender {
    fn reset(&mut self) {
        self.buffer = None;
        self.buffer_list.clear();
    }

    fn release(self) {
        trace!(
            "sender released, list capacity {}",
            self.buffer_list.capacity()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::mock::MockSocket;

    #[tokio::test]
    async fn single_buffer_is_sent_completely() {
        let socket = MockSocket::new();
        socket.limit_writes(3);
        let mut sender = Sender::new();
        let data = Bytes::from_static(b"0123456789");

        let sent = sender
            .send(&socket, SendBuffer::Single(&data))
            .await
            .unwrap();

        assert_eq!(sent, 10);
        assert_eq!(socket.outbound(), b"0123456789");
        assert!(sender.buffer.is_some());
        assert!(sender.buffer_list.is_empty());
    }

    #[tokio::test]
    async fn sequence_survives_partial_vectored_writes() {
        let socket = MockSocket::new();
        socket.limit_writes(4);
        let mut sender = Sender::new();
        let segments = vec![
            Bytes::from_static(b"head"),
            Bytes::new(),
            Bytes::from_static(b"-body-"),
            Bytes::from_static(b"tail"),
        ];

        let sent = sender
            .send(&socket, SendBuffer::Sequence(&segments))
            .await
            .unwrap();

        assert_eq!(sent, 14);
        assert_eq!(socket.outbound(), b"head-body-tail");
        assert!(sender.buffer.is_none());
        assert_eq!(sender.buffer_list.len(), 3);
    }

    #[tokio::test]
    async fn reuse_without_reset_fails_fast() {
        let socket = MockSocket::new();
        let mut sender = Sender::new();
        let data = Bytes::from_static(b"once");
        sender
            .send(&socket, SendBuffer::Single(&data))
            .await
            .unwrap();

        let again = sender.send(&socket, SendBuffer::Single(&data)).await;
        assert!(matches!(again, Err(AppError::InvalidOperation(_))));

        sender.reset();
        assert!(sender.is_reset());
        sender
            .send(&socket, SendBuffer::Single(&data))
            .await
            .unwrap();
        assert_eq!(socket.outbound(), b"onceonce");
    }

    #[tokio::test]
    async fn send_failure_is_a_transport_error() {
        let socket = MockSocket::new();
        socket.fail_next(32);
        let mut sender = Sender::new();
        let data = Bytes::from_static(b"lost");

        let error = sender
            .send(&socket, SendBuffer::Single(&data))
            .await
            .unwrap_err();
        assert_eq!(error.socket_error_code(), Some(32));
    }
}
