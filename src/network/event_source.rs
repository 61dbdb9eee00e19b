//! Reusable completion slot for non-blocking socket operations.
//!
//! A [`SocketEventSource`] is owned by one [`Receiver`](super::Receiver) or
//! [`Sender`](super::Sender) and reused for every operation it issues. Each call to
//! [`SocketEventSource::operate`] returns a [`SocketOperation`] future that lives on the
//! caller's stack and mutably borrows the source, so a second operation can never be
//! started while one is still in flight.
//!
//! An operation that completes on its first attempt returns without touching the
//! completion state. One that would block moves the source to `Pending` under a fresh
//! token, waits for socket readiness and is completed against that token; the result is
//! taken exactly once, which returns the source to `Idle`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::trace;

use crate::network::transport::{SocketInterest, SocketTransport};
use crate::{AppError, AppResult};

#[derive(Debug, Default)]
enum OperationState {
    #[default]
    Idle,
    Pending,
    Completed(io::Result<usize>),
}

#[derive(Debug, Default)]
pub struct SocketEventSource {
    token: u16,
    state: OperationState,
}

impl SocketEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the most recent operation that had to wait.
    pub fn token(&self) -> u16 {
        self.token
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, OperationState::Idle)
    }

    /// Runs `operation` against `socket` until it stops reporting `WouldBlock`.
    pub fn operate<'a, S, F>(
        &'a mut self,
        socket: &'a S,
        interest: SocketInterest,
        operation: F,
    ) -> SocketOperation<'a, S, F>
    where
        S: SocketTransport + ?Sized,
        F: FnMut(&S) -> io::Result<usize> + Unpin,
    {
        SocketOperation {
            source: self,
            socket,
            interest,
            operation,
            token: None,
        }
    }

    fn begin(&mut self) -> AppResult<u16> {
        match self.state {
            OperationState::Idle => {
                self.token = self.token.wrapping_add(1);
                self.state = OperationState::Pending;
                Ok(self.token)
            }
            _ => Err(AppError::IllegalStateError(format!(
                "socket operation {} is still in flight",
                self.token
            ))),
        }
    }

    fn complete(&mut self, token: u16, result: io::Result<usize>) -> AppResult<()> {
        if token != self.token {
            return Err(AppError::IllegalStateError(format!(
                "stale completion token {} (current {})",
                token, self.token
            )));
        }
        match self.state {
            OperationState::Pending => {
                self.state = OperationState::Completed(result);
                Ok(())
            }
            _ => Err(AppError::IllegalStateError(format!(
                "completion for token {} without a pending operation",
                token
            ))),
        }
    }

    fn get_result(&mut self, token: u16) -> AppResult<usize> {
        if token != self.token {
            return Err(AppError::IllegalStateError(format!(
                "stale result token {} (current {})",
                token, self.token
            )));
        }
        match std::mem::take(&mut self.state) {
            OperationState::Completed(result) => result.map_err(AppError::socket),
            other => {
                self.state = other;
                Err(AppError::IllegalStateError(format!(
                    "result for token {} requested before completion",
                    token
                )))
            }
        }
    }

    fn reset(&mut self) {
        self.state = OperationState::Idle;
    }
}

/// Future of one socket operation bound to a [`SocketEventSource`].
///
/// Dropping it before completion returns the source to `Idle`.
pub struct SocketOperation<'a, S: ?Sized, F> {
    source: &'a mut SocketEventSource,
    socket: &'a S,
    interest: SocketInterest,
    operation: F,
    token: Option<u16>,
}

fn attempt<S, F>(operation: &mut F, socket: &S) -> Option<io::Result<usize>>
where
    S: ?Sized,
    F: FnMut(&S) -> io::Result<usize>,
{
    loop {
        match operation(socket) {
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return None,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            result => return Some(result),
        }
    }
}

impl<S, F> Future for SocketOperation<'_, S, F>
where
    S: SocketTransport + ?Sized,
    F: FnMut(&S) -> io::Result<usize> + Unpin,
{
    type Output = AppResult<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let token = match this.token {
            Some(token) => token,
            None => match attempt(&mut this.operation, this.socket) {
                // completed synchronously, nothing was registered
                Some(result) => return Poll::Ready(result.map_err(AppError::socket)),
                None => {
                    let token = this.source.begin()?;
                    this.token = Some(token);
                    token
                }
            },
        };

        loop {
            let outcome = match this.socket.poll_ready(cx, this.interest) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => Some(Err(error)),
                Poll::Ready(Ok(())) => attempt(&mut this.operation, this.socket),
            };
            if let Some(result) = outcome {
                this.source.complete(token, result)?;
                let result = this.source.get_result(token);
                this.token = None;
                return Poll::Ready(result);
            }
        }
    }
}

impl<S: ?Sized, F> Drop for SocketOperation<'_, S, F> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            trace!("socket operation {} abandoned before completion", token);
            self.source.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::transport::mock::MockSocket;

    fn receive<'a>(
        source: &'a mut SocketEventSource,
        socket: &'a MockSocket,
        buffer: &'a mut [u8],
    ) -> SocketOperation<'a, MockSocket, impl FnMut(&MockSocket) -> io::Result<usize> + Unpin + 'a>
    {
        source.operate(socket, SocketInterest::Receive, move |s| s.try_receive(buffer))
    }

    #[tokio::test]
    async fn synchronous_completion_does_not_consume_a_token() {
        let socket = MockSocket::new();
        socket.push_inbound(b"ready");
        let mut source = SocketEventSource::new();
        let mut buffer = [0u8; 16];

        let read = receive(&mut source, &socket, &mut buffer).await.unwrap();

        assert_eq!(read, 5);
        assert_eq!(&buffer[..5], b"ready");
        assert_eq!(source.token(), 0);
        assert!(source.is_idle());
    }

    #[tokio::test]
    async fn pending_operation_completes_from_readiness() {
        let socket = MockSocket::new();
        let mut source = SocketEventSource::new();
        let mut buffer = [0u8; 16];

        let (read, _) = tokio::join!(receive(&mut source, &socket, &mut buffer), async {
            tokio::task::yield_now().await;
            socket.push_inbound(b"late");
        });

        assert_eq!(read.unwrap(), 4);
        assert_eq!(source.token(), 1);
        assert!(source.is_idle());
    }

    #[tokio::test]
    async fn transport_failure_carries_native_code() {
        let socket = MockSocket::new();
        let mut source = SocketEventSource::new();
        let mut buffer = [0u8; 16];

        let (read, _) = tokio::join!(receive(&mut source, &socket, &mut buffer), async {
            tokio::task::yield_now().await;
            socket.fail_next(104);
        });

        let error = read.unwrap_err();
        assert_eq!(error.socket_error_code(), Some(104));
        assert!(source.is_idle());
    }

    #[tokio::test]
    async fn abandoned_operation_leaves_source_reusable() {
        let socket = MockSocket::new();
        let mut source = SocketEventSource::new();
        let mut buffer = [0u8; 16];

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            receive(&mut source, &socket, &mut buffer),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(source.is_idle());
        assert_eq!(source.token(), 1);

        let (read, _) = tokio::join!(receive(&mut source, &socket, &mut buffer), async {
            tokio::task::yield_now().await;
            socket.push_inbound(b"again");
        });
        assert_eq!(read.unwrap(), 5);
        assert_eq!(source.token(), 2);
    }

    #[test]
    fn stale_tokens_are_rejected() {
        let mut source = SocketEventSource::new();
        let token = source.begin().unwrap();
        assert!(matches!(
            source.begin(),
            Err(AppError::IllegalStateError(_))
        ));
        assert!(source.complete(token.wrapping_add(1), Ok(1)).is_err());
        assert!(source.get_result(token).is_err());

        source.complete(token, Ok(3)).unwrap();
        assert_eq!(source.get_result(token).unwrap(), 3);
        assert!(source.is_idle());
        assert!(source.get_result(token).is_err());
    }
}
