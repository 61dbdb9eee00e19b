//! Duplex adapter between a connected socket and two byte pipes.
//!
//! ```text
//!            output() ──► transport pipe ──► send loop ──► socket
//!  protocol                                                  │
//!            input()  ◄── application pipe ◄── receive loop ◄┘
//! ```
//!
//! `start` spawns the two loops. Whichever loop ends first shuts the socket down, and
//! completes the writer of the opposite pipe so the other side is not left waiting.
//! `dispose` completes the loop-facing pipe ends, waits for both loops and releases the
//! `Receiver` and any still-rented `Sender`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::network::pipe::{pipe, PipeHandle, PipeOptions, PipeReader, PipeWriter};
use crate::network::pool::{Poolable, SenderPool};
use crate::network::receiver::Receiver;
use crate::network::sender::{SendBuffer, Sender};
use crate::network::transport::SocketTransport;
use crate::service::ConnectionConfig;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Smallest write buffer the receive loop asks the application pipe for.
pub const MIN_RECEIVE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    /// Send and receive loops are running.
    Started,
    ShuttingDown,
    Disposed,
}

/// Lifecycle and failure notifications, published to the channel given to
/// [`SocketConnection::with_events`].
#[derive(Debug)]
pub enum ConnectionEvent {
    Started { connection_id: u64 },
    PeerClosed { connection_id: u64 },
    SendFailed { connection_id: u64, error: AppError },
    ReceiveFailed { connection_id: u64, error: AppError },
    Closed { connection_id: u64 },
}

/// A duplex byte connection exposed as two pipes.
pub trait Connection {
    /// Bytes received from the peer.
    fn input(&mut self) -> &mut PipeReader;

    /// Bytes to send to the peer.
    fn output(&mut self) -> &mut PipeWriter;

    fn start(&mut self) -> AppResult<()>;

    fn shutdown(&self);

    async fn dispose(self) -> AppResult<()>
    where
        Self: Sized;
}

#[derive(Debug)]
struct ConnectionShared<S> {
    connection_id: u64,
    socket: S,
    // one-shot flag, the lock also serializes concurrent shutdown calls
    shut_down: Mutex<bool>,
    state: Mutex<ConnectionState>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl<S: SocketTransport> ConnectionShared<S> {
    fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock();
        if *shut_down {
            return;
        }
        *shut_down = true;
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disposed {
                *state = ConnectionState::ShuttingDown;
            }
        }
        if let Err(e) = self.socket.shutdown() {
            // the peer may already have torn the connection down
            debug!(
                "connection {} socket shutdown error: {}",
                self.connection_id, e
            );
        }
        debug!("connection {} shut down", self.connection_id);
        self.emit(ConnectionEvent::Closed {
            connection_id: self.connection_id,
        });
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                trace!(
                    "connection {} event receiver dropped",
                    self.connection_id
                );
            }
        }
    }
}

/// Shuts a connection down from any thread without owning it.
#[derive(Debug)]
pub struct ShutdownHandle<S> {
    shared: Arc<ConnectionShared<S>>,
}

impl<S> Clone for ShutdownHandle<S> {
    fn clone(&self) -> Self {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<S: SocketTransport> ShutdownHandle<S> {
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

// pipe ends owned by the loops once started
#[derive(Debug)]
struct LoopEnds {
    transport_reader: PipeReader,
    application_writer: PipeWriter,
    receiver: Receiver,
}

#[derive(Debug)]
pub struct SocketConnection<S: SocketTransport> {
    shared: Arc<ConnectionShared<S>>,
    sender_pool: Arc<SenderPool>,
    min_receive_buffer: usize,
    input: PipeReader,
    output: PipeWriter,
    transport: PipeHandle,
    application: PipeHandle,
    loop_ends: Option<LoopEnds>,
    send_task: Option<JoinHandle<Option<Sender>>>,
    receive_task: Option<JoinHandle<Receiver>>,
}

impl<S: SocketTransport> SocketConnection<S> {
    pub fn new(socket: S, sender_pool: Arc<SenderPool>, config: &ConnectionConfig) -> Self {
        let options = PipeOptions::from(config);
        let (output, transport_reader) = pipe(options);
        let (application_writer, input) = pipe(options);
        let transport = output.handle();
        let application = input.handle();
        SocketConnection {
            shared: Arc::new(ConnectionShared {
                connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                socket,
                shut_down: Mutex::new(false),
                state: Mutex::new(ConnectionState::Created),
                events: None,
            }),
            sender_pool,
            min_receive_buffer: config.min_receive_buffer.max(1),
            input,
            output,
            transport,
            application,
            loop_ends: Some(LoopEnds {
                transport_reader,
                application_writer,
                receiver: Receiver::new(),
            }),
            send_task: None,
            receive_task: None,
        }
    }

    /// Publishes lifecycle events to `events`. Must be called before `start`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.events = Some(events),
            None => warn!(
                "connection {} already shared, events not attached",
                self.shared.connection_id
            ),
        }
        self
    }

    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn socket(&self) -> &S {
        &self.shared.socket
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle<S> {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    /// Both application-facing pipe ends at once.
    pub fn pipes(&mut self) -> (&mut PipeReader, &mut PipeWriter) {
        (&mut self.input, &mut self.output)
    }
}

async fn do_send<S: SocketTransport>(
    shared: &ConnectionShared<S>,
    sender_pool: &SenderPool,
    reader: &mut PipeReader,
    rented: &mut Option<Sender>,
) -> AppResult<()> {
    loop {
        let result = reader.read().await;
        if result.is_canceled {
            break;
        }
        let consumed = result.buffer.len();
        let is_completed = result.is_completed;
        if !result.buffer.is_empty() {
            let sender = rented.insert(sender_pool.rent());
            sender
                .send(&shared.socket, SendBuffer::Sequence(result.buffer.segments()))
                .await?;
            if let Some(sender) = rented.take() {
                sender_pool.give_back(sender);
            }
        }
        reader.advance_to(consumed);
        if is_completed {
            break;
        }
    }
    Ok(())
}

async fn do_receive<S: SocketTransport>(
    shared: &ConnectionShared<S>,
    receiver: &mut Receiver,
    writer: &mut PipeWriter,
    min_receive_buffer: usize,
) -> AppResult<()> {
    loop {
        let memory = writer.get_memory(min_receive_buffer);
        let received = receiver.receive(&shared.socket, memory).await?;
        if received == 0 {
            debug!("connection {} closed by peer", shared.connection_id);
            shared.emit(ConnectionEvent::PeerClosed {
                connection_id: shared.connection_id,
            });
            break;
        }
        writer.advance(received)?;
        let flush = writer.flush().await;
        if flush.is_canceled || flush.is_completed {
            break;
        }
    }
    Ok(())
}

impl<S: SocketTransport> Connection for SocketConnection<S> {
    fn input(&mut self) -> &mut PipeReader {
        &mut self.input
    }

    fn output(&mut self) -> &mut PipeWriter {
        &mut self.output
    }

    fn start(&mut self) -> AppResult<()> {
        let LoopEnds {
            mut transport_reader,
            mut application_writer,
            mut receiver,
        } = self.loop_ends.take().ok_or_else(|| {
            AppError::InvalidOperation(format!(
                "connection {} already started",
                self.shared.connection_id
            ))
        })?;
        self.shared.set_state(ConnectionState::Started);
        self.shared.emit(ConnectionEvent::Started {
            connection_id: self.shared.connection_id,
        });

        let shared = self.shared.clone();
        let sender_pool = self.sender_pool.clone();
        let application = self.application.clone();
        self.send_task = Some(tokio::spawn(async move {
            let mut rented = None;
            let result = do_send(&shared, &sender_pool, &mut transport_reader, &mut rented).await;
            if let Err(e) = result {
                error!("connection {} send loop failed: {}", shared.connection_id, e);
                shared.emit(ConnectionEvent::SendFailed {
                    connection_id: shared.connection_id,
                    error: e,
                });
            }
            shared.shutdown();
            application.complete_writer();
            transport_reader.complete();
            trace!("connection {} send loop exited", shared.connection_id);
            rented
        }));

        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let min_receive_buffer = self.min_receive_buffer;
        self.receive_task = Some(tokio::spawn(async move {
            let result = do_receive(
                &shared,
                &mut receiver,
                &mut application_writer,
                min_receive_buffer,
            )
            .await;
            if let Err(e) = result {
                error!(
                    "connection {} receive loop failed: {}",
                    shared.connection_id, e
                );
                shared.emit(ConnectionEvent::ReceiveFailed {
                    connection_id: shared.connection_id,
                    error: e,
                });
            }
            shared.shutdown();
            transport.complete_writer();
            application_writer.complete();
            trace!("connection {} receive loop exited", shared.connection_id);
            receiver
        }));
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.shutdown();
    }

    async fn dispose(mut self) -> AppResult<()> {
        self.transport.complete_reader();
        self.application.complete_writer();

        if let Some(task) = self.send_task.take() {
            match task.await {
                Ok(Some(sender)) => sender.release(),
                Ok(None) => {}
                Err(e) => error!(
                    "connection {} send loop aborted: {}",
                    self.shared.connection_id, e
                ),
            }
        }
        if let Some(task) = self.receive_task.take() {
            match task.await {
                Ok(receiver) => receiver.release(),
                Err(e) => error!(
                    "connection {} receive loop aborted: {}",
                    self.shared.connection_id, e
                ),
            }
        }
        if let Some(loop_ends) = self.loop_ends.take() {
            // never started
            loop_ends.receiver.release();
            self.shared.shutdown();
        }

        self.shared.set_state(ConnectionState::Disposed);
        debug!("connection {} disposed", self.shared.connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::network::transport::mock::MockSocket;

    fn connection(pool: &Arc<SenderPool>) -> SocketConnection<MockSocket> {
        SocketConnection::new(MockSocket::new(), pool.clone(), &ConnectionConfig::default())
    }

    async fn read_exactly(input: &mut PipeReader, expected: usize) -> Bytes {
        let mut collected = Vec::new();
        while collected.len() < expected {
            let result = input.read().await;
            let consumed = result.buffer.len();
            collected.extend_from_slice(&result.buffer.to_bytes());
            let is_completed = result.is_completed;
            input.advance_to(consumed);
            if is_completed {
                break;
            }
        }
        Bytes::from(collected)
    }

    #[tokio::test]
    async fn received_bytes_reach_input() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();
        assert_eq!(connection.state(), ConnectionState::Started);

        connection.socket().push_inbound(b"hello device");
        let received = read_exactly(connection.input(), 12).await;
        assert_eq!(received, Bytes::from_static(b"hello device"));

        connection.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn output_is_sent_with_a_pooled_sender() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();

        connection.output().write(b"ping");
        connection.output().flush().await;
        connection.output().write(b"pong");
        connection.output().flush().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while connection.socket().outbound().len() < 8 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(connection.socket().outbound(), b"pingpong");
        assert!(pool.created() >= 1);

        connection.dispose().await.unwrap();
        assert!(pool.retained() >= 1);
    }

    #[tokio::test]
    async fn peer_close_completes_input_and_shuts_down_once() {
        let pool = Arc::new(SenderPool::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connection = connection(&pool).with_events(events_tx);
        connection.start().unwrap();

        connection.socket().close_inbound();
        let result = connection.input().read().await;
        assert!(result.is_completed);
        assert!(result.buffer.is_empty());

        connection.dispose().await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], ConnectionEvent::Started { .. }));
        assert!(events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::PeerClosed { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, ConnectionEvent::Closed { .. }))
                .count(),
            1
        );
        assert!(!events.iter().any(|event| matches!(
            event,
            ConnectionEvent::ReceiveFailed { .. } | ConnectionEvent::SendFailed { .. }
        )));
    }

    #[tokio::test]
    async fn receive_failure_is_reported_and_shuts_down() {
        let pool = Arc::new(SenderPool::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connection = connection(&pool).with_events(events_tx);
        let shutdown = connection.shutdown_handle();
        connection.start().unwrap();

        connection.socket().fail_next(104);
        let result = connection.input().read().await;
        assert!(result.is_completed);

        connection.dispose().await.unwrap();
        shutdown.shutdown();

        let mut failed_code = None;
        while let Ok(event) = events_rx.try_recv() {
            if let ConnectionEvent::ReceiveFailed { error, .. } = event {
                failed_code = error.socket_error_code();
            }
        }
        assert_eq!(failed_code, Some(104));
    }

    async fn wait_for_shutdown(connection: &SocketConnection<MockSocket>) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while connection.socket().shutdown_calls() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn canceled_output_read_stops_send_loop() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();

        connection.transport.cancel_pending_read();
        wait_for_shutdown(&connection).await;
        assert_eq!(connection.state(), ConnectionState::ShuttingDown);

        // the receive loop follows the socket shutdown and completes input
        let result = connection.input().read().await;
        assert!(result.is_completed);

        let shutdown = connection.shutdown_handle();
        connection.dispose().await.unwrap();
        assert_eq!(shutdown.shared.socket.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn canceled_input_flush_stops_receive_loop() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();

        connection.application.cancel_pending_flush();
        connection.socket().push_inbound(b"x");
        wait_for_shutdown(&connection).await;
        assert_eq!(connection.state(), ConnectionState::ShuttingDown);

        // data received before the cancel is still published
        let received = read_exactly(connection.input(), 1).await;
        assert_eq!(received, Bytes::from_static(b"x"));

        let shutdown = connection.shutdown_handle();
        connection.dispose().await.unwrap();
        assert_eq!(shutdown.shared.socket.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn dispose_stops_both_loops_and_closes_socket_once() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();
        let shutdown = connection.shutdown_handle();

        connection.dispose().await.unwrap();
        shutdown.shutdown();

        assert_eq!(shutdown.shared.socket.shutdown_calls(), 1);
        assert_eq!(*shutdown.shared.state.lock(), ConnectionState::Disposed);
    }

    #[tokio::test]
    async fn dispose_without_start_still_closes_socket() {
        let pool = Arc::new(SenderPool::default());
        let connection = connection(&pool);
        let shutdown = connection.shutdown_handle();

        connection.dispose().await.unwrap();
        assert_eq!(shutdown.shared.socket.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let pool = Arc::new(SenderPool::default());
        let mut connection = connection(&pool);
        connection.start().unwrap();
        assert!(matches!(
            connection.start(),
            Err(AppError::InvalidOperation(_))
        ));
        connection.dispose().await.unwrap();
    }

    #[test]
    fn concurrent_shutdown_closes_exactly_once() {
        let pool = Arc::new(SenderPool::default());
        let connection = connection(&pool);
        let handle = connection.shutdown_handle();

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.shutdown())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        connection.shutdown();

        assert_eq!(connection.socket().shutdown_calls(), 1);
        assert_eq!(connection.state(), ConnectionState::ShuttingDown);
    }
}
