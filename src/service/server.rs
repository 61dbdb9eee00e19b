use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace};

use crate::network::{Connection, SenderPool, SocketConnection};
use crate::service::{ConnectionConfig, DevcomConfig, Shutdown};
use crate::{AppError, AppResult};

/// Serves one started connection until the peer goes away or shutdown is signalled.
///
/// The server shuts the connection down and disposes it once `handle` returns, whatever
/// the outcome.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        connection: &mut SocketConnection<TcpStream>,
        shutdown: &mut Shutdown,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    sender_pool: Arc<SenderPool>,
    connection_config: ConnectionConfig,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        sender_pool: Arc<SenderPool>,
        connection_config: ConnectionConfig,
    ) -> Self {
        Server {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            sender_pool,
            connection_config,
        }
    }

    /// Binds the configured address and sizes the connection limit and sender pool.
    pub async fn bind(
        config: &DevcomConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Server> {
        let listen_address = format!("{}:{}", config.network.ip, config.network.port);
        let listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(
                    "Failed to bind server to address: {} - Error: {}",
                    &listen_address, err
                );
                return Err(err.into());
            }
        };
        info!("tcp server binding to {} for listening", &listen_address);

        Ok(Server::new(
            listener,
            Arc::new(Semaphore::new(config.network.max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            Arc::new(SenderPool::new(config.sender_pool.max_queue_size)),
            config.connection.clone(),
        ))
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sender_pool(&self) -> &Arc<SenderPool> {
        &self.sender_pool
    }

    /// Accepts connections until accepting fails for good.
    ///
    /// Each accepted socket takes a permit, so at most `max_connection` connections are
    /// served at once; the next accept waits for a permit to come back. Every connection
    /// runs in its own task holding a clone of `shutdown_complete_tx`, which lets the
    /// caller wait for all of them after broadcasting shutdown.
    pub async fn run<H: ConnectionHandler>(&self, handler: Arc<H>) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limit: {}", e)))?;

            let (socket, peer) = self.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set nodelay for {} failed: {}", peer, e);
            }

            let mut connection =
                SocketConnection::new(socket, self.sender_pool.clone(), &self.connection_config);
            debug!(
                "accepted connection {} from {}",
                connection.connection_id(),
                peer
            );
            let handler = handler.clone();
            let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();

            tokio::spawn(async move {
                let connection_id = connection.connection_id();
                let result = match connection.start() {
                    Ok(()) => handler.handle(&mut connection, &mut shutdown).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("connection {} error: {}", connection_id, e);
                }
                // whether gracefully or unexpectedly closed, release the connection
                connection.shutdown();
                if let Err(e) = connection.dispose().await {
                    error!("connection {} dispose error: {}", connection_id, e);
                }
                trace!("connection {} released", connection_id);
                drop(shutdown_complete_tx);
                drop(permit);
            });
        }
    }

    /// Runs until `signal` resolves, then stops accepting.
    ///
    /// Connections already being served keep running until they observe the shutdown
    /// broadcast, which the caller sends after this returns.
    pub async fn run_until<H, F>(&self, handler: Arc<H>, signal: F) -> AppResult<()>
    where
        H: ConnectionHandler,
        F: Future,
    {
        tokio::select! {
            res = self.run(handler) => res,
            _ = signal => {
                info!("get shutdown signal");
                Ok(())
            }
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    error!("accept error, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
        self.sender_pool.dispose();
    }
}
