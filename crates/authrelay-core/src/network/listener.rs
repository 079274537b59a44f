//! TCP listener for accepting relay connections.
//!
//! The listener accepts connections and spawns one worker task per socket,
//! delegating to the [`ConnectionHandler`] for the handshake and request
//! processing. Workers are tracked in a `JoinSet` so stopping the listener
//! can wait for them.
//!
//! Everything a caller needs to observe arrives as a [`ServerEvent`]:
//! worker failures, one `ConnectionClosed` per worker and a final `Stopped`.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::SecurityProvider;
use crate::config::{ConnectionConfig, RelayConfig};
use crate::error::{is_disconnect, RelayError, Result};
use crate::handlers::RequestHandler;
use crate::metrics::RelayMetrics;

use super::connection::{ConnectionHandler, ConnectionShared};

/// Notifications from a running listener.
#[derive(Debug)]
pub enum ServerEvent {
    /// A worker failed or a request handler returned an error.
    ///
    /// `connection_id` is `None` for failures of the accept loop itself.
    Error {
        connection_id: Option<String>,
        error: RelayError,
    },
    /// A worker finished. Emitted exactly once per accepted connection.
    ConnectionClosed { connection_id: String },
    /// The accept loop exited. Emitted exactly once.
    Stopped,
}

/// TCP listener that accepts relay connections.
pub struct Listener {
    address: SocketAddr,
    backlog: u32,
    connection: ConnectionConfig,
    provider: Arc<dyn SecurityProvider>,
    handler: Arc<dyn RequestHandler>,
    metrics: Arc<RelayMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl Listener {
    /// Create a new listener for `config.listen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address does not parse.
    pub fn new(
        config: &RelayConfig,
        provider: Arc<dyn SecurityProvider>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            address: config.listen.socket_addr()?,
            backlog: config.listen.backlog,
            connection: config.connection.clone(),
            provider,
            handler,
            metrics: Arc::new(RelayMetrics::new()),
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Share an existing metrics registry instead of a private one.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind with address reuse and start the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn start(self) -> Result<RunningListener> {
        let listener = bind(self.address, self.backlog)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "relay listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = ConnectionShared {
            provider: self.provider,
            handler: self.handler,
            config: self.connection,
            metrics: self.metrics,
            events: events_tx,
        };
        // Subscribed before spawning so a stop sent right after start is seen.
        let shutdown_rx = self.shutdown_tx.subscribe();
        let accept = AcceptLoop {
            listener,
            shared,
            shutdown_tx: self.shutdown_tx.clone(),
            active_connections: Arc::clone(&self.active_connections),
        };
        let accept_task = tokio::spawn(accept.run(shutdown_rx));

        Ok(RunningListener {
            local_addr,
            shutdown_tx: self.shutdown_tx,
            events: events_rx,
            accept_task: Some(accept_task),
            active_connections: self.active_connections,
        })
    }

    /// Run until shutdown is signalled, logging events as they arrive.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn run(self) -> Result<()> {
        let mut running = self.start().await?;
        while let Some(event) = running.next_event().await {
            match event {
                ServerEvent::Error {
                    connection_id,
                    error,
                } => warn!(?connection_id, %error, "connection error"),
                ServerEvent::ConnectionClosed { connection_id } => {
                    debug!(%connection_id, "connection closed");
                }
                ServerEvent::Stopped => break,
            }
        }
        Ok(())
    }
}

/// Handle to a started listener.
pub struct RunningListener {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    accept_task: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl RunningListener {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Next event, or `None` after `Stopped` has been received and the
    /// channel is drained.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Stop accepting, signal every worker, and wait for the accept loop to
    /// finish joining them. Events, including `Stopped`, stay readable.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "accept loop failed");
            }
        }
    }
}

impl Drop for RunningListener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn bind(address: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    Ok(socket.listen(backlog)?)
}

struct AcceptLoop {
    listener: TcpListener,
    shared: ConnectionShared,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut workers = JoinSet::new();
        let mut worker_ids: HashMap<Id, String> = HashMap::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("listener shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            next_id += 1;
                            let connection_id = format!("conn-{next_id}");
                            let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!(%peer, %connection_id, active, "accepted connection");
                            let task = workers.spawn(self.worker(socket, peer, connection_id.clone()));
                            worker_ids.insert(task.id(), connection_id);
                        }
                        Err(e) if is_disconnect(&e) => {
                            debug!(error = %e, "accept interrupted");
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            let _ = self.shared.events.send(ServerEvent::Error {
                                connection_id: None,
                                error: e.into(),
                            });
                        }
                    }
                }
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    Self::reap(&self.shared.events, &mut worker_ids, joined);
                }
            }
        }

        // Closing the socket before joining stops new peers from queueing.
        drop(self.listener);

        let drain = async {
            while let Some(joined) = workers.join_next_with_id().await {
                Self::reap(&self.shared.events, &mut worker_ids, joined);
            }
        };
        if timeout(self.shared.config.stop_timeout(), drain).await.is_err() {
            warn!(remaining = workers.len(), "aborting connection workers");
            workers.abort_all();
            while let Some(joined) = workers.join_next_with_id().await {
                Self::reap(&self.shared.events, &mut worker_ids, joined);
            }
        }

        info!("listener stopped");
        let _ = self.shared.events.send(ServerEvent::Stopped);
    }

    fn worker(
        &self,
        socket: tokio::net::TcpStream,
        peer: SocketAddr,
        connection_id: String,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let guard = WorkerGuard {
            connection_id: connection_id.clone(),
            events: self.shared.events.clone(),
            metrics: Arc::clone(&self.shared.metrics),
            active_connections: Arc::clone(&self.active_connections),
        };
        guard.metrics.connection_opened();
        let events = self.shared.events.clone();
        let handler = ConnectionHandler::new(
            connection_id.clone(),
            self.shared.clone(),
            self.shutdown_tx.subscribe(),
        );

        async move {
            let _guard = guard;
            match handler.handle(socket, peer).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => debug!(%connection_id, error = %e, "peer went away"),
                Err(e) => {
                    warn!(%connection_id, error = %e, "connection failed");
                    let _ = events.send(ServerEvent::Error {
                        connection_id: Some(connection_id),
                        error: e,
                    });
                }
            }
        }
    }

    fn reap(
        events: &mpsc::UnboundedSender<ServerEvent>,
        worker_ids: &mut HashMap<Id, String>,
        joined: std::result::Result<(Id, ()), JoinError>,
    ) {
        let e = match joined {
            Ok((id, ())) => {
                worker_ids.remove(&id);
                return;
            }
            Err(e) => e,
        };
        let connection_id = worker_ids.remove(&e.id());
        if e.is_panic() {
            let message = panic_message(e.into_panic());
            error!(?connection_id, %message, "connection worker panicked");
            let _ = events.send(ServerEvent::Error {
                connection_id,
                error: RelayError::Worker { message },
            });
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Emits `ConnectionClosed` when the worker's future is dropped, whether it
/// returned, panicked or was aborted.
struct WorkerGuard {
    connection_id: String,
    events: mpsc::UnboundedSender<ServerEvent>,
    metrics: Arc<RelayMetrics>,
    active_connections: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.metrics.connection_closed();
        let _ = self.events.send(ServerEvent::ConnectionClosed {
            connection_id: std::mem::take(&mut self.connection_id),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::auth::Credential;
    use crate::handlers::{Request, WhoAmIHandler};
    use crate::network::{ConnectOptions, Connection};
    use crate::protocol::Message;
    use crate::testing::ScriptedProvider;

    struct PanickingHandler;

    #[async_trait]
    impl RequestHandler for PanickingHandler {
        async fn handle(&self, _request: &Request) -> Result<Option<Message>> {
            panic!("handler blew up");
        }
    }

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config
    }

    fn listener() -> Listener {
        Listener::new(
            &test_config(),
            Arc::new(ScriptedProvider::new(1)),
            Arc::new(WhoAmIHandler::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_address_rejected() {
        let mut config = test_config();
        config.listen.address = "not an address".to_string();
        let result = Listener::new(
            &config,
            Arc::new(ScriptedProvider::new(1)),
            Arc::new(WhoAmIHandler::new()),
        );
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_emits_stopped_once() {
        let mut running = listener().start().await.unwrap();
        assert_ne!(running.local_addr().port(), 0);

        running.stop().await;
        assert!(matches!(running.next_event().await, Some(ServerEvent::Stopped)));
        assert!(running.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_immediately_after_start() {
        for _ in 0..20 {
            let mut running = listener().start().await.unwrap();
            tokio::time::timeout(Duration::from_secs(3), running.stop())
                .await
                .expect("stop should not hang");
            assert!(matches!(running.next_event().await, Some(ServerEvent::Stopped)));
        }
    }

    #[tokio::test]
    async fn test_drop_right_after_start_stops_accept_loop() {
        let running = listener().start().await.unwrap();
        let address = running.local_addr();
        drop(running);

        // The socket closes once the accept loop sees the shutdown.
        let mut refused = false;
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(address).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
    }

    #[tokio::test]
    async fn test_worker_panic_names_connection() {
        let mut running = Listener::new(
            &test_config(),
            Arc::new(ScriptedProvider::new(1)),
            Arc::new(PanickingHandler),
        )
        .unwrap()
        .start()
        .await
        .unwrap();

        let options =
            ConnectOptions::authenticated(Arc::new(ScriptedProvider::new(1)), Credential::Current);
        let mut client = Connection::connect("127.0.0.1", running.local_addr().port(), options)
            .await
            .unwrap();
        assert!(client.request(Message::who_am_i()).await.is_err());

        let mut panicked = None;
        let mut closed = 0;
        while panicked.is_none() || closed == 0 {
            match running.next_event().await {
                Some(ServerEvent::Error {
                    connection_id,
                    error: RelayError::Worker { message },
                }) => panicked = Some((connection_id, message)),
                Some(ServerEvent::ConnectionClosed { .. }) => closed += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        let (connection_id, message) = panicked.unwrap();
        assert_eq!(connection_id.as_deref(), Some("conn-1"));
        assert_eq!(message, "handler blew up");
        assert_eq!(closed, 1);

        client.stop().await.unwrap();
        running.stop().await;
    }

    #[tokio::test]
    async fn test_connection_closed_once_per_worker() {
        let mut running = listener().start().await.unwrap();

        let client = tokio::net::TcpStream::connect(running.local_addr()).await.unwrap();
        drop(client);

        match running.next_event().await {
            Some(ServerEvent::ConnectionClosed { connection_id }) => {
                assert_eq!(connection_id, "conn-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(running.active_connections(), 0);

        running.stop().await;
        assert!(matches!(running.next_event().await, Some(ServerEvent::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_ends_idle_workers() {
        let mut running = listener().start().await.unwrap();
        let _client = tokio::net::TcpStream::connect(running.local_addr()).await.unwrap();

        // Wait until the worker exists before stopping.
        for _ in 0..100 {
            if running.active_connections() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        running.stop().await;

        let mut closed = 0;
        let mut stopped = 0;
        while let Some(event) = running.next_event().await {
            match event {
                ServerEvent::ConnectionClosed { .. } => closed += 1,
                ServerEvent::Stopped => stopped += 1,
                ServerEvent::Error { .. } => {}
            }
        }
        assert_eq!((closed, stopped), (1, 1));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }
}
