//! Client-role connection.
//!
//! A [`Connection`] owns one TCP socket. Its read half belongs to a single
//! receive task for the whole lifetime of the connection; the write half sits
//! behind a mutex shared by callers and by the receive task (which writes
//! handshake continuations). Readiness is published on a `watch` channel so a
//! send can wait for the handshake without polling.
//!
//! ```text
//!   connect ──► initiate ──► ClientToken ──►
//!                             ◄── ServerToken ── continue_with ──► ...
//!                             ◄── ServerToken ── Complete ──► Ready
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::auth::{Credential, Negotiation, SecurityContext, SecurityProvider};
use crate::config::ConnectionConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{Message, MessageCodec, Operation};

type SharedWriter = Arc<Mutex<Option<FramedWrite<OwnedWriteHalf, MessageCodec>>>>;

/// Handshake progress as seen by senders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    /// The handshake is still running.
    Pending,
    /// Application messages may flow.
    Ready,
    /// The handshake failed; no message will ever be sent.
    Failed(String),
    /// The socket closed.
    Closed,
}

/// Notifications from the receive task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An application message from the peer.
    Received(Message),
    /// The established connection hit a protocol or transport error and is
    /// closing. Always followed by `Disconnected`.
    Error(String),
    /// The receive task ended. Emitted exactly once per connection.
    Disconnected,
}

/// How a [`Connection`] authenticates.
#[derive(Clone)]
pub struct ConnectOptions {
    auth: Option<(Arc<dyn SecurityProvider>, Credential)>,
    target: Option<String>,
    config: ConnectionConfig,
}

impl ConnectOptions {
    /// Run the handshake as initiator with `credential`.
    pub fn authenticated(provider: Arc<dyn SecurityProvider>, credential: Credential) -> Self {
        Self {
            auth: Some((provider, credential)),
            target: None,
            config: ConnectionConfig::default(),
        }
    }

    /// Skip the handshake; the connection is ready as soon as it is open.
    pub fn unauthenticated() -> Self {
        Self {
            auth: None,
            target: None,
            config: ConnectionConfig::default(),
        }
    }

    /// Service name to authenticate to. Defaults to `host/<host>`.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn authenticate(&self) -> bool {
        self.auth.is_some()
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("authenticate", &self.authenticate())
            .field("credential", &self.auth.as_ref().map(|(_, c)| c))
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// An outbound connection.
pub struct Connection {
    peer: SocketAddr,
    writer: SharedWriter,
    ready: watch::Receiver<ReadyState>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    receive_task: Option<JoinHandle<()>>,
    config: ConnectionConfig,
}

impl Connection {
    /// Connect to `host:port` and start the handshake if one is configured.
    ///
    /// Returns once the first handshake token is written; use [`Self::send`]
    /// or [`Self::wait_ready`] to wait for authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened within the connect
    /// timeout, if the provider refuses the credential, or if the first
    /// token cannot be written.
    #[instrument(skip(options), fields(authenticate = options.authenticate()))]
    pub async fn connect(host: &str, port: u16, options: ConnectOptions) -> Result<Self> {
        let address = resolve(host, port).await;
        let config = options.config;

        let stream = timeout(config.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| {
                RelayError::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        info!(peer = %address, "connected");

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(
            read_half,
            MessageCodec::with_max_frame_size(config.max_frame_size),
        );
        let writer: SharedWriter = Arc::new(Mutex::new(Some(FramedWrite::new(
            write_half,
            MessageCodec::with_max_frame_size(config.max_frame_size),
        ))));

        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let context = match options.auth {
            Some((provider, credential)) => {
                let target = options.target.unwrap_or_else(|| format!("host/{host}"));
                let mut context = SecurityContext::initiator(provider.as_ref(), &credential, target)?;
                match context.initiate()? {
                    Negotiation::Continue(token) => {
                        if !token.is_empty() {
                            write_message(&writer, Message::client_token(token), &config).await?;
                        }
                    }
                    Negotiation::Complete(token) => {
                        if let Some(token) = token {
                            write_message(&writer, Message::client_token(token), &config).await?;
                        }
                        ready_tx.send_replace(ReadyState::Ready);
                    }
                }
                Some(context)
            }
            None => {
                ready_tx.send_replace(ReadyState::Ready);
                None
            }
        };

        let receiver = Receiver {
            writer: Arc::clone(&writer),
            context,
            config: config.clone(),
            guard: ReceiveGuard {
                ready: ready_tx,
                events: events_tx,
            },
        };
        let receive_task = tokio::spawn(receiver.run(reader, address));

        Ok(Self {
            peer: address,
            writer,
            ready: ready_rx,
            events: events_rx,
            receive_task: Some(receive_task),
            config,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready.borrow().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == ReadyState::Ready
    }

    /// Wait for the handshake to finish, up to the ready timeout.
    ///
    /// # Errors
    ///
    /// - [`RelayError::AuthenticationTimeout`] if the bound elapses
    /// - [`RelayError::AuthenticationFailed`] if the handshake failed
    /// - [`RelayError::ConnectionClosed`] if the socket closed first
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        let waited = timeout(
            self.config.ready_timeout(),
            ready.wait_for(|state| *state != ReadyState::Pending),
        )
        .await
        .map_err(|_| RelayError::AuthenticationTimeout {
            timeout_ms: self.config.ready_timeout_ms,
        })?;

        let state = match waited {
            Ok(state) => state.clone(),
            Err(_) => ReadyState::Closed,
        };
        match state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(reason) => Err(RelayError::AuthenticationFailed { reason }),
            ReadyState::Pending | ReadyState::Closed => Err(RelayError::ConnectionClosed),
        }
    }

    /// Send an application message once the connection is ready.
    ///
    /// The write is complete (flushed to the socket) when this returns.
    ///
    /// # Errors
    ///
    /// Fails if the connection does not become ready (see [`Self::wait_ready`]),
    /// if the connection was stopped, or if the write times out.
    pub async fn send(&self, message: Message) -> Result<()> {
        if message.operation().is_handshake() {
            return Err(RelayError::protocol(format!(
                "{} is reserved for the handshake",
                message.operation()
            )));
        }
        self.wait_ready().await?;
        write_message(&self.writer, message, &self.config).await
    }

    /// Next event from the receive task, or `None` once the stream is drained.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Send `message` and wait for the peer's reply.
    ///
    /// Messages that are not replies (see [`Operation::is_reply`]) are
    /// skipped while waiting.
    ///
    /// # Errors
    ///
    /// - any error from [`Self::send`]
    /// - [`RelayError::ReplyTimeout`] if no reply arrives in time
    /// - [`RelayError::ConnectionClosed`] if the peer disconnects first
    /// - [`RelayError::Protocol`] if the connection broke on a bad frame
    /// - [`RelayError::Remote`] if the peer answers with a fault
    pub async fn request(&mut self, message: Message) -> Result<Message> {
        self.send(message).await?;

        let reply_timeout_ms = self.config.reply_timeout_ms;
        let events = &mut self.events;
        let reply = async move {
            loop {
                match events.recv().await {
                    Some(ConnectionEvent::Received(reply)) if reply.operation() == Operation::Fault => {
                        return Err(RelayError::Remote {
                            message: reply.data_text().unwrap_or_default(),
                        });
                    }
                    Some(ConnectionEvent::Received(reply)) if reply.operation().is_reply() => {
                        return Ok(reply);
                    }
                    Some(ConnectionEvent::Received(other)) => {
                        debug!(operation = %other.operation(), "ignoring message while awaiting reply");
                    }
                    Some(ConnectionEvent::Error(reason)) => return Err(RelayError::protocol(reason)),
                    Some(ConnectionEvent::Disconnected) | None => return Err(RelayError::ConnectionClosed),
                }
            }
        };

        timeout(self.config.reply_timeout(), reply)
            .await
            .map_err(|_| RelayError::ReplyTimeout {
                timeout_ms: reply_timeout_ms,
            })?
    }

    /// Close the connection.
    ///
    /// Waits for an in-flight send, shuts down the write half, then gives the
    /// receive task a bounded time to see the peer close before aborting it.
    ///
    /// # Errors
    ///
    /// Currently infallible; errors while closing are logged.
    pub async fn stop(&mut self) -> Result<()> {
        let stop_timeout = self.config.stop_timeout();

        match timeout(stop_timeout, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut sink) = writer.take() {
                    match timeout(stop_timeout, sink.close()).await {
                        Ok(Err(e)) if !e.is_disconnect() => {
                            warn!(peer = %self.peer, error = %e, "error closing connection");
                        }
                        Err(_) => warn!(peer = %self.peer, "close timed out"),
                        _ => {}
                    }
                }
            }
            Err(_) => warn!(peer = %self.peer, "in-flight send did not finish before stop"),
        }

        if let Some(mut task) = self.receive_task.take() {
            if timeout(stop_timeout, &mut task).await.is_err() {
                debug!(peer = %self.peer, "aborting receive task");
                task.abort();
                let _ = task.await;
            }
        }
        debug!(peer = %self.peer, "connection stopped");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}

/// Resolve `host`, preferring the first IPv4 address.
///
/// Falls back to loopback when resolution fails so local setups keep working.
pub async fn resolve(host: &str, port: u16) -> SocketAddr {
    match lookup_host((host, port)).await {
        Ok(addresses) => {
            let addresses: Vec<SocketAddr> = addresses.collect();
            if let Some(address) = addresses
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addresses.first())
            {
                return *address;
            }
            warn!(host, "host resolved to no addresses, using loopback");
        }
        Err(e) => warn!(host, error = %e, "failed to resolve host, using loopback"),
    }
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

async fn write_message(writer: &SharedWriter, message: Message, config: &ConnectionConfig) -> Result<()> {
    let mut writer = writer.lock().await;
    let sink = writer.as_mut().ok_or(RelayError::NotConnected)?;
    timeout(config.write_timeout(), sink.send(message))
        .await
        .map_err(|_| RelayError::WriteTimeout {
            timeout_ms: config.write_timeout_ms,
        })?
}

/// Publishes the end of the receive task exactly once, however it ends.
struct ReceiveGuard {
    ready: watch::Sender<ReadyState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ReceiveGuard {
    fn set_ready(&self) {
        self.ready.send_replace(ReadyState::Ready);
    }

    /// Record why the connection is closing: a failed handshake before
    /// ready, an `Error` event after.
    fn fail(&self, error: &RelayError) {
        let reason = failure_reason(error);
        if self.is_ready() {
            let _ = self.events.send(ConnectionEvent::Error(reason));
        } else {
            self.ready.send_replace(ReadyState::Failed(reason));
        }
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow() == ReadyState::Ready
    }

    fn deliver(&self, message: Message) {
        let _ = self.events.send(ConnectionEvent::Received(message));
    }
}

impl Drop for ReceiveGuard {
    fn drop(&mut self) {
        self.ready.send_if_modified(|state| match state {
            ReadyState::Pending | ReadyState::Ready => {
                *state = ReadyState::Closed;
                true
            }
            ReadyState::Failed(_) | ReadyState::Closed => false,
        });
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }
}

/// Text for a failure without the wrapper prefixes, so a remote fault or an
/// authentication error reads the same as it did where it was raised.
fn failure_reason(error: &RelayError) -> String {
    match error {
        RelayError::Remote { message } | RelayError::Protocol { message } => message.clone(),
        RelayError::Authentication(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// State owned by the receive task.
struct Receiver {
    writer: SharedWriter,
    context: Option<SecurityContext>,
    config: ConnectionConfig,
    guard: ReceiveGuard,
}

impl Receiver {
    #[instrument(name = "receive", skip_all, fields(peer = %peer))]
    async fn run(mut self, mut reader: FramedRead<OwnedReadHalf, MessageCodec>, peer: SocketAddr) {
        while let Some(frame) = reader.next().await {
            let message = match frame {
                Ok(message) => message,
                Err(e) if e.is_disconnect() => {
                    debug!(error = %e, "connection closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    self.guard.fail(&e);
                    return;
                }
            };

            if let Err(e) = self.dispatch(message).await {
                warn!(error = %e, "closing connection");
                self.guard.fail(&e);
                return;
            }
        }
        debug!("peer closed connection");
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        match message.operation() {
            Operation::ServerToken => self.continue_handshake(message).await,
            Operation::ClientToken => Err(RelayError::protocol("peer sent a client token")),
            Operation::Fault if !self.guard.is_ready() => Err(RelayError::Remote {
                message: message.data_text().unwrap_or_default(),
            }),
            operation if !self.guard.is_ready() => Err(RelayError::protocol(format!(
                "{operation} received before authentication completed"
            ))),
            _ => {
                self.guard.deliver(message);
                Ok(())
            }
        }
    }

    async fn continue_handshake(&mut self, message: Message) -> Result<()> {
        let context = match self.context.as_mut() {
            Some(context) if !context.is_established() => context,
            _ => return Err(RelayError::protocol("unexpected server token")),
        };
        let token = message.into_token().unwrap_or_default();

        match context.continue_with(&token)? {
            Negotiation::Continue(token) => {
                if !token.is_empty() {
                    write_message(&self.writer, Message::client_token(token), &self.config).await?;
                }
            }
            Negotiation::Complete(token) => {
                if let Some(token) = token {
                    write_message(&self.writer, Message::client_token(token), &self.config).await?;
                }
                info!(target = context.target(), "authenticated");
                self.guard.set_ready();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
    use std::time::Duration;

    use crate::testing::ScriptedProvider;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn read_message(stream: &mut TcpStream) -> Message {
        let frame = read_frame(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        MessageCodec::decode_payload(&frame).unwrap()
    }

    async fn write_message_raw(stream: &mut TcpStream, message: &Message) {
        let payload = MessageCodec::encode_payload(message).unwrap();
        write_frame(stream, &payload, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
    }

    fn short_timeouts() -> ConnectionConfig {
        ConnectionConfig {
            ready_timeout_ms: 200,
            reply_timeout_ms: 500,
            stop_timeout_ms: 200,
            ..ConnectionConfig::default()
        }
    }

    fn scripted(rounds: u32) -> ConnectOptions {
        ConnectOptions::authenticated(Arc::new(ScriptedProvider::new(rounds)), Credential::Current)
            .with_config(short_timeouts())
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_is_ready() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_message(&mut stream).await;
            assert_eq!(request.operation(), Operation::WhoAmI);
            write_message_raw(&mut stream, &Message::identity("anyone")).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, ConnectOptions::unauthenticated())
            .await
            .unwrap();
        assert!(connection.is_ready());

        let reply = connection.request(Message::who_am_i()).await.unwrap();
        assert_eq!(reply.data_text().as_deref(), Some("anyone"));
        connection.stop().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_then_send() {
        let (listener, port) = bind().await;
        let provider = ScriptedProvider::new(2);
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut context = SecurityContext::acceptor(&provider, &Credential::Current).unwrap();
            while !context.is_established() {
                let message = read_message(&mut stream).await;
                assert_eq!(message.operation(), Operation::ClientToken);
                let token = match context.accept_token(message.token().unwrap()).unwrap() {
                    Negotiation::Continue(token) => token,
                    Negotiation::Complete(token) => token.unwrap(),
                };
                write_message_raw(&mut stream, &Message::server_token(token)).await;
            }
            let request = read_message(&mut stream).await;
            assert_eq!(request.operation(), Operation::WhoAmI);
        });

        let connection = Connection::connect("127.0.0.1", port, scripted(2)).await.unwrap();
        connection.send(Message::who_am_i()).await.unwrap();
        assert!(connection.is_ready());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_times_out_without_handshake_reply() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let connection = Connection::connect("127.0.0.1", port, scripted(1)).await.unwrap();
        let err = connection.send(Message::who_am_i()).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthenticationTimeout { timeout_ms: 200 }));
        assert_eq!(connection.ready_state(), ReadyState::Pending);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_mid_handshake() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, scripted(1)).await.unwrap();
        server.await.unwrap();

        let err = connection.send(Message::who_am_i()).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
        assert_eq!(connection.next_event().await, Some(ConnectionEvent::Disconnected));
        connection.stop().await.unwrap();
        assert_eq!(connection.next_event().await, None);
    }

    #[tokio::test]
    async fn test_fault_during_handshake_fails_send() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_message_raw(&mut stream, &Message::fault("bad proof")).await;
            let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let connection = Connection::connect("127.0.0.1", port, scripted(1)).await.unwrap();
        let err = connection.send(Message::who_am_i()).await.unwrap_err();
        match err {
            RelayError::AuthenticationFailed { reason } => assert_eq!(reason, "bad proof"),
            other => panic!("unexpected error: {other}"),
        }
        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_application_message_before_ready_is_rejected() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_message_raw(&mut stream, &Message::identity("early")).await;
            let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, scripted(1)).await.unwrap();
        assert!(connection.send(Message::who_am_i()).await.is_err());
        assert_eq!(connection.next_event().await, Some(ConnectionEvent::Disconnected));
        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_frame_after_ready_reports_error() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_message_raw(&mut stream, &Message::identity("alice")).await;
            stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
            let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, ConnectOptions::unauthenticated())
            .await
            .unwrap();
        let reply = connection.request(Message::who_am_i()).await.unwrap();
        assert_eq!(reply.data_text().as_deref(), Some("alice"));

        match connection.next_event().await {
            Some(ConnectionEvent::Error(reason)) => assert!(reason.contains("exceeds")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(connection.next_event().await, Some(ConnectionEvent::Disconnected));
        assert_eq!(connection.ready_state(), ReadyState::Closed);
        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_frame_fails_pending_request() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_frame(&mut stream, b"\x07not a message", DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, ConnectOptions::unauthenticated())
            .await
            .unwrap();
        let err = connection.request(Message::who_am_i()).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_skips_non_reply_messages() {
        let (listener, port) = bind().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_message_raw(&mut stream, &Message::who_am_i()).await;
            write_message_raw(&mut stream, &Message::identity("alice")).await;
            let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut connection = Connection::connect("127.0.0.1", port, ConnectOptions::unauthenticated())
            .await
            .unwrap();
        let reply = connection.request(Message::who_am_i()).await.unwrap();
        assert_eq!(reply.operation(), Operation::Identity);
        assert_eq!(reply.data_text().as_deref(), Some("alice"));
        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_handshake_operations() {
        let (listener, port) = bind().await;
        let _server = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connection = Connection::connect("127.0.0.1", port, ConnectOptions::unauthenticated())
            .await
            .unwrap();
        let err = connection
            .send(Message::client_token(b"forged".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_resolve_prefers_ipv4_and_falls_back() {
        let address = resolve("127.0.0.1", 4242).await;
        assert_eq!(address, SocketAddr::from((Ipv4Addr::LOCALHOST, 4242)));

        let fallback = resolve("host.invalid", 4243).await;
        assert_eq!(fallback, SocketAddr::from((Ipv4Addr::LOCALHOST, 4243)));
    }
}
