//! Server-role connection handling.
//!
//! Each accepted socket is served by one [`ConnectionHandler`] running in its
//! own task. The handler reads frames, drives the acceptor side of the
//! handshake until the security context is established, and only then
//! dispatches application messages, one at a time, to the request handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::auth::{
    Credential, Negotiation, Principal, ScopedIdentity, SecurityContext, SecurityProvider,
};
use crate::config::ConnectionConfig;
use crate::error::{RelayError, Result};
use crate::handlers::{Request, RequestHandler};
use crate::metrics::RelayMetrics;
use crate::protocol::{FrameCodec, Message, MessageCodec, Operation};

use super::context::ConnectionContext;
use super::listener::ServerEvent;

/// Everything a worker shares with the listener that spawned it.
#[derive(Clone)]
pub struct ConnectionShared {
    pub provider: Arc<dyn SecurityProvider>,
    pub handler: Arc<dyn RequestHandler>,
    pub config: ConnectionConfig,
    pub metrics: Arc<RelayMetrics>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
}

/// Handles a single accepted connection.
pub struct ConnectionHandler {
    connection_id: String,
    shared: ConnectionShared,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    /// Create a new connection handler.
    #[must_use]
    pub fn new(
        connection_id: String,
        shared: ConnectionShared,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            connection_id,
            shared,
            shutdown_rx,
        }
    }

    /// Serve the connection until the peer leaves, a fatal error occurs, or
    /// shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Returns protocol and authentication errors, and IO errors that are not
    /// an ordinary disconnect. A peer going away is `Ok`.
    #[instrument(
        skip(self, stream),
        fields(peer = %peer, connection_id = %self.connection_id, principal = tracing::field::Empty)
    )]
    pub async fn handle(mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let max_frame_size = self.shared.config.max_frame_size;
        let mut reader = FramedRead::new(read_half, FrameCodec::with_max_frame_size(max_frame_size));
        let mut writer = ReplyWriter {
            sink: FramedWrite::new(write_half, FrameCodec::with_max_frame_size(max_frame_size)),
            config: &self.shared.config,
            metrics: &self.shared.metrics,
        };

        let mut security = SecurityContext::acceptor(self.shared.provider.as_ref(), &Credential::Current)?;
        let mut context = ConnectionContext::anonymous(peer, self.connection_id.clone());

        let outcome = loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                _ = self.shutdown_rx.recv() => {
                    debug!("shutdown signal received");
                    break Ok(());
                }
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) if e.is_disconnect() => {
                    debug!(error = %e, "peer disconnected");
                    break Ok(());
                }
                Some(Err(e)) => break Err(e),
                None => {
                    debug!("peer closed connection");
                    break Ok(());
                }
            };
            self.shared.metrics.record_bytes_received(frame.len() as u64);
            let message = match MessageCodec::decode_payload(&frame) {
                Ok(message) => message,
                Err(e) => break Err(e),
            };

            let step = if security.is_established() {
                match security.impersonate_caller() {
                    Ok(identity) => self.serve(&context, message, identity, &mut writer).await,
                    Err(e) => Err(e.into()),
                }
            } else {
                match self.negotiate(&mut security, message, &mut writer).await {
                    Ok(Some(principal)) => {
                        tracing::Span::current().record("principal", principal.name.as_str());
                        context = context.with_principal(principal);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        if !security.is_established() {
            let label = match &outcome {
                Err(RelayError::Authentication(_)) => "failed",
                _ => "abandoned",
            };
            self.shared.metrics.record_handshake(label);
        }
        outcome
    }

    /// Feed one handshake message into the acceptor.
    ///
    /// Returns the caller's principal once the context is established.
    async fn negotiate(
        &self,
        security: &mut SecurityContext,
        message: Message,
        writer: &mut ReplyWriter<'_>,
    ) -> Result<Option<Principal>> {
        if message.operation() != Operation::ClientToken {
            let e = RelayError::protocol(format!(
                "{} received before authentication completed",
                message.operation()
            ));
            writer.fault(&e).await;
            return Err(e);
        }
        let token = message.into_token().unwrap_or_default();

        match security.accept_token(&token) {
            Ok(Negotiation::Continue(token)) => {
                writer.send(Message::server_token(token)).await?;
                Ok(None)
            }
            Ok(Negotiation::Complete(token)) => {
                if let Some(token) = token {
                    writer.send(Message::server_token(token)).await?;
                }
                let principal = security.caller()?;
                info!(caller = %principal, "client authenticated");
                self.shared.metrics.record_handshake("established");
                Ok(Some(principal))
            }
            Err(e) => {
                let e = RelayError::Authentication(e);
                writer.fault(&e).await;
                Err(e)
            }
        }
    }

    /// Dispatch one application message under the caller's impersonation scope.
    async fn serve(
        &self,
        context: &ConnectionContext,
        message: Message,
        identity: ScopedIdentity,
        writer: &mut ReplyWriter<'_>,
    ) -> Result<()> {
        let operation = message.operation();
        if operation.is_handshake() {
            let e = RelayError::protocol(format!("{operation} after authentication completed"));
            writer.fault(&e).await;
            return Err(e);
        }
        self.shared.metrics.record_request(operation.as_str());
        let started = Instant::now();

        let request = Request::new(message, context.clone(), identity);
        let result = self.shared.handler.handle(&request).await;
        drop(request);

        self.shared
            .metrics
            .record_duration(operation.as_str(), started.elapsed().as_secs_f64());

        match result {
            Ok(Some(reply)) => writer.send(reply).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(%operation, error = %e, "request failed");
                writer.fault(&e).await;
                let _ = self.shared.events.send(ServerEvent::Error {
                    connection_id: Some(self.connection_id.clone()),
                    error: e,
                });
                Ok(())
            }
        }
    }
}

/// Write half of a served connection, bounded by the write timeout.
struct ReplyWriter<'a> {
    sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    config: &'a ConnectionConfig,
    metrics: &'a RelayMetrics,
}

impl ReplyWriter<'_> {
    async fn send(&mut self, message: Message) -> Result<()> {
        let payload: Bytes = MessageCodec::encode_payload(&message)?;
        let length = payload.len() as u64;
        timeout(self.config.write_timeout(), self.sink.send(payload))
            .await
            .map_err(|_| RelayError::WriteTimeout {
                timeout_ms: self.config.write_timeout_ms,
            })??;
        self.metrics.record_bytes_sent(length);
        Ok(())
    }

    /// Best-effort fault reply; the peer may already be gone.
    async fn fault(&mut self, error: &RelayError) {
        let text = match error {
            RelayError::Authentication(inner) => inner.to_string(),
            other => other.to_string(),
        };
        if let Err(e) = self.send(Message::fault(&text)).await {
            debug!(error = %e, "could not deliver fault reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::WhoAmIHandler;
    use crate::protocol::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
    use crate::testing::ScriptedProvider;
    use tokio::net::TcpListener;

    struct Served {
        client: TcpStream,
        worker: tokio::task::JoinHandle<Result<()>>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        shutdown: broadcast::Sender<()>,
        metrics: Arc<RelayMetrics>,
    }

    async fn serve_one(provider: ScriptedProvider) -> Served {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let metrics = Arc::new(RelayMetrics::new());
        let shared = ConnectionShared {
            provider: Arc::new(provider),
            handler: Arc::new(WhoAmIHandler::new()),
            config: ConnectionConfig::default(),
            metrics: Arc::clone(&metrics),
            events: events_tx,
        };

        let client = TcpStream::connect(address).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let handler = ConnectionHandler::new("conn-1".to_string(), shared, shutdown_rx);
        let worker = tokio::spawn(handler.handle(stream, peer));
        Served {
            client,
            worker,
            events,
            shutdown,
            metrics,
        }
    }

    async fn send(stream: &mut TcpStream, message: &Message) {
        let payload = MessageCodec::encode_payload(message).unwrap();
        write_frame(stream, &payload, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
    }

    async fn receive(stream: &mut TcpStream) -> Message {
        let frame = read_frame(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        MessageCodec::decode_payload(&frame).unwrap()
    }

    async fn authenticate(stream: &mut TcpStream) {
        send(stream, &Message::client_token(b"scripted-1 direct alice".to_vec())).await;
        let reply = receive(stream).await;
        assert_eq!(reply.operation(), Operation::ServerToken);
        assert_eq!(reply.token(), Some(&b"scripted-done"[..]));
    }

    #[tokio::test]
    async fn test_handshake_then_request() {
        let mut served = serve_one(ScriptedProvider::new(1)).await;
        authenticate(&mut served.client).await;

        send(&mut served.client, &Message::who_am_i()).await;
        let reply = receive(&mut served.client).await;
        assert_eq!(reply.operation(), Operation::Identity);
        assert_eq!(reply.data_text().as_deref(), Some("alice"));

        drop(served.client);
        served.worker.await.unwrap().unwrap();
        assert_eq!(
            served
                .metrics
                .handshakes_total
                .with_label_values(&["established"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_application_message_before_handshake_is_rejected() {
        let mut served = serve_one(ScriptedProvider::new(1)).await;
        send(&mut served.client, &Message::who_am_i()).await;

        let reply = receive(&mut served.client).await;
        assert_eq!(reply.operation(), Operation::Fault);
        let err = served.worker.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_failed_handshake_replies_fault() {
        let mut served = serve_one(ScriptedProvider::new(1).fail_at_round(1)).await;
        send(
            &mut served.client,
            &Message::client_token(b"scripted-1 direct alice".to_vec()),
        )
        .await;

        let reply = receive(&mut served.client).await;
        assert_eq!(reply.operation(), Operation::Fault);
        assert_eq!(
            reply.data_text().as_deref(),
            Some("authentication failed (code 0x8009030c): scripted failure at round 1")
        );
        let err = served.worker.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Authentication(_)));
        assert_eq!(
            served
                .metrics
                .handshakes_total
                .with_label_values(&["failed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_handler_error_keeps_connection() {
        let mut served = serve_one(ScriptedProvider::new(1)).await;
        authenticate(&mut served.client).await;

        send(&mut served.client, &Message::identity("not a request")).await;
        assert_eq!(receive(&mut served.client).await.operation(), Operation::Fault);
        assert!(matches!(
            served.events.recv().await,
            Some(ServerEvent::Error { connection_id: Some(id), .. }) if id == "conn-1"
        ));

        send(&mut served.client, &Message::who_am_i()).await;
        assert_eq!(receive(&mut served.client).await.operation(), Operation::Identity);
    }

    #[tokio::test]
    async fn test_disconnect_mid_handshake_is_clean() {
        let served = serve_one(ScriptedProvider::new(3)).await;
        let mut client = served.client;
        send(&mut client, &Message::client_token(b"scripted-1 direct alice".to_vec())).await;
        assert_eq!(receive(&mut client).await.operation(), Operation::ServerToken);
        drop(client);

        served.worker.await.unwrap().unwrap();
        assert_eq!(
            served
                .metrics
                .handshakes_total
                .with_label_values(&["abandoned"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_ends_worker() {
        let served = serve_one(ScriptedProvider::new(1)).await;
        served.shutdown.send(()).unwrap();
        served.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_error() {
        let mut served = serve_one(ScriptedProvider::new(1)).await;
        write_frame(&mut served.client, b"\x07not a message", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let err = served.worker.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }
}
