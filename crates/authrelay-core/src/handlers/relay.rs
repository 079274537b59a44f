//! Delegation relay handler.
//!
//! The primary server answers a `who_am_i` that names a delegate host by
//! opening a second, independently authenticated connection to that host as
//! the caller and forwarding the request. The caller's identity travels as an
//! explicit credential derived from the request's impersonation scope, or
//! from the delegation token the client supplied.
//!
//! The relay is sequential per request: the serving worker waits for the
//! delegated host's reply, which doubles as the acknowledgment that the
//! forwarded message landed, before closing the second connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::auth::{Credential, SecurityProvider};
use crate::config::ConnectionConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::network::{ConnectOptions, Connection};
use crate::protocol::{Message, Operation};

use super::{Request, RequestHandler, WhoAmIHandler};

/// Forwards requests to a delegated host under the caller's identity.
pub struct DelegationRelay {
    provider: Arc<dyn SecurityProvider>,
    config: ConnectionConfig,
    metrics: Option<Arc<RelayMetrics>>,
}

impl DelegationRelay {
    /// Create a relay that authenticates outbound hops with `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn SecurityProvider>, config: ConnectionConfig) -> Self {
        Self {
            provider,
            config,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Credential the outbound handshake presents for this request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request's impersonation scope was released.
    pub fn credential_for(request: &Request) -> Result<Credential> {
        match request.message().delegation_token() {
            Some(token) => Ok(Credential::DelegationToken(token.to_string())),
            None => Ok(request.identity().delegated_credential()?),
        }
    }

    /// Relay `request` to the delegate host it names and return the reply.
    ///
    /// The outbound connection is stopped on every path.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Delegation`] wrapping whatever failed on the
    /// second hop, or a protocol error if the message names no target.
    #[instrument(
        skip(self, request),
        fields(connection_id = request.context().connection_id())
    )]
    pub async fn relay(&self, request: &Request) -> Result<Message> {
        let (host, port) = request
            .message()
            .delegate_target()
            .ok_or_else(|| RelayError::protocol("request names no delegate host"))?;

        let result = self.forward(request, host, port).await;
        match &result {
            Ok(_) => {
                info!(host, port, caller = %request.context().principal(), "relayed request");
                self.record("success");
            }
            Err(e) => {
                warn!(host, port, error = %e, "relay failed");
                self.record("failure");
            }
        }

        result.map_err(|e| RelayError::Delegation {
            host: host.to_string(),
            port,
            source: Box::new(e),
        })
    }

    async fn forward(&self, request: &Request, host: &str, port: u16) -> Result<Message> {
        let credential = Self::credential_for(request)?;
        let options = ConnectOptions::authenticated(Arc::clone(&self.provider), credential)
            .with_config(self.config.clone());

        let mut connection = Connection::connect(host, port, options).await?;
        let reply = connection.request(request.message().forwarded()).await;
        connection.stop().await?;
        reply
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_relay(outcome);
        }
    }
}

/// Primary server handler: relays when a target is named, answers locally otherwise.
pub struct RelayHandler {
    relay: DelegationRelay,
    local: WhoAmIHandler,
}

impl RelayHandler {
    #[must_use]
    pub fn new(relay: DelegationRelay) -> Self {
        Self {
            relay,
            local: WhoAmIHandler::new(),
        }
    }

    /// Whether the primary forwards this message instead of answering it.
    #[must_use]
    pub fn is_relay_eligible(message: &Message) -> bool {
        message.operation() == Operation::WhoAmI && message.delegate_target().is_some()
    }
}

#[async_trait]
impl RequestHandler for RelayHandler {
    async fn handle(&self, request: &Request) -> Result<Option<Message>> {
        if Self::is_relay_eligible(request.message()) {
            self.relay.relay(request).await.map(Some)
        } else {
            self.local.handle(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionContext;
    use crate::testing::{establish, ScriptedProvider};

    fn relay() -> DelegationRelay {
        let config = ConnectionConfig {
            connect_timeout_ms: 200,
            ready_timeout_ms: 200,
            reply_timeout_ms: 200,
            stop_timeout_ms: 100,
            ..ConnectionConfig::default()
        };
        DelegationRelay::new(Arc::new(ScriptedProvider::new(1)), config)
    }

    fn request(message: Message) -> (crate::auth::SecurityContext, Request) {
        let provider = ScriptedProvider::new(1);
        let server = establish(&provider, &Credential::Current).unwrap();
        let identity = server.impersonate_caller().unwrap();
        let context = ConnectionContext::new(
            server.caller().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
            "conn-1".to_string(),
        );
        (server, Request::new(message, context, identity))
    }

    #[test]
    fn test_relay_eligibility() {
        assert!(RelayHandler::is_relay_eligible(
            &Message::who_am_i().with_delegate("delegated", 5655)
        ));
        assert!(!RelayHandler::is_relay_eligible(&Message::who_am_i()));
        assert!(!RelayHandler::is_relay_eligible(
            &Message::who_am_i().with_delegate("delegated", 0)
        ));
        assert!(!RelayHandler::is_relay_eligible(
            &Message::identity("x").with_delegate("delegated", 5655)
        ));
    }

    #[test]
    fn test_credential_prefers_delegation_token() {
        let (_server, with_token) =
            request(Message::who_am_i().with_delegation_token("bob"));
        assert_eq!(
            DelegationRelay::credential_for(&with_token).unwrap(),
            Credential::DelegationToken("bob".to_string())
        );

        let (_server, without) = request(Message::who_am_i());
        assert!(matches!(
            DelegationRelay::credential_for(&without).unwrap(),
            Credential::Impersonated { principal } if principal.name == "scripted-user"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_delegate_is_a_delegation_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (server, request) = request(Message::who_am_i().with_delegate("127.0.0.1", port));

        let err = relay().relay(&request).await.unwrap_err();
        match err {
            RelayError::Delegation { host, port: p, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(request);
        assert!(!server.is_impersonating());
    }

    #[tokio::test]
    async fn test_failed_second_handshake_releases_resources() {
        use crate::config::RelayConfig;
        use crate::network::{Listener, ServerEvent};

        let delegated_provider = ScriptedProvider::new(2).fail_at_round(2);
        let mut config = RelayConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        let mut delegated = Listener::new(
            &config,
            Arc::new(delegated_provider.clone()),
            Arc::new(WhoAmIHandler::new()),
        )
        .unwrap()
        .start()
        .await
        .unwrap();
        let port = delegated.local_addr().port();

        let relay_provider = ScriptedProvider::new(2);
        let relay = DelegationRelay::new(
            Arc::new(relay_provider.clone()),
            ConnectionConfig {
                stop_timeout_ms: 200,
                ..ConnectionConfig::default()
            },
        );
        let (server, request) = request(Message::who_am_i().with_delegate("127.0.0.1", port));

        let err = relay.relay(&request).await.unwrap_err();
        match err {
            RelayError::Delegation { source, .. } => {
                assert!(matches!(*source, RelayError::AuthenticationFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(relay_provider.live_handles(), 0);
        assert!(relay_provider.released_handles() >= 1);

        drop(request);
        assert!(!server.is_impersonating());

        delegated.stop().await;
        while let Some(event) = delegated.next_event().await {
            if matches!(event, ServerEvent::Stopped) {
                break;
            }
        }
        assert_eq!(delegated_provider.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_handler_answers_locally_without_target() {
        let (_server, request) = request(Message::who_am_i());
        let reply = RelayHandler::new(relay()).handle(&request).await.unwrap().unwrap();
        assert_eq!(reply.data_text().as_deref(), Some("scripted-user"));
    }
}
