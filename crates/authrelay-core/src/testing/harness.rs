//! Three-party test harness.
//!
//! Starts a delegated host and a primary server on ephemeral loopback ports
//! and hands out client connections to the primary. The delegated host
//! records every request it serves, so tests can check which identity
//! arrived on the second hop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::auth::{create_provider, Credential, Principal, SecurityProvider};
use crate::config::{ConnectionConfig, CredentialConfig, RelayConfig, SecurityConfig, UserCredential};
use crate::error::Result;
use crate::handlers::{DelegationRelay, RelayHandler, Request, RequestHandler, WhoAmIHandler};
use crate::metrics::RelayMetrics;
use crate::network::{ConnectOptions, Connection, Listener, RunningListener, ServerEvent};
use crate::protocol::{Message, Operation};

use super::provider::ScriptedProvider;

/// Service account the primary uses for the second hop.
pub const RELAY_SERVICE: &str = "relay-svc";

/// A request observed by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub connection_id: String,
    pub operation: Operation,
    pub caller: Principal,
}

/// Handler wrapper that records each request before passing it on.
pub struct RecordingHandler {
    inner: Arc<dyn RequestHandler>,
    calls: Arc<RwLock<Vec<RecordedCall>>>,
}

impl RecordingHandler {
    pub fn new(inner: Arc<dyn RequestHandler>) -> Self {
        Self {
            inner,
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Shared view of the recorded calls.
    pub fn calls(&self) -> Arc<RwLock<Vec<RecordedCall>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, request: &Request) -> Result<Option<Message>> {
        let caller = request.identity().principal()?.clone();
        self.calls.write().await.push(RecordedCall {
            connection_id: request.context().connection_id().to_string(),
            operation: request.message().operation(),
            caller,
        });
        self.inner.handle(request).await
    }
}

/// Test harness with a primary server relaying to a delegated host.
pub struct RelayTestHarness {
    /// The primary server (runs the relay handler).
    pub primary: RunningListener,
    /// The delegated host (answers `who_am_i`).
    pub delegated: RunningListener,
    /// Metrics of the primary server.
    pub metrics: Arc<RelayMetrics>,
    delegated_calls: Arc<RwLock<Vec<RecordedCall>>>,
    client_provider: Arc<dyn SecurityProvider>,
    connection: ConnectionConfig,
}

impl RelayTestHarness {
    /// All three parties use a [`ScriptedProvider`] with `rounds` rounds.
    pub async fn scripted(rounds: u32) -> Self {
        let provider: Arc<dyn SecurityProvider> = Arc::new(ScriptedProvider::new(rounds));
        Self::with_providers(Arc::clone(&provider), Arc::clone(&provider), provider).await
    }

    /// All three parties use SCRAM-SHA-256.
    ///
    /// Users `alice` and `bob` exist on both servers; the primary relays as
    /// [`RELAY_SERVICE`], which the delegated host trusts.
    pub async fn scram() -> Self {
        Self::scram_with_trusted(&[RELAY_SERVICE]).await
    }

    /// SCRAM setup where the delegated host trusts only `trusted`.
    pub async fn scram_with_trusted(trusted: &[&str]) -> Self {
        let primary = create_provider(&scram_security(&[])).expect("primary provider");
        let delegated = create_provider(&scram_security(trusted)).expect("delegated provider");
        let client = create_provider(&scram_security(&[])).expect("client provider");
        Self::with_providers(primary, delegated, client).await
    }

    /// Start both servers with explicit providers.
    pub async fn with_providers(
        primary_provider: Arc<dyn SecurityProvider>,
        delegated_provider: Arc<dyn SecurityProvider>,
        client_provider: Arc<dyn SecurityProvider>,
    ) -> Self {
        let mut config = RelayConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config.connection = test_connection_config();

        let recorder = RecordingHandler::new(Arc::new(WhoAmIHandler::new()));
        let delegated_calls = recorder.calls();
        let delegated = Listener::new(&config, delegated_provider, Arc::new(recorder))
            .expect("delegated listener")
            .start()
            .await
            .expect("start delegated listener");

        let metrics = Arc::new(RelayMetrics::new());
        let relay = DelegationRelay::new(Arc::clone(&primary_provider), config.connection.clone())
            .with_metrics(Arc::clone(&metrics));
        let primary = Listener::new(&config, primary_provider, Arc::new(RelayHandler::new(relay)))
            .expect("primary listener")
            .with_metrics(Arc::clone(&metrics))
            .start()
            .await
            .expect("start primary listener");

        Self {
            primary,
            delegated,
            metrics,
            delegated_calls,
            client_provider,
            connection: config.connection,
        }
    }

    #[must_use]
    pub fn primary_port(&self) -> u16 {
        self.primary.local_addr().port()
    }

    #[must_use]
    pub fn delegated_port(&self) -> u16 {
        self.delegated.local_addr().port()
    }

    /// Connection settings used by the harness.
    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Open an authenticated client connection to the primary server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn connect(&self, credential: Credential) -> Result<Connection> {
        let options = ConnectOptions::authenticated(Arc::clone(&self.client_provider), credential)
            .with_config(self.connection.clone());
        Connection::connect("127.0.0.1", self.primary_port(), options).await
    }

    /// A `who_am_i` the primary relays to the delegated host.
    #[must_use]
    pub fn relayed_who_am_i(&self) -> Message {
        Message::who_am_i().with_delegate("127.0.0.1", self.delegated_port())
    }

    /// Requests the delegated host has served so far.
    pub async fn delegated_calls(&self) -> Vec<RecordedCall> {
        self.delegated_calls.read().await.clone()
    }

    /// Stop both servers and return every event each emitted.
    pub async fn shutdown(mut self) -> (Vec<ServerEvent>, Vec<ServerEvent>) {
        self.primary.stop().await;
        self.delegated.stop().await;
        (
            drain(&mut self.primary).await,
            drain(&mut self.delegated).await,
        )
    }
}

async fn drain(listener: &mut RunningListener) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = listener.next_event().await {
        events.push(event);
    }
    events
}

/// Short timeouts so failing tests fail fast.
#[must_use]
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 2_000,
        ready_timeout_ms: 5_000,
        write_timeout_ms: 2_000,
        reply_timeout_ms: 10_000,
        stop_timeout_ms: 500,
        ..ConnectionConfig::default()
    }
}

/// Password credential for one of the harness users.
#[must_use]
pub fn user(name: &str) -> Credential {
    Credential::password(name, format!("{name}-secret"), None)
}

fn scram_security(trusted: &[&str]) -> SecurityConfig {
    let users = ["alice", "bob", RELAY_SERVICE]
        .iter()
        .map(|name| UserCredential::new(*name, format!("{name}-secret")))
        .collect();
    SecurityConfig {
        service: Some(UserCredential::new(RELAY_SERVICE, format!("{RELAY_SERVICE}-secret"))),
        credentials: CredentialConfig::Inline { users },
        trusted_delegates: trusted.iter().map(ToString::to_string).collect(),
        ..SecurityConfig::default()
    }
}
