//! Authentication for relay connections.
//!
//! This module provides:
//! - the [`SecurityProvider`] interface a mechanism plugs into
//! - [`SecurityContext`], the per-connection handshake state machine
//! - [`ScopedIdentity`], the explicit handle for acting as a caller
//! - a SCRAM provider that supports identity delegation
//!
//! # Delegation
//!
//! A primary server that must reach a delegated host on behalf of its caller
//! takes a [`ScopedIdentity`] from its accepting context and turns it into a
//! [`Credential::Impersonated`]. The provider authenticates to the delegated
//! host as the configured service and asserts the caller's name; the
//! delegated host accepts the assertion only from trusted delegates.
//!
//! # Example Configuration
//!
//! ```yaml
//! security:
//!   mechanism: SCRAM-SHA-256
//!   service:
//!     username: relay-svc
//!     password: "${RELAY_SVC_PASSWORD}"
//!   credentials:
//!     users:
//!       - username: alice
//!         password: "${ALICE_PASSWORD}"
//!   trusted_delegates: [relay-svc]
//! ```

pub mod context;
pub mod credentials;
pub mod impersonation;
pub mod principal;
pub mod provider;
pub mod scram;

pub use context::{ContextState, Negotiation, Role, SecurityContext};
pub use credentials::{
    create_credential_store, Credential, CredentialStore, FileCredentialStore,
    InMemoryCredentialStore, StoredCredentials,
};
pub use impersonation::ScopedIdentity;
pub use principal::{AuthMethod, Principal};
pub use provider::{status, ProviderContext, ProviderStep, SecurityProvider};
pub use scram::{
    create_provider, ScramHash, ScramProvider, ScramSha256, ScramSha256Provider, ScramSha512,
    ScramSha512Provider,
};
