//! Authentication Relay Core Library
//!
//! This library provides the core functionality for a mutually authenticated
//! TCP relay. A client authenticates to a primary server; the primary then
//! acts as that caller and authenticates again, as the caller, to a delegated
//! host it forwards the request to.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`protocol`] - Length-prefixed framing and the message codec
//! - [`auth`] - Security providers, the handshake state machine and scoped impersonation
//! - [`network`] - Client connections, the server worker and the TCP listener
//! - [`handlers`] - Application request handlers and the delegation relay
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use authrelay_core::auth::create_provider;
//! use authrelay_core::config::RelayConfig;
//! use authrelay_core::handlers::WhoAmIHandler;
//! use authrelay_core::network::Listener;
//!
//! let config = RelayConfig::from_file("relay.yaml")?;
//! let provider = create_provider(&config.security)?;
//! let listener = Listener::new(&config, provider, Arc::new(WhoAmIHandler::new()))?;
//! listener.run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod network;
pub mod protocol;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use auth::{Credential, Principal, ScopedIdentity, SecurityContext, SecurityProvider};
pub use config::RelayConfig;
pub use error::{AuthError, ConfigError, RelayError, Result};
pub use network::{ConnectOptions, Connection, Listener};
pub use protocol::{Message, Operation};
