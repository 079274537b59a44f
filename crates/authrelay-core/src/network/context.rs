//! Per-connection metadata carried through request handling.
//!
//! A `ConnectionContext` is created by the server worker once the handshake
//! has completed. It names the connection for logging and records the caller
//! principal the security context established. It never grants the right to
//! act as that caller; that is what a [`ScopedIdentity`](crate::auth::ScopedIdentity)
//! is for.
//!
//! # Example
//!
//! ```
//! use std::net::SocketAddr;
//! use authrelay_core::auth::{AuthMethod, Principal};
//! use authrelay_core::network::ConnectionContext;
//!
//! let addr: SocketAddr = "192.168.1.100:45678".parse().unwrap();
//! let context = ConnectionContext::new(
//!     Principal::new("alice", AuthMethod::Password),
//!     addr,
//!     "conn-1".to_string(),
//! );
//!
//! assert_eq!(context.principal().name, "alice");
//! assert_eq!(context.peer_address(), addr);
//! ```

use std::fmt;
use std::net::SocketAddr;

use crate::auth::Principal;

/// Context for one accepted connection.
///
/// `Clone` so it can be handed to handlers and spawned tasks. Treated as
/// immutable once the handshake has produced it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// The caller the handshake authenticated.
    principal: Principal,
    /// Remote address of the caller.
    peer_address: SocketAddr,
    /// Connection identifier (for logging/tracing).
    connection_id: String,
}

impl ConnectionContext {
    pub fn new(principal: Principal, peer_address: SocketAddr, connection_id: String) -> Self {
        Self {
            principal,
            peer_address,
            connection_id,
        }
    }

    /// Context for a connection that has not authenticated yet.
    pub fn anonymous(peer_address: SocketAddr, connection_id: String) -> Self {
        Self::new(Principal::anonymous(), peer_address, connection_id)
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Check if this connection is authenticated (not anonymous).
    pub fn is_authenticated(&self) -> bool {
        !self.principal.is_anonymous()
    }

    /// Replace the principal once the handshake has established it.
    #[must_use]
    pub fn with_principal(self, principal: Principal) -> Self {
        Self { principal, ..self }
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionContext(id={}, principal={}, peer={})",
            self.connection_id, self.principal, self.peer_address
        )
    }
}
