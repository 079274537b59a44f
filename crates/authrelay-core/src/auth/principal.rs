//! Principal representation for authenticated identities.
//!
//! A principal is what the accepting side of a handshake learns about its
//! peer:
//! - the name the peer authenticated as (or asserted, when delegated)
//! - how it was authenticated
//! - which service vouched for it, when the identity arrived through a relay
//!
//! # Example
//!
//! ```
//! use authrelay_core::auth::{AuthMethod, Principal};
//!
//! let direct = Principal::new("alice", AuthMethod::Password);
//! assert_eq!(direct.to_string(), "alice");
//!
//! let relayed = Principal::delegated("alice", "relay-svc");
//! assert_eq!(relayed.to_string(), "alice (via relay-svc)");
//! assert!(relayed.is_delegated());
//! ```

use std::fmt;

/// Represents an authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    /// The name/identity of the principal.
    pub name: String,
    /// How this principal was authenticated.
    pub auth_method: AuthMethod,
    /// Service principal that asserted this identity, if any.
    pub delegated_by: Option<String>,
}

/// How the principal was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication took place.
    Anonymous,
    /// The peer proved knowledge of its own password.
    Password,
    /// A trusted service authenticated and asserted this identity.
    Delegated,
}

impl Principal {
    /// Create a new principal with the given name and authentication method.
    pub fn new(name: impl Into<String>, auth_method: AuthMethod) -> Self {
        Self {
            name: name.into(),
            auth_method,
            delegated_by: None,
        }
    }

    /// Principal asserted by `service` on behalf of `name`.
    pub fn delegated(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_method: AuthMethod::Delegated,
            delegated_by: Some(service.into()),
        }
    }

    /// Create an anonymous principal.
    pub fn anonymous() -> Self {
        Self::new("ANONYMOUS", AuthMethod::Anonymous)
    }

    /// Check if this is an anonymous principal.
    pub fn is_anonymous(&self) -> bool {
        self.name == "ANONYMOUS" && matches!(self.auth_method, AuthMethod::Anonymous)
    }

    pub fn is_delegated(&self) -> bool {
        self.delegated_by.is_some()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.delegated_by {
            Some(service) => write!(f, "{} (via {service})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::anonymous()
    }
}
