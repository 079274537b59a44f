//! Security provider interface.
//!
//! The relay never interprets handshake tokens itself. A [`SecurityProvider`]
//! creates one [`ProviderContext`] per handshake, and the context turns each
//! incoming token into a [`ProviderStep`]. Dropping the context releases
//! whatever the mechanism holds for it.

use std::fmt;

use super::credentials::Credential;
use super::principal::Principal;
use crate::error::AuthResult;

/// Status codes carried by [`ProviderStep::Fatal`].
pub mod status {
    /// A token could not be parsed or arrived out of order.
    pub const INVALID_TOKEN: u32 = 0x8009_0308;
    /// The peer's proof did not verify.
    pub const LOGON_DENIED: u32 = 0x8009_030C;
    /// No usable credential for the requested identity.
    pub const UNKNOWN_CREDENTIALS: u32 = 0x8009_030D;
    /// A call was made after the context completed or failed.
    pub const OUT_OF_SEQUENCE: u32 = 0x8009_0310;
    /// The peer asserted an identity it is not trusted to assert.
    pub const DELEGATION_POLICY: u32 = 0x8009_035E;
    /// The acceptor's final proof did not verify.
    pub const MUTUAL_AUTH_FAILED: u32 = 0x8009_0363;
}

/// Result of feeding one token (or none) into a provider context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStep {
    /// More rounds are needed; `token` goes to the peer if non-empty.
    ContinueNeeded { token: Vec<u8> },
    /// The context is established; a final token may still go to the peer.
    Accepted { token: Option<Vec<u8>> },
    /// The handshake cannot succeed.
    Fatal { code: u32, reason: String },
}

impl ProviderStep {
    pub fn fatal(code: u32, reason: impl Into<String>) -> Self {
        Self::Fatal {
            code,
            reason: reason.into(),
        }
    }
}

/// Per-handshake provider state, exclusively owned by one security context.
pub trait ProviderContext: Send + fmt::Debug {
    /// Initiator step. `incoming` is `None` on the first call.
    fn initialize(&mut self, target: &str, incoming: Option<&[u8]>) -> ProviderStep;

    /// Acceptor step.
    fn accept(&mut self, incoming: &[u8]) -> ProviderStep;

    /// Identity of the authenticated peer.
    ///
    /// # Errors
    ///
    /// Returns an error unless this is an accepting context that has completed.
    fn impersonate_caller(&self) -> AuthResult<Principal>;

    /// Name of the authenticated peer, for diagnostics.
    fn caller_name(&self) -> Option<String>;
}

/// Factory for provider contexts, shared by every connection of a process.
pub trait SecurityProvider: Send + Sync + fmt::Debug {
    /// Mechanism name, e.g. `SCRAM-SHA-256`.
    fn package(&self) -> &str;

    /// Create a context for the initiating side.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cannot be used to initiate.
    fn initiator_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>>;

    /// Create a context for the accepting side.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cannot be used to accept.
    fn acceptor_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>>;
}
