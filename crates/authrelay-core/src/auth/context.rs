//! Handshake state machine shared by both ends of a connection.
//!
//! # States
//!
//! ```text
//!            initiate / accept_token
//!   Idle ───────────────────────────► Negotiating ──(Accepted)──► Established
//!     │                                   │  ▲
//!     │                                   └──┘ ContinueNeeded
//!     └──────────── Fatal ────────────────┴──────────────────────► Failed
//! ```
//!
//! Tokens strictly alternate: the initiator speaks first, the acceptor
//! answers, and so on until the provider reports `Accepted`. Calls that do not
//! fit the current role and state are rejected without touching the provider.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::credentials::Credential;
use super::impersonation::{ImpersonationSlot, ScopedIdentity};
use super::principal::Principal;
use super::provider::{ProviderContext, ProviderStep, SecurityProvider};
use crate::error::{AuthError, AuthResult};

/// Which end of the handshake this context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Negotiating,
    Established,
    Failed,
}

impl ContextState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Established => "established",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller must do after a handshake call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Send this token to the peer (if non-empty) and wait for its answer.
    Continue(Vec<u8>),
    /// The context is established; send the final token, if any.
    Complete(Option<Vec<u8>>),
}

/// Per-connection security context.
///
/// Owns its provider context for its whole lifetime; dropping the security
/// context drops the provider context exactly once and revokes any
/// impersonation scope still outstanding.
pub struct SecurityContext {
    role: Role,
    state: ContextState,
    target: String,
    provider: Box<dyn ProviderContext>,
    rounds: u32,
    impersonation: Arc<ImpersonationSlot>,
}

impl SecurityContext {
    /// Create an initiator context that will authenticate to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the credential.
    pub fn initiator(
        provider: &dyn SecurityProvider,
        credential: &Credential,
        target: impl Into<String>,
    ) -> AuthResult<Self> {
        let handle = provider.initiator_context(credential)?;
        Ok(Self::with_handle(Role::Initiator, handle, target.into()))
    }

    /// Create an acceptor context.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the credential.
    pub fn acceptor(provider: &dyn SecurityProvider, credential: &Credential) -> AuthResult<Self> {
        let handle = provider.acceptor_context(credential)?;
        Ok(Self::with_handle(Role::Acceptor, handle, String::new()))
    }

    /// Wrap an existing provider context.
    #[must_use]
    pub fn with_handle(role: Role, provider: Box<dyn ProviderContext>, target: String) -> Self {
        Self {
            role,
            state: ContextState::Idle,
            target,
            provider,
            rounds: 0,
            impersonation: Arc::new(ImpersonationSlot::default()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Rounds completed in the current negotiation. Diagnostic only.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == ContextState::Established
    }

    /// Start the handshake as initiator.
    ///
    /// # Errors
    ///
    /// Fails if this is not an idle initiator, or if the provider reports a
    /// fatal status (the context is then `Failed`).
    pub fn initiate(&mut self) -> AuthResult<Negotiation> {
        self.expect(Role::Initiator, &[ContextState::Idle], "initiate")?;
        self.state = ContextState::Negotiating;
        let step = self.provider.initialize(&self.target, None);
        self.apply(step)
    }

    /// Feed the acceptor's latest token back into the initiator.
    ///
    /// # Errors
    ///
    /// Fails if this is not a negotiating initiator, or on a fatal status.
    pub fn continue_with(&mut self, token: &[u8]) -> AuthResult<Negotiation> {
        self.expect(Role::Initiator, &[ContextState::Negotiating], "continue")?;
        let step = self.provider.initialize(&self.target, Some(token));
        self.apply(step)
    }

    /// Feed the initiator's latest token into the acceptor.
    ///
    /// # Errors
    ///
    /// Fails if this is not an idle or negotiating acceptor, or on a fatal status.
    pub fn accept_token(&mut self, token: &[u8]) -> AuthResult<Negotiation> {
        self.expect(
            Role::Acceptor,
            &[ContextState::Idle, ContextState::Negotiating],
            "accept_token",
        )?;
        self.state = ContextState::Negotiating;
        let step = self.provider.accept(token);
        self.apply(step)
    }

    /// Begin acting as the authenticated caller.
    ///
    /// # Errors
    ///
    /// - [`AuthError::NotAcceptor`] on an initiator context
    /// - [`AuthError::NotEstablished`] before the handshake completes
    /// - [`AuthError::ImpersonationActive`] while another scope is live
    pub fn impersonate_caller(&self) -> AuthResult<ScopedIdentity> {
        ScopedIdentity::acquire(&self.impersonation, self.caller()?)
    }

    /// The authenticated caller, without taking an impersonation scope.
    ///
    /// # Errors
    ///
    /// Same role and state requirements as [`Self::impersonate_caller`].
    pub fn caller(&self) -> AuthResult<Principal> {
        if self.role != Role::Acceptor {
            return Err(AuthError::NotAcceptor);
        }
        if self.state != ContextState::Established {
            return Err(AuthError::NotEstablished);
        }
        self.provider.impersonate_caller()
    }

    /// Revoke any live impersonation scope. Safe to call at any time.
    pub fn revert_impersonation(&self) {
        self.impersonation.revert();
    }

    #[must_use]
    pub fn is_impersonating(&self) -> bool {
        self.impersonation.is_active()
    }

    /// Name of the authenticated peer, for diagnostics.
    #[must_use]
    pub fn caller_name(&self) -> Option<String> {
        self.provider.caller_name()
    }

    fn expect(&self, role: Role, states: &[ContextState], operation: &'static str) -> AuthResult<()> {
        if self.role != role || !states.contains(&self.state) {
            return Err(AuthError::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, step: ProviderStep) -> AuthResult<Negotiation> {
        match step {
            ProviderStep::ContinueNeeded { token } => {
                self.rounds += 1;
                debug!(role = ?self.role, round = self.rounds, "handshake continues");
                Ok(Negotiation::Continue(token))
            }
            ProviderStep::Accepted { token } => {
                debug!(
                    role = ?self.role,
                    rounds = self.rounds + 1,
                    caller = ?self.provider.caller_name(),
                    "security context established"
                );
                self.state = ContextState::Established;
                self.rounds = 0;
                Ok(Negotiation::Complete(token))
            }
            ProviderStep::Fatal { code, reason } => {
                warn!(role = ?self.role, round = self.rounds, code, %reason, "handshake failed");
                self.state = ContextState::Failed;
                Err(AuthError::Fatal { code, reason })
            }
        }
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.impersonation.revert();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    fn pair(provider: &ScriptedProvider) -> (SecurityContext, SecurityContext) {
        let client = SecurityContext::initiator(provider, &Credential::Current, "host/test").unwrap();
        let server = SecurityContext::acceptor(provider, &Credential::Current).unwrap();
        (client, server)
    }

    /// Drive both contexts to completion, returning the number of tokens exchanged.
    fn run(client: &mut SecurityContext, server: &mut SecurityContext) -> AuthResult<usize> {
        let mut exchanged = 0;
        let mut outgoing = match client.initiate()? {
            Negotiation::Continue(token) => token,
            Negotiation::Complete(_) => return Ok(exchanged),
        };
        loop {
            exchanged += 1;
            let reply = match server.accept_token(&outgoing)? {
                Negotiation::Continue(token) => token,
                Negotiation::Complete(token) => {
                    if let Some(token) = token {
                        exchanged += 1;
                        client.continue_with(&token)?;
                    }
                    return Ok(exchanged);
                }
            };
            exchanged += 1;
            match client.continue_with(&reply)? {
                Negotiation::Continue(token) => outgoing = token,
                Negotiation::Complete(_) => return Ok(exchanged),
            }
        }
    }

    #[test]
    fn test_handshake_reaches_established() {
        let provider = ScriptedProvider::new(3);
        let (mut client, mut server) = pair(&provider);

        assert_eq!(client.state(), ContextState::Idle);
        run(&mut client, &mut server).unwrap();

        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(server.rounds(), 0);
        assert_eq!(server.caller_name().as_deref(), Some("scripted-user"));
    }

    #[test]
    fn test_fatal_status_fails_context() {
        let provider = ScriptedProvider::new(3).fail_at_round(2);
        let (mut client, mut server) = pair(&provider);

        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, AuthError::Fatal { .. }));
        assert_eq!(server.state(), ContextState::Failed);
        assert!(!server.is_established());
        assert_eq!(
            server.impersonate_caller().unwrap_err(),
            AuthError::NotEstablished
        );
    }

    #[test]
    fn test_wrong_role_calls_rejected() {
        let provider = ScriptedProvider::new(2);
        let (mut client, mut server) = pair(&provider);

        assert!(matches!(
            server.initiate(),
            Err(AuthError::InvalidState { operation: "initiate", .. })
        ));
        assert!(matches!(
            client.accept_token(b"x"),
            Err(AuthError::InvalidState { .. })
        ));
        assert!(matches!(
            client.continue_with(b"x"),
            Err(AuthError::InvalidState { state: "idle", .. })
        ));
    }

    #[test]
    fn test_no_calls_after_established() {
        let provider = ScriptedProvider::new(1);
        let (mut client, mut server) = pair(&provider);
        run(&mut client, &mut server).unwrap();

        assert!(server.accept_token(b"again").is_err());
        assert!(client.initiate().is_err());
    }

    #[test]
    fn test_impersonation_requires_acceptor() {
        let provider = ScriptedProvider::new(1);
        let (mut client, mut server) = pair(&provider);
        run(&mut client, &mut server).unwrap();

        assert_eq!(client.impersonate_caller().unwrap_err(), AuthError::NotAcceptor);

        let scope = server.impersonate_caller().unwrap();
        assert!(server.is_impersonating());
        assert_eq!(scope.principal().unwrap().name, "scripted-user");
        assert_eq!(
            server.impersonate_caller().unwrap_err(),
            AuthError::ImpersonationActive
        );

        drop(scope);
        assert!(!server.is_impersonating());
    }

    #[test]
    fn test_revert_is_idempotent() {
        let provider = ScriptedProvider::new(1);
        let (mut client, mut server) = pair(&provider);

        // Before any scope exists.
        server.revert_impersonation();
        run(&mut client, &mut server).unwrap();

        let scope = server.impersonate_caller().unwrap();
        server.revert_impersonation();
        server.revert_impersonation();
        assert!(!scope.is_active());
        assert!(server.impersonate_caller().is_ok());
    }

    #[test]
    fn test_provider_handle_released_once() {
        let provider = ScriptedProvider::new(2).fail_at_round(1);
        {
            let (mut client, mut server) = pair(&provider);
            assert_eq!(provider.live_handles(), 2);
            let _ = run(&mut client, &mut server);
            assert_eq!(provider.live_handles(), 2);
        }
        assert_eq!(provider.live_handles(), 0);
        assert_eq!(provider.released_handles(), 2);
    }

    #[test]
    fn test_drop_revokes_outstanding_scope() {
        let provider = ScriptedProvider::new(1);
        let (mut client, mut server) = pair(&provider);
        run(&mut client, &mut server).unwrap();

        let scope = server.impersonate_caller().unwrap();
        drop(server);
        assert!(scope.principal().is_err());
    }
}
