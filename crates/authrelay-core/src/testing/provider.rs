//! A deterministic security provider for tests.
//!
//! Tokens are plain text. The initiator's first token names the identity it
//! claims (`scripted-1 direct alice` or `scripted-1 delegated alice`), later
//! tokens only carry the round number. The acceptor answers every round with
//! `ContinueNeeded` until the configured number of rounds is reached, then
//! accepts and sends `scripted-done`, which completes the initiator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::{
    status, AuthMethod, Credential, Negotiation, Principal, ProviderContext, ProviderStep,
    SecurityContext, SecurityProvider,
};
use crate::error::{AuthError, AuthResult};

/// Caller name produced by [`Credential::Current`].
pub const SCRIPTED_USER: &str = "scripted-user";

/// Service name recorded on delegated principals.
pub const SCRIPTED_SERVICE: &str = "scripted-service";

const DONE: &str = "scripted-done";

#[derive(Debug, Default)]
struct HandleCounters {
    live: AtomicUsize,
    released: AtomicUsize,
}

/// Provider whose handshake takes a fixed number of acceptor rounds.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    rounds: u32,
    fail_at: Option<u32>,
    counters: Arc<HandleCounters>,
}

impl ScriptedProvider {
    /// A provider that establishes after `rounds` acceptor rounds (at least one).
    #[must_use]
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds: rounds.max(1),
            fail_at: None,
            counters: Arc::default(),
        }
    }

    /// Make the acceptor report a fatal status on the given round (1-based).
    #[must_use]
    pub fn fail_at_round(mut self, round: u32) -> Self {
        self.fail_at = Some(round);
        self
    }

    /// Provider contexts created and not yet dropped.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Provider contexts dropped so far.
    #[must_use]
    pub fn released_handles(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    fn handle(&self, kind: HandleKind) -> Box<dyn ProviderContext> {
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedHandle {
            kind,
            rounds: self.rounds,
            fail_at: self.fail_at,
            round: 0,
            caller: None,
            done: false,
            counters: Arc::clone(&self.counters),
        })
    }
}

impl SecurityProvider for ScriptedProvider {
    fn package(&self) -> &str {
        "SCRIPTED"
    }

    fn initiator_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>> {
        let claim = match credential {
            Credential::Current => Claim::Direct(SCRIPTED_USER.to_string()),
            Credential::Password { username, .. } => Claim::Direct(username.clone()),
            Credential::Impersonated { principal } => Claim::Delegated(principal.name.clone()),
            Credential::DelegationToken(token) => Claim::Delegated(token.clone()),
            Credential::Keytab { username, .. } => Claim::Direct(username.clone()),
        };
        Ok(self.handle(HandleKind::Initiator(claim)))
    }

    fn acceptor_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>> {
        match credential {
            Credential::Current => Ok(self.handle(HandleKind::Acceptor)),
            other => Err(AuthError::UnsupportedCredential(format!(
                "scripted acceptor cannot use a {} credential",
                other.kind()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
enum Claim {
    Direct(String),
    Delegated(String),
}

impl Claim {
    fn parse(mode: &str, name: &str) -> Option<Self> {
        match mode {
            "direct" => Some(Self::Direct(name.to_string())),
            "delegated" => Some(Self::Delegated(name.to_string())),
            _ => None,
        }
    }

    fn encode(&self) -> String {
        match self {
            Self::Direct(name) => format!("direct {name}"),
            Self::Delegated(name) => format!("delegated {name}"),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Direct(name) | Self::Delegated(name) => name,
        }
    }

    fn principal(&self) -> Principal {
        match self {
            Self::Direct(name) => Principal::new(name.clone(), AuthMethod::Password),
            Self::Delegated(name) => Principal::delegated(name.clone(), SCRIPTED_SERVICE),
        }
    }
}

#[derive(Debug)]
enum HandleKind {
    Initiator(Claim),
    Acceptor,
}

#[derive(Debug)]
struct ScriptedHandle {
    kind: HandleKind,
    rounds: u32,
    fail_at: Option<u32>,
    round: u32,
    caller: Option<Claim>,
    done: bool,
    counters: Arc<HandleCounters>,
}

impl ProviderContext for ScriptedHandle {
    fn initialize(&mut self, _target: &str, incoming: Option<&[u8]>) -> ProviderStep {
        let HandleKind::Initiator(claim) = &self.kind else {
            return ProviderStep::fatal(status::OUT_OF_SEQUENCE, "acceptor cannot initialize");
        };
        if self.done {
            return ProviderStep::fatal(status::OUT_OF_SEQUENCE, "handshake already complete");
        }
        match incoming {
            None => {
                self.round = 1;
                ProviderStep::ContinueNeeded {
                    token: format!("scripted-1 {}", claim.encode()).into_bytes(),
                }
            }
            Some(token) if token == DONE.as_bytes() => {
                self.done = true;
                ProviderStep::Accepted { token: None }
            }
            Some(_) => {
                self.round += 1;
                ProviderStep::ContinueNeeded {
                    token: format!("scripted-{}", self.round).into_bytes(),
                }
            }
        }
    }

    fn accept(&mut self, incoming: &[u8]) -> ProviderStep {
        if !matches!(self.kind, HandleKind::Acceptor) {
            return ProviderStep::fatal(status::OUT_OF_SEQUENCE, "initiator cannot accept");
        }
        if self.done {
            return ProviderStep::fatal(status::OUT_OF_SEQUENCE, "handshake already complete");
        }
        self.round += 1;

        let text = String::from_utf8_lossy(incoming);
        let mut parts = text.split(' ');
        if parts.next() != Some(format!("scripted-{}", self.round).as_str()) {
            return ProviderStep::fatal(
                status::INVALID_TOKEN,
                format!("unexpected token for round {}", self.round),
            );
        }
        if self.round == 1 {
            let claim = match (parts.next(), parts.next()) {
                (Some(mode), Some(name)) if !name.is_empty() => Claim::parse(mode, name),
                _ => None,
            };
            match claim {
                Some(claim) => self.caller = Some(claim),
                None => return ProviderStep::fatal(status::INVALID_TOKEN, "missing claim"),
            }
        }

        if self.fail_at == Some(self.round) {
            return ProviderStep::fatal(
                status::LOGON_DENIED,
                format!("scripted failure at round {}", self.round),
            );
        }
        if self.round < self.rounds {
            return ProviderStep::ContinueNeeded {
                token: format!("scripted-ack-{}", self.round).into_bytes(),
            };
        }
        self.done = true;
        ProviderStep::Accepted {
            token: Some(DONE.as_bytes().to_vec()),
        }
    }

    fn impersonate_caller(&self) -> AuthResult<Principal> {
        match (&self.kind, &self.caller) {
            (HandleKind::Acceptor, Some(claim)) if self.done => Ok(claim.principal()),
            (HandleKind::Acceptor, _) => Err(AuthError::NotEstablished),
            (HandleKind::Initiator(_), _) => Err(AuthError::NotAcceptor),
        }
    }

    fn caller_name(&self) -> Option<String> {
        self.caller.as_ref().map(|claim| claim.name().to_string())
    }
}

/// Run a complete in-memory handshake and return the established acceptor.
///
/// # Errors
///
/// Returns the first error either side reports.
pub fn establish(provider: &dyn SecurityProvider, credential: &Credential) -> AuthResult<SecurityContext> {
    let mut client = SecurityContext::initiator(provider, credential, "host/in-memory")?;
    let mut server = SecurityContext::acceptor(provider, &Credential::Current)?;

    let mut outgoing = match client.initiate()? {
        Negotiation::Continue(token) => token,
        Negotiation::Complete(_) => return Err(AuthError::NotEstablished),
    };
    loop {
        match server.accept_token(&outgoing)? {
            Negotiation::Continue(token) => match client.continue_with(&token)? {
                Negotiation::Continue(token) => outgoing = token,
                Negotiation::Complete(_) => return Err(AuthError::NotEstablished),
            },
            Negotiation::Complete(token) => {
                if let Some(token) = token {
                    client.continue_with(&token)?;
                }
                return Ok(server);
            }
        }
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}
