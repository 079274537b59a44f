//! SCRAM-backed security provider with identity delegation.
//!
//! SCRAM (Salted Challenge Response Authentication Mechanism) provides mutual
//! password-based authentication without transmitting the password. The four
//! messages map onto the relay handshake as:
//!
//! ```text
//! initiator                                   acceptor
//!   client-first  ──── client_token ────►
//!                 ◄─── server_token ────  server-first   (ContinueNeeded)
//!   client-final  ──── client_token ────►
//!                 ◄─── server_token ────  server-final   (Accepted)
//!   verify v=                                            (Accepted)
//! ```
//!
//! # Delegation
//!
//! An initiator acting for someone else authenticates with the provider's own
//! service credential and names the asserted identity in the GS2 header
//! (`n,a=alice,`). The channel-binding field repeats the header, so the
//! assertion is covered by the client proof. The acceptor honours the
//! assertion only when the authenticated principal is listed as a trusted
//! delegate.
//!
//! Supports:
//! - SCRAM-SHA-256 (RFC 7677)
//! - SCRAM-SHA-512 (RFC 7677 variant)

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, warn};

use super::credentials::{create_credential_store, Credential, CredentialStore};
use super::principal::{AuthMethod, Principal};
use super::provider::{status, ProviderContext, ProviderStep, SecurityProvider};
use crate::config::{principal_name, SecurityConfig, UserCredential, MIN_ITERATIONS};
use crate::error::{AuthError, AuthResult};

/// Default number of PBKDF2 iterations
pub const DEFAULT_ITERATIONS: u32 = MIN_ITERATIONS;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 16;

/// Nonce length in bytes
pub const NONCE_LENGTH: usize = 24;

/// SCRAM credentials stored for a user.
#[derive(Debug, Clone)]
pub struct ScramCredentials {
    /// Random salt used for key derivation.
    pub salt: Vec<u8>,
    /// Number of PBKDF2 iterations.
    pub iterations: u32,
    /// Stored key: H(ClientKey) where ClientKey = HMAC(SaltedPassword, "Client Key")
    pub stored_key: Vec<u8>,
    /// Server key: HMAC(SaltedPassword, "Server Key")
    pub server_key: Vec<u8>,
}

/// Hash algorithm trait for SCRAM variants.
pub trait ScramHash: Send + Sync + std::fmt::Debug + 'static {
    /// The hash algorithm name.
    fn name() -> &'static str;
    /// Compute HMAC.
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    /// Compute hash.
    fn hash(data: &[u8]) -> Vec<u8>;
    /// Derive key using PBKDF2.
    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

/// SHA-256 implementation for SCRAM.
#[derive(Debug)]
pub struct ScramSha256;

impl ScramHash for ScramSha256 {
    fn name() -> &'static str {
        "SCRAM-SHA-256"
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
        output
    }
}

/// SHA-512 implementation for SCRAM.
#[derive(Debug)]
pub struct ScramSha512;

impl ScramHash for ScramSha512 {
    fn name() -> &'static str {
        "SCRAM-SHA-512"
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 64];
        pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut output);
        output
    }
}

/// Generate SCRAM credentials with a fresh random salt.
pub fn generate_scram_credentials<H: ScramHash>(password: &str, iterations: u32) -> ScramCredentials {
    let salt: [u8; SALT_LENGTH] = rand::thread_rng().gen();
    generate_scram_credentials_with_salt::<H>(password, &salt, iterations)
}

/// Generate SCRAM credentials with specific salt and iterations.
pub fn generate_scram_credentials_with_salt<H: ScramHash>(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> ScramCredentials {
    let salted_password = H::pbkdf2(password.as_bytes(), salt, iterations);
    let client_key = H::hmac(&salted_password, b"Client Key");
    let stored_key = H::hash(&client_key);
    let server_key = H::hmac(&salted_password, b"Server Key");

    ScramCredentials {
        salt: salt.to_vec(),
        iterations,
        stored_key,
        server_key,
    }
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

fn random_nonce() -> String {
    let random_bytes: [u8; NONCE_LENGTH] = rand::thread_rng().gen();
    BASE64.encode(random_bytes)
}

// ============================================================================
// Message formatting and parsing
// ============================================================================

/// Escape a name for use in `n=` / `a=` attributes (RFC 5802 saslname).
#[must_use]
pub fn escape_saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Reverse [`escape_saslname`].
///
/// # Errors
///
/// Returns an error for a `=` not followed by `2C` or `3D`.
pub fn unescape_saslname(value: &str) -> AuthResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('=') {
        out.push_str(&rest[..idx]);
        let escape = rest.get(idx..idx + 3);
        match escape {
            Some("=2C") => out.push(','),
            Some("=3D") => out.push('='),
            _ => {
                return Err(AuthError::InvalidMessage(format!(
                    "invalid escape in saslname '{value}'"
                )))
            }
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// GS2 header: `n,,` or `n,a=<authzid>,`.
#[must_use]
pub fn gs2_header(authzid: Option<&str>) -> String {
    match authzid {
        Some(name) => format!("n,a={},", escape_saslname(name)),
        None => "n,,".to_string(),
    }
}

/// Parsed client-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFirst {
    /// GS2 header including the trailing comma.
    pub gs2_header: String,
    /// Identity asserted in the header, if any.
    pub authzid: Option<String>,
    /// Message without the GS2 header.
    pub bare: String,
    pub username: String,
    pub nonce: String,
}

/// Parse client-first-message.
///
/// Format: `gs2-cbind-flag,[a=authzid],n=username,r=client-nonce`
///
/// # Errors
///
/// Returns an error if the header requests channel binding or any attribute
/// is missing.
pub fn parse_client_first_message(message: &str) -> AuthResult<ClientFirst> {
    let mut parts = message.splitn(3, ',');
    let flag = parts.next().unwrap_or_default();
    let authz = parts.next();
    let bare = parts.next();

    let (Some(authz), Some(bare)) = (authz, bare) else {
        return Err(AuthError::InvalidMessage(
            "invalid GS2 header format".to_string(),
        ));
    };

    if flag != "n" {
        return Err(AuthError::InvalidMessage(
            "channel binding not supported".to_string(),
        ));
    }

    let authzid = if authz.is_empty() {
        None
    } else if let Some(value) = authz.strip_prefix("a=") {
        Some(unescape_saslname(value)?)
    } else {
        return Err(AuthError::InvalidMessage(format!(
            "invalid authorization identity '{authz}'"
        )));
    };

    let mut username = None;
    let mut nonce = None;
    for part in bare.split(',') {
        if let Some(value) = part.strip_prefix("n=") {
            username = Some(unescape_saslname(value)?);
        } else if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        }
    }

    let username =
        username.ok_or_else(|| AuthError::InvalidMessage("missing username".to_string()))?;
    let nonce = nonce.ok_or_else(|| AuthError::InvalidMessage("missing client nonce".to_string()))?;

    Ok(ClientFirst {
        gs2_header: format!("{flag},{authz},"),
        authzid,
        bare: bare.to_string(),
        username,
        nonce,
    })
}

/// Parse server-first-message to extract combined nonce, salt, and iterations.
///
/// # Errors
///
/// Returns an error if any attribute is missing or malformed.
pub fn parse_server_first_message(message: &str) -> AuthResult<(String, Vec<u8>, u32)> {
    let mut combined_nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            combined_nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|e| AuthError::InvalidMessage(format!("invalid base64 salt: {e}")))?,
            );
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(value.parse::<u32>().map_err(|e| {
                AuthError::InvalidMessage(format!("invalid iteration count: {e}"))
            })?);
        }
    }

    let missing = |what: &str| AuthError::InvalidMessage(format!("missing {what}"));
    Ok((
        combined_nonce.ok_or_else(|| missing("nonce (r=)"))?,
        salt.ok_or_else(|| missing("salt (s=)"))?,
        iterations.ok_or_else(|| missing("iterations (i=)"))?,
    ))
}

/// Parsed client-final-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinal {
    /// Decoded channel-binding attribute.
    pub channel_binding: Vec<u8>,
    pub nonce: String,
    /// Message up to (not including) `,p=`.
    pub without_proof: String,
    pub proof: Vec<u8>,
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=combined-nonce,p=client-proof`
///
/// # Errors
///
/// Returns an error if any attribute is missing or malformed.
pub fn parse_client_final_message(message: &str) -> AuthResult<ClientFinal> {
    let Some(idx) = message.rfind(",p=") else {
        return Err(AuthError::InvalidMessage("missing client proof".to_string()));
    };
    let proof = BASE64
        .decode(&message[idx + 3..])
        .map_err(|_| AuthError::InvalidMessage("invalid proof encoding".to_string()))?;
    let without_proof = &message[..idx];

    let mut channel_binding = None;
    let mut nonce = None;
    for part in without_proof.split(',') {
        if let Some(value) = part.strip_prefix("c=") {
            channel_binding = Some(BASE64.decode(value).map_err(|_| {
                AuthError::InvalidMessage("invalid channel binding encoding".to_string())
            })?);
        } else if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        }
    }

    Ok(ClientFinal {
        channel_binding: channel_binding.ok_or_else(|| {
            AuthError::InvalidMessage("missing channel binding in client-final".to_string())
        })?,
        nonce: nonce.ok_or_else(|| AuthError::InvalidMessage("missing nonce in final".to_string()))?,
        without_proof: without_proof.to_string(),
        proof,
    })
}

fn utf8(token: &[u8]) -> AuthResult<&str> {
    std::str::from_utf8(token)
        .map_err(|_| AuthError::InvalidMessage("invalid UTF-8 in SCRAM message".to_string()))
}

fn fatal_for(err: &AuthError) -> ProviderStep {
    let code = match err {
        AuthError::InvalidCredentials | AuthError::UnknownPrincipal(_) => status::LOGON_DENIED,
        AuthError::DelegationNotPermitted { .. } => status::DELEGATION_POLICY,
        _ => status::INVALID_TOKEN,
    };
    ProviderStep::fatal(code, err.to_string())
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug)]
struct ServiceIdentity {
    name: String,
    password: String,
}

/// Accepting-side data shared by every context of one provider.
#[derive(Debug)]
struct AcceptorRealm {
    users: HashMap<String, ScramCredentials>,
    trusted_delegates: HashSet<String>,
}

/// SCRAM security provider.
///
/// Stored keys are derived once, when the provider is built.
#[derive(Debug)]
pub struct ScramProvider<H: ScramHash> {
    realm: Arc<AcceptorRealm>,
    service: Option<Arc<ServiceIdentity>>,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> ScramProvider<H> {
    /// Create a provider accepting every user in `store`.
    #[must_use]
    pub fn new(store: &dyn CredentialStore, iterations: u32) -> Self {
        let users = store
            .users()
            .into_iter()
            .map(|user| {
                let creds = generate_scram_credentials::<H>(&user.password, iterations);
                (user.username, creds)
            })
            .collect();

        Self {
            realm: Arc::new(AcceptorRealm {
                users,
                trusted_delegates: HashSet::new(),
            }),
            service: None,
            _marker: PhantomData,
        }
    }

    /// Identity used for [`Credential::Current`] and for delegated handshakes.
    #[must_use]
    pub fn with_service(mut self, service: &UserCredential) -> Self {
        self.service = Some(Arc::new(ServiceIdentity {
            name: service.principal_name(),
            password: service.password(),
        }));
        self
    }

    /// Principals allowed to assert another identity.
    #[must_use]
    pub fn with_trusted_delegates<I, S>(mut self, delegates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let realm = AcceptorRealm {
            users: self.realm.users.clone(),
            trusted_delegates: delegates.into_iter().map(Into::into).collect(),
        };
        self.realm = Arc::new(realm);
        self
    }

    /// Names of the users this provider accepts.
    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.realm.users.keys().map(String::as_str)
    }

    fn service(&self, purpose: &str) -> AuthResult<&ServiceIdentity> {
        self.service.as_deref().ok_or_else(|| {
            AuthError::UnsupportedCredential(format!("no service credential configured for {purpose}"))
        })
    }
}

impl<H: ScramHash> SecurityProvider for ScramProvider<H> {
    fn package(&self) -> &str {
        H::name()
    }

    fn initiator_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>> {
        let (username, password, authzid) = match credential {
            Credential::Current => {
                let service = self.service("the current identity")?;
                (service.name.clone(), service.password.clone(), None)
            }
            Credential::Password {
                username,
                password,
                domain,
            } => (
                principal_name(username, domain.as_deref()),
                password.clone(),
                None,
            ),
            Credential::Impersonated { principal } => {
                let service = self.service("impersonation")?;
                (
                    service.name.clone(),
                    service.password.clone(),
                    Some(principal.name.clone()),
                )
            }
            Credential::DelegationToken(token) => {
                if token.is_empty() {
                    return Err(AuthError::UnsupportedCredential(
                        "empty delegation token".to_string(),
                    ));
                }
                let service = self.service("delegation")?;
                (
                    service.name.clone(),
                    service.password.clone(),
                    Some(token.clone()),
                )
            }
            Credential::Keytab { .. } => {
                return Err(AuthError::UnsupportedCredential(format!(
                    "{} does not accept keytab credentials",
                    H::name()
                )));
            }
        };

        debug!(
            mechanism = H::name(),
            credential = credential.kind(),
            username = %username,
            authzid = ?authzid,
            "created initiator context"
        );

        Ok(Box::new(ScramInitiator::<H> {
            username,
            password,
            authzid,
            state: InitiatorState::Start,
            _marker: PhantomData,
        }))
    }

    fn acceptor_context(&self, credential: &Credential) -> AuthResult<Box<dyn ProviderContext>> {
        let acceptor = match credential {
            Credential::Current => self
                .service
                .as_ref()
                .map_or_else(|| "<unnamed>".to_string(), |s| s.name.clone()),
            Credential::Password {
                username, domain, ..
            } => principal_name(username, domain.as_deref()),
            other => {
                return Err(AuthError::UnsupportedCredential(format!(
                    "{} credential cannot accept handshakes",
                    other.kind()
                )))
            }
        };

        Ok(Box::new(ScramAcceptor::<H> {
            realm: Arc::clone(&self.realm),
            acceptor,
            state: AcceptorState::AwaitingClientFirst,
            _marker: PhantomData,
        }))
    }
}

/// Type aliases for convenience
pub type ScramSha256Provider = ScramProvider<ScramSha256>;
pub type ScramSha512Provider = ScramProvider<ScramSha512>;

/// Build the provider described by `config`.
///
/// # Errors
///
/// Returns an error if the credential store cannot be loaded.
pub fn create_provider(config: &SecurityConfig) -> AuthResult<Arc<dyn SecurityProvider>> {
    let store = create_credential_store(&config.credentials)?;

    fn build<H: ScramHash>(
        store: &dyn CredentialStore,
        config: &SecurityConfig,
    ) -> Arc<dyn SecurityProvider> {
        let mut provider = ScramProvider::<H>::new(store, config.iterations)
            .with_trusted_delegates(config.trusted_delegates.iter().cloned());
        if let Some(service) = &config.service {
            provider = provider.with_service(service);
        }
        info!(
            mechanism = H::name(),
            users = provider.realm.users.len(),
            service = ?provider.service.as_ref().map(|s| s.name.as_str()),
            trusted_delegates = config.trusted_delegates.len(),
            "security provider ready"
        );
        Arc::new(provider)
    }

    Ok(match config.mechanism {
        crate::config::Mechanism::ScramSha256 => build::<ScramSha256>(store.as_ref(), config),
        crate::config::Mechanism::ScramSha512 => build::<ScramSha512>(store.as_ref(), config),
    })
}

// ============================================================================
// Initiator
// ============================================================================

#[derive(Debug)]
enum InitiatorState {
    Start,
    AwaitingServerFirst {
        gs2_header: String,
        client_nonce: String,
        client_first_bare: String,
    },
    AwaitingServerFinal {
        expected_verifier: String,
    },
    Done,
    Failed,
}

struct ScramInitiator<H: ScramHash> {
    username: String,
    password: String,
    authzid: Option<String>,
    state: InitiatorState,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> std::fmt::Debug for ScramInitiator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramInitiator")
            .field("username", &self.username)
            .field("authzid", &self.authzid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<H: ScramHash> ScramInitiator<H> {
    fn client_first(&mut self) -> ProviderStep {
        let client_nonce = random_nonce();
        let gs2_header = gs2_header(self.authzid.as_deref());
        let client_first_bare = format!("n={},r={client_nonce}", escape_saslname(&self.username));
        let message = format!("{gs2_header}{client_first_bare}");

        self.state = InitiatorState::AwaitingServerFirst {
            gs2_header,
            client_nonce,
            client_first_bare,
        };
        ProviderStep::ContinueNeeded {
            token: message.into_bytes(),
        }
    }

    fn client_final(
        &self,
        server_first: &str,
        gs2_header: &str,
        client_nonce: &str,
        client_first_bare: &str,
    ) -> AuthResult<(String, String)> {
        let (combined_nonce, salt, iterations) = parse_server_first_message(server_first)?;

        if !combined_nonce.starts_with(client_nonce) || combined_nonce.len() == client_nonce.len() {
            return Err(AuthError::InvalidMessage(
                "server nonce does not extend client nonce".to_string(),
            ));
        }
        if iterations < MIN_ITERATIONS {
            return Err(AuthError::InvalidMessage(format!(
                "iteration count {iterations} below minimum"
            )));
        }

        let salted_password = H::pbkdf2(self.password.as_bytes(), &salt, iterations);
        let client_key = H::hmac(&salted_password, b"Client Key");
        let stored_key = H::hash(&client_key);
        let server_key = H::hmac(&salted_password, b"Server Key");

        let channel_binding = BASE64.encode(gs2_header.as_bytes());
        let without_proof = format!("c={channel_binding},r={combined_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = H::hmac(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);
        let server_signature = H::hmac(&server_key, auth_message.as_bytes());

        Ok((
            format!("{without_proof},p={}", BASE64.encode(client_proof)),
            format!("v={}", BASE64.encode(server_signature)),
        ))
    }
}

impl<H: ScramHash> ProviderContext for ScramInitiator<H> {
    fn initialize(&mut self, target: &str, incoming: Option<&[u8]>) -> ProviderStep {
        let state = std::mem::replace(&mut self.state, InitiatorState::Failed);
        match (state, incoming) {
            (InitiatorState::Start, None) => {
                debug!(target, "SCRAM: sending client-first-message");
                self.client_first()
            }
            (
                InitiatorState::AwaitingServerFirst {
                    gs2_header,
                    client_nonce,
                    client_first_bare,
                },
                Some(token),
            ) => {
                let result = utf8(token).and_then(|server_first| {
                    self.client_final(server_first, &gs2_header, &client_nonce, &client_first_bare)
                });
                match result {
                    Ok((client_final, expected_verifier)) => {
                        debug!("SCRAM: sending client-final-message");
                        self.state = InitiatorState::AwaitingServerFinal { expected_verifier };
                        ProviderStep::ContinueNeeded {
                            token: client_final.into_bytes(),
                        }
                    }
                    Err(e) => fatal_for(&e),
                }
            }
            (InitiatorState::AwaitingServerFinal { expected_verifier }, Some(token)) => {
                let server_final = match utf8(token) {
                    Ok(s) => s,
                    Err(e) => return fatal_for(&e),
                };
                if let Some(error) = server_final.strip_prefix("e=") {
                    return ProviderStep::fatal(
                        status::LOGON_DENIED,
                        format!("server rejected authentication: {error}"),
                    );
                }
                if server_final != expected_verifier {
                    warn!(username = %self.username, "SCRAM: server signature verification failed");
                    return ProviderStep::fatal(
                        status::MUTUAL_AUTH_FAILED,
                        "server signature verification failed",
                    );
                }
                debug!(username = %self.username, "SCRAM: server verified");
                self.state = InitiatorState::Done;
                ProviderStep::Accepted { token: None }
            }
            (state, _) => {
                let reason = format!("unexpected initiator call in state {state:?}");
                ProviderStep::fatal(status::OUT_OF_SEQUENCE, reason)
            }
        }
    }

    fn accept(&mut self, _incoming: &[u8]) -> ProviderStep {
        self.state = InitiatorState::Failed;
        ProviderStep::fatal(status::OUT_OF_SEQUENCE, "initiator context cannot accept")
    }

    fn impersonate_caller(&self) -> AuthResult<Principal> {
        Err(AuthError::NotAcceptor)
    }

    fn caller_name(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Acceptor
// ============================================================================

#[derive(Debug)]
enum AcceptorState {
    AwaitingClientFirst,
    AwaitingClientFinal {
        first: ClientFirst,
        server_first: String,
        combined_nonce: String,
    },
    Done {
        principal: Principal,
    },
    Failed,
}

struct ScramAcceptor<H: ScramHash> {
    realm: Arc<AcceptorRealm>,
    acceptor: String,
    state: AcceptorState,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> std::fmt::Debug for ScramAcceptor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramAcceptor")
            .field("acceptor", &self.acceptor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<H: ScramHash> ScramAcceptor<H> {
    fn credentials(&self, username: &str) -> AuthResult<&ScramCredentials> {
        self.realm
            .users
            .get(username)
            .ok_or_else(|| AuthError::UnknownPrincipal(username.to_string()))
    }

    /// Generate server-first-message.
    ///
    /// Format: `r=combined-nonce,s=salt,i=iterations`
    fn server_first(&self, first: &ClientFirst) -> AuthResult<(String, String)> {
        let credentials = self.credentials(&first.username)?;

        let mut rng = rand::thread_rng();
        let server_nonce: String = (0..NONCE_LENGTH)
            .map(|_| {
                let idx = rng.gen_range(0..62u8);
                match idx {
                    0..=9 => (b'0' + idx) as char,
                    10..=35 => (b'a' + idx - 10) as char,
                    _ => (b'A' + idx - 36) as char,
                }
            })
            .collect();

        let combined_nonce = format!("{}{server_nonce}", first.nonce);
        let message = format!(
            "r={combined_nonce},s={},i={}",
            BASE64.encode(&credentials.salt),
            credentials.iterations
        );
        Ok((message, combined_nonce))
    }

    /// Verify the client proof, apply delegation policy and sign.
    fn verify(
        &self,
        first: &ClientFirst,
        server_first: &str,
        combined_nonce: &str,
        message: &str,
    ) -> AuthResult<(Principal, String)> {
        let fin = parse_client_final_message(message)?;

        if fin.nonce != combined_nonce {
            warn!("SCRAM: nonce mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        if fin.channel_binding != first.gs2_header.as_bytes() {
            return Err(AuthError::InvalidMessage(
                "channel binding does not match GS2 header".to_string(),
            ));
        }

        let credentials = self.credentials(&first.username)?;
        let auth_message = format!("{},{server_first},{}", first.bare, fin.without_proof);

        // ClientKey = ClientProof XOR ClientSignature; verify H(ClientKey) == StoredKey
        let client_signature = H::hmac(&credentials.stored_key, auth_message.as_bytes());
        if fin.proof.len() != client_signature.len()
            || H::hash(&xor(&fin.proof, &client_signature)) != credentials.stored_key
        {
            warn!(username = %first.username, "SCRAM: authentication failed");
            return Err(AuthError::InvalidCredentials);
        }

        let principal = match &first.authzid {
            Some(asserted) if asserted != &first.username => {
                if !self.realm.trusted_delegates.contains(&first.username) {
                    warn!(
                        principal = %first.username,
                        asserted = %asserted,
                        "SCRAM: delegation refused"
                    );
                    return Err(AuthError::DelegationNotPermitted {
                        principal: first.username.clone(),
                        asserted: asserted.clone(),
                    });
                }
                Principal::delegated(asserted.clone(), first.username.clone())
            }
            _ => Principal::new(first.username.clone(), AuthMethod::Password),
        };

        let server_signature = H::hmac(&credentials.server_key, auth_message.as_bytes());
        Ok((principal, format!("v={}", BASE64.encode(server_signature))))
    }
}

impl<H: ScramHash> ProviderContext for ScramAcceptor<H> {
    fn initialize(&mut self, _target: &str, _incoming: Option<&[u8]>) -> ProviderStep {
        ProviderStep::fatal(status::OUT_OF_SEQUENCE, "acceptor context cannot initiate")
    }

    fn accept(&mut self, incoming: &[u8]) -> ProviderStep {
        if matches!(self.state, AcceptorState::Done { .. } | AcceptorState::Failed) {
            return ProviderStep::fatal(
                status::OUT_OF_SEQUENCE,
                "acceptor context already completed",
            );
        }

        let state = std::mem::replace(&mut self.state, AcceptorState::Failed);
        let message = match utf8(incoming) {
            Ok(m) => m,
            Err(e) => return fatal_for(&e),
        };

        match state {
            AcceptorState::AwaitingClientFirst => {
                debug!(acceptor = %self.acceptor, "SCRAM: processing client-first-message");
                let result = parse_client_first_message(message)
                    .and_then(|first| self.server_first(&first).map(|sf| (first, sf)));
                match result {
                    Ok((first, (server_first, combined_nonce))) => {
                        self.state = AcceptorState::AwaitingClientFinal {
                            first,
                            server_first: server_first.clone(),
                            combined_nonce,
                        };
                        ProviderStep::ContinueNeeded {
                            token: server_first.into_bytes(),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "SCRAM: rejected client-first-message");
                        fatal_for(&e)
                    }
                }
            }
            AcceptorState::AwaitingClientFinal {
                first,
                server_first,
                combined_nonce,
            } => {
                debug!("SCRAM: processing client-final-message");
                match self.verify(&first, &server_first, &combined_nonce, message) {
                    Ok((principal, server_final)) => {
                        debug!(principal = %principal, "SCRAM: authentication successful");
                        self.state = AcceptorState::Done { principal };
                        ProviderStep::Accepted {
                            token: Some(server_final.into_bytes()),
                        }
                    }
                    Err(e) => fatal_for(&e),
                }
            }
            AcceptorState::Done { .. } | AcceptorState::Failed => {
                ProviderStep::fatal(status::OUT_OF_SEQUENCE, "acceptor context already completed")
            }
        }
    }

    fn impersonate_caller(&self) -> AuthResult<Principal> {
        match &self.state {
            AcceptorState::Done { principal } => Ok(principal.clone()),
            _ => Err(AuthError::NotEstablished),
        }
    }

    fn caller_name(&self) -> Option<String> {
        match &self.state {
            AcceptorState::Done { principal } => Some(principal.name.clone()),
            _ => None,
        }
    }
}
