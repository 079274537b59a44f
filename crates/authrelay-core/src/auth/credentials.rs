//! Credential material and credential storage.
//!
//! [`Credential`] is what a caller hands to the security provider when a
//! context is created; the core never looks inside it. [`CredentialStore`]
//! backends hold the users an accepting provider will recognise.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::principal::Principal;
use crate::config::{CredentialConfig, UserCredential};
use crate::error::{AuthError, AuthResult};

/// Credential material passed to the security provider.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// The identity of the running process, as the provider resolves it.
    Current,
    /// An explicit username and password.
    Password {
        username: String,
        password: String,
        domain: Option<String>,
    },
    /// The identity of an authenticated caller, taken from a live
    /// impersonation scope.
    Impersonated { principal: Principal },
    /// An explicit identity assertion used instead of impersonation.
    DelegationToken(String),
    /// A pre-issued keytab or ticket blob, handed to the provider as is.
    Keytab {
        keytab: Vec<u8>,
        username: String,
        domain: Option<String>,
    },
}

impl Credential {
    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: Option<String>,
    ) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
            domain,
        }
    }

    /// Short label used in logs; never includes secrets.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Password { .. } => "password",
            Self::Impersonated { .. } => "impersonated",
            Self::DelegationToken(_) => "delegation_token",
            Self::Keytab { .. } => "keytab",
        }
    }

    /// Identity asserted on behalf of someone else, if this credential carries one.
    #[must_use]
    pub fn asserted_identity(&self) -> Option<&str> {
        match self {
            Self::Impersonated { principal } => Some(&principal.name),
            Self::DelegationToken(token) => Some(token),
            _ => None,
        }
    }
}

impl From<&UserCredential> for Credential {
    fn from(user: &UserCredential) -> Self {
        Self::Password {
            username: user.username(),
            password: user.password(),
            domain: user.domain.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("Current"),
            Self::Password {
                username, domain, ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("domain", domain)
                .field("password", &"<redacted>")
                .finish(),
            Self::Impersonated { principal } => f
                .debug_struct("Impersonated")
                .field("principal", &principal.name)
                .finish(),
            Self::DelegationToken(token) => f.debug_tuple("DelegationToken").field(token).finish(),
            Self::Keytab {
                keytab,
                username,
                domain,
            } => f
                .debug_struct("Keytab")
                .field("username", username)
                .field("domain", domain)
                .field("keytab", &format_args!("<{} bytes>", keytab.len()))
                .finish(),
        }
    }
}

/// Stored credentials for a user.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    /// Principal name (`user` or `user@domain`).
    pub username: String,
    /// The plaintext password.
    pub password: String,
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Get credentials for a username.
    fn get_credentials(&self, username: &str) -> Option<StoredCredentials>;

    /// All stored users, in a stable order.
    fn users(&self) -> Vec<StoredCredentials>;

    /// Check if credentials are valid.
    fn validate(&self, username: &str, password: &str) -> bool {
        self.get_credentials(username)
            .map(|creds| creds.password == password)
            .unwrap_or(false)
    }
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credentials: BTreeMap<String, StoredCredentials>,
}

impl InMemoryCredentialStore {
    /// Create a new in-memory credential store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials for a user.
    pub fn add_user(&mut self, username: String, password: String) {
        self.credentials
            .insert(username.clone(), StoredCredentials { username, password });
    }

    /// Create from a list of user credentials.
    ///
    /// Users are keyed by principal name, so a user with a domain is stored
    /// as `user@domain`.
    #[must_use]
    pub fn from_users(users: &[UserCredential]) -> Self {
        let mut store = Self::new();
        for user in users {
            store.add_user(user.principal_name(), user.password());
        }
        store
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get_credentials(&self, username: &str) -> Option<StoredCredentials> {
        self.credentials.get(username).cloned()
    }

    fn users(&self) -> Vec<StoredCredentials> {
        self.credentials.values().cloned().collect()
    }
}

/// File-based credential store.
///
/// Loads credentials from a file in the format:
/// ```text
/// username1:password1
/// username2@DOMAIN:password2
/// ```
#[derive(Debug)]
pub struct FileCredentialStore {
    inner: InMemoryCredentialStore,
}

impl FileCredentialStore {
    /// Create a new file-based credential store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> AuthResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AuthError::CredentialStore(format!(
                "failed to read credentials file '{}': {e}",
                path.display()
            ))
        })?;

        let mut inner = InMemoryCredentialStore::new();

        for (line_num, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((username, password)) = line.split_once(':') else {
                return Err(AuthError::CredentialStore(format!(
                    "invalid credentials file format at line {}: expected 'username:password'",
                    line_num + 1
                )));
            };

            inner.add_user(username.to_string(), password.to_string());
        }

        Ok(Self { inner })
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_credentials(&self, username: &str) -> Option<StoredCredentials> {
        self.inner.get_credentials(username)
    }

    fn users(&self) -> Vec<StoredCredentials> {
        self.inner.users()
    }
}

/// Create a credential store from configuration.
///
/// # Errors
///
/// Returns an error if the credential store cannot be created.
pub fn create_credential_store(config: &CredentialConfig) -> AuthResult<Arc<dyn CredentialStore>> {
    match config {
        CredentialConfig::Inline { users } => Ok(Arc::new(InMemoryCredentialStore::from_users(users))),
        CredentialConfig::File { file } => Ok(Arc::new(FileCredentialStore::load(file)?)),
    }
}
