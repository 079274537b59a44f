//! Domain error types for the authentication relay.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::io;

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// A value is out of its accepted range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Errors raised by the security provider or the handshake state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The presented proof did not match the stored credentials.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A handshake token could not be parsed.
    #[error("invalid handshake message: {0}")]
    InvalidMessage(String),

    /// The principal is not known to the provider.
    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    /// The authenticated principal asserted another identity without being trusted to.
    #[error("principal '{principal}' is not trusted to act as '{asserted}'")]
    DelegationNotPermitted { principal: String, asserted: String },

    /// The provider cannot use this kind of credential material.
    #[error("unsupported credential: {0}")]
    UnsupportedCredential(String),

    /// The provider returned a fatal status.
    #[error("authentication failed (code {code:#x}): {reason}")]
    Fatal { code: u32, reason: String },

    /// A handshake call was made in a state that does not allow it.
    #[error("handshake call '{operation}' invalid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Impersonation was requested from an initiator-role context.
    #[error("impersonation is only available to the accepting side")]
    NotAcceptor,

    /// The context has not reached the established state.
    #[error("security context is not established")]
    NotEstablished,

    /// Another impersonation scope is still active on this context.
    #[error("an impersonation scope is already active on this context")]
    ImpersonationActive,

    /// The impersonation scope was released or reverted.
    #[error("impersonation scope has been released")]
    ImpersonationReleased,

    /// Credential store could not be loaded.
    #[error("credential store error: {0}")]
    CredentialStore(String),
}

/// Errors that occur while running connections, listeners and relays.
#[derive(Error, Debug)]
pub enum RelayError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The byte stream no longer carries valid frames or messages.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The ready signal did not fire within the configured bound.
    #[error("authentication did not complete within {timeout_ms} ms")]
    AuthenticationTimeout { timeout_ms: u64 },

    /// The handshake failed.
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// The connection's handshake failed before a send could go out.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// A socket write did not complete within the configured bound.
    #[error("write did not complete within {timeout_ms} ms")]
    WriteTimeout { timeout_ms: u64 },

    /// No reply arrived within the configured bound.
    #[error("no reply within {timeout_ms} ms")]
    ReplyTimeout { timeout_ms: u64 },

    /// The connection is not running.
    #[error("not connected")]
    NotConnected,

    /// The peer answered with a fault reply.
    #[error("remote fault: {message}")]
    Remote { message: String },

    /// The relay to the delegated host failed.
    #[error("delegation to {host}:{port} failed: {source}")]
    Delegation {
        host: String,
        port: u16,
        #[source]
        source: Box<RelayError>,
    },

    /// A connection worker panicked.
    #[error("connection worker failed: {message}")]
    Worker { message: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shutdown signal received.
    #[error("shutting down")]
    Shutdown,
}

impl RelayError {
    /// Build a protocol error from anything displayable.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error is an expected end of a connection rather than a defect.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Shutdown => true,
            Self::Connection(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// Classify socket errors that mean the peer went away.
///
/// These end a receive loop cleanly. Anything else is a defect and propagates.
#[must_use]
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
            | io::ErrorKind::NotConnected
    )
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for authentication operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;
