//! Application request handlers.
//!
//! A server worker turns every authenticated application message into a
//! [`Request`] and hands it to a [`RequestHandler`]. The request owns the
//! impersonation scope for the caller, so whatever the handler does on the
//! caller's behalf happens while the scope is live, and the scope is released
//! when the worker drops the request.

pub mod relay;
pub mod whoami;

pub use relay::{DelegationRelay, RelayHandler};
pub use whoami::WhoAmIHandler;

use async_trait::async_trait;

use crate::auth::ScopedIdentity;
use crate::error::Result;
use crate::network::ConnectionContext;
use crate::protocol::Message;

/// One authenticated application message and the right to act for its sender.
#[derive(Debug)]
pub struct Request {
    message: Message,
    context: ConnectionContext,
    identity: ScopedIdentity,
}

impl Request {
    pub fn new(message: Message, context: ConnectionContext, identity: ScopedIdentity) -> Self {
        Self {
            message,
            context,
            identity,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// The caller's impersonation scope for this request.
    pub fn identity(&self) -> &ScopedIdentity {
        &self.identity
    }
}

/// Trait for application handlers.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request and produce the reply, if any.
    ///
    /// An error is reported to the server's error channel and answered with
    /// a `fault` reply; the connection keeps serving.
    async fn handle(&self, request: &Request) -> Result<Option<Message>>;
}
