//! Identity echo handler.
//!
//! Answers `who_am_i` with the name of the caller as this host observes it.
//! The delegated host runs only this handler; the primary server falls back
//! to it when a request carries no delegation target.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::protocol::{Message, Operation};

use super::{Request, RequestHandler};

/// Handler that replies with the caller's identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhoAmIHandler;

impl WhoAmIHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler for WhoAmIHandler {
    async fn handle(&self, request: &Request) -> Result<Option<Message>> {
        let operation = request.message().operation();
        if operation != Operation::WhoAmI {
            return Err(RelayError::protocol(format!(
                "unsupported operation {operation}"
            )));
        }

        let principal = request.identity().principal()?;
        debug!(
            connection_id = request.context().connection_id(),
            caller = %principal,
            "who_am_i"
        );
        Ok(Some(Message::identity(&principal.name)))
    }
}
