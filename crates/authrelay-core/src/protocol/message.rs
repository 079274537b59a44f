//! Application envelope exchanged between relay peers.

use serde::{Deserialize, Serialize};

/// Closed set of operations carried on the wire.
///
/// The operation fully determines how a message's payload is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Handshake token from the initiator.
    ClientToken,
    /// Handshake token or continuation from the acceptor.
    ServerToken,
    /// Ask the peer which identity it observes for this connection.
    WhoAmI,
    /// Reply carrying the UTF-8 name of the observed identity.
    Identity,
    /// Reply carrying a UTF-8 error description.
    Fault,
}

impl Operation {
    /// Whether this operation belongs to the authentication handshake.
    #[must_use]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::ClientToken | Self::ServerToken)
    }

    /// Whether this operation answers an earlier request.
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Identity | Self::Fault)
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToken => "client_token",
            Self::ServerToken => "server_token",
            Self::WhoAmI => "who_am_i",
            Self::Identity => "identity",
            Self::Fault => "fault",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the wire.
///
/// Fields are private; a message is built with the constructors and
/// `with_*` methods and read through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    token: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegate_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegate_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_token: Option<String>,
}

impl Message {
    /// Create a message with no optional fields set.
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            token: None,
            data: None,
            delegate_host: None,
            delegate_port: None,
            delegation_token: None,
        }
    }

    /// Handshake token from the initiator.
    #[must_use]
    pub fn client_token(token: Vec<u8>) -> Self {
        Self::new(Operation::ClientToken).with_token(token)
    }

    /// Handshake token from the acceptor.
    #[must_use]
    pub fn server_token(token: Vec<u8>) -> Self {
        Self::new(Operation::ServerToken).with_token(token)
    }

    /// `who_am_i` request without a delegation target.
    #[must_use]
    pub fn who_am_i() -> Self {
        Self::new(Operation::WhoAmI)
    }

    /// Reply naming the identity the peer observed.
    #[must_use]
    pub fn identity(name: &str) -> Self {
        Self::new(Operation::Identity).with_data(name.as_bytes().to_vec())
    }

    /// Error reply.
    #[must_use]
    pub fn fault(message: &str) -> Self {
        Self::new(Operation::Fault).with_data(message.as_bytes().to_vec())
    }

    #[must_use]
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Ask the receiving server to relay this request to `host:port`.
    #[must_use]
    pub fn with_delegate(mut self, host: impl Into<String>, port: u16) -> Self {
        self.delegate_host = Some(host.into());
        self.delegate_port = Some(port);
        self
    }

    /// Assert an identity explicitly instead of relying on impersonation.
    #[must_use]
    pub fn with_delegation_token(mut self, token: impl Into<String>) -> Self {
        self.delegation_token = Some(token.into());
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn delegate_host(&self) -> Option<&str> {
        self.delegate_host.as_deref()
    }

    pub fn delegate_port(&self) -> Option<u16> {
        self.delegate_port
    }

    pub fn delegation_token(&self) -> Option<&str> {
        self.delegation_token.as_deref()
    }

    /// Delegation target, present only when both host and a non-zero port are set.
    #[must_use]
    pub fn delegate_target(&self) -> Option<(&str, u16)> {
        match (self.delegate_host.as_deref(), self.delegate_port) {
            (Some(host), Some(port)) if !host.is_empty() && port != 0 => Some((host, port)),
            _ => None,
        }
    }

    /// Payload decoded as UTF-8, lossily.
    #[must_use]
    pub fn data_text(&self) -> Option<String> {
        self.data
            .as_deref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// Consume the message, taking its handshake token.
    #[must_use]
    pub fn into_token(self) -> Option<Vec<u8>> {
        self.token
    }

    /// Copy of this message with the delegation fields removed, as forwarded to the next hop.
    #[must_use]
    pub fn forwarded(&self) -> Self {
        Self {
            operation: self.operation,
            token: None,
            data: self.data.clone(),
            delegate_host: None,
            delegate_port: None,
            delegation_token: None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_names() {
        let json = serde_json::to_string(&Operation::WhoAmI).unwrap();
        assert_eq!(json, "\"who_am_i\"");
        assert_eq!(Operation::ClientToken.as_str(), "client_token");
        assert!(Operation::ServerToken.is_handshake());
        assert!(!Operation::WhoAmI.is_handshake());
        assert!(Operation::Fault.is_reply());
    }

    #[test]
    fn test_absent_fields_omitted() {
        let json = serde_json::to_string(&Message::who_am_i()).unwrap();
        assert_eq!(json, r#"{"operation":"who_am_i"}"#);
    }

    #[test]
    fn test_token_is_base64() {
        let json = serde_json::to_string(&Message::client_token(vec![0xff, 0x00, 0x10])).unwrap();
        assert!(json.contains("\"token\":\"/wAQ\""));
    }

    #[test]
    fn test_delegate_target_requires_port() {
        let msg = Message::who_am_i().with_delegate("db.internal", 0);
        assert!(msg.delegate_target().is_none());

        let msg = Message::who_am_i().with_delegate("db.internal", 5655);
        assert_eq!(msg.delegate_target(), Some(("db.internal", 5655)));
    }

    #[test]
    fn test_forwarded_strips_delegation() {
        let msg = Message::who_am_i()
            .with_data(b"payload".to_vec())
            .with_delegate("db.internal", 5655)
            .with_delegation_token("alice");
        let fwd = msg.forwarded();
        assert_eq!(fwd.operation(), Operation::WhoAmI);
        assert_eq!(fwd.data(), Some(&b"payload"[..]));
        assert!(fwd.delegate_host().is_none());
        assert!(fwd.delegation_token().is_none());
    }

    #[test]
    fn test_data_text() {
        assert_eq!(Message::identity("alice").data_text().as_deref(), Some("alice"));
        assert!(Message::who_am_i().data_text().is_none());
    }
}
