//! Test utilities for the authentication relay.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`ScriptedProvider`] - A deterministic security provider with a
//!   configurable number of rounds, an optional failing round and a count of
//!   live provider handles
//! - [`RelayTestHarness`] - A primary server and a delegated host on
//!   ephemeral ports, with the delegated host recording what it serves
//!
//! # Example
//!
//! ```rust,ignore
//! use authrelay_core::testing::{user, RelayTestHarness};
//!
//! #[tokio::test]
//! async fn test_relay() {
//!     let harness = RelayTestHarness::scram().await;
//!     let mut client = harness.connect(user("alice")).await.unwrap();
//!
//!     let reply = client.request(harness.relayed_who_am_i()).await.unwrap();
//!     assert_eq!(reply.data_text().as_deref(), Some("alice"));
//! }
//! ```

pub mod harness;
pub mod provider;

pub use harness::{
    test_connection_config, user, RecordedCall, RecordingHandler, RelayTestHarness, RELAY_SERVICE,
};
pub use provider::{establish, ScriptedProvider, SCRIPTED_SERVICE, SCRIPTED_USER};
