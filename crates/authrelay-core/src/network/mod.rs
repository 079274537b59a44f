//! Network layer for the authentication relay.
//!
//! This module provides:
//! - [`Connection`], the client-role connection with its handshake and ready signal
//! - [`ConnectionHandler`], the server-role worker for one accepted socket
//! - [`Listener`], which accepts sockets and runs one worker per connection
//! - [`ConnectionContext`], the per-connection metadata handed to handlers

pub mod client;
pub mod connection;
pub mod context;
pub mod listener;

pub use client::{resolve, ConnectOptions, Connection, ConnectionEvent, ReadyState};
pub use connection::{ConnectionHandler, ConnectionShared};
pub use context::ConnectionContext;
pub use listener::{Listener, RunningListener, ServerEvent};
