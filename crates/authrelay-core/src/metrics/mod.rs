//! Metrics collection for the authentication relay.
//!
//! Provides Prometheus-compatible metrics for monitoring connections,
//! handshakes and relays.

pub mod prometheus;

pub use prometheus::RelayMetrics;
