//! Prometheus metrics for the authentication relay.
//!
//! Provides counters, histograms, and gauges for monitoring connection,
//! handshake and relay health.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Relay metrics collection.
///
/// Contains all metrics exposed by a relay process for monitoring.
pub struct RelayMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Total accepted connections.
    pub connections_accepted: IntCounter,

    /// Current active connections.
    pub active_connections: IntGauge,

    /// Handshakes by outcome (`established`, `failed`, `abandoned`).
    pub handshakes_total: IntCounterVec,

    /// Application requests by operation.
    pub requests_total: IntCounterVec,

    /// Request latency histogram by operation.
    pub request_duration_seconds: HistogramVec,

    /// Relays to delegated hosts by outcome.
    pub relays_total: IntCounterVec,

    /// Total bytes received from peers.
    pub bytes_received: IntCounter,

    /// Total bytes sent to peers.
    pub bytes_sent: IntCounter,
}

impl RelayMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = IntCounter::new(
            "authrelay_connections_accepted_total",
            "Total number of accepted connections",
        )
        .expect("metric creation should succeed");

        let active_connections = IntGauge::new(
            "authrelay_active_connections",
            "Current number of active connections",
        )
        .expect("metric creation should succeed");

        let handshakes_total = IntCounterVec::new(
            Opts::new(
                "authrelay_handshakes_total",
                "Total number of handshakes by outcome",
            ),
            &["outcome"],
        )
        .expect("metric creation should succeed");

        let requests_total = IntCounterVec::new(
            Opts::new(
                "authrelay_requests_total",
                "Total number of application requests by operation",
            ),
            &["operation"],
        )
        .expect("metric creation should succeed");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "authrelay_request_duration_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
            &["operation"],
        )
        .expect("metric creation should succeed");

        let relays_total = IntCounterVec::new(
            Opts::new(
                "authrelay_relays_total",
                "Total number of relays to delegated hosts by outcome",
            ),
            &["outcome"],
        )
        .expect("metric creation should succeed");

        let bytes_received = IntCounter::new(
            "authrelay_bytes_received_total",
            "Total bytes received from peers",
        )
        .expect("metric creation should succeed");

        let bytes_sent = IntCounter::new("authrelay_bytes_sent_total", "Total bytes sent to peers")
            .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(connections_accepted.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_connections.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(handshakes_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(relays_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_received.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            connections_accepted,
            active_connections,
            handshakes_total,
            requests_total,
            request_duration_seconds,
            relays_total,
            bytes_received,
            bytes_sent,
        }
    }

    /// Record an accepted connection; it stays active until [`Self::connection_closed`].
    pub fn connection_opened(&self) {
        self.connections_accepted.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Record how a handshake ended.
    pub fn record_handshake(&self, outcome: &str) {
        self.handshakes_total.with_label_values(&[outcome]).inc();
    }

    /// Record a request being processed.
    pub fn record_request(&self, operation: &str) {
        self.requests_total.with_label_values(&[operation]).inc();
    }

    /// Record request duration.
    pub fn record_duration(&self, operation: &str, duration_seconds: f64) {
        self.request_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record how a relay to a delegated host ended.
    pub fn record_relay(&self, outcome: &str) {
        self.relays_total.with_label_values(&[outcome]).inc();
    }

    /// Record bytes received.
    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.inc_by(bytes);
    }

    /// Record bytes sent.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.inc_by(bytes);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("active_connections", &self.active_connections.get())
            .finish_non_exhaustive()
    }
}
