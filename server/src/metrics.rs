//! Server counters.
//!
//! Atomic counters for inbound traffic. Each counter can be reset on its
//! own so callers can sample rates over their own windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for the socket server.
#[derive(Debug)]
pub struct ServerCounters {
    /// Inbound WebSocket messages.
    ws_messages: AtomicU64,

    /// Inbound invokes.
    invokes: AtomicU64,

    /// Inbound transmits.
    transmits: AtomicU64,

    /// HTTP requests, upgrades included.
    http_requests: AtomicU64,

    /// Topic deliveries skipped because the member was backpressured.
    skipped_deliveries: AtomicU64,

    /// Sockets admitted.
    connections_opened: AtomicU64,

    /// Sockets closed.
    connections_closed: AtomicU64,

    /// Start time for rate calculation.
    start_time: Instant,
}

impl Default for ServerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCounters {
    /// Creates a new counters instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ws_messages: AtomicU64::new(0),
            invokes: AtomicU64::new(0),
            transmits: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            skipped_deliveries: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records an inbound WebSocket message.
    pub fn record_ws_message(&self) {
        self.ws_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound invoke.
    pub fn record_invoke(&self) {
        self.invokes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound transmit.
    pub fn record_transmit(&self) {
        self.transmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an HTTP request.
    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a topic delivery skipped for backpressure. Returns the new
    /// count.
    pub fn record_skipped_delivery(&self) -> u64 {
        self.skipped_deliveries.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records an admitted connection.
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the inbound WebSocket message count.
    #[must_use]
    pub fn ws_messages(&self) -> u64 {
        self.ws_messages.load(Ordering::Relaxed)
    }

    /// Returns the inbound invoke count.
    #[must_use]
    pub fn invokes(&self) -> u64 {
        self.invokes.load(Ordering::Relaxed)
    }

    /// Returns the inbound transmit count.
    #[must_use]
    pub fn transmits(&self) -> u64 {
        self.transmits.load(Ordering::Relaxed)
    }

    /// Returns the HTTP request count.
    #[must_use]
    pub fn http_requests(&self) -> u64 {
        self.http_requests.load(Ordering::Relaxed)
    }

    /// Returns the number of deliveries skipped for backpressure.
    #[must_use]
    pub fn skipped_deliveries(&self) -> u64 {
        self.skipped_deliveries.load(Ordering::Relaxed)
    }

    /// Returns the current active connections.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }

    /// Resets the WebSocket message count.
    pub fn reset_ws_messages(&self) {
        self.ws_messages.store(0, Ordering::Relaxed);
    }

    /// Resets the invoke count.
    pub fn reset_invokes(&self) {
        self.invokes.store(0, Ordering::Relaxed);
    }

    /// Resets the transmit count.
    pub fn reset_transmits(&self) {
        self.transmits.store(0, Ordering::Relaxed);
    }

    /// Resets the HTTP request count.
    pub fn reset_http_requests(&self) {
        self.http_requests.store(0, Ordering::Relaxed);
    }

    /// Resets the skipped delivery count.
    pub fn reset_skipped_deliveries(&self) {
        self.skipped_deliveries.store(0, Ordering::Relaxed);
    }

    /// Returns the uptime.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            ws_messages: self.ws_messages(),
            invokes: self.invokes(),
            transmits: self.transmits(),
            http_requests: self.http_requests(),
            skipped_deliveries: self.skipped_deliveries(),
            active_connections: self.active_connections(),
            uptime: self.uptime(),
        }
    }

    /// Resets the traffic counters. Connection counts are kept.
    pub fn reset(&self) {
        self.reset_ws_messages();
        self.reset_invokes();
        self.reset_transmits();
        self.reset_http_requests();
        self.reset_skipped_deliveries();
    }
}

/// A point-in-time snapshot of server counters.
#[derive(Debug, Clone)]
pub struct CountersSnapshot {
    /// Inbound WebSocket messages.
    pub ws_messages: u64,
    /// Inbound invokes.
    pub invokes: u64,
    /// Inbound transmits.
    pub transmits: u64,
    /// HTTP requests.
    pub http_requests: u64,
    /// Topic deliveries skipped for backpressure.
    pub skipped_deliveries: u64,
    /// Active connections.
    pub active_connections: u64,
    /// Uptime.
    pub uptime: Duration,
}
