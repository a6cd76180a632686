//! Observability and Metrics
//!
//! Atomic counters owned by a server or a client instance. There is no global
//! collector: every `Server` and `Client` exposes its own `metrics()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one server or client
#[derive(Debug)]
pub struct Metrics {
    /// Total connections admitted
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections closed by admission control
    pub connections_rejected: AtomicU64,
    /// Total packets sent
    pub packets_sent: AtomicU64,
    /// Total packets received
    pub packets_received: AtomicU64,
    /// Total bytes sent, headers included
    pub bytes_sent: AtomicU64,
    /// Total bytes received, headers included
    pub bytes_received: AtomicU64,
    /// Heartbeats answered without dispatch
    pub heartbeats: AtomicU64,
    /// Tasks accepted by the worker pool
    pub tasks_submitted: AtomicU64,
    /// Submissions rejected with a full queue
    pub queue_full: AtomicU64,
    /// Handlers run on the receive task after a full queue
    pub inline_executions: AtomicU64,
    /// Packets with no handler and no default handler
    pub unhandled_packets: AtomicU64,
    /// Connections terminated by malformed wire data
    pub framing_errors: AtomicU64,
    /// Handlers that returned an error
    pub handler_errors: AtomicU64,
    /// Correlated responses that arrived after their waiter gave up
    pub late_responses: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            tasks_submitted: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            inline_executions: AtomicU64::new(0),
            unhandled_packets: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inline_execution(&self) {
        self.inline_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_packet(&self) {
        self.unhandled_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            inline_executions: self.inline_executions.load(Ordering::Relaxed),
            unhandled_packets: self.unhandled_packets.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            heartbeats = snapshot.heartbeats,
            tasks_submitted = snapshot.tasks_submitted,
            queue_full = snapshot.queue_full,
            inline_executions = snapshot.inline_executions,
            unhandled_packets = snapshot.unhandled_packets,
            framing_errors = snapshot.framing_errors,
            handler_errors = snapshot.handler_errors,
            late_responses = snapshot.late_responses,
            uptime_seconds = snapshot.uptime_seconds,
            "Metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub heartbeats: u64,
    pub tasks_submitted: u64,
    pub queue_full: u64,
    pub inline_executions: u64,
    pub unhandled_packets: u64,
    pub framing_errors: u64,
    pub handler_errors: u64,
    pub late_responses: u64,
    pub uptime_seconds: u64,
}
