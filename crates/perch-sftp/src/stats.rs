//! Server counters
//!
//! Lock-free counters shared by every connection. [`ServerStats::snapshot`]
//! turns them into a serializable status report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared server counters
#[derive(Debug, Clone)]
pub struct ServerStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,

    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,

    sessions_started: AtomicU64,

    operations: AtomicU64,
    denials: AtomicU64,
    errors: AtomicU64,

    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    started_at: DateTime<Utc>,
}

/// Point-in-time view of the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether the accept loop is running
    pub running: bool,
    /// Listen address
    pub listen_addr: String,
    /// When the server was created
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`
    pub uptime_seconds: i64,

    /// Connections accepted since start
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: usize,

    /// Successful logins
    pub auth_successes: u64,
    /// Failed logins
    pub auth_failures: u64,
    /// Logins refused because the client IP was locked out
    pub rate_limited: u64,

    /// SFTP subsystems started
    pub sessions_started: u64,

    /// Requests that reached storage
    pub operations: u64,
    /// Requests refused by confinement or permissions
    pub denials: u64,
    /// Requests that failed in storage
    pub errors: u64,

    /// Bytes sent to clients
    pub bytes_read: u64,
    /// Bytes received from clients
    pub bytes_written: u64,
}

impl ServerStats {
    /// Fresh counters starting now
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                auth_successes: AtomicU64::new(0),
                auth_failures: AtomicU64::new(0),
                rate_limited: AtomicU64::new(0),
                sessions_started: AtomicU64::new(0),
                operations: AtomicU64::new(0),
                denials: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                started_at: Utc::now(),
            }),
        }
    }

    /// Record an accepted connection
    pub fn record_connection(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection
    pub fn record_connection_close(&self) {
        // Saturate instead of wrapping if a close is ever double counted.
        let _ = self.inner.active_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |active| active.checked_sub(1),
        );
    }

    /// Record a successful login
    pub fn record_auth_success(&self) {
        self.inner.auth_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed login
    pub fn record_auth_failure(&self) {
        self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a login refused by the rate limiter
    pub fn record_rate_limited(&self) {
        self.inner.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a started SFTP session
    pub fn record_session(&self) {
        self.inner.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that reached storage
    pub fn record_operation(&self) {
        self.inner.operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused request
    pub fn record_denial(&self) {
        self.inner.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a storage failure
    pub fn record_error(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes sent to a client
    pub fn record_bytes_read(&self, bytes: u64) {
        self.inner.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes received from a client
    pub fn record_bytes_written(&self, bytes: u64) {
        self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Currently open connections
    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// Take a snapshot
    pub fn snapshot(&self, running: bool, listen_addr: &str) -> StatusSnapshot {
        let inner = &self.inner;
        StatusSnapshot {
            running,
            listen_addr: listen_addr.to_string(),
            started_at: inner.started_at,
            uptime_seconds: Utc::now()
                .signed_duration_since(inner.started_at)
                .num_seconds(),
            total_connections: inner.total_connections.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            auth_successes: inner.auth_successes.load(Ordering::Relaxed),
            auth_failures: inner.auth_failures.load(Ordering::Relaxed),
            rate_limited: inner.rate_limited.load(Ordering::Relaxed),
            sessions_started: inner.sessions_started.load(Ordering::Relaxed),
            operations: inner.operations.load(Ordering::Relaxed),
            denials: inner.denials.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            bytes_read: inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: inner.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSnapshot {
    /// Export as JSON
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which does not happen for this type.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
