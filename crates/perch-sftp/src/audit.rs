//! Audit trail
//!
//! Every connection, login, session, permission denial and filesystem
//! operation is attributable to a username, an operation and a path. Events
//! are emitted through `tracing` so they end up wherever the server logs go.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// TCP connection accepted
    ConnectionEstablished {
        /// Connection identifier
        session_id: Uuid,
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Connection handler dropped
    ConnectionClosed {
        /// Connection identifier
        session_id: Uuid,
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Authenticated username
        username: Option<String>,
        /// Connection lifetime in seconds
        duration_secs: i64,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Password authentication attempt
    AuthAttempt {
        /// Connection identifier
        session_id: Uuid,
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Username attempted
        username: String,
        /// Whether authentication succeeded
        success: bool,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// SFTP subsystem accepted on a channel
    SessionStarted {
        /// Connection identifier
        session_id: Uuid,
        /// Authenticated username
        username: String,
        /// Whether the channel got a deny-all session
        denied: bool,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Filesystem operation that passed the permission gate
    Operation {
        /// Connection identifier
        session_id: Uuid,
        /// Authenticated username
        username: Option<String>,
        /// Operation kind
        operation: String,
        /// Virtual path as sent by the client
        path: String,
        /// Whether the storage action succeeded
        success: bool,
        /// Storage error, if any
        error: Option<String>,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Request refused by confinement or the permission gate
    AccessDenied {
        /// Connection identifier
        session_id: Uuid,
        /// Authenticated username
        username: Option<String>,
        /// Operation kind
        operation: String,
        /// Virtual path as sent by the client
        path: String,
        /// Internal reason, never sent to the client
        reason: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Client IP locked out after repeated failures
    RateLimited {
        /// Client IP address
        client_ip: IpAddr,
        /// Lockout length in seconds
        lockout_secs: u64,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Write the event to the log
    pub fn log(&self) {
        match self {
            Self::ConnectionEstablished {
                session_id,
                client_ip,
                ..
            } => {
                info!(
                    event = "connection_established",
                    %session_id,
                    client_ip = ?client_ip,
                    "New connection established"
                );
            }
            Self::ConnectionClosed {
                session_id,
                username,
                duration_secs,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    %session_id,
                    username = ?username,
                    duration_secs,
                    "Connection closed"
                );
            }
            Self::AuthAttempt {
                session_id,
                client_ip,
                username,
                success,
                ..
            } => {
                if *success {
                    info!(
                        event = "auth_success",
                        %session_id,
                        client_ip = ?client_ip,
                        username,
                        "Authentication successful"
                    );
                } else {
                    warn!(
                        event = "auth_failure",
                        %session_id,
                        client_ip = ?client_ip,
                        username,
                        "Authentication failed"
                    );
                }
            }
            Self::SessionStarted {
                session_id,
                username,
                denied,
                ..
            } => {
                if *denied {
                    warn!(
                        event = "session_started",
                        %session_id,
                        username,
                        denied,
                        "SFTP session started without a user record, all requests will be refused"
                    );
                } else {
                    info!(event = "session_started", %session_id, username, "SFTP session started");
                }
            }
            Self::Operation {
                session_id,
                username,
                operation,
                path,
                success,
                error,
                ..
            } => {
                if *success {
                    info!(
                        event = "operation",
                        %session_id,
                        username = ?username,
                        operation,
                        path,
                        "Operation completed"
                    );
                } else {
                    warn!(
                        event = "operation_failed",
                        %session_id,
                        username = ?username,
                        operation,
                        path,
                        error = ?error,
                        "Operation failed"
                    );
                }
            }
            Self::AccessDenied {
                session_id,
                username,
                operation,
                path,
                reason,
                ..
            } => {
                warn!(
                    event = "access_denied",
                    %session_id,
                    username = ?username,
                    operation,
                    path,
                    reason,
                    "Access denied"
                );
            }
            Self::RateLimited {
                client_ip,
                lockout_secs,
                ..
            } => {
                warn!(
                    event = "rate_limited",
                    %client_ip,
                    lockout_secs,
                    "Client locked out after repeated authentication failures"
                );
            }
        }
    }

    /// Export as JSON
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which does not happen for these types.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Gate for audit output
#[derive(Debug, Clone, Copy)]
pub struct Auditor {
    enabled: bool,
}

impl Auditor {
    /// Create an auditor; a disabled one drops every event
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether events are emitted
    pub const fn is_enabled(self) -> bool {
        self.enabled
    }

    /// Emit `event` if auditing is on
    pub fn record(self, event: &AuditEvent) {
        if self.enabled {
            event.log();
        }
    }
}

impl Default for Auditor {
    fn default() -> Self {
        Self::new(true)
    }
}
