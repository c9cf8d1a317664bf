//! # Perch SFTP
//!
//! Permission-aware SFTP server.
//!
//! Users authenticate with a password against a static list and are confined
//! to `root_path/<username>`. Four independent flags decide what they may do:
//!
//! - `read`: open files for reading
//! - `write`: open files for writing
//! - `list`: list directories
//! - `cmd`: remove, rename, mkdir, stat, lstat and readlink
//!
//! The SSH transport comes from `russh` and the SFTP wire protocol from
//! `russh-sftp`. This crate supplies the authorization layer in between:
//! path confinement, the permission gate and per-session request dispatch.

pub mod audit;
pub mod config;
pub mod confine;
pub mod dispatcher;
pub mod error;
pub mod host_key;
pub mod logging;
pub mod permissions;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod sftp;
pub mod stats;
pub mod users;

pub use audit::{AuditEvent, Auditor};
pub use config::{Config, LogFormat};
pub use dispatcher::{DirListing, ListPage, Request, RequestDispatcher, Response, WriteMode};
pub use error::{Error, Result};
pub use permissions::{Decision, OperationKind, PermissionMode, PermissionRule, Permissions};
pub use server::Server;
pub use session::{ConnectionIdentity, SessionContext, SessionState};
pub use sftp::SftpSession;
pub use stats::{ServerStats, StatusSnapshot};
pub use users::{UserDirectory, UserRecord, hash_password};
