//! Per-connection session state
//!
//! A [`SessionContext`] is built once, when the `sftp` subsystem is
//! accepted, and is owned by that channel's handler until it closes.

use crate::permissions::{self, PermissionMode, Permissions};
use crate::users::{UserDirectory, UserRecord};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Confined view of the filesystem for one authenticated user
#[derive(Debug, Clone)]
pub struct SessionContext {
    user: Arc<UserRecord>,
    root: PathBuf,
    mode: PermissionMode,
}

impl SessionContext {
    /// Bind `user` to `base_root/<username>`
    pub fn new(user: Arc<UserRecord>, base_root: &Path, mode: PermissionMode) -> Self {
        let root = base_root.join(user.username());
        Self { user, root, mode }
    }

    /// User this session belongs to
    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    /// Login name
    pub fn username(&self) -> &str {
        self.user.username()
    }

    /// Absolute root directory of the session
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rule resolution mode
    pub const fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// Flags in effect for a normalized virtual path
    pub fn permissions_for(&self, virtual_path: &str) -> Permissions {
        permissions::resolve(self.user.permissions(), virtual_path, self.mode)
    }
}

/// Authorization state of an SFTP channel
#[derive(Debug, Clone)]
pub enum SessionState {
    /// No user record behind this channel; every request is refused
    Denied,
    /// Normal session
    Active(SessionContext),
}

impl SessionState {
    /// Build the state for an authenticated username
    ///
    /// A username with no directory entry yields [`SessionState::Denied`].
    pub fn from_directory(
        directory: &UserDirectory,
        username: &str,
        base_root: &Path,
        mode: PermissionMode,
    ) -> Self {
        directory.find_user(username).map_or(Self::Denied, |user| {
            Self::Active(SessionContext::new(user, base_root, mode))
        })
    }

    /// Active context, if any
    pub const fn context(&self) -> Option<&SessionContext> {
        match self {
            Self::Active(context) => Some(context),
            Self::Denied => None,
        }
    }

    /// Flags in effect for a normalized virtual path
    pub fn permissions_for(&self, virtual_path: &str) -> Permissions {
        self.context()
            .map_or(Permissions::NONE, |context| context.permissions_for(virtual_path))
    }
}

/// Who is on the other end of a connection
///
/// Used for logs and audit records only, never for authorization.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    /// Random per-connection identifier
    pub session_id: Uuid,
    /// Peer address, when the transport knows it
    pub remote_addr: Option<SocketAddr>,
    /// Authenticated username
    pub username: Option<String>,
}

impl ConnectionIdentity {
    /// Identity for a freshly accepted connection
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            remote_addr,
            username: None,
        }
    }

    /// Peer IP address
    pub fn client_ip(&self) -> Option<std::net::IpAddr> {
        self.remote_addr.map(|addr| addr.ip())
    }
}
