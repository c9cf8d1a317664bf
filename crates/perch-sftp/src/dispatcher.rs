//! Request dispatcher
//!
//! Every filesystem request goes through the same steps in order:
//!
//! 1. confine each path lexically under the session root
//! 2. check the permission gate for each path
//! 3. check that symlinks do not lead out of the root
//! 4. perform the storage action
//!
//! Any failure ends the request with an [`Error`] the protocol layer turns
//! into a status code. Nothing here closes a channel.

use crate::audit::{AuditEvent, Auditor};
use crate::confine;
use crate::permissions::{self, OperationKind};
use crate::session::{ConnectionIdentity, SessionContext, SessionState};
use crate::stats::ServerStats;
use crate::{Error, Result};
use chrono::Utc;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

/// How a file is opened for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMode {
    /// Also open for reading; needs the read flag as well
    pub read: bool,
    /// Create the file if missing
    pub create: bool,
    /// Truncate an existing file
    pub truncate: bool,
    /// Position every write at the end of the file
    pub append: bool,
    /// Fail if the file already exists
    pub exclusive: bool,
}

impl Default for WriteMode {
    fn default() -> Self {
        Self {
            read: false,
            create: true,
            truncate: true,
            append: false,
            exclusive: false,
        }
    }
}

impl WriteMode {
    fn creates(self) -> bool {
        self.create || self.exclusive
    }
}

/// A filesystem request with client-supplied paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a file for reading
    Read {
        /// File path
        path: String,
    },
    /// Open a file for writing
    Write {
        /// File path
        path: String,
        /// Open flags
        mode: WriteMode,
    },
    /// Read a whole directory
    List {
        /// Directory path
        path: String,
    },
    /// Remove a file
    Remove {
        /// File path
        path: String,
    },
    /// Remove an empty directory
    RemoveDir {
        /// Directory path
        path: String,
    },
    /// Rename a file or directory
    Rename {
        /// Current path
        from: String,
        /// New path
        to: String,
    },
    /// Create a single directory
    Mkdir {
        /// Directory path
        path: String,
    },
    /// Attributes, following symlinks
    Stat {
        /// Path
        path: String,
    },
    /// Attributes of the entry itself
    Lstat {
        /// Path
        path: String,
    },
    /// Target of a symlink
    Readlink {
        /// Link path
        path: String,
    },
    /// Canonical virtual form of a path
    Realpath {
        /// Path
        path: String,
    },
}

impl Request {
    /// Name used in logs and audit records
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::List { .. } => "list",
            Self::Remove { .. } => "remove",
            Self::RemoveDir { .. } => "rmdir",
            Self::Rename { .. } => "rename",
            Self::Mkdir { .. } => "mkdir",
            Self::Stat { .. } => "stat",
            Self::Lstat { .. } => "lstat",
            Self::Readlink { .. } => "readlink",
            Self::Realpath { .. } => "realpath",
        }
    }

    /// Client paths named by the request
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Self::Read { path }
            | Self::Write { path, .. }
            | Self::List { path }
            | Self::Remove { path }
            | Self::RemoveDir { path }
            | Self::Mkdir { path }
            | Self::Stat { path }
            | Self::Lstat { path }
            | Self::Readlink { path }
            | Self::Realpath { path } => vec![path.as_str()],
        }
    }

    /// Permission checks the request needs
    pub fn kinds(&self) -> Vec<OperationKind> {
        match self {
            Self::Read { .. } => vec![OperationKind::Read],
            Self::Write { mode, .. } if mode.read => {
                vec![OperationKind::Write, OperationKind::Read]
            }
            Self::Write { .. } => vec![OperationKind::Write],
            Self::List { .. } => vec![OperationKind::List],
            Self::Remove { .. } | Self::RemoveDir { .. } => vec![OperationKind::Remove],
            Self::Rename { .. } => vec![OperationKind::Rename],
            Self::Mkdir { .. } => vec![OperationKind::Mkdir],
            Self::Stat { .. } => vec![OperationKind::Stat],
            Self::Lstat { .. } => vec![OperationKind::Lstat],
            Self::Readlink { .. } => vec![OperationKind::Readlink],
            Self::Realpath { .. } => Vec::new(),
        }
    }

    /// Whether the final path component is followed when it is a symlink
    const fn follows_final_link(&self) -> bool {
        matches!(
            self,
            Self::Read { .. } | Self::Write { .. } | Self::List { .. } | Self::Stat { .. }
        )
    }

    /// Whether the request removes or moves the named entry
    const fn mutates_entry(&self) -> bool {
        matches!(
            self,
            Self::Remove { .. } | Self::RemoveDir { .. } | Self::Rename { .. }
        )
    }

    fn describe(&self) -> String {
        match self {
            Self::Rename { from, to } => format!("{from} -> {to}"),
            other => other.paths().concat(),
        }
    }
}

/// Result of a successful request
#[derive(Debug)]
pub enum Response {
    /// Opened file
    File(File),
    /// Directory contents
    Listing(DirListing),
    /// File attributes
    Attributes(Metadata),
    /// Symlink target as the client should see it
    LinkTarget(String),
    /// Normalized virtual path
    Path(String),
    /// Request completed with nothing to return
    Done,
}

/// One directory entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File name
    pub name: String,
    /// Attributes of the entry itself (symlinks are not followed)
    pub metadata: Metadata,
}

/// Snapshot of a directory, sorted by name
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    entries: Vec<DirEntry>,
}

/// A window into a [`DirListing`]
#[derive(Debug, Clone, Copy)]
pub struct ListPage<'a> {
    /// Entries in the window
    pub entries: &'a [DirEntry],
    /// Whether the window reaches the end of the listing
    pub eof: bool,
}

impl DirListing {
    /// Read a directory
    ///
    /// Entries whose attributes cannot be read are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be opened or iterated.
    pub async fn read(path: &Path) -> Result<Self> {
        let mut reader = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(metadata) => entries.push(DirEntry { name, metadata }),
                Err(e) => {
                    warn!(
                        event = "list_entry_skipped",
                        directory = %path.display(),
                        entry = %name,
                        error = %e,
                        "Skipping entry with unreadable attributes"
                    );
                }
            }
        }

        Ok(Self::from_entries(entries))
    }

    /// Build a listing from entries in any order
    pub fn from_entries(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in order
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Up to `max` entries starting at `offset`
    pub fn list_at(&self, offset: usize, max: usize) -> ListPage<'_> {
        let len = self.entries.len();
        let start = offset.min(len);
        let end = start.saturating_add(max).min(len);
        ListPage {
            entries: &self.entries[start..end],
            eof: end >= len,
        }
    }
}

struct Target {
    virtual_path: String,
    real_path: PathBuf,
}

/// Executes requests for one SFTP channel
#[derive(Debug)]
pub struct RequestDispatcher {
    state: SessionState,
    identity: ConnectionIdentity,
    auditor: Auditor,
    stats: ServerStats,
}

impl RequestDispatcher {
    /// Create a dispatcher
    pub const fn new(
        state: SessionState,
        identity: ConnectionIdentity,
        auditor: Auditor,
        stats: ServerStats,
    ) -> Self {
        Self {
            state,
            identity,
            auditor,
            stats,
        }
    }

    /// Authorization state
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Connection identity
    pub const fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Shared counters
    pub const fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Run a request
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] or [`Error::PathEscape`] when the
    /// request is refused, or [`Error::Io`] when storage fails.
    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        let (context, targets) = match self.authorize(&request).await {
            Ok(authorized) => authorized,
            Err(e) => {
                if e.is_denial() {
                    self.record_denial(&request, &e);
                } else {
                    self.record_outcome(&request, Err(&e));
                }
                return Err(e);
            }
        };

        let outcome = self.perform(&request, context, &targets).await;
        self.record_outcome(&request, outcome.as_ref().map(|_| ()));
        outcome
    }

    async fn authorize(&self, request: &Request) -> Result<(&SessionContext, Vec<Target>)> {
        let SessionState::Active(context) = &self.state else {
            return Err(Error::PermissionDenied("no session for this user".into()));
        };

        let mut targets = Vec::with_capacity(2);
        for path in request.paths() {
            let virtual_path = confine::normalize(path)?;
            let real_path = confine::confine(context.root(), &virtual_path)?;
            targets.push(Target {
                virtual_path,
                real_path,
            });
        }

        for target in &targets {
            let perms = context.permissions_for(&target.virtual_path);
            for kind in request.kinds() {
                if !permissions::check(perms, kind).is_allowed() {
                    return Err(Error::PermissionDenied(format!(
                        "{kind} on {}",
                        target.virtual_path
                    )));
                }
            }
            if request.mutates_entry() && target.virtual_path == "/" {
                return Err(Error::PermissionDenied(format!(
                    "{} on session root",
                    request.name()
                )));
            }
        }

        if !matches!(request, Request::Realpath { .. }) {
            let follow = request.follows_final_link();
            for target in &targets {
                confine::ensure_resolved_within(context.root(), &target.real_path, follow).await?;
            }
        }

        Ok((context, targets))
    }

    async fn perform(
        &self,
        request: &Request,
        context: &SessionContext,
        targets: &[Target],
    ) -> Result<Response> {
        let [first, rest @ ..] = targets else {
            return Err(Error::NotSupported("request without a path".into()));
        };
        let path = first.real_path.as_path();

        match request {
            Request::Read { .. } => Ok(Response::File(File::open(path).await?)),
            Request::Write { mode, .. } => {
                if mode.creates() {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                Ok(Response::File(open_for_write(path, *mode).await?))
            }
            Request::List { .. } => Ok(Response::Listing(DirListing::read(path).await?)),
            Request::Remove { .. } => {
                tokio::fs::remove_file(path).await?;
                Ok(Response::Done)
            }
            Request::RemoveDir { .. } => {
                tokio::fs::remove_dir(path).await?;
                Ok(Response::Done)
            }
            Request::Rename { .. } => {
                let Some(to) = rest.first() else {
                    return Err(Error::NotSupported("rename without a target".into()));
                };
                tokio::fs::rename(path, &to.real_path).await?;
                Ok(Response::Done)
            }
            Request::Mkdir { .. } => {
                tokio::fs::create_dir(path).await?;
                Ok(Response::Done)
            }
            Request::Stat { .. } => Ok(Response::Attributes(tokio::fs::metadata(path).await?)),
            Request::Lstat { .. } => Ok(Response::Attributes(
                tokio::fs::symlink_metadata(path).await?,
            )),
            Request::Readlink { .. } => {
                let target = tokio::fs::read_link(path).await?;
                let visible = confine::link_target_within(context.root(), path, &target)?;
                Ok(Response::LinkTarget(visible))
            }
            Request::Realpath { .. } => Ok(Response::Path(first.virtual_path.clone())),
        }
    }

    fn username(&self) -> Option<String> {
        self.state
            .context()
            .map(|context| context.username().to_string())
            .or_else(|| self.identity.username.clone())
    }

    fn record_denial(&self, request: &Request, error: &Error) {
        self.stats.record_denial();
        self.auditor.record(&AuditEvent::AccessDenied {
            session_id: self.identity.session_id,
            username: self.username(),
            operation: request.name().to_string(),
            path: request.describe(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn record_outcome(&self, request: &Request, outcome: std::result::Result<(), &Error>) {
        if matches!(request, Request::Realpath { .. }) {
            debug!(path = %request.describe(), "realpath");
            return;
        }

        match outcome {
            Ok(()) => self.stats.record_operation(),
            Err(_) => self.stats.record_error(),
        }

        self.auditor.record(&AuditEvent::Operation {
            session_id: self.identity.session_id,
            username: self.username(),
            operation: request.name().to_string(),
            path: request.describe(),
            success: outcome.is_ok(),
            error: outcome.err().map(ToString::to_string),
            timestamp: Utc::now(),
        });
    }
}

async fn open_for_write(path: &Path, mode: WriteMode) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).read(mode.read);

    if mode.exclusive {
        options.create_new(true);
    } else {
        options.create(mode.create);
    }

    if mode.append {
        options.append(true);
    } else if mode.truncate {
        options.truncate(true);
    }

    options.open(path).await
}
