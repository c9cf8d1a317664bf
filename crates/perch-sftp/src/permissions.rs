//! Permission gate
//!
//! Four flat capability flags decide every operation. `read`, `write` and
//! `list` map one-to-one, everything else that touches the namespace or
//! metadata is covered by `cmd`.

use crate::config::PermissionConfig;
use crate::confine;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of filesystem operation a client asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Open a file for reading
    Read,
    /// Open a file for writing
    Write,
    /// List a directory
    List,
    /// Remove a file or directory
    Remove,
    /// Rename a file or directory
    Rename,
    /// Create a directory
    Mkdir,
    /// Read attributes, following symlinks
    Stat,
    /// Read attributes of a link itself
    Lstat,
    /// Read a symlink target
    Readlink,
}

impl OperationKind {
    /// All operation kinds
    pub const ALL: [Self; 9] = [
        Self::Read,
        Self::Write,
        Self::List,
        Self::Remove,
        Self::Rename,
        Self::Mkdir,
        Self::Stat,
        Self::Lstat,
        Self::Readlink,
    ];

    /// Lowercase name used in logs and audit records
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
            Self::Remove => "remove",
            Self::Rename => "rename",
            Self::Mkdir => "mkdir",
            Self::Stat => "stat",
            Self::Lstat => "lstat",
            Self::Readlink => "readlink",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::NotSupported(format!("unknown operation kind: {s}")))
    }
}

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Operation may proceed
    Allow,
    /// Operation is refused
    Deny,
}

impl Decision {
    /// Whether the decision is [`Decision::Allow`]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Resolved capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Open files for reading
    pub read: bool,
    /// Open files for writing
    pub write: bool,
    /// Namespace and metadata operations
    pub cmd: bool,
    /// List directories
    pub list: bool,
}

impl Permissions {
    /// Every flag off
    pub const NONE: Self = Self {
        read: false,
        write: false,
        cmd: false,
        list: false,
    };

    /// Every flag on
    pub const ALL: Self = Self {
        read: true,
        write: true,
        cmd: true,
        list: true,
    };
}

/// Decide whether `kind` is allowed under `perms`
pub const fn check(perms: Permissions, kind: OperationKind) -> Decision {
    let allowed = match kind {
        OperationKind::Read => perms.read,
        OperationKind::Write => perms.write,
        OperationKind::List => perms.list,
        OperationKind::Remove
        | OperationKind::Rename
        | OperationKind::Mkdir
        | OperationKind::Stat
        | OperationKind::Lstat
        | OperationKind::Readlink => perms.cmd,
    };

    if allowed { Decision::Allow } else { Decision::Deny }
}

/// Decide by operation name
///
/// Names that do not parse are denied.
pub fn check_named(perms: Permissions, kind: &str) -> Decision {
    kind.parse::<OperationKind>()
        .map_or(Decision::Deny, |kind| check(perms, kind))
}

/// How a user's ordered rules are turned into flags for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// The rule with the longest matching directory prefix wins
    #[default]
    LongestPrefix,
    /// The first rule covers the whole root
    Flat,
}

/// A permission rule scoped to a directory of the user's virtual root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    path: String,
    permissions: Permissions,
}

impl PermissionRule {
    /// Create a rule for a virtual path
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` climbs above the virtual root.
    pub fn new(path: &str, permissions: Permissions) -> Result<Self> {
        let path = confine::normalize(path)
            .map_err(|_| Error::Config(format!("Permission path escapes user root: {path}")))?;
        Ok(Self { path, permissions })
    }

    /// Normalized virtual path this rule applies to
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flags granted by this rule
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Number of path components when the rule covers `virtual_path`
    fn match_depth(&self, virtual_path: &str) -> Option<usize> {
        if self.path == "/" {
            return Some(0);
        }

        let covers = virtual_path == self.path
            || virtual_path
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with('/'));

        covers.then(|| self.path.matches('/').count())
    }
}

impl TryFrom<&PermissionConfig> for PermissionRule {
    type Error = Error;

    fn try_from(config: &PermissionConfig) -> Result<Self> {
        Self::new(
            &config.path,
            Permissions {
                read: config.read,
                write: config.write,
                cmd: config.cmd,
                list: config.list,
            },
        )
    }
}

/// Resolve the flags in effect for `virtual_path`
///
/// `virtual_path` must already be normalized. With no matching rule the
/// result is [`Permissions::NONE`].
pub fn resolve(rules: &[PermissionRule], virtual_path: &str, mode: PermissionMode) -> Permissions {
    match mode {
        PermissionMode::Flat => rules
            .first()
            .map_or(Permissions::NONE, PermissionRule::permissions),
        PermissionMode::LongestPrefix => {
            let mut best: Option<(usize, &PermissionRule)> = None;
            for rule in rules {
                if let Some(depth) = rule.match_depth(virtual_path) {
                    if best.is_none_or(|(best_depth, _)| depth > best_depth) {
                        best = Some((depth, rule));
                    }
                }
            }
            best.map_or(Permissions::NONE, |(_, rule)| rule.permissions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOB: Permissions = Permissions {
        read: true,
        write: false,
        cmd: false,
        list: true,
    };

    fn rule(path: &str, permissions: Permissions) -> PermissionRule {
        PermissionRule::new(path, permissions).unwrap()
    }

    #[test]
    fn test_flag_mapping() {
        assert_eq!(check(BOB, OperationKind::Read), Decision::Allow);
        assert_eq!(check(BOB, OperationKind::List), Decision::Allow);
        assert_eq!(check(BOB, OperationKind::Write), Decision::Deny);
        for kind in [
            OperationKind::Remove,
            OperationKind::Rename,
            OperationKind::Mkdir,
            OperationKind::Stat,
            OperationKind::Lstat,
            OperationKind::Readlink,
        ] {
            assert_eq!(check(BOB, kind), Decision::Deny, "{kind} should need cmd");
        }
    }

    #[test]
    fn test_false_flag_denies_every_mapped_kind() {
        let flags = [
            (Permissions { read: false, ..Permissions::ALL }, OperationKind::Read),
            (Permissions { write: false, ..Permissions::ALL }, OperationKind::Write),
            (Permissions { list: false, ..Permissions::ALL }, OperationKind::List),
            (Permissions { cmd: false, ..Permissions::ALL }, OperationKind::Mkdir),
        ];
        for (perms, kind) in flags {
            assert_eq!(check(perms, kind), Decision::Deny);
        }

        for kind in OperationKind::ALL {
            assert_eq!(check(Permissions::NONE, kind), Decision::Deny);
            assert_eq!(check(Permissions::ALL, kind), Decision::Allow);
        }
    }

    #[test]
    fn test_unknown_kind_fails_closed() {
        assert_eq!(check_named(Permissions::ALL, "chmod"), Decision::Deny);
        assert_eq!(check_named(Permissions::ALL, ""), Decision::Deny);
        assert_eq!(check_named(Permissions::ALL, "read"), Decision::Allow);
        assert!("symlink".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.to_string().parse::<OperationKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = vec![
            rule("/", BOB),
            rule("/uploads", Permissions::ALL),
            rule("/uploads/locked", Permissions::NONE),
        ];
        let mode = PermissionMode::LongestPrefix;

        assert_eq!(resolve(&rules, "/report.txt", mode), BOB);
        assert_eq!(resolve(&rules, "/uploads", mode), Permissions::ALL);
        assert_eq!(resolve(&rules, "/uploads/a.bin", mode), Permissions::ALL);
        assert_eq!(resolve(&rules, "/uploads/locked/x", mode), Permissions::NONE);
        // Prefix matching is by component, not by string.
        assert_eq!(resolve(&rules, "/uploadsX/a", mode), BOB);
    }

    #[test]
    fn test_longest_prefix_ties_go_to_first_rule() {
        let rules = vec![rule("/docs", BOB), rule("/docs/", Permissions::ALL)];
        assert_eq!(
            resolve(&rules, "/docs/a", PermissionMode::LongestPrefix),
            BOB
        );
    }

    #[test]
    fn test_no_matching_rule_denies_all() {
        let rules = vec![rule("/public", Permissions::ALL)];
        assert_eq!(
            resolve(&rules, "/private/x", PermissionMode::LongestPrefix),
            Permissions::NONE
        );
        assert_eq!(resolve(&[], "/", PermissionMode::LongestPrefix), Permissions::NONE);
        assert_eq!(resolve(&[], "/", PermissionMode::Flat), Permissions::NONE);
    }

    #[test]
    fn test_flat_mode_uses_first_rule_everywhere() {
        let rules = vec![rule("/public", BOB), rule("/public/rw", Permissions::ALL)];
        assert_eq!(resolve(&rules, "/elsewhere", PermissionMode::Flat), BOB);
        assert_eq!(resolve(&rules, "/public/rw/x", PermissionMode::Flat), BOB);
    }

    #[test]
    fn test_rule_path_cannot_escape() {
        assert!(matches!(
            PermissionRule::new("../other", Permissions::ALL),
            Err(Error::Config(_))
        ));
        assert_eq!(rule("docs/./a/", BOB).path(), "/docs/a");
    }
}
