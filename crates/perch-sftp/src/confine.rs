//! Path confinement
//!
//! Clients address files with virtual paths where `/` is their own root.
//! Every such path is normalized lexically first; a `..` that would climb
//! above the virtual root is an escape and is rejected rather than clamped.
//! A second, symlink-aware pass checks that the on-disk resolution still
//! lands under the real root.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Normalize a client path to a virtual absolute path such as `/a/b`
///
/// # Errors
///
/// Returns [`Error::PathEscape`] if the path climbs above the root or
/// contains NUL bytes.
pub fn normalize(requested: &str) -> Result<String> {
    if requested.contains('\0') {
        return Err(Error::PathEscape("path contains NUL byte".into()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in requested.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::PathEscape(requested.to_string()));
                }
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Resolve a client path against `root`
///
/// The result is `root` joined with the normalized virtual path, and is
/// checked to still have `root` as a prefix. Pure: no filesystem access.
///
/// # Errors
///
/// Returns [`Error::PathEscape`] if the path would leave `root`.
pub fn confine(root: &Path, requested: &str) -> Result<PathBuf> {
    let virtual_path = normalize(requested)?;
    let relative = virtual_path.trim_start_matches('/');
    let joined = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };

    match joined.strip_prefix(root) {
        Ok(relative)
            if !relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir)) =>
        {
            Ok(joined)
        }
        _ => Err(Error::PathEscape(requested.to_string())),
    }
}

/// Check that `path` still resolves under `root` once symlinks are followed
///
/// With `follow_final` unset only the parent chain is resolved, which is the
/// right check for operations that act on a link itself (lstat, readlink,
/// remove, rename). Components that do not exist yet are skipped; the deepest
/// existing ancestor is what gets canonicalized. Dangling symlinks are not
/// missing components: their targets are checked instead.
///
/// # Errors
///
/// Returns [`Error::PathEscape`] if the resolved location is outside `root`,
/// or [`Error::Io`] if the root itself cannot be resolved.
pub async fn ensure_resolved_within(root: &Path, path: &Path, follow_final: bool) -> Result<()> {
    let canonical_root = tokio::fs::canonicalize(root).await?;

    if !follow_final && path == root {
        return Ok(());
    }

    let mut pending = if follow_final {
        Some(path.to_path_buf())
    } else {
        path.parent().map(Path::to_path_buf)
    };
    let mut hops = 0;

    while let Some(candidate) = pending {
        match tokio::fs::canonicalize(&candidate).await {
            Ok(resolved) => {
                if resolved.starts_with(&canonical_root) {
                    return Ok(());
                }
                warn!(
                    event = "symlink_escape",
                    path = %path.display(),
                    resolved = %resolved.display(),
                    "Path resolves outside session root"
                );
                return Err(Error::PathEscape(path.display().to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A dangling link is NotFound too, but creating through it
                // lands wherever it points.
                if let Some(target) = dangling_link_target(&candidate).await? {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return Err(Error::PathEscape(path.display().to_string()));
                    }
                    pending = Some(target);
                } else {
                    pending = candidate.parent().map(Path::to_path_buf);
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Err(Error::PathEscape(path.display().to_string()))
}

/// Dangling links followed before giving up
const MAX_LINK_HOPS: usize = 40;

/// Target of `candidate` if it is a symlink, resolved against its directory
async fn dangling_link_target(candidate: &Path) -> Result<Option<PathBuf>> {
    match tokio::fs::symlink_metadata(candidate).await {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            let target = tokio::fs::read_link(candidate).await?;
            let joined = match candidate.parent() {
                Some(dir) if target.is_relative() => dir.join(target),
                _ => target,
            };
            Ok(Some(lexical_clean(&joined)))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Confine the target of a symbolic link
///
/// `target` is the raw link contents read from `link_path`. Relative targets
/// are resolved against the link's directory, absolute ones are taken as
/// host paths. Returns the target as the client should see it: relative
/// targets unchanged, absolute targets rewritten as virtual paths.
///
/// # Errors
///
/// Returns [`Error::PathEscape`] if the target points outside `root`.
pub fn link_target_within(root: &Path, link_path: &Path, target: &Path) -> Result<String> {
    let escape = || Error::PathEscape(format!("{} -> {}", link_path.display(), target.display()));

    if target.is_absolute() {
        let relative = lexical_clean(target)
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| escape())?;
        return normalize(&relative.to_string_lossy()).map_err(|_| escape());
    }

    let link_dir = link_path.parent().ok_or_else(escape)?;
    let relative_dir = link_dir.strip_prefix(root).map_err(|_| escape())?;
    let combined = relative_dir.join(target);
    normalize(&combined.to_string_lossy()).map_err(|_| escape())?;

    Ok(target.to_string_lossy().into_owned())
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
