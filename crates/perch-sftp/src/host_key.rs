//! Host identity
//!
//! The host key is loaded once at startup and handed to the SSH config by
//! the server. On first start a fresh RSA key is generated and persisted
//! with owner-only permissions.

use crate::{Error, Result};
use russh::keys::PrivateKey;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, HashAlg, LineEnding};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Load the host key at `path`, generating it first if it does not exist
///
/// # Errors
///
/// Returns [`Error::HostKey`] if the key cannot be parsed, generated or
/// written.
pub async fn load_or_create(path: &Path) -> Result<PrivateKey> {
    load_or_create_with(
        path,
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        },
    )
    .await
}

/// Same as [`load_or_create`] with an explicit algorithm for new keys
///
/// # Errors
///
/// Returns [`Error::HostKey`] if the key cannot be parsed, generated or
/// written.
pub async fn load_or_create_with(path: &Path, algorithm: Algorithm) -> Result<PrivateKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let key = russh::keys::load_secret_key(path, None).map_err(|e| {
            Error::HostKey(format!("Failed to load host key {}: {e}", path.display()))
        })?;
        info!(
            event = "host_key_loaded",
            path = %path.display(),
            algorithm = %key.algorithm(),
            "Loaded host key"
        );
        return Ok(key);
    }

    info!(
        event = "host_key_generating",
        path = %path.display(),
        algorithm = %algorithm,
        "Host key not found, generating"
    );

    let key = PrivateKey::random(&mut OsRng, algorithm)
        .map_err(|e| Error::HostKey(format!("Failed to generate host key: {e}")))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::HostKey(format!("Failed to encode host key: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::HostKey(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }

    write_private(path, encoded.as_bytes())
        .await
        .map_err(|e| Error::HostKey(format!("Failed to write {}: {e}", path.display())))?;

    info!(event = "host_key_saved", path = %path.display(), "Saved new host key");
    Ok(key)
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generates_and_reloads_same_key() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("keys").join("host_key");

        let created = load_or_create_with(&path, Algorithm::Ed25519).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_create_with(&path, Algorithm::Ed25519).await.unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("host_key");
        load_or_create_with(&path, Algorithm::Ed25519).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_garbage_key_is_host_key_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("host_key");
        std::fs::write(&path, b"not a key").unwrap();

        let err = load_or_create(&path).await.unwrap_err();
        assert!(matches!(err, Error::HostKey(_)));
    }
}
