//! User directory and password verification
//!
//! Built once from the configuration and never mutated. Sessions hold their
//! own `Arc<UserRecord>`, so whatever they resolved at login stays in effect
//! for the life of the connection.

use crate::config::UserConfig;
use crate::permissions::PermissionRule;
use crate::{Error, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Hash verified for unknown users and plaintext secrets so every login
/// attempt pays for one Argon2 verification
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("perch-dummy-credential").ok());

/// Stored credential
#[derive(Clone)]
pub enum Secret {
    /// Argon2 PHC string
    Hash(String),
    /// Plaintext password, compared in constant time
    Plain(String),
}

impl Secret {
    /// Interpret a configured password
    ///
    /// Values starting with `$argon2` are parsed as PHC hashes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an `$argon2` value is not a valid PHC string.
    pub fn parse(value: &str) -> Result<Self> {
        if value.starts_with("$argon2") {
            let invalid = |reason: &dyn fmt::Display| {
                Error::Config(format!("Invalid password hash: {reason}"))
            };
            let parsed = PasswordHash::new(value).map_err(|e| invalid(&e))?;
            argon2::Algorithm::try_from(parsed.algorithm).map_err(|e| invalid(&e))?;
            argon2::Params::try_from(&parsed).map_err(|e| invalid(&e))?;
            if parsed.salt.is_none() || parsed.hash.is_none() {
                return Err(invalid(&"missing salt or hash"));
            }
            Ok(Self::Hash(value.to_string()))
        } else {
            Ok(Self::Plain(value.to_string()))
        }
    }

    /// Check a candidate password
    pub fn verify(&self, candidate: &str) -> bool {
        match self {
            Self::Hash(hash) => verify_password_hash(candidate, hash),
            Self::Plain(expected) => constant_time_eq(expected.as_bytes(), candidate.as_bytes()),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(_) => f.write_str("Secret::Hash(<redacted>)"),
            Self::Plain(_) => f.write_str("Secret::Plain(<redacted>)"),
        }
    }
}

/// A configured user
#[derive(Debug, Clone)]
pub struct UserRecord {
    username: String,
    password: Secret,
    permissions: Vec<PermissionRule>,
}

impl UserRecord {
    /// Create a user record
    pub const fn new(username: String, password: Secret, permissions: Vec<PermissionRule>) -> Self {
        Self {
            username,
            password,
            permissions,
        }
    }

    /// Login name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Ordered permission rules
    pub fn permissions(&self) -> &[PermissionRule] {
        &self.permissions
    }

    /// Check a candidate password
    pub fn verify_password(&self, candidate: &str) -> bool {
        self.password.verify(candidate)
    }
}

impl TryFrom<&UserConfig> for UserRecord {
    type Error = Error;

    fn try_from(config: &UserConfig) -> Result<Self> {
        validate_username(&config.username)?;

        let permissions = config
            .permissions
            .iter()
            .map(PermissionRule::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(
            config.username.clone(),
            Secret::parse(&config.password)?,
            permissions,
        ))
    }
}

/// Read-only username → user map
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<String, Arc<UserRecord>>,
}

impl UserDirectory {
    /// Build the directory from configured users
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on duplicate usernames, usernames that are
    /// not a single path component, or malformed rules and hashes.
    pub fn from_config(users: &[UserConfig]) -> Result<Self> {
        let mut directory = HashMap::with_capacity(users.len());

        for config in users {
            let record = UserRecord::try_from(config)?;
            if directory
                .insert(record.username.clone(), Arc::new(record))
                .is_some()
            {
                return Err(Error::Config(format!(
                    "Duplicate username: {}",
                    config.username
                )));
            }
        }

        Ok(Self { users: directory })
    }

    /// Look up a user
    pub fn find_user(&self, username: &str) -> Option<Arc<UserRecord>> {
        self.users.get(username).cloned()
    }

    /// Verify a username and password
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] for an unknown user or a wrong
    /// password. The two cases are indistinguishable to the caller's peer.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Arc<UserRecord>> {
        let Some(user) = self.find_user(username) else {
            verify_dummy(password);
            debug!(username, "Unknown user");
            return Err(Error::Authentication(format!("unknown user {username}")));
        };

        // Plaintext checks are otherwise far cheaper than an Argon2 verify.
        if matches!(user.password, Secret::Plain(_)) {
            verify_dummy(password);
        }

        if user.verify_password(password) {
            Ok(user)
        } else {
            Err(Error::Authentication(format!("bad password for {username}")))
        }
    }

    /// Number of configured users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no users are configured
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Iterate over configured usernames
    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }
}

/// Hash a password into an Argon2id PHC string
///
/// # Errors
///
/// Returns [`Error::Config`] if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Config(format!("Failed to hash password: {e}")))
}

fn verify_dummy(password: &str) {
    if let Some(dummy) = DUMMY_HASH.as_deref() {
        let _ = verify_password_hash(password, dummy);
    }
}

fn verify_password_hash(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

/// Compare two byte strings without early exit on the first mismatch
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b) {
        result |= x ^ y;
    }
    result == 0
}

fn validate_username(username: &str) -> Result<()> {
    let mut components = Path::new(username).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if username.is_empty() || username.contains(['/', '\\', '\0']) || !single_normal {
        return Err(Error::Config(format!("Invalid username: {username:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionConfig;

    fn user(name: &str, password: &str) -> UserConfig {
        UserConfig {
            username: name.into(),
            password: password.into(),
            permissions: vec![PermissionConfig {
                read: true,
                list: true,
                ..PermissionConfig::default()
            }],
        }
    }

    #[test]
    fn test_find_user() {
        let directory = UserDirectory::from_config(&[user("bob", "pw")]).unwrap();
        assert_eq!(directory.find_user("bob").unwrap().username(), "bob");
        assert!(directory.find_user("eve").is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_duplicate_usernames_are_config_errors() {
        let err = UserDirectory::from_config(&[user("bob", "a"), user("bob", "b")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_username_must_be_single_component() {
        for bad in ["", ".", "..", "a/b", "../bob", "a\\b"] {
            assert!(
                UserDirectory::from_config(&[user(bad, "pw")]).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_user_and_bad_password_look_the_same() {
        let directory = UserDirectory::from_config(&[user("bob", "hunter2")]).unwrap();

        let unknown = directory.authenticate("eve", "hunter2").unwrap_err();
        let wrong = directory.authenticate("bob", "letmein").unwrap_err();

        assert!(matches!(unknown, Error::Authentication(_)));
        assert!(matches!(wrong, Error::Authentication(_)));
        assert_eq!(unknown.sanitized_message(), wrong.sanitized_message());
    }

    #[test]
    fn test_authentication_is_deterministic() {
        let directory = UserDirectory::from_config(&[user("bob", "hunter2")]).unwrap();
        for _ in 0..3 {
            assert!(directory.authenticate("bob", "hunter2").is_ok());
            assert!(directory.authenticate("bob", "hunter3").is_err());
        }
    }

    #[test]
    fn test_argon2_hashed_password() {
        let hash = hash_password("correct horse").unwrap();
        let directory = UserDirectory::from_config(&[user("alice", &hash)]).unwrap();

        assert!(directory.authenticate("alice", "correct horse").is_ok());
        assert!(directory.authenticate("alice", "battery staple").is_err());
    }

    #[test]
    fn test_malformed_hash_rejected_at_load() {
        let valid = hash_password("pw").unwrap();
        let (without_hash, _) = valid.rsplit_once('$').unwrap();

        for bad in [
            "$argon2id$garbage",
            "$argon2id$v=19$m=19456,t=2,p=1",
            "$argon2xx$v=19$m=19456,t=2,p=1$c2FsdHNhbHQ$aGFzaGhhc2g",
            without_hash,
        ] {
            let err = UserDirectory::from_config(&[user("alice", bad)]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad:?} should be rejected");
        }

        assert!(UserDirectory::from_config(&[user("alice", &valid)]).is_ok());
    }

    #[test]
    fn test_plaintext_failure_costs_as_much_as_unknown_user() {
        let directory = UserDirectory::from_config(&[user("bob", "hunter2")]).unwrap();
        let hashed = Secret::parse(&hash_password("pw").unwrap()).unwrap();

        // Warm the dummy hash so neither side pays for building it.
        let _ = directory.authenticate("eve", "x");

        let time = |f: &dyn Fn()| {
            let start = std::time::Instant::now();
            for _ in 0..3 {
                f();
            }
            start.elapsed()
        };

        let plain = time(&|| assert!(directory.authenticate("bob", "wrong").is_err()));
        let argon = time(&|| assert!(!hashed.verify("wrong")));

        assert!(
            plain * 4 >= argon,
            "plaintext rejection took {plain:?}, one Argon2 verify took {argon:?}"
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::parse("hunter2").unwrap();
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
