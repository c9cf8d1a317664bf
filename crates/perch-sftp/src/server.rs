//! SFTP server
//!
//! Owns the listener, the host key and everything shared between
//! connections. Each accepted TCP connection gets its own task running the
//! SSH session; each accepted `sftp` subsystem gets its own task running the
//! SFTP loop.

use crate::audit::{AuditEvent, Auditor};
use crate::dispatcher::RequestDispatcher;
use crate::rate_limit::RateLimiter;
use crate::session::{ConnectionIdentity, SessionState};
use crate::sftp::SftpSession;
use crate::stats::{ServerStats, StatusSnapshot};
use crate::users::UserDirectory;
use crate::{host_key, Config, Error, Result};
use chrono::{DateTime, Utc};
use russh::keys::PrivateKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often expired rate-limit records are dropped
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by every connection
struct Shared {
    config: Config,
    users: UserDirectory,
    rate_limiter: RateLimiter,
    stats: ServerStats,
    auditor: Auditor,
}

/// SFTP server
pub struct Server {
    shared: Arc<Shared>,
    ssh_config: Arc<russh::server::Config>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Create a server, loading or generating the host key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or user list,
    /// and [`Error::HostKey`] if the host key cannot be loaded or created.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let key = host_key::load_or_create(&config.server.host_key_path).await?;
        Self::with_host_key(config, key)
    }

    /// Create a server with an already loaded host key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or user list.
    pub fn with_host_key(config: Config, key: PrivateKey) -> Result<Self> {
        config.validate()?;
        let users = UserDirectory::from_config(&config.users)?;

        let ssh_config = russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(config.server.inactivity_timeout_secs)),
            auth_rejection_time: Duration::from_secs(config.server.auth_rejection_delay_secs),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: config.server.max_auth_attempts,
            methods: password_only(),
            keys: vec![key],
            ..Default::default()
        };

        info!(
            event = "server_configured",
            users = users.len(),
            permission_mode = ?config.server.permission_mode,
            root_path = %config.server.root_path.display(),
            "Server configured"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                rate_limiter: RateLimiter::new(config.rate_limit.clone()),
                auditor: Auditor::new(config.logging.audit_enabled),
                stats: ServerStats::new(),
                users,
                config,
            }),
            ssh_config: Arc::new(ssh_config),
            shutdown: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Configured listen address
    pub fn listen_addr(&self) -> String {
        format!(
            "{}:{}",
            self.shared.config.server.host, self.shared.config.server.port
        )
    }

    /// Loaded user directory
    pub fn users(&self) -> &UserDirectory {
        &self.shared.users
    }

    /// Shared counters
    pub fn stats(&self) -> ServerStats {
        self.shared.stats.clone()
    }

    /// Current status
    pub fn status(&self) -> StatusSnapshot {
        self.shared
            .stats
            .snapshot(self.running.load(Ordering::Relaxed), &self.listen_addr())
    }

    /// Token that stops the accept loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let addr = self.listen_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!(event = "bind_failed", %addr, error = %e, "Failed to bind listener");
            Error::Io(e)
        })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and skipped.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_or_else(|_| self.listen_addr(), |addr| addr.to_string());
        info!(event = "server_listening", addr = %local, "SFTP server listening");

        self.running.store(true, Ordering::Relaxed);
        let cleanup = self.spawn_rate_limit_cleanup();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        warn!(event = "accept_failed", error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        self.running.store(false, Ordering::Relaxed);
        cleanup.abort();
        info!(
            event = "server_stopped",
            active_connections = self.shared.stats.active_connections(),
            "Accept loop stopped"
        );
        Ok(())
    }

    fn spawn_rate_limit_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => shared.rate_limiter.cleanup_expired().await,
                }
            }
        })
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let handler = ConnectionHandler::new(Arc::clone(&self.shared), Some(peer));
        let session_id = handler.identity.session_id;
        let config = Arc::clone(&self.ssh_config);

        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(%session_id, %peer, error = %e, "Connection ended with error");
                    }
                }
                Err(e) => {
                    debug!(%session_id, %peer, error = %e, "SSH handshake failed");
                }
            }
        });
    }
}

fn password_only() -> MethodSet {
    MethodSet::from(&[MethodKind::Password][..])
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(password_only()),
        partial_success: false,
    }
}

/// SSH handler for one connection
pub struct ConnectionHandler {
    shared: Arc<Shared>,
    identity: ConnectionIdentity,
    connected_at: DateTime<Utc>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn new(shared: Arc<Shared>, peer: Option<SocketAddr>) -> Self {
        let identity = ConnectionIdentity::new(peer);

        shared.stats.record_connection();
        shared.auditor.record(&AuditEvent::ConnectionEstablished {
            session_id: identity.session_id,
            client_ip: identity.client_ip(),
            timestamp: Utc::now(),
        });

        Self {
            shared,
            identity,
            connected_at: Utc::now(),
            channels: HashMap::new(),
        }
    }

    fn audit_auth(&self, username: &str, success: bool) {
        self.shared.auditor.record(&AuditEvent::AuthAttempt {
            session_id: self.identity.session_id,
            client_ip: self.identity.client_ip(),
            username: username.to_string(),
            success,
            timestamp: Utc::now(),
        });
    }

    fn refuse_channel(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<()> {
        self.channels.remove(&channel_id);
        session.channel_failure(channel_id)?;
        session.close(channel_id)?;
        Ok(())
    }

    async fn start_sftp(&mut self, channel: Channel<Msg>, username: &str) {
        let server = &self.shared.config.server;

        if server.create_user_roots && self.shared.users.find_user(username).is_some() {
            let root = server.root_path.join(username);
            if let Err(e) = tokio::fs::create_dir_all(&root).await {
                warn!(
                    event = "user_root_create_failed",
                    root = %root.display(),
                    error = %e,
                    "Failed to create user root"
                );
            }
        }

        let state = SessionState::from_directory(
            &self.shared.users,
            username,
            &server.root_path,
            server.permission_mode,
        );

        self.shared.stats.record_session();
        self.shared.auditor.record(&AuditEvent::SessionStarted {
            session_id: self.identity.session_id,
            username: username.to_string(),
            denied: matches!(state, SessionState::Denied),
            timestamp: Utc::now(),
        });

        let dispatcher = RequestDispatcher::new(
            state,
            self.identity.clone(),
            self.shared.auditor,
            self.shared.stats.clone(),
        );
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(dispatcher)).await;
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.shared.stats.record_connection_close();
        self.shared.auditor.record(&AuditEvent::ConnectionClosed {
            session_id: self.identity.session_id,
            client_ip: self.identity.client_ip(),
            username: self.identity.username.clone(),
            duration_secs: Utc::now()
                .signed_duration_since(self.connected_at)
                .num_seconds(),
            timestamp: Utc::now(),
        });
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        let client_ip = self.identity.client_ip();

        if let Some(ip) = client_ip {
            if !self.shared.rate_limiter.check_allowed(ip).await {
                self.shared.stats.record_rate_limited();
                self.audit_auth(user, false);
                return Ok(reject());
            }
        }

        match self.shared.users.authenticate(user, password) {
            Ok(record) => {
                if let Some(ip) = client_ip {
                    self.shared.rate_limiter.record_success(ip).await;
                }
                self.shared.stats.record_auth_success();
                self.identity.username = Some(record.username().to_string());
                self.audit_auth(user, true);
                Ok(Auth::Accept)
            }
            Err(e) => {
                debug!(session_id = %self.identity.session_id, error = %e, "Password rejected");
                self.shared.stats.record_auth_failure();
                self.audit_auth(user, false);

                if let Some(ip) = client_ip {
                    if self.shared.rate_limiter.record_failure(ip).await {
                        self.shared.auditor.record(&AuditEvent::RateLimited {
                            client_ip: ip,
                            lockout_secs: self.shared.rate_limiter.lockout_secs(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                Ok(reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if self.identity.username.is_none() {
            return Ok(false);
        }
        debug!(session_id = %self.identity.session_id, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let Some(username) = self.identity.username.clone() else {
            return self.refuse_channel(channel_id, session);
        };

        if name != "sftp" {
            warn!(
                event = "subsystem_rejected",
                session_id = %self.identity.session_id,
                username,
                subsystem = name,
                "Unsupported subsystem requested"
            );
            return self.refuse_channel(channel_id, session);
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;
        self.start_sftp(channel, &username).await;
        Ok(())
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<()> {
        warn!(
            event = "shell_rejected",
            session_id = %self.identity.session_id,
            "Shell access is not available"
        );
        self.refuse_channel(channel_id, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        warn!(
            event = "exec_rejected",
            session_id = %self.identity.session_id,
            "Command execution is not available"
        );
        self.refuse_channel(channel_id, session)
    }

    async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<()> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PermissionConfig, UserConfig};
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::ssh_key::rand_core::OsRng;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.server.root_path = root.to_path_buf();
        config.logging.audit_enabled = false;
        config.users.push(UserConfig {
            username: "bob".into(),
            password: "hunter2".into(),
            permissions: vec![PermissionConfig {
                read: true,
                list: true,
                ..PermissionConfig::default()
            }],
        });
        config
    }

    fn key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn test_duplicate_users_fail_construction() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = config(temp.path());
        config.users.push(config.users[0].clone());

        assert!(matches!(
            Server::with_host_key(config, key()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_status_before_start() {
        let temp = tempfile::TempDir::new().unwrap();
        let server = Server::with_host_key(config(temp.path()), key()).unwrap();

        let status = server.status();
        assert!(!status.running);
        assert_eq!(status.total_connections, 0);
        assert_eq!(status.listen_addr, "127.0.0.1:0");
        assert_eq!(server.users().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let temp = tempfile::TempDir::new().unwrap();
        let server = Arc::new(Server::with_host_key(config(temp.path()), key()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let token = server.shutdown_token();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.serve(listener).await });

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!server.status().running);
    }

    #[tokio::test]
    async fn test_connections_are_counted() {
        let temp = tempfile::TempDir::new().unwrap();
        let server = Arc::new(Server::with_host_key(config(temp.path()), key()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let token = server.shutdown_token();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.serve(listener).await });

        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if server.status().total_connections > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.status().total_connections, 1);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
