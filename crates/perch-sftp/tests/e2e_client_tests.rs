//! End-to-end tests over a loopback SSH connection
//!
//! Start the server on an ephemeral port and drive it with a `russh` client
//! and the `russh-sftp` client session.

use perch_sftp::Server;
use perch_sftp::config::{Config, PermissionConfig, RateLimitSettings, UserConfig};
use russh::ChannelMsg;
use russh::client;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::{self, Algorithm, rand_core::OsRng};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn test_config(temp_dir: &TempDir, rate_limit: RateLimitSettings) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.server.root_path = temp_dir.path().join("srv");
    config.server.auth_rejection_delay_secs = 0;
    config.logging.audit_enabled = false;
    config.rate_limit = rate_limit;
    config.users.push(UserConfig {
        username: "bob".into(),
        password: "hunter2".into(),
        permissions: vec![PermissionConfig {
            path: "/".into(),
            read: true,
            list: true,
            ..PermissionConfig::default()
        }],
    });
    config
}

/// Serve on an ephemeral loopback port
async fn start_server(rate_limit: RateLimitSettings) -> (Arc<Server>, SocketAddr, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let bob_root = temp_dir.path().join("srv/bob");
    tokio::fs::create_dir_all(&bob_root).await.unwrap();
    tokio::fs::write(bob_root.join("report.txt"), b"q3 numbers")
        .await
        .unwrap();

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let server = Arc::new(
        Server::with_host_key(test_config(&temp_dir, rate_limit), key).unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = Arc::clone(&server);
    tokio::spawn(async move { running.serve(listener).await });

    (server, addr, temp_dir)
}

async fn connect(addr: SocketAddr) -> client::Handle<TestClient> {
    let config = Arc::new(client::Config::default());
    tokio::time::timeout(TIMEOUT, client::connect(config, addr, TestClient))
        .await
        .unwrap()
        .unwrap()
}

async fn login(addr: SocketAddr, user: &str, password: &str) -> (client::Handle<TestClient>, bool) {
    let mut session = connect(addr).await;
    let result = session.authenticate_password(user, password).await.unwrap();
    (session, result.success())
}

/// Read channel messages until the server closes the channel
async fn drain(channel: &mut russh::Channel<client::Msg>) -> Vec<ChannelMsg> {
    tokio::time::timeout(TIMEOUT, async {
        let mut seen = Vec::new();
        while let Some(msg) = channel.wait().await {
            let closed = matches!(msg, ChannelMsg::Close);
            seen.push(msg);
            if closed {
                break;
            }
        }
        seen
    })
    .await
    .unwrap()
}

fn no_lockout() -> RateLimitSettings {
    RateLimitSettings {
        max_attempts: 100,
        ..RateLimitSettings::default()
    }
}

/// Unknown users and wrong passwords are both rejected
#[tokio::test]
async fn test_authentication_failure() {
    let (server, addr, _temp) = start_server(no_lockout()).await;

    let (_eve, ok) = login(addr, "eve", "hunter2").await;
    assert!(!ok);

    let (_bob, ok) = login(addr, "bob", "wrong").await;
    assert!(!ok);

    let (_bob, ok) = login(addr, "bob", "hunter2").await;
    assert!(ok);

    let status = server.status();
    assert_eq!(status.auth_failures, 2);
    assert_eq!(status.auth_successes, 1);
    assert_eq!(status.sessions_started, 0);
}

/// A locked-out address is refused even with the right password
#[tokio::test]
async fn test_rate_limiting() {
    let limits = RateLimitSettings {
        max_attempts: 2,
        window_secs: 300,
        lockout_secs: 600,
    };
    let (server, addr, _temp) = start_server(limits).await;

    for _ in 0..2 {
        let (_session, ok) = login(addr, "eve", "guess").await;
        assert!(!ok);
    }

    let (_bob, ok) = login(addr, "bob", "hunter2").await;
    assert!(!ok, "locked-out address must not authenticate");

    let status = server.status();
    assert!(status.rate_limited >= 1);
    assert_eq!(status.auth_successes, 0);
}

/// Only the sftp subsystem is served
#[tokio::test]
async fn test_other_subsystems_refused() {
    let (server, addr, _temp) = start_server(no_lockout()).await;
    let (session, ok) = login(addr, "bob", "hunter2").await;
    assert!(ok);

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "shell-ish").await.unwrap();
    let messages = drain(&mut channel).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Close)));

    assert_eq!(server.status().sessions_started, 0);
}

/// Shell and exec requests are refused and the channel closed
#[tokio::test]
async fn test_shell_and_exec_refused() {
    let (_server, addr, _temp) = start_server(no_lockout()).await;
    let (session, ok) = login(addr, "bob", "hunter2").await;
    assert!(ok);

    let mut shell = session.channel_open_session().await.unwrap();
    shell.request_shell(true).await.unwrap();
    let messages = drain(&mut shell).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));

    let mut exec = session.channel_open_session().await.unwrap();
    exec.exec(true, "cat /etc/passwd").await.unwrap();
    let messages = drain(&mut exec).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));
    assert!(
        !messages.iter().any(|m| matches!(m, ChannelMsg::Data { .. })),
        "no command output may be sent"
    );
}

/// Read, list and a refused write over a real SFTP channel
#[tokio::test]
async fn test_sftp_over_ssh() {
    let (server, addr, temp_dir) = start_server(no_lockout()).await;
    let (session, ok) = login(addr, "bob", "hunter2").await;
    assert!(ok);

    let channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let sftp = tokio::time::timeout(TIMEOUT, SftpSession::new(channel.into_stream()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sftp.canonicalize(".").await.unwrap(), "/");

    let mut file = sftp.open("/report.txt").await.unwrap();
    let mut content = Vec::new();
    file.read_to_end(&mut content).await.unwrap();
    assert_eq!(content, b"q3 numbers");

    let names: Vec<String> = sftp
        .read_dir("/")
        .await
        .unwrap()
        .map(|entry| entry.file_name())
        .collect();
    assert!(names.contains(&"report.txt".to_string()));

    let err = sftp
        .open_with_flags("/new.txt", OpenFlags::CREATE | OpenFlags::WRITE)
        .await
        .err().unwrap();
    match err {
        SftpError::Status(status) => assert_eq!(status.status_code, StatusCode::PermissionDenied),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!temp_dir.path().join("srv/bob/new.txt").exists());

    let err = sftp.open("/../../etc/hosts").await.err().unwrap();
    assert!(matches!(
        err,
        SftpError::Status(ref status) if status.status_code == StatusCode::PermissionDenied
    ));

    assert_eq!(server.status().sessions_started, 1);
}
