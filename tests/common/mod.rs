//! Shared fixtures for the integration suites: an in-process upstream SSH
//! server that records the authentication it sees, answers exec requests,
//! and echoes shell input; plus a client handler that trusts any host key.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{client, Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use gateshell::config::{AuthMethod, Endpoint, ProxyConfig};

/// One authentication attempt observed by the fake upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAuth {
    Password { user: String, password: String },
    None { user: String },
}

/// Handle to a running fake upstream server.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub auth_log: Arc<Mutex<Vec<UpstreamAuth>>>,
}

impl FakeUpstream {
    pub fn auth_seen(&self) -> Vec<UpstreamAuth> {
        self.auth_log.lock().unwrap().clone()
    }
}

/// Start an upstream SSH server on an ephemeral port.
///
/// Password auth always succeeds and is recorded. `none` auth succeeds
/// only when `allow_none` is set. `exec` of `echo hi` answers `hi\n` with
/// exit status 0; any other command is reported back with a `ran:` prefix.
/// Shell channels echo their input.
pub async fn spawn_upstream(allow_none: bool) -> FakeUpstream {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let config = Arc::new(server::Config {
        keys: vec![key],
        methods: MethodSet::from(&[MethodKind::None, MethodKind::Password][..]),
        auth_rejection_time: Duration::from_millis(10),
        ..Default::default()
    });

    let auth_log: Arc<Mutex<Vec<UpstreamAuth>>> = Arc::new(Mutex::new(Vec::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let log = auth_log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = EchoHandler {
                auth_log: log.clone(),
                allow_none,
            };
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    FakeUpstream { addr, auth_log }
}

struct EchoHandler {
    auth_log: Arc<Mutex<Vec<UpstreamAuth>>>,
    allow_none: bool,
}

impl server::Handler for EchoHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.auth_log.lock().unwrap().push(UpstreamAuth::Password {
            user: user.to_string(),
            password: password.to_string(),
        });
        Ok(Auth::Accept)
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.allow_none {
            self.auth_log.lock().unwrap().push(UpstreamAuth::None {
                user: user.to_string(),
            });
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let command = String::from_utf8_lossy(data).to_string();
        let handle = session.handle();
        tokio::spawn(async move {
            let output = match command.as_str() {
                "echo hi" => b"hi\n".to_vec(),
                other => format!("ran: {}\n", other).into_bytes(),
            };
            let _ = handle.data(channel, CryptoVec::from_slice(&output)).await;
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Echo shell input back to the sender.
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }
}

/// Client handler that accepts any proxy host key.
pub struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build an endpoint record pointing at `addr`.
pub fn endpoint_to(addr: SocketAddr, user: &str, methods: Vec<AuthMethod>) -> Endpoint {
    Endpoint {
        target: addr.to_string(),
        user: user.to_string(),
        methods,
    }
}

/// Start the proxy on `port` with the given endpoint table and wait until
/// it accepts TCP connections.
pub async fn spawn_proxy(
    port: u16,
    endpoints: Vec<(&str, Endpoint)>,
    default_endpoint: Option<&str>,
) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ProxyConfig {
        listen_addr: format!("127.0.0.1:{}", port),
        host_key_path: dir.path().join("host_key"),
        default_endpoint: default_endpoint.map(|name| name.to_string()),
        ..ProxyConfig::default()
    };
    for (name, endpoint) in endpoints {
        config.endpoints.insert(name.to_string(), endpoint);
    }
    config.validate().expect("test config must be valid");

    tokio::spawn(async move { gateshell::entrypoint(config).await });

    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the proxy to start");
    }

    dir
}

/// Connect to the proxy and authenticate with a password.
pub async fn connect_client(
    port: u16,
    user: &str,
    password: &str,
) -> client::Handle<TrustingClient> {
    let mut session = client::connect(
        Arc::new(client::Config::default()),
        ("127.0.0.1", port),
        TrustingClient,
    )
    .await
    .expect("Failed to connect to the proxy");

    let result = session
        .authenticate_password(user, password)
        .await
        .expect("Password auth errored");
    assert!(
        matches!(result, client::AuthResult::Success),
        "proxy should accept any password"
    );

    session
}
