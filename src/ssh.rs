//! SSH server implementation using russh.
//!
//! Handles:
//! - Inbound handshake and password capture
//! - Endpoint resolution and the upstream dial, once per connection
//! - Session channel bridging between the two SSH sessions

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Pty, Sig, SshId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::bridge::{ChannelBridge, ChannelRequest, DownstreamEvent};
use crate::config::ProxyConfig;
use crate::hostkey;
use crate::upstream::{self, UpstreamHandler};

/// Name advertised in the server identification string.
const SERVER_NAME: &str = "GateShell";

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<ProxyConfig>,
}

/// Per-connection handler state.
///
/// One of these drives the whole lifecycle of an inbound connection: the
/// captured credentials, the single upstream session dialed for it, and
/// the bridges for its channels.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// User name presented by the inbound client; the routing key.
    routing_key: Option<String>,

    /// Password captured during inbound auth. Held only until the
    /// upstream dial settles, then dropped (and zeroed).
    password: Option<Zeroizing<String>>,

    /// Upstream session, dialed right after inbound auth completes.
    upstream: Option<russh::client::Handle<UpstreamHandler>>,

    /// Active bridges (inbound channel id -> event sender).
    bridges: HashMap<ChannelId, mpsc::UnboundedSender<DownstreamEvent>>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            routing_key: None,
            password: None,
            upstream: None,
            bridges: HashMap::new(),
        }
    }

    /// Hand a captured channel request to the channel's bridge.
    ///
    /// The bridge mirrors the upstream's reply back to the client later;
    /// a request for a channel without a bridge is answered with failure
    /// right away.
    async fn forward_request(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        match self.bridges.get(&channel) {
            Some(events) => {
                let _ = events.send(DownstreamEvent::Request(request));
            }
            None => {
                debug!("Request for unbridged channel {:?}", channel);
                session.channel_failure(channel)?;
            }
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Accept any password and remember it; the upstream is the real
    /// authenticator, this proxy only passes credentials through.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!("Password auth from {} for user '{}'", self.peer_addr, user);
        self.routing_key = Some(user.to_string());
        self.password = Some(Zeroizing::new(password.to_string()));
        Ok(Auth::Accept)
    }

    /// Inbound auth is done: resolve the routing key and dial upstream.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let routing_key = self
            .routing_key
            .clone()
            .context("Authenticated session without a user name")?;
        let password = self
            .password
            .take()
            .unwrap_or_else(|| Zeroizing::new(String::new()));

        let Some(endpoint) = self.server.config.resolve(&routing_key).cloned() else {
            warn!(
                "No endpoint for user '{}' from {}",
                routing_key, self.peer_addr
            );
            let handle = session.handle();
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "no endpoint for user".to_string(),
                    String::new(),
                )
                .await;
            return Ok(());
        };

        info!(
            "Routing '{}' from {} to {} as '{}'",
            routing_key, self.peer_addr, endpoint.target, endpoint.user
        );

        match upstream::dial(&endpoint, &password).await {
            Ok(handle) => {
                self.upstream = Some(handle);
            }
            Err(err) => {
                warn!("Upstream dial for '{}' failed: {:#}", routing_key, err);
                let handle = session.handle();
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "upstream unreachable".to_string(),
                        String::new(),
                    )
                    .await;
            }
        }
        // `password` drops here; its buffer is zeroed either way.
        Ok(())
    }

    /// A new inbound `session` channel: open the matching upstream channel
    /// and wire the pair up. A refusal upstream rejects this channel only.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(upstream) = self.upstream.as_ref() else {
            debug!(
                "Rejecting session channel from {}: no upstream session",
                self.peer_addr
            );
            return Ok(false);
        };

        match upstream.channel_open_session().await {
            Ok(upstream_channel) => {
                debug!(
                    "Bridging session channel {:?} for {}",
                    channel.id(),
                    self.peer_addr
                );
                let (bridge, events) =
                    ChannelBridge::new(session.handle(), channel.id(), upstream_channel);
                self.bridges.insert(channel.id(), events);
                tokio::spawn(bridge.run());
                Ok(true)
            }
            Err(err) => {
                warn!(
                    "Upstream refused session channel for {}: {}",
                    self.peer_addr, err
                );
                Ok(false)
            }
        }
    }

    /// Only `session` channels are proxied.
    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Rejecting direct-tcpip channel to {}:{} from {}",
            host_to_connect, port_to_connect, self.peer_addr
        );
        Ok(false)
    }

    /// Handle data from the client.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(events) = self.bridges.get(&channel) {
            let _ = events.send(DownstreamEvent::Data(data.to_vec()));
        }
        Ok(())
    }

    /// Handle extended (stderr-class) data from the client.
    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(events) = self.bridges.get(&channel) {
            let _ = events.send(DownstreamEvent::ExtendedData {
                code,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    /// Handle channel EOF: propagate the half-close upstream.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel);
        if let Some(events) = self.bridges.get(&channel) {
            let _ = events.send(DownstreamEvent::Eof);
        }
        Ok(())
    }

    /// Handle channel close: dropping the sender lets the bridge finish.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel);
        self.bridges.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelRequest::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
            session,
        )
        .await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelRequest::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
            session,
        )
        .await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::Exec(data.to_vec()), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::Subsystem(name.to_string()), session)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
            session,
        )
        .await
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::Signal(signal), session)
            .await
    }

    /// The proxy advertises no global features.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Refusing tcpip-forward for {}:{} from {}",
            address, port, self.peer_addr
        );
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Refusing cancel-tcpip-forward for {}:{} from {}",
            address, port, self.peer_addr
        );
        Ok(false)
    }
}

impl Drop for ConnectionHandler {
    /// The inbound connection is gone: close the upstream session once the
    /// bridges (which hold their own channel halves) have drained.
    fn drop(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            tokio::spawn(async move {
                let _ = upstream
                    .disconnect(Disconnect::ByApplication, "", "")
                    .await;
            });
        }
    }
}

/// Run the SSH proxy server.
pub async fn run_server(config: Arc<ProxyConfig>) -> Result<()> {
    let key = hostkey::ensure_host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        server_id: SshId::Standard(format!(
            "SSH-2.0-{}-{}",
            SERVER_NAME,
            env!("CARGO_PKG_VERSION")
        )),
        methods: MethodSet::from(&[MethodKind::Password][..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let server_state = Arc::new(ServerState {
        config: config.clone(),
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("SSH proxy listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                // Transient accept errors must not kill the server.
                warn!("Failed to accept incoming connection: {}", err);
                continue;
            }
        };

        let server_state = server_state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            debug!("New connection from {}", peer_addr);
            let handler = ConnectionHandler::new(server_state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(err) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, err);
                    }
                    debug!("Connection from {} closed", peer_addr);
                }
                Err(err) => {
                    warn!("SSH handshake failed from {}: {}", peer_addr, err);
                }
            }
        });
    }
}
