//! Per-channel bridging between an inbound session channel and its
//! upstream counterpart.
//!
//! Each accepted inbound `session` channel gets one bridge task. The
//! inbound handler feeds the bridge a stream of downstream events; the
//! bridge owns the upstream channel and the server handle it writes
//! replies and output back through. The byte stream is opaque: nothing in
//! here inspects payloads.

use russh::client;
use russh::server;
use russh::{Channel, ChannelId, ChannelMsg, Pty, Sig};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Which half of a bridge stopped sending first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Downstream,
    Upstream,
}

/// Lifecycle of one bridged channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    /// Both halves live; data and requests flow.
    Open,
    /// The named side signalled EOF; the other side is still drained.
    HalfClosed(Side),
    /// Both halves are done; the bridge tears down.
    Closed,
}

impl BridgeState {
    /// Record that `side` is done sending and return the new state.
    fn eof(self, side: Side) -> BridgeState {
        match self {
            BridgeState::Open => BridgeState::HalfClosed(side),
            BridgeState::HalfClosed(other) if other != side => BridgeState::Closed,
            state => state,
        }
    }

    /// Whether `side` already signalled EOF.
    fn is_done(&self, side: Side) -> bool {
        match self {
            BridgeState::Open => false,
            BridgeState::HalfClosed(done) => *done == side,
            BridgeState::Closed => true,
        }
    }
}

/// A channel request captured on the inbound side, replayed upstream.
///
/// Payloads pass through untouched; the variants only exist because russh
/// hands requests to the server as typed callbacks.
#[derive(Debug)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

/// Traffic flowing from the inbound channel into the bridge task.
#[derive(Debug)]
pub enum DownstreamEvent {
    Data(Vec<u8>),
    ExtendedData { code: u32, data: Vec<u8> },
    Eof,
    Request(ChannelRequest),
}

/// Couples one inbound `session` channel with one upstream `session`
/// channel and pumps bytes and requests both ways until both halves close.
pub struct ChannelBridge {
    downstream_id: ChannelId,
    downstream: server::Handle,
    upstream: Channel<client::Msg>,
    events: mpsc::UnboundedReceiver<DownstreamEvent>,
    state: BridgeState,
    /// Replies owed to the inbound client for requests forwarded upstream.
    pending_replies: usize,
}

impl ChannelBridge {
    /// Build a bridge and the sender the inbound handler feeds it through.
    ///
    /// The event channel is unbounded so the inbound session loop never
    /// blocks on a bridge that is itself waiting for the inbound side to
    /// open its window.
    pub fn new(
        downstream: server::Handle,
        downstream_id: ChannelId,
        upstream: Channel<client::Msg>,
    ) -> (Self, mpsc::UnboundedSender<DownstreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                downstream_id,
                downstream,
                upstream,
                events: events_rx,
                state: BridgeState::Open,
                pending_replies: 0,
            },
            events_tx,
        )
    }

    /// Pump both directions until either side closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            if self.state.is_done(Side::Downstream) {
                                // Requests from a half-closed client side are dropped.
                                debug!(
                                    "Dropping downstream event after EOF on channel {:?}",
                                    self.downstream_id
                                );
                                continue;
                            }
                            if !self.handle_downstream(event).await {
                                break;
                            }
                        }
                        None => {
                            // Inbound channel closed underneath us.
                            let _ = self.upstream.close().await;
                            break;
                        }
                    }
                }
                msg = self.upstream.wait() => {
                    if !self.handle_upstream(msg).await {
                        break;
                    }
                }
            }
        }
        self.state = BridgeState::Closed;
        debug!("Bridge for channel {:?} closed", self.downstream_id);
    }

    /// Apply one downstream event. Returns false when the bridge is done.
    async fn handle_downstream(&mut self, event: DownstreamEvent) -> bool {
        match event {
            DownstreamEvent::Data(data) => {
                if self.upstream.data(&data[..]).await.is_err() {
                    return self.upstream_gone().await;
                }
            }
            DownstreamEvent::ExtendedData { code, data } => {
                if self.upstream.extended_data(code, &data[..]).await.is_err() {
                    return self.upstream_gone().await;
                }
            }
            DownstreamEvent::Eof => {
                let _ = self.upstream.eof().await;
                self.state = self.state.eof(Side::Downstream);
            }
            DownstreamEvent::Request(request) => {
                self.forward_request(request).await;
            }
        }
        true
    }

    /// Apply one upstream message. Returns false when the bridge is done.
    async fn handle_upstream(&mut self, msg: Option<ChannelMsg>) -> bool {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                if self.downstream.data(self.downstream_id, data).await.is_err() {
                    // The inbound side is gone; nothing left to drain for.
                    let _ = self.upstream.close().await;
                    return false;
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if self
                    .downstream
                    .extended_data(self.downstream_id, ext, data)
                    .await
                    .is_err()
                {
                    let _ = self.upstream.close().await;
                    return false;
                }
            }
            Some(ChannelMsg::Success) => {
                if self.pending_replies > 0 {
                    self.pending_replies -= 1;
                    let _ = self.downstream.channel_success(self.downstream_id).await;
                }
            }
            Some(ChannelMsg::Failure) => {
                if self.pending_replies > 0 {
                    self.pending_replies -= 1;
                    let _ = self.downstream.channel_failure(self.downstream_id).await;
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                let _ = self
                    .downstream
                    .exit_status_request(self.downstream_id, exit_status)
                    .await;
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            }) => {
                let _ = self
                    .downstream
                    .exit_signal_request(
                        self.downstream_id,
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    )
                    .await;
            }
            Some(ChannelMsg::Eof) => {
                let _ = self.downstream.eof(self.downstream_id).await;
                self.state = self.state.eof(Side::Upstream);
            }
            Some(ChannelMsg::Close) | None => {
                return self.upstream_gone().await;
            }
            Some(other) => {
                // Window adjustments and the like are handled inside russh.
                debug!("Ignoring upstream channel message {:?}", other);
            }
        }
        true
    }

    /// Replay one inbound channel request on the upstream channel.
    ///
    /// Forwarded requests always ask for a reply so the upstream's verdict
    /// can be mirrored back; russh suppresses the wire reply when the
    /// inbound client did not ask for one.
    async fn forward_request(&mut self, request: ChannelRequest) {
        let sent = match &request {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                self.upstream
                    .request_pty(
                        true,
                        term,
                        *col_width,
                        *row_height,
                        *pix_width,
                        *pix_height,
                        modes,
                    )
                    .await
            }
            ChannelRequest::Env { name, value } => {
                self.upstream.set_env(true, name.as_str(), value.as_str()).await
            }
            ChannelRequest::Shell => self.upstream.request_shell(true).await,
            ChannelRequest::Exec(command) => self.upstream.exec(true, &command[..]).await,
            ChannelRequest::Subsystem(name) => {
                self.upstream.request_subsystem(true, name.as_str()).await
            }
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                self.upstream
                    .window_change(*col_width, *row_height, *pix_width, *pix_height)
                    .await
            }
            ChannelRequest::Signal(signal) => self.upstream.signal(signal.clone()).await,
        };

        match sent {
            Ok(()) => match request {
                // window-change and signal carry no reply on the wire, so
                // acknowledge them ourselves rather than wait for one.
                ChannelRequest::WindowChange { .. } | ChannelRequest::Signal(_) => {
                    let _ = self.downstream.channel_success(self.downstream_id).await;
                }
                _ => self.pending_replies += 1,
            },
            Err(err) => {
                warn!(
                    "Failed to forward request on channel {:?}: {}",
                    self.downstream_id, err
                );
                let _ = self.downstream.channel_failure(self.downstream_id).await;
            }
        }
    }

    /// The upstream half closed or errored: synthesize failures for any
    /// replies still owed, close the inbound half, and finish.
    async fn upstream_gone(&mut self) -> bool {
        while self.pending_replies > 0 {
            self.pending_replies -= 1;
            let _ = self.downstream.channel_failure(self.downstream_id).await;
        }
        if !self.state.is_done(Side::Upstream) {
            let _ = self.downstream.eof(self.downstream_id).await;
        }
        let _ = self.downstream.close(self.downstream_id).await;
        false
    }
}
