//! GateShell: a reverse proxy for SSH.
//!
//! Inbound SSH sessions are terminated locally; the authenticating user
//! name selects a configured upstream server, which is dialed with the
//! credentials the client supplied, and `session` channels are bridged
//! between the two connections until either side closes.

pub mod bridge;
pub mod config;
pub mod hostkey;
pub mod ssh;
pub mod upstream;

pub use config::ProxyConfig;

use std::sync::Arc;

use anyhow::Result;

/// Start the proxy with an already-validated configuration and serve
/// until the process is killed.
pub async fn entrypoint(config: ProxyConfig) -> Result<()> {
    ssh::run_server(Arc::new(config)).await
}
