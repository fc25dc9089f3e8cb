//! Upstream dialing: the client side of the proxy.

use anyhow::{bail, Context, Result};
use russh::client::{self, AuthResult};
use russh::keys::PublicKey;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{AuthMethod, Endpoint};

/// Client handler for upstream connections.
///
/// Host keys are currently accepted without verification; this is the one
/// place a pinning or known-hosts policy would hook in.
pub struct UpstreamHandler;

impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting upstream host key ({})",
            server_public_key.algorithm()
        );
        Ok(true)
    }
}

/// Dial an endpoint and authenticate as its configured user.
///
/// The endpoint's methods are tried in order; the first one the upstream
/// accepts wins. TCP, handshake, and auth failures all come back as one
/// error to the caller, with the cause chain preserved for the log.
pub async fn dial(
    endpoint: &Endpoint,
    password: &str,
) -> Result<client::Handle<UpstreamHandler>> {
    let config = Arc::new(client::Config::default());

    let mut session = client::connect(config, endpoint.target.as_str(), UpstreamHandler)
        .await
        .with_context(|| format!("Upstream {} unreachable", endpoint.target))?;

    for method in &endpoint.methods {
        let result = match method {
            AuthMethod::Password => session
                .authenticate_password(endpoint.user.as_str(), password)
                .await
                .with_context(|| format!("Password auth to {} errored", endpoint.target))?,
            AuthMethod::None => session
                .authenticate_none(endpoint.user.as_str())
                .await
                .with_context(|| format!("None auth to {} errored", endpoint.target))?,
        };

        match result {
            AuthResult::Success => {
                debug!(
                    "Authenticated to {} as '{}' ({:?})",
                    endpoint.target, endpoint.user, method
                );
                return Ok(session);
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => {
                warn!(
                    "Upstream {} rejected {:?} auth for '{}' (remaining: {:?})",
                    endpoint.target, method, endpoint.user, remaining_methods
                );
            }
        }
    }

    bail!(
        "Upstream {} rejected all configured auth methods for '{}'",
        endpoint.target,
        endpoint.user
    )
}
