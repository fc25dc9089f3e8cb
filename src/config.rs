//! Proxy configuration loaded from TOML.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// SSH listen address (default: "0.0.0.0:22")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Endpoint used when the inbound user name has no entry of its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_endpoint: Option<String>,

    /// Upstream endpoints keyed by inbound user name
    #[serde(default)]
    pub endpoints: HashMap<String, Endpoint>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("gateshell");

        Self {
            listen_addr: "0.0.0.0:22".to_string(),
            host_key_path: data_dir.join("host_key"),
            default_endpoint: None,
            endpoints: HashMap::new(),
        }
    }
}

/// One upstream SSH server and the credentials policy used to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Upstream address, `host:port`
    pub target: String,

    /// User name presented to the upstream (may differ from the inbound one)
    pub user: String,

    /// Authentication methods to offer upstream, tried in order
    pub methods: Vec<AuthMethod>,
}

/// Authentication method offered to an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Forward the password captured from the inbound client.
    Password,
    /// Authenticate with no credentials at all.
    None,
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check the invariants the rest of the proxy relies on.
    pub fn validate(&self) -> Result<()> {
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))?;
        if addr.port() == 0 {
            bail!("Listen port must be non-zero");
        }

        if self.host_key_path.as_os_str().is_empty() {
            bail!("Host key file path is required");
        }

        if let Some(name) = &self.default_endpoint {
            if !self.endpoints.contains_key(name) {
                bail!("Default endpoint '{}' not found", name);
            }
        }

        for (name, endpoint) in &self.endpoints {
            endpoint
                .validate()
                .with_context(|| format!("Invalid endpoint '{}'", name))?;
        }

        Ok(())
    }

    /// Ensure the directories the proxy writes into exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }
        Ok(())
    }

    /// Look up the endpoint for an inbound user name.
    ///
    /// Falls back to the `default_endpoint` record when the name has no
    /// entry of its own. `None` means the connection has nowhere to go.
    pub fn resolve(&self, routing_key: &str) -> Option<&Endpoint> {
        self.endpoints.get(routing_key).or_else(|| {
            self.default_endpoint
                .as_deref()
                .and_then(|name| self.endpoints.get(name))
        })
    }
}

impl Endpoint {
    fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            bail!("Target is required");
        }
        let Some((host, port)) = self.target.rsplit_once(':') else {
            bail!("Target '{}' is not host:port", self.target);
        };
        if host.is_empty() {
            bail!("Target '{}' has an empty host", self.target);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("Target '{}' has an invalid port", self.target))?;
        if port == 0 {
            bail!("Target '{}' has a zero port", self.target);
        }

        if self.user.is_empty() {
            bail!("User is required");
        }
        if self.methods.is_empty() {
            bail!("At least one auth method is required");
        }

        Ok(())
    }
}
