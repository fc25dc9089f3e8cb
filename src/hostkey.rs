//! Host key management: the proxy's long-term server identity.

use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use std::path::Path;
use tracing::info;

/// Load the host key from `path`, generating and persisting a fresh
/// Ed25519 key first if the file does not exist.
///
/// An existing file is never regenerated. New keys are written to a
/// sibling temp file with owner-only permissions and renamed into place,
/// so a crash mid-write cannot leave a truncated identity behind.
pub async fn ensure_host_key(path: &Path) -> Result<PrivateKey> {
    if !path.exists() {
        generate_host_key(path).await?;
    }

    russh::keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {}", path.display()))
}

async fn generate_host_key(path: &Path) -> Result<()> {
    info!("Generating new Ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, encoded.as_bytes())
        .await
        .with_context(|| format!("Failed to write host key to {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp, perms)?;
    }

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move host key into {}", path.display()))?;

    info!("Saved host key to {}", path.display());
    Ok(())
}
