//! WireGuard Toolchain Boundary
//!
//! The four externally observable operations the controller needs
//! (up, down, hot sync, existence query) plus the key-generation
//! calls, all funneled through a [`CommandRunner`]. Up/down/sync
//! failures are logged at warning level and reported as a success
//! flag; the control loop continues with best-effort state.

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::process::CommandRunner;

/// Thin wrapper over the `wg` / `wg-quick` / `ip` command line tools
#[derive(Clone)]
pub struct WgCli {
    runner: Arc<dyn CommandRunner>,
}

impl WgCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Query whether the OS interface currently exists.
    pub async fn interface_exists(&self, name: &str) -> Result<bool> {
        let out = self.runner.run(&["ip", "link", "show", name]).await?;
        Ok(out.success())
    }

    /// Bring an interface up. Returns whether the tool succeeded.
    pub async fn interface_up(&self, name: &str) -> Result<bool> {
        tracing::info!("Starting interface {}", name);
        let out = self.runner.run(&["wg-quick", "up", name]).await?;
        if !out.success() {
            tracing::warn!("Problem starting interface {}: {}", name, out.stderr.trim());
        }
        Ok(out.success())
    }

    /// Bring an interface down if it exists. "Already down" is not an
    /// error.
    pub async fn interface_down(&self, name: &str) -> Result<bool> {
        if !self.interface_exists(name).await? {
            return Ok(true);
        }
        tracing::info!("Stopping interface {}", name);
        let out = self.runner.run(&["wg-quick", "down", name]).await?;
        if !out.success() {
            tracing::warn!("Problem stopping interface {}: {}", name, out.stderr.trim());
        }
        Ok(out.success())
    }

    /// Apply a peer-set configuration file to a live interface without
    /// tearing it down.
    pub async fn sync_peers(&self, name: &str, config: &Path) -> Result<bool> {
        let path = config.to_string_lossy();
        let out = self
            .runner
            .run(&["wg", "syncconf", name, path.as_ref()])
            .await?;
        if !out.success() {
            tracing::warn!("Problem syncing interface {}: {}", name, out.stderr.trim());
        }
        Ok(out.success())
    }
}

/// On-demand key generation, treated as an external boundary returning
/// opaque strings.
#[async_trait::async_trait]
pub trait KeySource: Send + Sync {
    /// Generate a new private key.
    async fn private_key(&self) -> Result<String>;

    /// Derive the public key for a private key.
    async fn public_key(&self, private_key: &str) -> Result<String>;

    /// Generate a new pre-shared key.
    async fn preshared_key(&self) -> Result<String>;
}

#[async_trait::async_trait]
impl KeySource for WgCli {
    async fn private_key(&self) -> Result<String> {
        let out = self.runner.run(&["wg", "genkey"]).await?;
        if !out.success() {
            return Err(Error::Keygen(out.stderr.trim().to_string()));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn public_key(&self, private_key: &str) -> Result<String> {
        let out = self
            .runner
            .run_with_input(&["wg", "pubkey"], private_key)
            .await?;
        if !out.success() {
            return Err(Error::Keygen(out.stderr.trim().to_string()));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn preshared_key(&self) -> Result<String> {
        let out = self.runner.run(&["wg", "genpsk"]).await?;
        if !out.success() {
            return Err(Error::Keygen(out.stderr.trim().to_string()));
        }
        Ok(out.stdout.trim().to_string())
    }
}
