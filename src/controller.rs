//! Interface Controller
//!
//! The reconciliation engine. Consumes change events one at a time, in
//! delivery order, and converges the host's WireGuard state onto the
//! rows in the store: one configuration file per owned interface,
//! fingerprint-gated rewrites, forced restarts only when the persisted
//! text actually changed, and peer-set hot sync against live
//! interfaces. The in-memory owned-id set is only ever touched from
//! this single event path.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::feed::ChangeEvent;
use crate::render;
use crate::store::model::{Interface, Peer};
use crate::store::pg::StateStore;
use crate::wg::WgCli;

/// Write configuration text with owner-only permissions; these files
/// carry private key material.
fn write_secret_file(path: &Path, content: &str) -> Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn on_disk_fingerprint(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|text| render::fingerprint(&text))
}

/// Reconciliation engine for one host
pub struct InterfaceController {
    server_name: String,
    config_dir: PathBuf,
    staging_dir: PathBuf,
    store: Arc<dyn StateStore>,
    wg: WgCli,
    /// Interface ids currently owned by this host
    interface_ids: HashSet<i64>,
}

impl InterfaceController {
    pub fn new(
        server_name: String,
        config_dir: PathBuf,
        staging_dir: PathBuf,
        store: Arc<dyn StateStore>,
        wg: WgCli,
    ) -> Self {
        Self {
            server_name,
            config_dir,
            staging_dir,
            store,
            wg,
            interface_ids: HashSet::new(),
        }
    }

    /// Interface ids currently owned by this host.
    pub fn owned_interfaces(&self) -> &HashSet<i64> {
        &self.interface_ids
    }

    fn conf_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", name))
    }

    /// Interface names present in the configuration directory.
    fn config_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.config_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "conf").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Render the full configuration for an interface and rewrite its
    /// file when the fingerprint changed. Returns whether a rewrite
    /// happened.
    async fn refresh_file(&self, iface: &Interface) -> Result<bool> {
        let peers = self.store.enabled_peers(iface.id).await?;
        let text = render::render_full(iface, &peers)?;
        let path = self.conf_path(&iface.interface_name);
        if on_disk_fingerprint(&path).as_deref() == Some(render::fingerprint(&text).as_str()) {
            return Ok(false);
        }
        tracing::info!("Writing configuration for {}", iface.interface_name);
        write_secret_file(&path, &text)?;
        Ok(true)
    }

    /// Converge on-disk and OS state for one owned, enabled interface.
    async fn materialize(&self, iface: &Interface) -> Result<()> {
        let name = &iface.interface_name;
        if self.refresh_file(iface).await? {
            // The persisted text changed: force a restart so hook
            // commands and operational parameters take effect.
            self.wg.interface_down(name).await?;
            self.wg.interface_up(name).await?;
        } else if !self.wg.interface_exists(name).await? {
            self.wg.interface_up(name).await?;
        }
        Ok(())
    }

    /// Bring an interface down and delete its configuration file.
    async fn teardown(&self, name: &str) -> Result<()> {
        self.wg.interface_down(name).await?;
        let path = self.conf_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Converge the host once against the full desired state. Called
    /// before the change feed starts delivering events.
    pub async fn startup(&mut self) -> Result<()> {
        tracing::info!("Reconciling interfaces for server {}", self.server_name);
        std::fs::create_dir_all(&self.config_dir)?;

        let interfaces = self.store.enabled_interfaces(&self.server_name).await?;
        let mut desired = HashSet::new();
        let mut forced = HashSet::new();
        for iface in &interfaces {
            self.interface_ids.insert(iface.id);
            desired.insert(iface.interface_name.clone());
            match self.refresh_file(iface).await {
                Ok(true) => {
                    forced.insert(iface.interface_name.clone());
                }
                Ok(false) => {}
                Err(e) if e.is_local() => {
                    // Blocks only this interface's materialization.
                    tracing::error!(
                        "Skipping interface {} (id {}): {}",
                        iface.interface_name,
                        iface.id,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        for name in self.config_files()? {
            if !desired.contains(&name) {
                tracing::info!("Removing stale configuration for {}", name);
                self.wg.interface_down(&name).await?;
                std::fs::remove_file(self.conf_path(&name))?;
            }
        }

        for name in self.config_files()? {
            if forced.contains(&name) {
                self.wg.interface_down(&name).await?;
                self.wg.interface_up(&name).await?;
            } else if !self.wg.interface_exists(&name).await? {
                self.wg.interface_up(&name).await?;
            }
        }
        Ok(())
    }

    /// Apply one change event. Failures are logged with enough context
    /// to diagnose a stuck reconciliation; they never terminate the
    /// controller.
    pub async fn handle(&mut self, event: ChangeEvent) {
        let result = match event {
            ChangeEvent::Interface { before, after } => {
                tracing::debug!(
                    "Interface event: before={:?} after={:?}",
                    before.as_ref().map(|i| i.id),
                    after.as_ref().map(|i| i.id)
                );
                self.on_interface_change(before, after).await
            }
            ChangeEvent::Peer { before, after } => {
                tracing::debug!(
                    "Peer event: before={:?} after={:?}",
                    before.as_ref().map(|p| p.id),
                    after.as_ref().map(|p| p.id)
                );
                self.on_peer_change(before, after).await
            }
        };
        if let Err(e) = result {
            tracing::error!("Reconciliation step failed: {}", e);
        }
    }

    async fn on_interface_change(
        &mut self,
        before: Option<Interface>,
        after: Option<Interface>,
    ) -> Result<()> {
        let was_ours = before
            .as_ref()
            .map_or(false, |b| b.server_name == self.server_name);

        match after {
            Some(after) if after.server_name == self.server_name && after.enabled => {
                if let Some(before) = &before {
                    if was_ours && before.interface_name != after.interface_name {
                        // Rename: retire the old device and file before
                        // materializing the new name.
                        tracing::info!(
                            "Interface {} renamed to {}",
                            before.interface_name,
                            after.interface_name
                        );
                        self.teardown(&before.interface_name).await?;
                    }
                }
                self.interface_ids.insert(after.id);
                self.materialize(&after).await
            }
            _ => {
                // Deleted, disabled, or moved to another server.
                if let Some(before) = before.filter(|_| was_ours) {
                    tracing::info!(
                        "Interface {} (id {}) is no longer managed here",
                        before.interface_name,
                        before.id
                    );
                    self.interface_ids.remove(&before.id);
                    self.teardown(&before.interface_name).await?;
                }
                Ok(())
            }
        }
    }

    async fn on_peer_change(
        &mut self,
        before: Option<Peer>,
        after: Option<Peer>,
    ) -> Result<()> {
        // A peer moved between interfaces touches both owners.
        let mut interface_ids = BTreeSet::new();
        if let Some(peer) = &before {
            interface_ids.insert(peer.interface_id);
        }
        if let Some(peer) = &after {
            interface_ids.insert(peer.interface_id);
        }

        for id in interface_ids {
            if !self.interface_ids.contains(&id) {
                continue;
            }
            let iface = match self.store.interface(id).await {
                Ok(iface) => iface,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !iface.enabled || iface.server_name != self.server_name {
                continue;
            }
            self.hot_sync(&iface).await?;
        }
        Ok(())
    }

    /// Apply the current peer set to a live interface without tearing
    /// it down, then persist the full text if it changed. A crash
    /// between the two steps is healed by the next event or the next
    /// startup pass.
    async fn hot_sync(&self, iface: &Interface) -> Result<()> {
        let name = &iface.interface_name;
        let peers = self.store.enabled_peers(iface.id).await?;

        let update = render::render_update(iface, &peers)?;
        let staging = self.staging_dir.join(format!("{}.conf", name));
        write_secret_file(&staging, &update)?;
        self.wg.sync_peers(name, &staging).await?;

        let full = render::render_full(iface, &peers)?;
        let path = self.conf_path(name);
        if on_disk_fingerprint(&path).as_deref() != Some(render::fingerprint(&full).as_str()) {
            tracing::info!("Writing configuration for {}", name);
            write_secret_file(&path, &full)?;
        }
        if !self.wg.interface_exists(name).await? {
            self.wg.interface_up(name).await?;
        }
        Ok(())
    }
}
