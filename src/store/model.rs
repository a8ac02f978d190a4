//! Row Types
//!
//! Typed snapshots of the `interface` and `peer` tables. The same
//! structs decode both sqlx rows and the JSON row images carried by
//! change notifications, so the controller always works with typed
//! values.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix marking a private key stored as a file reference instead of
/// an inline secret.
pub const FILE_KEY_PREFIX: &str = "file://";

/// One WireGuard tunnel endpoint owned by a named server instance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interface {
    pub id: i64,
    pub server_name: String,
    pub interface_name: String,
    /// Inline private key, or `file://<path>` reference
    pub private_key: String,
    pub public_key: Option<String>,
    pub listen_port: i32,
    /// The interface's own tunnel address (CIDR or bare)
    pub address: String,
    pub dns: Option<String>,
    pub mtu: Option<i32>,
    pub fw_mark: Option<i32>,
    pub table: Option<String>,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
    pub enabled: bool,
    /// Pool of addresses available for peer allocation
    pub ip_range: Option<String>,
    /// host:port reachable by peers
    pub public_endpoint: Option<String>,
    pub client_dns: Option<String>,
    pub client_allowed_ips: Option<String>,
    pub client_persistent_keepalive: Option<i32>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

/// One remote party permitted to connect through an Interface.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Peer {
    pub id: i64,
    pub interface_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Option<String>,
    /// Tunnel address assigned from the owning interface's ip_range
    pub address: String,
    pub persistent_keepalive: Option<i32>,
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

impl Interface {
    /// Resolve the private key material, reading it from disk when the
    /// row stores a `file://` reference.
    pub fn private_key_material(&self) -> Result<String> {
        if let Some(path) = self.private_key.strip_prefix(FILE_KEY_PREFIX) {
            Ok(std::fs::read_to_string(path)?.trim().to_string())
        } else {
            Ok(self.private_key.clone())
        }
    }
}

impl Peer {
    /// The bare host address, with any `/len` suffix stripped.
    pub fn host_address(&self) -> &str {
        self.address.split('/').next().unwrap_or(&self.address)
    }
}

/// Check that a name is a valid OS network-device name: non-empty, at
/// most 15 bytes, restricted character set.
pub fn is_valid_device_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Draft of an interface row, used by the write pipeline. Key material
/// and range canonicalization are filled in by the derive stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDraft {
    pub server_name: String,
    pub interface_name: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    pub listen_port: i32,
    pub address: String,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub mtu: Option<i32>,
    #[serde(default)]
    pub fw_mark: Option<i32>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub pre_up: Option<String>,
    #[serde(default)]
    pub post_up: Option<String>,
    #[serde(default)]
    pub pre_down: Option<String>,
    #[serde(default)]
    pub post_down: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub ip_range: Option<String>,
    #[serde(default)]
    pub public_endpoint: Option<String>,
    #[serde(default)]
    pub client_dns: Option<String>,
    #[serde(default)]
    pub client_allowed_ips: Option<String>,
    #[serde(default)]
    pub client_persistent_keepalive: Option<i32>,
}

/// Draft of a peer row. Address and key pair are filled in by the
/// derive stage when the caller leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDraft {
    pub interface_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<i32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Generated when no public key was supplied; returned to the
    /// caller once, never persisted.
    #[serde(skip)]
    pub private_key: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PeerDraft {
    /// Normalize the assigned address to a bare host address.
    pub fn normalized_address(&self) -> Result<String> {
        let raw = self
            .address
            .as_deref()
            .ok_or_else(|| Error::Constraint("peer address is not assigned".into()))?;
        let host = raw.split('/').next().unwrap_or(raw);
        host.parse::<std::net::Ipv4Addr>()
            .map(|ip| ip.to_string())
            .map_err(|_| Error::Constraint(format!("invalid peer address: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_validation() {
        assert!(is_valid_device_name("wg0"));
        assert!(is_valid_device_name("wg-office.1"));
        assert!(!is_valid_device_name(""));
        assert!(!is_valid_device_name("wg0/1"));
        assert!(!is_valid_device_name("anamethatiswaytoolong"));
    }

    #[test]
    fn test_peer_host_address() {
        let peer = Peer {
            id: 1,
            interface_id: 1,
            name: "alice".into(),
            description: None,
            public_key: "pk".into(),
            preshared_key: None,
            allowed_ips: None,
            address: "10.0.0.2/32".into(),
            persistent_keepalive: None,
            enabled: true,
            created_at: None,
            updated_at: None,
        };
        assert_eq!(peer.host_address(), "10.0.0.2");
    }

    #[test]
    fn test_draft_address_normalization() {
        let mut draft = PeerDraft {
            interface_id: 1,
            name: "alice".into(),
            description: None,
            public_key: Some("pk".into()),
            preshared_key: None,
            allowed_ips: None,
            address: Some("10.0.0.7/32".into()),
            persistent_keepalive: None,
            enabled: true,
            private_key: None,
        };
        assert_eq!(draft.normalized_address().unwrap(), "10.0.0.7");

        draft.address = Some("not-an-ip".into());
        assert!(draft.normalized_address().is_err());
    }

    #[test]
    fn test_row_decodes_from_notification_json() {
        let payload = r#"{
            "id": 7, "server_name": "edge-1", "interface_name": "wg0",
            "private_key": "sec", "public_key": "pub", "listen_port": 51820,
            "address": "10.0.0.1/24", "dns": null, "mtu": null,
            "fw_mark": null, "table": null, "pre_up": null, "post_up": null,
            "pre_down": null, "post_down": null, "enabled": true,
            "ip_range": "10.0.0.2 - 10.0.0.20", "public_endpoint": null,
            "client_dns": null, "client_allowed_ips": null,
            "client_persistent_keepalive": null,
            "created_at": "2024-05-01T10:00:00.123456",
            "updated_at": "2024-05-01T10:00:00.123456"
        }"#;
        let iface: Interface = serde_json::from_str(payload).unwrap();
        assert_eq!(iface.id, 7);
        assert!(iface.enabled);
        assert!(iface.created_at.is_some());
    }
}
