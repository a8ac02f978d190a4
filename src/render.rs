//! Configuration Rendering
//!
//! Deterministic rendering of WireGuard configuration text for an
//! interface and its enabled peers, plus a content fingerprint used to
//! gate disk writes and restarts. Identical desired state always
//! renders identical bytes: peers are sorted by id regardless of fetch
//! order.
//!
//! Two server-side modes exist. "Full" includes the private key and
//! all operational parameters and is what lands in the persisted
//! `.conf` file. "Update" carries only what `wg syncconf` needs, so a
//! peer-only change can be applied to a live interface without
//! rewriting secret material to its on-disk file.

use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::store::model::{Interface, Peer};

/// Stable content hash of rendered configuration text. Used purely for
/// change detection, not integrity.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha1::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sorted_enabled<'a>(peers: &'a [Peer]) -> Vec<&'a Peer> {
    let mut enabled: Vec<&Peer> = peers.iter().filter(|p| p.enabled).collect();
    enabled.sort_by_key(|p| p.id);
    enabled
}

fn push_peer(lines: &mut Vec<String>, peer: &Peer, full: bool) {
    lines.push(String::new());
    if full {
        lines.push(format!("[Peer]  # Name: {} ({})", peer.name, peer.address));
    } else {
        lines.push("[Peer]".to_string());
    }
    lines.push(format!("PublicKey = {}", peer.public_key));
    if let Some(psk) = &peer.preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    lines.push(format!("AllowedIPs = {}/32", peer.host_address()));
    if let Some(keepalive) = peer.persistent_keepalive {
        lines.push(format!("PersistentKeepalive = {}", keepalive));
    }
}

/// Render the persisted on-disk configuration for an interface and its
/// enabled peers.
pub fn render_full(iface: &Interface, peers: &[Peer]) -> Result<String> {
    let mut lines = vec!["[Interface]".to_string()];
    lines.push(format!("PrivateKey = {}", iface.private_key_material()?));
    if let Some(public_key) = &iface.public_key {
        lines.push(format!("# PublicKey = {}", public_key));
    }
    lines.push(format!("ListenPort = {}", iface.listen_port));
    if let Some(mark) = iface.fw_mark {
        if mark != 0 {
            lines.push(format!("FwMark = {}", mark));
        }
    }
    lines.push(format!("Address = {}", iface.address));
    if let Some(mtu) = iface.mtu {
        lines.push(format!("MTU = {}", mtu));
    }
    if let Some(table) = &iface.table {
        lines.push(format!("Table = {}", table));
    }
    if let Some(cmd) = &iface.pre_up {
        lines.push(format!("PreUp = {}", cmd));
    }
    if let Some(cmd) = &iface.post_up {
        lines.push(format!("PostUp = {}", cmd));
    }
    if let Some(cmd) = &iface.pre_down {
        lines.push(format!("PreDown = {}", cmd));
    }
    if let Some(cmd) = &iface.post_down {
        lines.push(format!("PostDown = {}", cmd));
    }

    for peer in sorted_enabled(peers) {
        push_peer(&mut lines, peer, true);
    }

    lines.push(String::new());
    Ok(lines.join("\n"))
}

/// Render the peer-set subset accepted by `wg syncconf`: key and port
/// parameters plus bare peer sections, no addresses or hook commands.
pub fn render_update(iface: &Interface, peers: &[Peer]) -> Result<String> {
    let mut lines = vec!["[Interface]".to_string()];
    lines.push(format!("PrivateKey = {}", iface.private_key_material()?));
    lines.push(format!("ListenPort = {}", iface.listen_port));
    if let Some(mark) = iface.fw_mark {
        if mark != 0 {
            lines.push(format!("FwMark = {}", mark));
        }
    }

    for peer in sorted_enabled(peers) {
        push_peer(&mut lines, peer, false);
    }

    lines.push(String::new());
    Ok(lines.join("\n"))
}

/// Render the client-side configuration handed back to the API caller
/// when a peer is created with a generated key pair.
pub fn render_client(iface: &Interface, peer: &Peer, private_key: &str) -> String {
    let mut lines = vec!["[Interface]".to_string()];
    lines.push(format!("PrivateKey = {}", private_key));
    lines.push(format!("# PublicKey = {}", peer.public_key));
    lines.push(format!("Address = {}", peer.address));
    if let Some(dns) = iface.client_dns.as_ref().or(iface.dns.as_ref()) {
        lines.push(format!("DNS = {}", dns));
    }
    lines.push(String::new());
    lines.push("[Peer]".to_string());
    if let Some(public_key) = &iface.public_key {
        lines.push(format!("PublicKey = {}", public_key));
    }
    if let Some(endpoint) = &iface.public_endpoint {
        lines.push(format!("Endpoint = {}", endpoint));
    }
    let allowed = peer
        .allowed_ips
        .as_ref()
        .or(iface.client_allowed_ips.as_ref())
        .map(String::as_str)
        .unwrap_or("0.0.0.0/0");
    lines.push(format!("AllowedIPs = {}", allowed));
    if let Some(keepalive) = peer
        .persistent_keepalive
        .or(iface.client_persistent_keepalive)
    {
        lines.push(format!("PersistentKeepalive = {}", keepalive));
    }
    if let Some(psk) = &peer.preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface() -> Interface {
        Interface {
            id: 1,
            server_name: "edge-1".into(),
            interface_name: "wg0".into(),
            private_key: "IFACE_PRIVATE".into(),
            public_key: Some("IFACE_PUBLIC".into()),
            listen_port: 51820,
            address: "10.0.0.1/24".into(),
            dns: None,
            mtu: Some(1420),
            fw_mark: None,
            table: None,
            pre_up: None,
            post_up: Some("iptables -A FORWARD -i %i -j ACCEPT".into()),
            pre_down: None,
            post_down: None,
            enabled: true,
            ip_range: Some("10.0.0.2 - 10.0.0.20".into()),
            public_endpoint: Some("vpn.example.com:51820".into()),
            client_dns: None,
            client_allowed_ips: None,
            client_persistent_keepalive: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn peer(id: i64, name: &str, address: &str, enabled: bool) -> Peer {
        Peer {
            id,
            interface_id: 1,
            name: name.into(),
            description: None,
            public_key: format!("{}_PUBLIC", name.to_uppercase()),
            preshared_key: None,
            allowed_ips: None,
            address: address.into(),
            persistent_keepalive: Some(25),
            enabled,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_render_is_deterministic_regardless_of_order() {
        let a = peer(1, "alice", "10.0.0.2", true);
        let b = peer(2, "bob", "10.0.0.3", true);
        let one = render_full(&iface(), &[a.clone(), b.clone()]).unwrap();
        let two = render_full(&iface(), &[b, a]).unwrap();
        assert_eq!(one, two);
        assert_eq!(fingerprint(&one), fingerprint(&two));
    }

    #[test]
    fn test_disabled_peers_excluded() {
        let text = render_full(
            &iface(),
            &[
                peer(1, "alice", "10.0.0.2", true),
                peer(2, "bob", "10.0.0.3", false),
            ],
        )
        .unwrap();
        assert!(text.contains("ALICE_PUBLIC"));
        assert!(!text.contains("BOB_PUBLIC"));
    }

    #[test]
    fn test_full_mode_carries_operational_parameters() {
        let text = render_full(&iface(), &[peer(1, "alice", "10.0.0.2", true)]).unwrap();
        assert!(text.contains("PrivateKey = IFACE_PRIVATE"));
        assert!(text.contains("Address = 10.0.0.1/24"));
        assert!(text.contains("MTU = 1420"));
        assert!(text.contains("PostUp = iptables"));
        assert!(text.contains("[Peer]  # Name: alice (10.0.0.2)"));
        assert!(text.contains("AllowedIPs = 10.0.0.2/32"));
    }

    #[test]
    fn test_update_mode_is_peer_list_only() {
        let text = render_update(&iface(), &[peer(1, "alice", "10.0.0.2", true)]).unwrap();
        assert!(text.contains("PrivateKey = IFACE_PRIVATE"));
        assert!(!text.contains("Address = 10.0.0.1/24"));
        assert!(!text.contains("MTU"));
        assert!(!text.contains("PostUp"));
        assert!(text.contains("[Peer]\n"));
        assert!(!text.contains("# Name:"));
    }

    #[test]
    fn test_fingerprint_detects_change() {
        let base = render_full(&iface(), &[peer(1, "alice", "10.0.0.2", true)]).unwrap();
        let changed = render_full(&iface(), &[peer(1, "alice", "10.0.0.4", true)]).unwrap();
        assert_ne!(fingerprint(&base), fingerprint(&changed));
        assert_eq!(fingerprint(&base), fingerprint(&base));
    }

    #[test]
    fn test_private_key_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("wg0.key");
        std::fs::write(&key_path, "FILE_PRIVATE\n").unwrap();

        let mut i = iface();
        i.private_key = format!("file://{}", key_path.display());
        let text = render_full(&i, &[]).unwrap();
        assert!(text.contains("PrivateKey = FILE_PRIVATE"));
    }

    #[test]
    fn test_client_config() {
        let p = peer(1, "alice", "10.0.0.2", true);
        let text = render_client(&iface(), &p, "ALICE_PRIVATE");
        assert!(text.contains("PrivateKey = ALICE_PRIVATE"));
        assert!(text.contains("PublicKey = IFACE_PUBLIC"));
        assert!(text.contains("Endpoint = vpn.example.com:51820"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0"));
    }
}
