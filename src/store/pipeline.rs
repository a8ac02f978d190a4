//! Write Pipeline
//!
//! Writes run through an explicit pipeline of named stages — validate,
//! derive-fields, persist, side-effect — composed per entity type via
//! the [`WriteStages`] trait. The reconciliation engine itself is
//! read-mostly; this is the contract the API layer drives when it
//! mutates rows, and it is where peer addresses are allocated and key
//! pairs are derived.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ipalloc;
use crate::render;
use crate::store::model::{
    is_valid_device_name, Interface, InterfaceDraft, Peer, PeerDraft, FILE_KEY_PREFIX,
};
use crate::store::pg::{map_db_err, PgStore, StateStore};
use crate::wg::KeySource;

/// The named stages every entity write passes through, in order.
#[async_trait::async_trait]
pub trait WriteStages: Send + Sync {
    type Draft: Send;
    type Row: Send;

    /// Reject drafts that violate entity invariants.
    fn validate(&self, draft: &Self::Draft) -> Result<()>;

    /// Fill derived fields: allocated addresses, key material,
    /// canonical range text. `existing` is the current row on updates.
    async fn derive(
        &self,
        store: &PgStore,
        existing: Option<&Self::Row>,
        draft: &mut Self::Draft,
    ) -> Result<()>;

    /// Fetch the current row for an update.
    async fn fetch(&self, store: &PgStore, id: i64) -> Result<Self::Row>;

    /// Insert the draft, returning the stored row.
    async fn insert(&self, store: &PgStore, draft: &Self::Draft) -> Result<Self::Row>;

    /// Overwrite an existing row with the draft.
    async fn update(&self, store: &PgStore, id: i64, draft: &Self::Draft)
        -> Result<Self::Row>;

    /// Post-persist side effects.
    async fn finish(&self, _store: &PgStore, _row: &Self::Row) -> Result<()> {
        Ok(())
    }
}

async fn run_create<W: WriteStages>(
    stages: &W,
    store: &PgStore,
    draft: &mut W::Draft,
) -> Result<W::Row> {
    stages.validate(draft)?;
    stages.derive(store, None, draft).await?;
    let row = stages.insert(store, draft).await?;
    stages.finish(store, &row).await?;
    Ok(row)
}

async fn run_update<W: WriteStages>(
    stages: &W,
    store: &PgStore,
    id: i64,
    draft: &mut W::Draft,
) -> Result<W::Row> {
    stages.validate(draft)?;
    let existing = stages.fetch(store, id).await?;
    stages.derive(store, Some(&existing), draft).await?;
    let row = stages.update(store, id, draft).await?;
    stages.finish(store, &row).await?;
    Ok(row)
}

/// Stages for interface rows
pub struct InterfaceWriter {
    pub keys: Arc<dyn KeySource>,
}

#[async_trait::async_trait]
impl WriteStages for InterfaceWriter {
    type Draft = InterfaceDraft;
    type Row = Interface;

    fn validate(&self, draft: &InterfaceDraft) -> Result<()> {
        if draft.server_name.is_empty() {
            return Err(Error::Constraint("server_name cannot be empty".into()));
        }
        if !is_valid_device_name(&draft.interface_name) {
            return Err(Error::Constraint(format!(
                "invalid interface name: {:?}",
                draft.interface_name
            )));
        }
        if !(1..=65535).contains(&draft.listen_port) {
            return Err(Error::Constraint(format!(
                "invalid listen port: {}",
                draft.listen_port
            )));
        }
        Ok(())
    }

    async fn derive(
        &self,
        _store: &PgStore,
        _existing: Option<&Interface>,
        draft: &mut InterfaceDraft,
    ) -> Result<()> {
        if draft.private_key.is_none() {
            draft.private_key = Some(self.keys.private_key().await?);
        }
        let private_key = draft.private_key.as_deref().unwrap_or_default();
        if private_key.starts_with(FILE_KEY_PREFIX) && draft.public_key.is_none() {
            return Err(Error::Constraint(
                "public_key is required when the private key is a file reference".into(),
            ));
        }
        if draft.public_key.is_none() {
            draft.public_key = Some(self.keys.public_key(private_key).await?);
        }
        if let Some(range) = draft.ip_range.clone() {
            if let Some(canonical) = ipalloc::canonicalize(&range)? {
                tracing::debug!(
                    "Replacing ip_range {:?} with canonical form {:?}",
                    range,
                    canonical
                );
                draft.ip_range = Some(canonical);
            }
        }
        Ok(())
    }

    async fn fetch(&self, store: &PgStore, id: i64) -> Result<Interface> {
        store.interface(id).await
    }

    async fn insert(&self, store: &PgStore, draft: &InterfaceDraft) -> Result<Interface> {
        sqlx::query_as::<_, Interface>(
            r#"
            INSERT INTO interface (
                server_name, interface_name, private_key, public_key,
                listen_port, address, dns, mtu, fw_mark, "table",
                pre_up, post_up, pre_down, post_down, enabled,
                ip_range, public_endpoint, client_dns, client_allowed_ips,
                client_persistent_keepalive
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            ) RETURNING *
            "#,
        )
        .bind(&draft.server_name)
        .bind(&draft.interface_name)
        .bind(&draft.private_key)
        .bind(&draft.public_key)
        .bind(draft.listen_port)
        .bind(&draft.address)
        .bind(&draft.dns)
        .bind(draft.mtu)
        .bind(draft.fw_mark)
        .bind(&draft.table)
        .bind(&draft.pre_up)
        .bind(&draft.post_up)
        .bind(&draft.pre_down)
        .bind(&draft.post_down)
        .bind(draft.enabled)
        .bind(&draft.ip_range)
        .bind(&draft.public_endpoint)
        .bind(&draft.client_dns)
        .bind(&draft.client_allowed_ips)
        .bind(draft.client_persistent_keepalive)
        .fetch_one(store.pool())
        .await
        .map_err(map_db_err)
    }

    async fn update(
        &self,
        store: &PgStore,
        id: i64,
        draft: &InterfaceDraft,
    ) -> Result<Interface> {
        sqlx::query_as::<_, Interface>(
            r#"
            UPDATE interface SET
                server_name = $2, interface_name = $3, private_key = $4,
                public_key = $5, listen_port = $6, address = $7, dns = $8,
                mtu = $9, fw_mark = $10, "table" = $11, pre_up = $12,
                post_up = $13, pre_down = $14, post_down = $15,
                enabled = $16, ip_range = $17, public_endpoint = $18,
                client_dns = $19, client_allowed_ips = $20,
                client_persistent_keepalive = $21, updated_at = NOW()
            WHERE id = $1 RETURNING *
            "#,
        )
        .bind(id)
        .bind(&draft.server_name)
        .bind(&draft.interface_name)
        .bind(&draft.private_key)
        .bind(&draft.public_key)
        .bind(draft.listen_port)
        .bind(&draft.address)
        .bind(&draft.dns)
        .bind(draft.mtu)
        .bind(draft.fw_mark)
        .bind(&draft.table)
        .bind(&draft.pre_up)
        .bind(&draft.post_up)
        .bind(&draft.pre_down)
        .bind(&draft.post_down)
        .bind(draft.enabled)
        .bind(&draft.ip_range)
        .bind(&draft.public_endpoint)
        .bind(&draft.client_dns)
        .bind(&draft.client_allowed_ips)
        .bind(draft.client_persistent_keepalive)
        .fetch_optional(store.pool())
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("interface {}", id)))
    }
}

/// Stages for peer rows
pub struct PeerWriter {
    pub keys: Arc<dyn KeySource>,
}

#[async_trait::async_trait]
impl WriteStages for PeerWriter {
    type Draft = PeerDraft;
    type Row = Peer;

    fn validate(&self, draft: &PeerDraft) -> Result<()> {
        if draft.name.is_empty() {
            return Err(Error::Constraint("peer name cannot be empty".into()));
        }
        Ok(())
    }

    async fn derive(
        &self,
        store: &PgStore,
        existing: Option<&Peer>,
        draft: &mut PeerDraft,
    ) -> Result<()> {
        let iface = store.interface(draft.interface_id).await?;

        if draft.public_key.is_none() {
            let private_key = self.keys.private_key().await?;
            draft.public_key = Some(self.keys.public_key(&private_key).await?);
            draft.private_key = Some(private_key);
        }

        // A peer address is assigned exactly once and is thereafter
        // stable.
        if draft.address.is_none() {
            if let Some(peer) = existing {
                draft.address = Some(peer.address.clone());
            } else {
                let free = store.free_addresses(&iface).await?;
                let next = free.first().ok_or_else(|| {
                    Error::Constraint(format!(
                        "no free addresses left on interface {}",
                        iface.id
                    ))
                })?;
                draft.address = Some(next.to_string());
            }
        }

        let address = draft.normalized_address()?;
        if let Some(range) = iface.ip_range.as_deref() {
            let pool = ipalloc::expand_range(range)?;
            let ip: std::net::Ipv4Addr = address
                .parse()
                .map_err(|_| Error::Constraint(format!("invalid peer address: {}", address)))?;
            if !pool.contains(&ip) {
                return Err(Error::Constraint(format!(
                    "address {} is outside the address range of interface {}",
                    address, iface.id
                )));
            }
        }
        draft.address = Some(address);
        Ok(())
    }

    async fn fetch(&self, store: &PgStore, id: i64) -> Result<Peer> {
        store.peer(id).await
    }

    async fn insert(&self, store: &PgStore, draft: &PeerDraft) -> Result<Peer> {
        sqlx::query_as::<_, Peer>(
            r#"
            INSERT INTO peer (
                interface_id, name, description, public_key, preshared_key,
                allowed_ips, address, persistent_keepalive, enabled
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(draft.interface_id)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.public_key)
        .bind(&draft.preshared_key)
        .bind(&draft.allowed_ips)
        .bind(&draft.address)
        .bind(draft.persistent_keepalive)
        .bind(draft.enabled)
        .fetch_one(store.pool())
        .await
        .map_err(map_db_err)
    }

    async fn update(&self, store: &PgStore, id: i64, draft: &PeerDraft) -> Result<Peer> {
        sqlx::query_as::<_, Peer>(
            r#"
            UPDATE peer SET
                interface_id = $2, name = $3, description = $4,
                public_key = $5, preshared_key = $6, allowed_ips = $7,
                address = $8, persistent_keepalive = $9, enabled = $10,
                updated_at = NOW()
            WHERE id = $1 RETURNING *
            "#,
        )
        .bind(id)
        .bind(draft.interface_id)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.public_key)
        .bind(&draft.preshared_key)
        .bind(&draft.allowed_ips)
        .bind(&draft.address)
        .bind(draft.persistent_keepalive)
        .bind(draft.enabled)
        .fetch_optional(store.pool())
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("peer {}", id)))
    }

    async fn finish(&self, _store: &PgStore, row: &Peer) -> Result<()> {
        tracing::debug!(
            "Peer {} persisted with address {} on interface {}",
            row.id,
            row.address,
            row.interface_id
        );
        Ok(())
    }
}

/// Create an interface row through the write pipeline.
pub async fn create_interface(
    store: &PgStore,
    keys: Arc<dyn KeySource>,
    mut draft: InterfaceDraft,
) -> Result<Interface> {
    let writer = InterfaceWriter { keys };
    run_create(&writer, store, &mut draft).await
}

/// Update an interface row through the write pipeline.
pub async fn update_interface(
    store: &PgStore,
    keys: Arc<dyn KeySource>,
    id: i64,
    mut draft: InterfaceDraft,
) -> Result<Interface> {
    let writer = InterfaceWriter { keys };
    run_update(&writer, store, id, &mut draft).await
}

/// A created peer plus, when the key pair was generated server-side,
/// the one-time private key and rendered client configuration.
#[derive(Debug, Clone)]
pub struct CreatedPeer {
    pub peer: Peer,
    pub private_key: Option<String>,
    pub client_config: Option<String>,
}

/// Create a peer row through the write pipeline, allocating an address
/// and key pair when the caller left them out.
pub async fn create_peer(
    store: &PgStore,
    keys: Arc<dyn KeySource>,
    mut draft: PeerDraft,
) -> Result<CreatedPeer> {
    let writer = PeerWriter { keys };
    let peer = run_create(&writer, store, &mut draft).await?;

    let client_config = match &draft.private_key {
        Some(private_key) => {
            let iface = store.interface(peer.interface_id).await?;
            Some(render::render_client(&iface, &peer, private_key))
        }
        None => None,
    };

    Ok(CreatedPeer {
        peer,
        private_key: draft.private_key,
        client_config,
    })
}

/// Update a peer row through the write pipeline. The assigned address
/// is kept stable unless the caller supplies a replacement.
pub async fn update_peer(
    store: &PgStore,
    keys: Arc<dyn KeySource>,
    id: i64,
    mut draft: PeerDraft,
) -> Result<Peer> {
    let writer = PeerWriter { keys };
    run_update(&writer, store, id, &mut draft).await
}

/// Delete an interface row.
pub async fn delete_interface(store: &PgStore, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM interface WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await
        .map_err(map_db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("interface {}", id)));
    }
    Ok(())
}

/// Delete a peer row.
pub async fn delete_peer(store: &PgStore, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM peer WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await
        .map_err(map_db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("peer {}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoKeys;

    #[async_trait::async_trait]
    impl KeySource for NoKeys {
        async fn private_key(&self) -> Result<String> {
            Err(Error::Keygen("not available in tests".into()))
        }
        async fn public_key(&self, _private_key: &str) -> Result<String> {
            Err(Error::Keygen("not available in tests".into()))
        }
        async fn preshared_key(&self) -> Result<String> {
            Err(Error::Keygen("not available in tests".into()))
        }
    }

    fn draft(name: &str, port: i32) -> InterfaceDraft {
        InterfaceDraft {
            server_name: "edge-1".into(),
            interface_name: name.into(),
            private_key: Some("sec".into()),
            public_key: Some("pub".into()),
            listen_port: port,
            address: "10.0.0.1/24".into(),
            dns: None,
            mtu: None,
            fw_mark: None,
            table: None,
            pre_up: None,
            post_up: None,
            pre_down: None,
            post_down: None,
            enabled: true,
            ip_range: None,
            public_endpoint: None,
            client_dns: None,
            client_allowed_ips: None,
            client_persistent_keepalive: None,
        }
    }

    #[test]
    fn test_interface_validation() {
        let writer = InterfaceWriter {
            keys: Arc::new(NoKeys),
        };
        assert!(writer.validate(&draft("wg0", 51820)).is_ok());
        assert!(writer.validate(&draft("wg0/evil", 51820)).is_err());
        assert!(writer.validate(&draft("wg0", 0)).is_err());
        assert!(writer.validate(&draft("wg0", 70000)).is_err());
    }

    #[test]
    fn test_peer_validation() {
        let writer = PeerWriter {
            keys: Arc::new(NoKeys),
        };
        let peer_draft = PeerDraft {
            interface_id: 1,
            name: String::new(),
            description: None,
            public_key: Some("pub".into()),
            preshared_key: None,
            allowed_ips: None,
            address: Some("10.0.0.2".into()),
            persistent_keepalive: None,
            enabled: true,
            private_key: None,
        };
        assert!(writer.validate(&peer_draft).is_err());
    }
}
