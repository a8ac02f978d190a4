//! PostgreSQL Store
//!
//! sqlx-backed queries over the `interface` and `peer` tables, plus
//! schema bootstrap. Uniqueness and foreign-key violations surface as
//! [`Error::Constraint`]; missing rows as [`Error::NotFound`].

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::ipalloc;
use crate::store::model::{Interface, Peer};

/// Map an sqlx error onto the store taxonomy: SQLSTATE class 23 is an
/// integrity constraint violation.
pub(crate) fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code.starts_with("23") {
                return Error::Constraint(db.message().to_string());
            }
        }
    }
    Error::Database(e)
}

/// Ordering and pagination for list queries
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Column to order by; defaults to `id`
    pub order_by: Option<String>,
    /// Maximum rows to return; 0 means unbounded
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    fn clause(&self) -> Result<String> {
        let order = self.order_by.as_deref().unwrap_or("id");
        if !order
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(Error::Config(format!("invalid sort column: {}", order)));
        }
        let mut clause = format!(" ORDER BY {}", order);
        if self.limit > 0 {
            clause.push_str(&format!(" LIMIT {}", self.limit));
        }
        if self.offset > 0 {
            clause.push_str(&format!(" OFFSET {}", self.offset));
        }
        Ok(clause)
    }
}

/// Read surface the reconciliation engine depends on
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch one interface row by id.
    async fn interface(&self, id: i64) -> Result<Interface>;

    /// List enabled interface rows owned by a server, ordered by id.
    async fn enabled_interfaces(&self, server_name: &str) -> Result<Vec<Interface>>;

    /// List enabled peer rows of an interface, ordered by id.
    async fn enabled_peers(&self, interface_id: i64) -> Result<Vec<Peer>>;
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch one peer row by id.
    pub async fn peer(&self, id: i64) -> Result<Peer> {
        sqlx::query_as::<_, Peer>("SELECT * FROM peer WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))
    }

    /// List interface rows, optionally filtered by server name and
    /// enabled flag.
    pub async fn list_interfaces(
        &self,
        server_name: Option<&str>,
        enabled: Option<bool>,
        page: &Page,
    ) -> Result<Vec<Interface>> {
        let mut sql = String::from("SELECT * FROM interface WHERE 1=1");
        if server_name.is_some() {
            sql.push_str(" AND server_name = $1");
        }
        if let Some(enabled) = enabled {
            sql.push_str(if enabled { " AND enabled" } else { " AND NOT enabled" });
        }
        sql.push_str(&page.clause()?);

        let mut query = sqlx::query_as::<_, Interface>(&sql);
        if let Some(name) = server_name {
            query = query.bind(name.to_string());
        }
        query.fetch_all(&self.pool).await.map_err(map_db_err)
    }

    /// List peer rows, optionally filtered by owning interface.
    pub async fn list_peers(
        &self,
        interface_id: Option<i64>,
        enabled: Option<bool>,
        page: &Page,
    ) -> Result<Vec<Peer>> {
        let mut sql = String::from("SELECT * FROM peer WHERE 1=1");
        if interface_id.is_some() {
            sql.push_str(" AND interface_id = $1");
        }
        if let Some(enabled) = enabled {
            sql.push_str(if enabled { " AND enabled" } else { " AND NOT enabled" });
        }
        sql.push_str(&page.clause()?);

        let mut query = sqlx::query_as::<_, Peer>(&sql);
        if let Some(id) = interface_id {
            query = query.bind(id);
        }
        query.fetch_all(&self.pool).await.map_err(map_db_err)
    }

    /// Peer addresses already assigned on an interface. Unparsable
    /// rows are skipped with a warning rather than failing allocation.
    pub async fn used_addresses(&self, interface_id: i64) -> Result<BTreeSet<Ipv4Addr>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT address FROM peer WHERE interface_id = $1")
                .bind(interface_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;

        let mut used = BTreeSet::new();
        for (address,) in rows {
            let host = address.split('/').next().unwrap_or(&address);
            match host.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    used.insert(ip);
                }
                Err(_) => {
                    tracing::warn!("Skipping unparsable peer address {:?}", address);
                }
            }
        }
        Ok(used)
    }

    /// Free peer addresses of an interface, lowest first.
    pub async fn free_addresses(&self, iface: &Interface) -> Result<Vec<Ipv4Addr>> {
        let Some(range) = iface.ip_range.as_deref() else {
            return Ok(Vec::new());
        };
        let mut used = self.used_addresses(iface.id).await?;
        let host = iface.address.split('/').next().unwrap_or(&iface.address);
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            used.insert(ip);
        }
        ipalloc::free_addresses(range, &used)
    }
}

#[async_trait::async_trait]
impl StateStore for PgStore {
    async fn interface(&self, id: i64) -> Result<Interface> {
        sqlx::query_as::<_, Interface>("SELECT * FROM interface WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("interface {}", id)))
    }

    async fn enabled_interfaces(&self, server_name: &str) -> Result<Vec<Interface>> {
        sqlx::query_as::<_, Interface>(
            "SELECT * FROM interface WHERE server_name = $1 AND enabled ORDER BY id",
        )
        .bind(server_name)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn enabled_peers(&self, interface_id: i64) -> Result<Vec<Peer>> {
        sqlx::query_as::<_, Peer>(
            "SELECT * FROM peer WHERE interface_id = $1 AND enabled ORDER BY id",
        )
        .bind(interface_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }
}

/// Apply `update_*.sql` migrations in lexical order when the interface
/// table does not exist yet.
pub async fn migrate(pool: &PgPool, dir: &Path) -> Result<()> {
    use sqlx::Executor as _;

    let present: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM information_schema.tables
        WHERE table_schema = current_schema() AND table_name = 'interface'
        "#,
    )
    .fetch_one(pool)
    .await?;
    if present > 0 {
        return Ok(());
    }

    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("update_") && n.ends_with(".sql"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    for file in files {
        tracing::info!("Applying migration {}", file.display());
        let sql = std::fs::read_to_string(&file)?;
        let mut tx = pool.begin().await?;
        (&mut *tx).execute(sql.as_str()).await?;
        tx.commit().await?;
    }
    tracing::info!("Database schema created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clause() {
        let page = Page::default();
        assert_eq!(page.clause().unwrap(), " ORDER BY id");

        let page = Page {
            order_by: Some("interface_name".into()),
            limit: 10,
            offset: 20,
        };
        assert_eq!(
            page.clause().unwrap(),
            " ORDER BY interface_name LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_page_rejects_hostile_sort_column() {
        let page = Page {
            order_by: Some("id; DROP TABLE peer".into()),
            ..Default::default()
        };
        assert!(page.clause().is_err());
    }
}
