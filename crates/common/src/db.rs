//! Database accessor
//!
//! Reflective PostgreSQL client for one appliance database. Tables are exposed
//! by name; descriptors are reflected on first access and cached. Every
//! operation first verifies the connection with a trivial probe and recycles
//! the pool once if the probe fails.

use crate::ssh::CONNECT_TIMEOUT;
use crate::types::DbTarget;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Column of a reflected table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Index of a reflected table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub definition: String,
}

/// Reflected table descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub indices: Vec<Index>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Result of looking up a table by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableInfo {
    Reflected(TableDescriptor),
    /// The table exists but its structure could not be read
    Unreflectable { name: String, reason: String },
}

impl TableInfo {
    pub fn is_reflected(&self) -> bool {
        matches!(self, TableInfo::Reflected(_))
    }

    pub fn descriptor(&self) -> Option<&TableDescriptor> {
        match self {
            TableInfo::Reflected(d) => Some(d),
            TableInfo::Unreflectable { .. } => None,
        }
    }
}

/// Database capability of an appliance
#[async_trait]
pub trait Vmdb: Send + Sync {
    /// Address of the database host; accessors compare equal by address
    fn address(&self) -> &str;

    /// Sorted table names
    async fn table_names(&self) -> Result<Vec<String>>;

    /// Descriptor for `name`; `NoSuchTable` when absent
    async fn table(&self, name: &str) -> Result<TableInfo>;

    /// First column of every row of `sql`, rendered as text
    async fn fetch_column(&self, sql: &str) -> Result<Vec<String>>;

    /// Raw YAML settings of the configuration `name` for the server `guid`
    async fn server_settings(&self, guid: &str, name: &str) -> Result<Option<String>>;

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.table_names().await?.iter().any(|t| t == name))
    }
}

/// Database accessor backed by a single-connection sqlx pool
pub struct Db {
    target: DbTarget,
    pool: Mutex<Option<PgPool>>,
    tables: Mutex<HashMap<String, TableInfo>>,
}

impl Db {
    /// Create an accessor; nothing connects until first use
    pub fn new(target: DbTarget) -> Self {
        Self {
            target,
            pool: Mutex::new(None),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> &DbTarget {
        &self.target
    }

    fn build_pool(&self) -> PgPool {
        let options = PgConnectOptions::new()
            .host(&self.target.address)
            .port(self.target.port)
            .username(&self.target.credentials.username)
            .password(&self.target.credentials.password)
            .database(&self.target.db_name);
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_lazy_with(options)
    }

    /// Pool that answered the liveness probe, recycled once if it did not
    async fn live_pool(&self) -> Result<PgPool> {
        let pool = {
            let mut guard = self.pool.lock();
            guard.get_or_insert_with(|| self.build_pool()).clone()
        };

        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => Ok(pool),
            Err(e) => {
                warn!(address = %self.target.address, "DB liveness probe failed, recycling: {}", e);
                pool.close().await;
                let fresh = self.build_pool();
                *self.pool.lock() = Some(fresh.clone());
                sqlx::query("SELECT 1")
                    .execute(&fresh)
                    .await
                    .map_err(|e| Error::Connectivity {
                        target: format!("{}:{}", self.target.address, self.target.port),
                        reason: e.to_string(),
                    })?;
                Ok(fresh)
            }
        }
    }

    /// Long-lived autocommitting session for reads
    pub async fn session(&self) -> Result<PgPool> {
        self.live_pool().await
    }

    /// Run `f` inside a transaction; an error from `f` rolls it back
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let pool = self.live_pool().await?;
        let mut tx = pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Execute a statement outside of an explicit transaction
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        trace!("{}", sql);
        let pool = self.live_pool().await?;
        Ok(sqlx::query(sql).execute(&pool).await?.rows_affected())
    }

    /// Forget reflected descriptors
    pub fn clear_cache(&self) {
        self.tables.lock().clear();
    }

    async fn reflect(&self, pool: &PgPool, name: &str) -> std::result::Result<TableDescriptor, sqlx::Error> {
        let columns = sqlx::query(
            "SELECT column_name::text, data_type::text, is_nullable::text \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(name)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            Ok(Column {
                name: row.try_get(0)?,
                data_type: row.try_get(1)?,
                nullable: row.try_get::<String, _>(2)? == "YES",
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        let primary_key = sqlx::query_scalar::<_, String>(
            "SELECT a.attname::text FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = ('public.' || quote_ident($1))::regclass AND i.indisprimary",
        )
        .bind(name)
        .fetch_all(pool)
        .await?;

        let indices = sqlx::query(
            "SELECT indexname::text, indexdef::text FROM pg_indexes \
             WHERE schemaname = 'public' AND tablename = $1 ORDER BY indexname",
        )
        .bind(name)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            Ok(Index {
                name: row.try_get(0)?,
                definition: row.try_get(1)?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        Ok(TableDescriptor {
            name: name.to_string(),
            columns,
            primary_key,
            indices,
        })
    }
}

/// Render a single cell as text regardless of its SQL type
fn cell_text(row: &PgRow, idx: usize) -> Result<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v.unwrap_or_default());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(|v| v.to_string()).unwrap_or_default());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return Ok(v.map(|v| v.to_string()).unwrap_or_default());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(|v| v.to_string()).unwrap_or_default());
    }
    Ok(row
        .try_get::<Option<bool>, _>(idx)?
        .map(|v| v.to_string())
        .unwrap_or_default())
}

#[async_trait]
impl Vmdb for Db {
    fn address(&self) -> &str {
        &self.target.address
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let pool = self.live_pool().await?;
        let names = sqlx::query_scalar::<_, String>(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'public' ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await?;
        Ok(names)
    }

    async fn table(&self, name: &str) -> Result<TableInfo> {
        if let Some(info) = self.tables.lock().get(name) {
            return Ok(info.clone());
        }
        if !self.contains(name).await? {
            return Err(Error::NoSuchTable(name.to_string()));
        }

        let pool = self.live_pool().await?;
        let info = match self.reflect(&pool, name).await {
            Ok(descriptor) => TableInfo::Reflected(descriptor),
            Err(e) => {
                warn!("Could not reflect table {}: {}", name, e);
                TableInfo::Unreflectable {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        self.tables.lock().insert(name.to_string(), info.clone());
        Ok(info)
    }

    async fn fetch_column(&self, sql: &str) -> Result<Vec<String>> {
        trace!("{}", sql);
        let pool = self.live_pool().await?;
        let rows = sqlx::query(sql).fetch_all(&pool).await?;
        rows.iter().map(|row| cell_text(row, 0)).collect()
    }

    async fn server_settings(&self, guid: &str, name: &str) -> Result<Option<String>> {
        let pool = self.live_pool().await?;
        let settings = sqlx::query_scalar::<_, Option<String>>(
            "SELECT configurations.settings FROM configurations \
             JOIN miq_servers ON configurations.miq_server_id = miq_servers.id \
             WHERE miq_servers.guid = $1 AND configurations.typ = $2",
        )
        .bind(guid)
        .bind(name)
        .fetch_optional(&pool)
        .await?;
        Ok(settings.flatten())
    }
}

impl PartialEq for Db {
    fn eq(&self, other: &Self) -> bool {
        self.target.address == other.target.address
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("address", &self.target.address)
            .field("port", &self.target.port)
            .field("db_name", &self.target.db_name)
            .finish()
    }
}
