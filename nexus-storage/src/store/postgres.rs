//! PostgreSQL state store.
//!
//! Table layout (name configurable, validated as a plain identifier):
//!
//! ```text
//! key        TEXT PRIMARY KEY
//! payload    JSONB            -- NULL for tombstones
//! revision   BIGINT NOT NULL
//! deleted    BOOLEAN NOT NULL
//! updated_at TIMESTAMPTZ NOT NULL
//! ```
//!
//! Every write is one statement. Revisions are incremented by the database
//! (`revision = revision + 1`) and new-key races are settled by the primary
//! key through `ON CONFLICT`.

use async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use nexus_core::{
    ConfigError, Revision, StateKey, StateRecord, StorageError, StorageResult, StoreConfig,
    Timestamp, WriteOutcome,
};
use serde_json::Value;
use std::time::Instant;
use tokio_postgres::{NoTls, Row};

use super::{StateStore, StoreHealth};
use crate::pool::{ConnectionPool, PoolStatus};

/// SQL text for one table, rendered once at construction.
#[derive(Debug, Clone)]
struct Statements {
    create: String,
    fetch: String,
    upsert: String,
    create_if_absent: String,
    compare_and_increment: String,
    tombstone: String,
    purge: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    key TEXT PRIMARY KEY,
                    payload JSONB,
                    revision BIGINT NOT NULL CHECK (revision > 0),
                    deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS {t}_tombstone_idx ON {t} (updated_at) WHERE deleted;",
                t = table
            ),
            fetch: format!(
                "SELECT payload, revision, updated_at FROM {t} WHERE key = $1 AND NOT deleted",
                t = table
            ),
            upsert: format!(
                "INSERT INTO {t} AS t (key, payload, revision, deleted, updated_at)
                 VALUES ($1, $2, 1, FALSE, now())
                 ON CONFLICT (key) DO UPDATE
                    SET payload = EXCLUDED.payload,
                        revision = t.revision + 1,
                        deleted = FALSE,
                        updated_at = now()
                 RETURNING revision, updated_at",
                t = table
            ),
            create_if_absent: format!(
                "INSERT INTO {t} AS t (key, payload, revision, deleted, updated_at)
                 VALUES ($1, $2, 1, FALSE, now())
                 ON CONFLICT (key) DO UPDATE
                    SET payload = EXCLUDED.payload,
                        revision = t.revision + 1,
                        deleted = FALSE,
                        updated_at = now()
                    WHERE t.deleted
                 RETURNING revision, updated_at",
                t = table
            ),
            compare_and_increment: format!(
                "UPDATE {t}
                    SET payload = $3, revision = revision + 1, updated_at = now()
                  WHERE key = $1 AND revision = $2 AND NOT deleted
                 RETURNING revision, updated_at",
                t = table
            ),
            tombstone: format!(
                "UPDATE {t}
                    SET payload = NULL, revision = revision + 1, deleted = TRUE, updated_at = now()
                  WHERE key = $1 AND NOT deleted
                 RETURNING revision",
                t = table
            ),
            purge: format!(
                "DELETE FROM {t} WHERE deleted AND updated_at < $1",
                t = table
            ),
        }
    }
}

fn query_failed(operation: &str) -> impl FnOnce(tokio_postgres::Error) -> StorageError + '_ {
    move |e| {
        if e.is_closed() {
            StorageError::Unavailable {
                reason: e.to_string(),
            }
        } else {
            StorageError::QueryFailed {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn column<'a, T>(row: &'a Row, key: &StateKey, name: &str) -> StorageResult<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name).map_err(|e| StorageError::CorruptRecord {
        key: key.to_string(),
        reason: format!("column {}: {}", name, e),
    })
}

fn applied_record(row: &Row, key: &StateKey, payload: &Value) -> StorageResult<StateRecord> {
    Ok(StateRecord {
        key: key.clone(),
        payload: payload.clone(),
        revision: Revision::new(column(row, key, "revision")?),
        updated_at: column(row, key, "updated_at")?,
    })
}

/// [`StateStore`] backed by PostgreSQL through a deadpool-postgres pool.
pub struct PostgresStateStore {
    pool: ConnectionPool<deadpool_postgres::Manager>,
    statements: Statements,
}

impl PostgresStateStore {
    /// Create the pool. No connection is opened until the first call.
    pub fn connect(config: &StoreConfig) -> StorageResult<Self> {
        config.validate().map_err(|e: ConfigError| StorageError::ConnectionFailed {
            reason: e.to_string(),
        })?;

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.connect_timeout = Some(config.create_timeout());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(config.pool_size);
        let mut timeouts = Timeouts::new();
        timeouts.wait = Some(config.wait_timeout());
        timeouts.create = Some(config.create_timeout());
        timeouts.recycle = Some(config.create_timeout());
        pool_config.timeouts = timeouts;
        cfg.pool = Some(pool_config);

        let pool: Pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::ConnectionFailed {
                reason: format!("Failed to create pool: {}", e),
            })?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            table = %config.table,
            pool_size = config.pool_size,
            "state store pool created"
        );

        Ok(Self {
            pool: ConnectionPool::from_pool(pool, config.wait_timeout()),
            statements: Statements::for_table(&config.table),
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn fetch(&self, key: &StateKey) -> StorageResult<Option<StateRecord>> {
        let conn = self.pool.get().await?;
        let stmt = conn
            .prepare_cached(&self.statements.fetch)
            .await
            .map_err(query_failed("fetch"))?;
        let row = conn
            .query_opt(&stmt, &[&key.to_string()])
            .await
            .map_err(query_failed("fetch"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: Option<Value> = column(&row, key, "payload")?;
        let payload = payload.ok_or_else(|| StorageError::CorruptRecord {
            key: key.to_string(),
            reason: "live row without payload".to_string(),
        })?;
        Ok(Some(StateRecord {
            key: key.clone(),
            payload,
            revision: Revision::new(column(&row, key, "revision")?),
            updated_at: column(&row, key, "updated_at")?,
        }))
    }

    async fn write(&self, key: &StateKey, payload: &Value) -> StorageResult<StateRecord> {
        let conn = self.pool.get().await?;
        let stmt = conn
            .prepare_cached(&self.statements.upsert)
            .await
            .map_err(query_failed("write"))?;
        let row = conn
            .query_one(&stmt, &[&key.to_string(), payload])
            .await
            .map_err(query_failed("write"))?;
        applied_record(&row, key, payload)
    }

    async fn write_if_revision(
        &self,
        key: &StateKey,
        expected: Revision,
        payload: &Value,
    ) -> StorageResult<WriteOutcome> {
        let conn = self.pool.get().await?;
        let row = if expected.is_zero() {
            let stmt = conn
                .prepare_cached(&self.statements.create_if_absent)
                .await
                .map_err(query_failed("write_if_revision"))?;
            conn.query_opt(&stmt, &[&key.to_string(), payload]).await
        } else {
            let stmt = conn
                .prepare_cached(&self.statements.compare_and_increment)
                .await
                .map_err(query_failed("write_if_revision"))?;
            conn.query_opt(&stmt, &[&key.to_string(), &expected.get(), payload])
                .await
        }
        .map_err(query_failed("write_if_revision"))?;

        match row {
            Some(row) => Ok(WriteOutcome::Applied(applied_record(&row, key, payload)?)),
            None => Ok(WriteOutcome::RevisionConflict {
                key: key.clone(),
                expected,
            }),
        }
    }

    async fn delete(&self, key: &StateKey) -> StorageResult<Option<Revision>> {
        let conn = self.pool.get().await?;
        let stmt = conn
            .prepare_cached(&self.statements.tombstone)
            .await
            .map_err(query_failed("delete"))?;
        let row = conn
            .query_opt(&stmt, &[&key.to_string()])
            .await
            .map_err(query_failed("delete"))?;
        row.map(|row| column(&row, key, "revision").map(Revision::new))
            .transpose()
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&self.statements.create)
            .await
            .map_err(|e| StorageError::SchemaFailed {
                reason: e.to_string(),
            })?;
        tracing::info!("state table ready");
        Ok(())
    }

    async fn purge_tombstones(&self, older_than: Timestamp) -> StorageResult<u64> {
        let conn = self.pool.get().await?;
        let purged = conn
            .execute(&self.statements.purge, &[&older_than])
            .await
            .map_err(query_failed("purge_tombstones"))?;
        if purged > 0 {
            tracing::info!(purged, older_than = %older_than, "purged tombstones");
        }
        Ok(purged)
    }

    async fn health(&self) -> StorageResult<StoreHealth> {
        let started = Instant::now();
        let conn = self.pool.get().await?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(query_failed("health"))?;
        Ok(StoreHealth {
            latency: started.elapsed(),
            pool: self.pool.status(),
        })
    }

    fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    fn close(&self) {
        self.pool.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================
