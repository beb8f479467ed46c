//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::notify::{LockNotifier, PgNotifier};
use crate::repos::{BucketRepo, LockRepo, TenantRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS upload_locks (
    resource_id TEXT PRIMARY KEY,
    holder_token TEXT NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_locks_acquired_at ON upload_locks(acquired_at);

-- Read-only for the upload core; normally created by the object metadata schema.
CREATE TABLE IF NOT EXISTS buckets (
    id TEXT PRIMARY KEY,
    file_size_limit BIGINT
);

CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    file_size_limit BIGINT
);
"#;

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
///
/// Safe to share between processes: lock rows live in one table and releases
/// travel over `LISTEN/NOTIFY`.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    notifier: Arc<PgNotifier>,
}

impl PostgresStore {
    /// Connect using a connection URL, run migrations and start the release listener.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::from_str(url)?;

        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        // The listener holds one connection of its own for the lifetime of the store.
        if max_connections < 2 {
            return Err(MetadataError::Config(
                "postgres max_connections must be at least 2".to_string(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let notifier = Arc::new(PgNotifier::start(pool.clone()).await?);
        let store = Self { pool, notifier };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn lock_notifier(&self) -> Arc<dyn LockNotifier> {
        self.notifier.clone()
    }
}

#[async_trait]
impl LockRepo for PostgresStore {
    async fn try_insert_lock(&self, lock: &LockRow) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_locks (resource_id, holder_token, acquired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(&lock.resource_id)
        .bind(&lock.holder_token)
        .bind(lock.acquired_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_lock(&self, resource_id: &str, holder_token: &str) -> MetadataResult<bool> {
        let result =
            sqlx::query("DELETE FROM upload_locks WHERE resource_id = $1 AND holder_token = $2")
                .bind(resource_id)
                .bind(holder_token)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, resource_id: &str) -> MetadataResult<Option<LockRow>> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT resource_id, holder_token, acquired_at FROM upload_locks WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_stale_locks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<LockRow>> {
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT resource_id, holder_token, acquired_at
            FROM upload_locks
            WHERE acquired_at < $1
            ORDER BY acquired_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl BucketRepo for PostgresStore {
    async fn get_bucket(&self, bucket_id: &str) -> MetadataResult<Option<BucketRow>> {
        let row =
            sqlx::query_as::<_, BucketRow>("SELECT id, file_size_limit FROM buckets WHERE id = $1")
                .bind(bucket_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row)
    }
}

#[async_trait]
impl TenantRepo for PostgresStore {
    async fn get_tenant_file_size_limit(&self, tenant_id: &str) -> MetadataResult<Option<u64>> {
        let value: Option<Option<i64>> =
            sqlx::query_scalar("SELECT file_size_limit FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        match value {
            None => Err(MetadataError::NotFound(format!("tenant {tenant_id}"))),
            Some(limit) => Ok(limit.map(|v| u64::try_from(v).unwrap_or(0))),
        }
    }
}
