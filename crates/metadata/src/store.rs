//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::notify::{LocalNotifier, LockNotifier};
use crate::repos::{BucketRepo, LockRepo, TenantRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: LockRepo + BucketRepo + TenantRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Notifier that reaches every process sharing this store.
    fn lock_notifier(&self) -> Arc<dyn LockNotifier>;
}

/// SQLite-based metadata store.
///
/// Lock release notifications stay in-process, so a SQLite store must not be
/// shared between processes that contend for the same uploads.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    notifier: Arc<LocalNotifier>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::MetadataError::Internal(format!("create db dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // Lock waiters never hold a connection while sleeping, so one is enough.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            notifier: Arc::new(LocalNotifier::new()),
        };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Opened SQLite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
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

mod sqlite_impl {
    use super::*;
    use crate::error::MetadataError;
    use crate::models::*;
    use time::OffsetDateTime;

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_insert_lock(&self, lock: &LockRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO upload_locks (resource_id, holder_token, acquired_at)
                VALUES (?, ?, ?)
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
                sqlx::query("DELETE FROM upload_locks WHERE resource_id = ? AND holder_token = ?")
                    .bind(resource_id)
                    .bind(holder_token)
                    .execute(&self.pool)
                    .await?;

            Ok(result.rows_affected() > 0)
        }

        async fn get_lock(&self, resource_id: &str) -> MetadataResult<Option<LockRow>> {
            let row = sqlx::query_as::<_, LockRow>(
                "SELECT resource_id, holder_token, acquired_at FROM upload_locks WHERE resource_id = ?",
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
                WHERE acquired_at < ?
                ORDER BY acquired_at ASC
                LIMIT ?
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
    impl BucketRepo for SqliteStore {
        async fn get_bucket(&self, bucket_id: &str) -> MetadataResult<Option<BucketRow>> {
            let row = sqlx::query_as::<_, BucketRow>(
                "SELECT id, file_size_limit FROM buckets WHERE id = ?",
            )
            .bind(bucket_id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row)
        }
    }

    #[async_trait]
    impl TenantRepo for SqliteStore {
        async fn get_tenant_file_size_limit(&self, tenant_id: &str) -> MetadataResult<Option<u64>> {
            // None: no tenant row. Some(None): tenant without an explicit limit.
            let value: Option<Option<i64>> =
                sqlx::query_scalar("SELECT file_size_limit FROM tenants WHERE id = ?")
                    .bind(tenant_id)
                    .fetch_optional(&self.pool)
                    .await?;

            match value {
                None => Err(MetadataError::NotFound(format!("tenant {tenant_id}"))),
                Some(limit) => Ok(limit.map(|v| u64::try_from(v).unwrap_or(0))),
            }
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Upload locks: at most one row per resource, the row is the lock.
CREATE TABLE IF NOT EXISTS upload_locks (
    resource_id TEXT PRIMARY KEY,
    holder_token TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_locks_acquired_at ON upload_locks(acquired_at);

-- Buckets and tenants are owned by the object metadata schema; the upload
-- core only reads their limits. Created here so a standalone store works.
CREATE TABLE IF NOT EXISTS buckets (
    id TEXT PRIMARY KEY,
    file_size_limit INTEGER
);

CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    file_size_limit INTEGER
);
"#;
