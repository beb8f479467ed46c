//! Distributed lock across two PostgreSQL-backed stores using testcontainers.
//!
//! Each store has its own pool and `LISTEN` connection, standing in for two
//! server processes. Requires Docker; set SKIP_POSTGRES_TESTS=1 to skip.

use ferry_core::config::LockConfig;
use ferry_metadata::repos::LockRepo;
use ferry_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore};
use ferry_upload::{DistributedLocker, UploadError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::time::Instant;

/// Stable prefix for container startup failures, which skip instead of fail.
const CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

struct TwoProcesses {
    a: Arc<PostgresStore>,
    b: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

impl TwoProcesses {
    async fn start() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let a = PostgresStore::from_url(&url, 5, None).await?;
        let b = PostgresStore::from_url(&url, 5, None).await?;
        Ok(Self {
            a: Arc::new(a),
            b: Arc::new(b),
            _container: container,
        })
    }

    fn lockers(&self) -> (DistributedLocker, DistributedLocker) {
        let config = LockConfig::default();
        (
            DistributedLocker::new(self.a.clone(), &config),
            DistributedLocker::new(self.b.clone(), &config),
        )
    }
}

/// Start the stores, skipping when Docker is unavailable or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures skip; connection or schema errors still fail.
async fn postgres_or_skip() -> Option<TwoProcesses> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TwoProcesses::start().await {
        Ok(stores) => Some(stores),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_release_wakes_waiter_in_other_process() {
    let Some(pg) = postgres_or_skip().await else {
        return;
    };
    assert_eq!(pg.a.lock_notifier().notifier_name(), "postgres");
    let (holder, waiter) = pg.lockers();

    let guard = holder.acquire("upload-x", Duration::from_secs(5)).await.unwrap();

    let task = tokio::spawn(async move {
        let started = Instant::now();
        let guard = waiter.acquire("upload-x", Duration::from_secs(30)).await?;
        let waited = started.elapsed();
        waiter.release(guard).await?;
        Ok::<_, UploadError>(waited)
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!task.is_finished(), "waiter acquired a held lock");
    holder.release(guard).await.unwrap();

    let waited = task.await.unwrap().unwrap();
    assert!(
        waited < Duration::from_secs(10),
        "waiter should be woken by NOTIFY, waited {waited:?}"
    );
    assert!(pg.a.get_lock("upload-x").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_critical_sections_never_overlap_across_processes() {
    let Some(pg) = postgres_or_skip().await else {
        return;
    };
    let (a, b) = pg.lockers();

    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..12 {
        let locker = if i % 2 == 0 { a.clone() } else { b.clone() };
        let inside = inside.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            locker
                .with_lock("upload-y", Duration::from_secs(60), move || async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, UploadError>(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(pg.b.get_lock("upload-y").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_lost_listener_wakes_waiters() {
    let Some(pg) = postgres_or_skip().await else {
        return;
    };
    let (holder, waiter) = pg.lockers();

    let guard = holder.acquire("upload-z", Duration::from_secs(5)).await.unwrap();
    let task = tokio::spawn(async move {
        let guard = waiter.acquire("upload-z", Duration::from_secs(30)).await?;
        waiter.release(guard).await?;
        Ok::<_, UploadError>(())
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Free the row without publishing, as if the release notification were lost.
    assert!(
        pg.a.delete_lock("upload-z", guard.holder_token())
            .await
            .unwrap()
    );

    // Dropping the LISTEN connections makes each listener wake all its waiters.
    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE query ILIKE 'LISTEN%' AND pid <> pg_backend_pid()",
    )
    .execute(pg.a.pool())
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("waiter should re-check the lock after the listener reconnects")
        .unwrap()
        .unwrap();

    // The row is already gone; releasing the old guard only deletes its own row.
    holder.release(guard).await.unwrap();
    assert!(pg.a.get_lock("upload-z").await.unwrap().is_none());
}
