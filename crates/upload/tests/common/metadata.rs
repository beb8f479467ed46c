use async_trait::async_trait;
use ferry_metadata::models::{BucketRow, LockRow};
use ferry_metadata::repos::{BucketRepo, LockRepo, TenantRepo};
use ferry_metadata::{LocalNotifier, LockNotifier, MetadataError, MetadataResult, MetadataStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

/// In-memory metadata store with lookup counters and failure injection.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryMetadataStore {
    locks: Mutex<HashMap<String, LockRow>>,
    buckets: Mutex<HashMap<String, Option<i64>>>,
    tenants: Mutex<HashMap<String, Option<u64>>>,
    notifier: Arc<LocalNotifier>,
    bucket_lookups: AtomicUsize,
    tenant_lookups: AtomicUsize,
    fail_tenant_lookups: AtomicBool,
}

#[allow(dead_code)]
impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant_id: &str, limit: Option<u64>) -> Self {
        self.tenants
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), limit);
        self
    }

    pub fn with_bucket(self, bucket_id: &str, limit: Option<i64>) -> Self {
        self.buckets
            .lock()
            .unwrap()
            .insert(bucket_id.to_string(), limit);
        self
    }

    pub fn fail_tenant_lookups(&self, fail: bool) {
        self.fail_tenant_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn bucket_lookups(&self) -> usize {
        self.bucket_lookups.load(Ordering::SeqCst)
    }

    pub fn tenant_lookups(&self) -> usize {
        self.tenant_lookups.load(Ordering::SeqCst)
    }

    pub fn held_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Insert a lock row directly, bypassing the locker.
    pub fn insert_lock(&self, resource_id: &str, holder_token: &str, acquired_at: OffsetDateTime) {
        self.locks.lock().unwrap().insert(
            resource_id.to_string(),
            LockRow {
                resource_id: resource_id.to_string(),
                holder_token: holder_token.to_string(),
                acquired_at,
            },
        );
    }
}

#[async_trait]
impl LockRepo for MemoryMetadataStore {
    async fn try_insert_lock(&self, lock: &LockRow) -> MetadataResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(&lock.resource_id) {
            return Ok(false);
        }
        locks.insert(lock.resource_id.clone(), lock.clone());
        Ok(true)
    }

    async fn delete_lock(&self, resource_id: &str, holder_token: &str) -> MetadataResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(resource_id) {
            Some(row) if row.holder_token == holder_token => {
                locks.remove(resource_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, resource_id: &str) -> MetadataResult<Option<LockRow>> {
        Ok(self.locks.lock().unwrap().get(resource_id).cloned())
    }

    async fn find_stale_locks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<LockRow>> {
        let mut stale: Vec<LockRow> = self
            .locks
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.acquired_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|row| row.acquired_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }
}

#[async_trait]
impl BucketRepo for MemoryMetadataStore {
    async fn get_bucket(&self, bucket_id: &str) -> MetadataResult<Option<BucketRow>> {
        self.bucket_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .get(bucket_id)
            .map(|limit| BucketRow {
                id: bucket_id.to_string(),
                file_size_limit: *limit,
            }))
    }
}

#[async_trait]
impl TenantRepo for MemoryMetadataStore {
    async fn get_tenant_file_size_limit(&self, tenant_id: &str) -> MetadataResult<Option<u64>> {
        self.tenant_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_tenant_lookups.load(Ordering::SeqCst) {
            return Err(MetadataError::Internal("tenant store unreachable".to_string()));
        }
        self.tenants
            .lock()
            .unwrap()
            .get(tenant_id)
            .copied()
            .ok_or_else(|| MetadataError::NotFound(format!("tenant {tenant_id}")))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn migrate(&self) -> MetadataResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }

    fn lock_notifier(&self) -> Arc<dyn LockNotifier> {
        self.notifier.clone()
    }
}
