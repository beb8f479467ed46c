//! Upload lock repository.

use crate::error::MetadataResult;
use crate::models::LockRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for per-resource lock rows.
///
/// The table is the only source of truth for lock ownership: a row means the
/// resource is held, no row means it is free.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Insert a lock row if none exists for the resource.
    /// Returns `true` if this call created the row (lock acquired).
    async fn try_insert_lock(&self, lock: &LockRow) -> MetadataResult<bool>;

    /// Delete the lock row for a resource, but only if it is still held by `holder_token`.
    /// Returns `true` if a row was deleted.
    async fn delete_lock(&self, resource_id: &str, holder_token: &str) -> MetadataResult<bool>;

    /// Get the current lock row for a resource.
    async fn get_lock(&self, resource_id: &str) -> MetadataResult<Option<LockRow>>;

    /// Get lock rows acquired before `older_than`, oldest first.
    /// Used by an external reaper to find locks whose holder likely crashed.
    async fn find_stale_locks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<LockRow>>;
}
