//! Distributed per-resource locking.
//!
//! A lock is a row in the shared `upload_locks` table: whoever inserts the row
//! for a resource id holds it until the row is deleted. Contenders do not poll.
//! They subscribe to the store's release notifications for that resource before
//! trying the insert, then sleep until a release is published or their wait
//! budget runs out.

use crate::error::{UploadError, UploadResult};
use ferry_core::config::LockConfig;
use ferry_metadata::models::LockRow;
use ferry_metadata::{LockNotifier, MetadataStore};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Acquires and releases upload locks through the metadata store.
#[derive(Clone)]
pub struct DistributedLocker {
    store: Arc<dyn MetadataStore>,
    notifier: Arc<dyn LockNotifier>,
    stale_after: Duration,
}

impl std::fmt::Debug for DistributedLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLocker")
            .field("notifier", &self.notifier.notifier_name())
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

/// A held lock.
///
/// Release it with [`DistributedLocker::release`]. A guard dropped without
/// being released (e.g. its task was cancelled) releases in a background task.
#[must_use = "a lock guard must be released"]
pub struct LockGuard {
    resource_id: String,
    holder_token: String,
    acquired_at: OffsetDateTime,
    store: Arc<dyn MetadataStore>,
    notifier: Arc<dyn LockNotifier>,
    released: bool,
}

impl LockGuard {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn holder_token(&self) -> &str {
        &self.holder_token
    }

    pub fn acquired_at(&self) -> OffsetDateTime {
        self.acquired_at
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_id", &self.resource_id)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                resource_id = %self.resource_id,
                "Lock guard dropped outside a runtime, row left for the stale-lock reaper"
            );
            return;
        };

        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let resource_id = std::mem::take(&mut self.resource_id);
        let holder_token = std::mem::take(&mut self.holder_token);
        runtime.spawn(async move {
            if let Err(e) = release_row(&*store, &*notifier, &resource_id, &holder_token).await {
                tracing::warn!(
                    resource_id = %resource_id,
                    error = %e,
                    "Failed to release dropped lock guard"
                );
            }
        });
    }
}

/// Delete the row held under `holder_token`, then wake waiters.
async fn release_row(
    store: &dyn MetadataStore,
    notifier: &dyn LockNotifier,
    resource_id: &str,
    holder_token: &str,
) -> UploadResult<()> {
    let deleted = store
        .delete_lock(resource_id, holder_token)
        .await
        .map_err(UploadError::LockStore)?;
    if !deleted {
        tracing::warn!(
            resource_id = %resource_id,
            "Lock row was already gone on release, it may have been reaped as stale"
        );
    }

    // A lost notification only delays waiters until their timeout.
    if let Err(e) = notifier.publish(resource_id).await {
        tracing::warn!(
            resource_id = %resource_id,
            notifier = notifier.notifier_name(),
            error = %e,
            "Failed to publish lock release"
        );
    }
    Ok(())
}

impl DistributedLocker {
    /// Create a locker that uses the store's own release notifier.
    pub fn new(store: Arc<dyn MetadataStore>, config: &LockConfig) -> Self {
        let notifier = store.lock_notifier();
        Self::with_notifier(store, notifier, config)
    }

    /// Create a locker with an explicit release notifier.
    pub fn with_notifier(
        store: Arc<dyn MetadataStore>,
        notifier: Arc<dyn LockNotifier>,
        config: &LockConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            stale_after: config.stale_after(),
        }
    }

    /// Acquire the lock on `resource_id`, waiting at most `timeout`.
    pub async fn acquire(&self, resource_id: &str, timeout: Duration) -> UploadResult<LockGuard> {
        let started = Instant::now();
        let deadline = started + timeout;
        // Subscribe before the first insert so a release in between is not missed.
        let mut subscription = self.notifier.subscribe(resource_id);
        let holder_token = uuid::Uuid::new_v4().to_string();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let row = LockRow {
                resource_id: resource_id.to_string(),
                holder_token: holder_token.clone(),
                acquired_at: OffsetDateTime::now_utc(),
            };
            if self
                .store
                .try_insert_lock(&row)
                .await
                .map_err(UploadError::LockStore)?
            {
                tracing::debug!(
                    resource_id = %resource_id,
                    attempts,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired upload lock"
                );
                return Ok(LockGuard {
                    resource_id: row.resource_id,
                    holder_token: row.holder_token,
                    acquired_at: row.acquired_at,
                    store: Arc::clone(&self.store),
                    notifier: Arc::clone(&self.notifier),
                    released: false,
                });
            }

            if Instant::now() >= deadline {
                tracing::info!(
                    resource_id = %resource_id,
                    attempts,
                    "Timed out waiting for upload lock"
                );
                return Err(UploadError::LockTimeout {
                    resource_id: resource_id.to_string(),
                    waited: started.elapsed(),
                });
            }

            tracing::debug!(resource_id = %resource_id, attempts, "Upload lock held, waiting for release");
            // On timeout the loop makes one last insert attempt before giving up.
            let _ = tokio::time::timeout_at(deadline, subscription.released()).await;
        }
    }

    /// Release a held lock: delete its row, then wake waiters.
    pub async fn release(&self, mut guard: LockGuard) -> UploadResult<()> {
        guard.released = true;
        let result = release_row(
            &*self.store,
            &*self.notifier,
            &guard.resource_id,
            &guard.holder_token,
        )
        .await;
        tracing::debug!(
            resource_id = %guard.resource_id,
            held_ms = (OffsetDateTime::now_utc() - guard.acquired_at).whole_milliseconds() as i64,
            "Released upload lock"
        );
        result
    }

    /// Run `f` while holding the lock on `resource_id`.
    ///
    /// The lock is released on every exit path: success, error, or a panic
    /// inside `f`, which is resumed after the release.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource_id: &str,
        timeout: Duration,
        f: F,
    ) -> UploadResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        let guard = self.acquire(resource_id, timeout).await?;
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release(guard).await {
            tracing::warn!(
                resource_id = %resource_id,
                error = %e,
                "Failed to release upload lock"
            );
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Lock rows held longer than the staleness threshold, oldest first.
    ///
    /// Only reports; removing a row is left to the reaper that calls this.
    pub async fn stale_locks(&self, limit: u32) -> UploadResult<Vec<LockRow>> {
        let cutoff = OffsetDateTime::now_utc() - self.stale_after;
        self.store
            .find_stale_locks(cutoff, limit)
            .await
            .map_err(UploadError::LockStore)
    }

    /// Age after which a held lock counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}
