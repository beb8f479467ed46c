//! Request-scoped memoization.
//!
//! A [`RequestContext`] is created when an upload operation starts, passed by
//! reference to every resolver and backend call made on behalf of that
//! operation, and dropped when it finishes. Lookups that several layers need
//! (the bucket row, for one) are computed once per request through
//! [`RequestContext::get_or_try_init`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type Slot = Box<dyn Any + Send + Sync>;

/// Per-request state shared by the calls serving one upload operation.
pub struct RequestContext {
    request_id: String,
    tenant_id: String,
    cache: Mutex<HashMap<(TypeId, String), Slot>>,
}

impl RequestContext {
    /// Create a context with a freshly generated request id.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string(), tenant_id)
    }

    /// Create a context that reuses a request id assigned upstream.
    pub fn with_request_id(request_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: tenant_id.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Return the value cached under `key`, computing it with `init` on first use.
    ///
    /// Concurrent callers for the same key and type share a single computation.
    /// A failed computation is not cached; the next caller runs `init` again.
    /// Values of different types never collide, even under the same key.
    pub async fn get_or_try_init<T, E, F, Fut>(&self, key: &str, init: F) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = self.cell::<T>(key);
        let value = cell
            .get_or_try_init(|| async { init().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(value))
    }

    /// Return the value cached under `key`, if it has been computed.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.cell::<T>(key).get().cloned()
    }

    fn cell<T: Send + Sync + 'static>(&self, key: &str) -> Arc<OnceCell<Arc<T>>> {
        // Never held across an await; poisoning can only come from a panic in this fn.
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = cache
            .entry((TypeId::of::<T>(), key.to_string()))
            .or_insert_with(|| Box::new(Arc::new(OnceCell::<Arc<T>>::new())));

        match slot.downcast_ref::<Arc<OnceCell<Arc<T>>>>() {
            Some(cell) => Arc::clone(cell),
            None => {
                let cell = Arc::new(OnceCell::new());
                *slot = Box::new(Arc::clone(&cell));
                cell
            }
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}
