//! Upload session persistence seam.
//!
//! Sessions belong to the protocol engine; the coordinator only loads and saves
//! them while holding the upload's lock, so every operation sees the offset and
//! backend state left by the one before it.

use crate::error::UploadResult;
use async_trait::async_trait;
use ferry_core::{UploadIdentifier, UploadSession};
use std::collections::HashMap;
use std::sync::Mutex;

/// Where upload sessions live between requests.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn load_session(&self, id: &UploadIdentifier) -> UploadResult<Option<UploadSession>>;

    /// Insert or replace the session for `session.id`.
    async fn save_session(&self, session: &UploadSession) -> UploadResult<()>;

    /// Remove a session. Removing a missing session succeeds.
    async fn delete_session(&self, id: &UploadIdentifier) -> UploadResult<()>;
}

/// Process-local session store for single-process deployments and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<UploadIdentifier, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UploadIdentifier, UploadSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, id: &UploadIdentifier) -> UploadResult<Option<UploadSession>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn save_session(&self, session: &UploadSession) -> UploadResult<()> {
        self.lock().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &UploadIdentifier) -> UploadResult<()> {
        self.lock().remove(id);
        Ok(())
    }
}
