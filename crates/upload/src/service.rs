//! Upload operation sequencing.
//!
//! [`UploadCoordinator`] is what a protocol engine calls for each upload
//! operation. Every offset-mutating call decodes the upload id, takes the
//! upload's lock, re-reads the session under it, bounds the write by the
//! resolved size limit, drives the storage backend and saves the session
//! before the lock is released.

use crate::error::{UploadError, UploadResult};
use crate::limits::SizeLimitResolver;
use crate::lock::DistributedLocker;
use crate::retry::retry_with_backoff;
use crate::session::SessionStore;
use anyhow::Context;
use bytes::Bytes;
use ferry_core::config::{AppConfig, RetryConfig};
use ferry_core::{UploadIdentifier, UploadSession};
use ferry_metadata::MetadataStore;
use ferry_storage::{CommittedObject, RequestContext, StorageBackend, StorageError, UploadHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Drives upload operations against the lock, the limits and the backend.
pub struct UploadCoordinator {
    backend: Arc<dyn StorageBackend>,
    sessions: Arc<dyn SessionStore>,
    locker: DistributedLocker,
    limits: SizeLimitResolver,
    lock_timeout: Duration,
    retry: RetryConfig,
}

impl UploadCoordinator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn MetadataStore>,
        sessions: Arc<dyn SessionStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            backend,
            sessions,
            locker: DistributedLocker::new(Arc::clone(&store), &config.lock),
            limits: SizeLimitResolver::new(store, &config.limits),
            lock_timeout: config.lock.wait_timeout(),
            retry: config.retry.clone(),
        }
    }

    /// Open the configured metadata store and storage backend.
    pub async fn from_config(
        config: &AppConfig,
        sessions: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = ferry_metadata::from_config(&config.metadata)
            .await
            .context("Failed to open metadata store")?;
        store
            .migrate()
            .await
            .context("Failed to run metadata migrations")?;

        let backend = ferry_storage::from_config(&config.storage)
            .await
            .context("Failed to initialize storage backend")?;
        backend
            .health_check()
            .await
            .context("Storage backend health check failed")?;

        tracing::info!(
            backend = backend.backend_name(),
            notifier = store.lock_notifier().notifier_name(),
            "Upload coordinator ready"
        );
        Ok(Self::new(backend, store, sessions, config))
    }

    pub fn locker(&self) -> &DistributedLocker {
        &self.locker
    }

    pub fn limits(&self) -> &SizeLimitResolver {
        &self.limits
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Decode a client-supplied upload token.
    pub fn decode_token(token: &str) -> UploadResult<UploadIdentifier> {
        Ok(UploadIdentifier::decode(token)?)
    }

    /// Start a new upload session for `id`, owned by the context's tenant.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id(), upload = %id))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        id: UploadIdentifier,
        declared_size: Option<u64>,
    ) -> UploadResult<UploadSession> {
        let limit = self
            .limits
            .resolve(ctx, ctx.tenant_id(), Some(id.bucket()))
            .await?;
        if let Some(size) = declared_size
            && size > limit
        {
            return Err(UploadError::SizeLimitExceeded { size, limit });
        }

        let id = &id;
        let session = self
            .locker
            .with_lock(&id.resource_id(), self.lock_timeout, move || async move {
                if self.sessions.load_session(id).await?.is_some() {
                    return Err(UploadError::UploadExists(id.encode()));
                }

                let handle = retry_with_backoff(&self.retry, "create_or_resume", || {
                    self.backend.create_or_resume(ctx, id, 0, None)
                })
                .await?;

                let mut session = UploadSession::new(id.clone(), ctx.tenant_id(), declared_size);
                session.backend_state = Some(handle.to_state()?);
                self.sessions.save_session(&session).await?;
                Ok::<_, UploadError>(session)
            })
            .await?;

        tracing::info!(size = ?declared_size, limit, "Upload created");
        Ok(session)
    }

    /// Append `data` at `expected_offset` and return the new offset.
    #[instrument(skip(self, ctx, token, data), fields(request_id = %ctx.request_id(), size = data.len()))]
    pub async fn append(
        &self,
        ctx: &RequestContext,
        token: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> UploadResult<u64> {
        let id = &Self::decode_token(token)?;
        let data = &data;

        self.locker
            .with_lock(&id.resource_id(), self.lock_timeout, move || async move {
                let mut session = self.owned_session(ctx, id).await?;
                if session.offset() != expected_offset {
                    return Err(UploadError::OffsetMismatch {
                        expected: expected_offset,
                        actual: session.offset(),
                    });
                }

                let new_len = expected_offset
                    .checked_add(data.len() as u64)
                    .ok_or_else(|| UploadError::InvalidSession("offset overflow".to_string()))?;
                let limit = self
                    .limits
                    .resolve(ctx, &session.tenant_id, Some(id.bucket()))
                    .await?;
                if new_len > limit {
                    return Err(UploadError::SizeLimitExceeded {
                        size: new_len,
                        limit,
                    });
                }
                if let Some(size) = session.size()
                    && new_len > size
                {
                    return Err(UploadError::InvalidSession(format!(
                        "chunk ends at {new_len}, past the declared length {size}"
                    )));
                }

                let saved = Self::saved_handle(&session)?;
                let handle = self
                    .backend
                    .create_or_resume(ctx, id, expected_offset, Some(&saved))
                    .await?;

                // Each attempt writes from the pre-write handle, which a failed write leaves as-is.
                let (offset, handle) = retry_with_backoff(&self.retry, "write_chunk", || {
                    let mut attempt = handle.clone();
                    let data = data.clone();
                    async move {
                        let offset = self.backend.write_chunk(ctx, &mut attempt, data).await?;
                        Ok::<_, StorageError>((offset, attempt))
                    }
                })
                .await?;

                session.advance(offset)?;
                session.backend_state = Some(handle.to_state()?);
                if let Err(e) = self.sessions.save_session(&session).await {
                    // The backend rolls back to the saved handle on the next resume.
                    tracing::warn!(
                        offset = expected_offset,
                        unsaved_offset = offset,
                        error = %e,
                        "Session save failed after write"
                    );
                    return Err(e);
                }
                Ok::<_, UploadError>(offset)
            })
            .await
    }

    /// Commit the uploaded bytes as the final object and drop the session.
    ///
    /// A deferred-length upload takes its current offset as its length.
    #[instrument(skip(self, ctx, token), fields(request_id = %ctx.request_id()))]
    pub async fn finish(&self, ctx: &RequestContext, token: &str) -> UploadResult<CommittedObject> {
        let id = &Self::decode_token(token)?;

        let committed = self
            .locker
            .with_lock(&id.resource_id(), self.lock_timeout, move || async move {
                let mut session = self.owned_session(ctx, id).await?;
                match session.size() {
                    None => session.declare_size(session.offset())?,
                    Some(size) if !session.is_complete() => {
                        return Err(UploadError::InvalidSession(format!(
                            "upload incomplete: {} of {size} bytes received",
                            session.offset()
                        )));
                    }
                    Some(_) => {}
                }

                let saved = Self::saved_handle(&session)?;
                let handle = self
                    .backend
                    .create_or_resume(ctx, id, session.offset(), Some(&saved))
                    .await?;
                // Not retried: a completion whose response was lost cannot be repeated.
                let committed = self.backend.finalize(ctx, &handle).await?;

                self.sessions.delete_session(id).await?;
                Ok::<_, UploadError>(committed)
            })
            .await?;

        tracing::info!(
            upload = %id,
            location = %committed.location,
            size = committed.size,
            "Upload committed"
        );
        Ok(committed)
    }

    /// Discard an upload and everything the backend holds for it.
    #[instrument(skip(self, ctx, token), fields(request_id = %ctx.request_id()))]
    pub async fn abort(&self, ctx: &RequestContext, token: &str) -> UploadResult<()> {
        let id = &Self::decode_token(token)?;

        self.locker
            .with_lock(&id.resource_id(), self.lock_timeout, move || async move {
                let session = self.owned_session(ctx, id).await?;
                // Expired uploads are aborted from the saved handle without resuming.
                let saved = Self::saved_handle(&session)?;
                self.backend.abort(ctx, &saved).await?;
                self.sessions.delete_session(id).await?;
                Ok::<_, UploadError>(())
            })
            .await?;

        tracing::info!(upload = %id, "Upload aborted");
        Ok(())
    }

    /// Current state of an upload, for offset queries. Does not take the lock.
    pub async fn status(&self, ctx: &RequestContext, token: &str) -> UploadResult<UploadSession> {
        let id = Self::decode_token(token)?;
        self.owned_session(ctx, &id).await
    }

    /// Load the session for `id`, hiding sessions of other tenants.
    async fn owned_session(
        &self,
        ctx: &RequestContext,
        id: &UploadIdentifier,
    ) -> UploadResult<UploadSession> {
        match self.sessions.load_session(id).await? {
            Some(session) if session.tenant_id == ctx.tenant_id() => Ok(session),
            _ => Err(UploadError::UploadNotFound(id.encode())),
        }
    }

    fn saved_handle(session: &UploadSession) -> UploadResult<UploadHandle> {
        let state = session.backend_state.as_ref().ok_or_else(|| {
            UploadError::InvalidSession(format!("session {} has no backend state", session.id))
        })?;
        Ok(UploadHandle::from_state(state)?)
    }
}
