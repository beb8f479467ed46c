//! Remote multipart storage backend.
//!
//! Every full `part_size` slice of incoming bytes becomes one part. The
//! undersized tail of each write is parked in an incomplete-part object next to
//! the target key and prepended to the next write, so a later request on any
//! process can continue the upload from the serialized handle alone.
//!
//! Tail objects are keyed by the upload offset they start at. A write that cuts
//! new parts leaves the previous tail in place, so a handle whose successor was
//! never saved can still be resumed; the leftover is deleted by the next write.

use crate::context::RequestContext;
use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BackendState, CommittedObject, CompletedPartInfo, MultipartClient, StorageBackend,
    UploadHandle,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_core::UploadIdentifier;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::instrument;

/// Highest part number accepted by S3-compatible multipart APIs.
pub const MAX_PART_NUMBER: i32 = 10_000;

const INCOMPLETE_SUFFIX: &str = "incomplete";

/// Reject a part that would break the multipart minimum.
///
/// Only the final part of an upload may be shorter than `min`.
pub(crate) fn check_part_size(
    part_number: i32,
    size: u64,
    min: u64,
    is_final: bool,
) -> StorageResult<()> {
    if !is_final && size < min {
        return Err(StorageError::PartSizeViolation {
            part_number,
            size,
            min,
        });
    }
    if part_number > MAX_PART_NUMBER {
        return Err(StorageError::TooManyParts {
            max: MAX_PART_NUMBER,
        });
    }
    Ok(())
}

/// Tunables for [`MultipartBackend`].
#[derive(Clone, Debug)]
pub struct MultipartOptions {
    /// Size of every non-final part.
    pub part_size: u64,
    /// Part uploads allowed in flight across the whole process.
    pub max_concurrent_parts: usize,
    /// How long an untouched upload stays resumable.
    pub expiry: Duration,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            part_size: ferry_core::DEFAULT_PART_SIZE,
            max_concurrent_parts: 100,
            expiry: Duration::from_secs(86400),
        }
    }
}

/// Upload backend on top of a remote multipart API.
pub struct MultipartBackend {
    client: Arc<dyn MultipartClient>,
    part_size: usize,
    expiry: Duration,
    /// Process-local bound on in-flight part uploads, shared by all uploads.
    in_flight: Arc<Semaphore>,
}

impl std::fmt::Debug for MultipartBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartBackend")
            .field("client", &self.client.client_name())
            .field("part_size", &self.part_size)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

struct Part {
    number: i32,
    data: Bytes,
}

impl MultipartBackend {
    pub fn new(client: Arc<dyn MultipartClient>, options: MultipartOptions) -> StorageResult<Self> {
        if options.part_size == 0 {
            return Err(StorageError::Config("part size must be positive".to_string()));
        }
        if options.max_concurrent_parts == 0 {
            return Err(StorageError::Config(
                "max_concurrent_parts must be at least 1".to_string(),
            ));
        }
        let part_size = usize::try_from(options.part_size).map_err(|_| {
            StorageError::Config(format!(
                "part size {} exceeds platform address space",
                options.part_size
            ))
        })?;

        Ok(Self {
            client,
            part_size,
            expiry: options.expiry,
            in_flight: Arc::new(Semaphore::new(options.max_concurrent_parts)),
        })
    }

    /// Object key the upload completes into.
    fn target_key(id: &UploadIdentifier) -> String {
        format!("{}/{}", id.bucket(), id.object_key())
    }

    /// Object holding the undersized tail that starts at byte `start` of the upload.
    fn incomplete_key(target_key: &str, id: &UploadIdentifier, start: u64) -> String {
        format!("{target_key}.{}.{start}.{INCOMPLETE_SUFFIX}", id.version())
    }

    fn superseded_tail(handle: &UploadHandle) -> Option<u64> {
        match &handle.state {
            BackendState::Multipart {
                superseded_tail, ..
            } => *superseded_tail,
            BackendState::Local { .. } => None,
        }
    }

    /// Best-effort removal of a tail object no saved handle refers to.
    async fn delete_tail(&self, target_key: &str, id: &UploadIdentifier, start: u64) {
        let key = Self::incomplete_key(target_key, id, start);
        if let Err(e) = self.client.delete_object(&key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete incomplete part");
        }
    }

    fn multipart_state(
        handle: &UploadHandle,
    ) -> StorageResult<(&str, &str, &[CompletedPartInfo], u64)> {
        match &handle.state {
            BackendState::Multipart {
                upload_id,
                key,
                parts,
                incomplete_len,
                ..
            } => Ok((
                upload_id.as_str(),
                key.as_str(),
                parts.as_slice(),
                *incomplete_len,
            )),
            BackendState::Local { .. } => Err(StorageError::Config(
                "multipart backend cannot use a local handle".to_string(),
            )),
        }
    }

    fn check_not_expired(&self, handle: &UploadHandle) -> StorageResult<()> {
        if self.is_expired(handle, OffsetDateTime::now_utc()) {
            return Err(StorageError::Expired(handle.id.to_string()));
        }
        Ok(())
    }

    /// Fetch the parked tail recorded in the handle.
    ///
    /// The stored object may be longer than `incomplete_len` when a later write
    /// was never saved; only the handle's prefix counts.
    async fn load_incomplete(
        &self,
        handle: &UploadHandle,
        target_key: &str,
        incomplete_len: u64,
    ) -> StorageResult<Bytes> {
        if incomplete_len == 0 {
            return Ok(Bytes::new());
        }
        let start = handle.offset.saturating_sub(incomplete_len);
        let key = Self::incomplete_key(target_key, &handle.id, start);
        let tail = match self.client.get_object(&key).await {
            Ok(tail) => tail,
            Err(StorageError::NotFound(_)) => Bytes::new(),
            Err(e) => return Err(e),
        };
        if (tail.len() as u64) < incomplete_len {
            return Err(StorageError::OffsetMismatch {
                expected: handle.offset,
                actual: start + tail.len() as u64,
            });
        }
        Ok(tail.slice(..incomplete_len as usize))
    }

    /// Upload `parts` concurrently, bounded by the process-wide semaphore.
    /// Returns the completed parts ordered by part number.
    async fn upload_parts(
        &self,
        upload_id: &str,
        key: &str,
        parts: Vec<Part>,
    ) -> StorageResult<Vec<CompletedPartInfo>> {
        let min = self.part_size as u64;
        let mut pending: FuturesUnordered<_> = parts
            .into_iter()
            .map(|part| self.upload_part(upload_id, key, part, min, false))
            .collect();

        let mut completed = Vec::with_capacity(pending.len());
        while let Some(result) = pending.next().await {
            // Dropping `pending` on error cancels the parts still in flight.
            completed.push(result?);
        }
        completed.sort_by_key(|p| p.part_number);
        Ok(completed)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part: Part,
        min: u64,
        is_final: bool,
    ) -> StorageResult<CompletedPartInfo> {
        let size = part.data.len() as u64;
        check_part_size(part.number, size, min, is_final)?;

        let _permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Unavailable("part upload limiter closed".to_string()))?;

        let etag = self
            .client
            .upload_part(key, upload_id, part.number, part.data)
            .await?;

        tracing::debug!(part_number = part.number, size, "Uploaded part");
        Ok(CompletedPartInfo {
            part_number: part.number,
            etag,
            size,
        })
    }
}

#[async_trait]
impl StorageBackend for MultipartBackend {
    #[instrument(skip(self, ctx, saved), fields(backend = "multipart", request_id = %ctx.request_id(), upload = %id))]
    async fn create_or_resume(
        &self,
        ctx: &RequestContext,
        id: &UploadIdentifier,
        expected_offset: u64,
        saved: Option<&UploadHandle>,
    ) -> StorageResult<UploadHandle> {
        let Some(saved) = saved else {
            if expected_offset != 0 {
                return Err(StorageError::OffsetMismatch {
                    expected: expected_offset,
                    actual: 0,
                });
            }

            let key = Self::target_key(id);
            let upload_id = self.client.create_multipart_upload(&key).await?;
            tracing::debug!(%upload_id, key = %key, "Started multipart upload");

            let now = OffsetDateTime::now_utc();
            return Ok(UploadHandle {
                id: id.clone(),
                offset: 0,
                state: BackendState::Multipart {
                    upload_id,
                    key,
                    parts: Vec::new(),
                    incomplete_len: 0,
                    superseded_tail: None,
                    created_at: now,
                    last_write_at: now,
                },
            });
        };

        if &saved.id != id {
            return Err(StorageError::Config(format!(
                "saved handle belongs to {}, not {id}",
                saved.id
            )));
        }
        Self::multipart_state(saved)?;
        self.check_not_expired(saved)?;

        if saved.offset != expected_offset {
            return Err(StorageError::OffsetMismatch {
                expected: expected_offset,
                actual: saved.offset,
            });
        }

        Ok(saved.clone())
    }

    #[instrument(skip(self, ctx, handle, data), fields(backend = "multipart", request_id = %ctx.request_id(), upload = %handle.id, size = data.len()))]
    async fn write_chunk(
        &self,
        ctx: &RequestContext,
        handle: &mut UploadHandle,
        data: Bytes,
    ) -> StorageResult<u64> {
        self.check_not_expired(handle)?;
        let (upload_id, key, parts, incomplete_len) = Self::multipart_state(handle)?;
        let (upload_id, key) = (upload_id.to_string(), key.to_string());
        let next_part = i32::try_from(parts.len())
            .map_err(|_| StorageError::TooManyParts {
                max: MAX_PART_NUMBER,
            })?
            + 1;

        let tail_start = handle.offset.saturating_sub(incomplete_len);
        if let Some(start) = Self::superseded_tail(handle) {
            self.delete_tail(&key, &handle.id, start).await;
        }

        let tail = self.load_incomplete(handle, &key, incomplete_len).await?;
        let mut buffer = BytesMut::with_capacity(tail.len() + data.len());
        buffer.extend_from_slice(&tail);
        buffer.extend_from_slice(&data);
        let buffer = buffer.freeze();

        let full_parts = buffer.len() / self.part_size;
        let slices = (0..full_parts)
            .map(|i| -> StorageResult<Part> {
                let start = i * self.part_size;
                let number = i32::try_from(i)
                    .ok()
                    .and_then(|i| next_part.checked_add(i))
                    .ok_or(StorageError::TooManyParts {
                        max: MAX_PART_NUMBER,
                    })?;
                Ok(Part {
                    number,
                    data: buffer.slice(start..start + self.part_size),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let remainder = buffer.slice(full_parts * self.part_size..);

        let uploaded = self.upload_parts(&upload_id, &key, slices).await?;

        // Without new parts the tail keeps its start, and the old tail stays a prefix.
        let new_start = tail_start + (full_parts * self.part_size) as u64;
        if !remainder.is_empty() {
            self.client
                .put_object(
                    &Self::incomplete_key(&key, &handle.id, new_start),
                    remainder.clone(),
                )
                .await?;
        }
        let left_behind = (full_parts > 0 && incomplete_len > 0).then_some(tail_start);

        if let BackendState::Multipart {
            parts,
            incomplete_len,
            superseded_tail,
            last_write_at,
            ..
        } = &mut handle.state
        {
            parts.extend(uploaded);
            *incomplete_len = remainder.len() as u64;
            *superseded_tail = left_behind;
            *last_write_at = OffsetDateTime::now_utc();
        }
        handle.offset += data.len() as u64;

        Ok(handle.offset)
    }

    #[instrument(skip(self, ctx, handle), fields(backend = "multipart", request_id = %ctx.request_id(), upload = %handle.id))]
    async fn finalize(
        &self,
        ctx: &RequestContext,
        handle: &UploadHandle,
    ) -> StorageResult<CommittedObject> {
        let (upload_id, key, parts, incomplete_len) = Self::multipart_state(handle)?;
        let tail = self.load_incomplete(handle, key, incomplete_len).await?;

        let mut parts = parts.to_vec();
        if !tail.is_empty() {
            let number = i32::try_from(parts.len() + 1).map_err(|_| StorageError::TooManyParts {
                max: MAX_PART_NUMBER,
            })?;
            let last = self
                .upload_part(
                    upload_id,
                    key,
                    Part { number, data: tail },
                    self.part_size as u64,
                    true,
                )
                .await?;
            parts.push(last);
        }

        // Multipart uploads need at least one non-empty part; an empty object is
        // written directly instead.
        let etag = if parts.is_empty() {
            if let Err(e) = self.client.abort_multipart_upload(key, upload_id).await {
                tracing::warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to abort multipart upload for zero-byte file, orphaned parts may remain"
                );
            }
            self.client.put_object(key, Bytes::new()).await?;
            None
        } else {
            parts.sort_by_key(|p| p.part_number);
            self.client
                .complete_multipart_upload(key, upload_id, &parts)
                .await?
        };

        // An unsaved write may have parked a tail even when the handle has none.
        let tail_start = handle.offset.saturating_sub(incomplete_len);
        self.delete_tail(key, &handle.id, tail_start).await;
        if let Some(start) = Self::superseded_tail(handle) {
            self.delete_tail(key, &handle.id, start).await;
        }

        Ok(CommittedObject {
            id: handle.id.clone(),
            location: key.to_string(),
            size: handle.offset,
            etag,
        })
    }

    #[instrument(skip(self, ctx, handle), fields(backend = "multipart", request_id = %ctx.request_id(), upload = %handle.id))]
    async fn abort(&self, ctx: &RequestContext, handle: &UploadHandle) -> StorageResult<()> {
        let (upload_id, key, _, incomplete_len) = Self::multipart_state(handle)?;

        let aborted = self.client.abort_multipart_upload(key, upload_id).await;
        if let Err(e) = &aborted {
            tracing::warn!(key = %key, upload_id = %upload_id, error = %e, "Failed to abort multipart upload");
        }

        let tail_start = handle.offset.saturating_sub(incomplete_len);
        self.delete_tail(key, &handle.id, tail_start).await;
        if let Some(start) = Self::superseded_tail(handle) {
            self.delete_tail(key, &handle.id, start).await;
        }

        aborted
    }

    fn backend_name(&self) -> &'static str {
        "multipart"
    }

    fn expires_at(&self, handle: &UploadHandle) -> Option<OffsetDateTime> {
        match &handle.state {
            BackendState::Multipart { last_write_at, .. } => Some(*last_write_at + self.expiry),
            BackendState::Local { .. } => None,
        }
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_final_part_below_minimum_rejected() {
        let err = check_part_size(3, 1024, 5 * 1024 * 1024, false).unwrap_err();
        assert!(matches!(
            err,
            StorageError::PartSizeViolation {
                part_number: 3,
                size: 1024,
                ..
            }
        ));
    }

    #[test]
    fn test_final_part_may_be_short() {
        assert!(check_part_size(3, 1, 5 * 1024 * 1024, true).is_ok());
        assert!(check_part_size(1, 5 * 1024 * 1024, 5 * 1024 * 1024, false).is_ok());
    }

    #[test]
    fn test_part_number_limit() {
        assert!(check_part_size(MAX_PART_NUMBER, 10, 10, false).is_ok());
        assert!(matches!(
            check_part_size(MAX_PART_NUMBER + 1, 10, 10, false),
            Err(StorageError::TooManyParts { .. })
        ));
    }

    #[test]
    fn test_incomplete_key_is_per_version() {
        let v1 = UploadIdentifier::new("b", "dir/file", "v1").unwrap();
        let v2 = UploadIdentifier::new("b", "dir/file", "v2").unwrap();
        let key = MultipartBackend::target_key(&v1);
        assert_eq!(key, "b/dir/file");
        assert_eq!(
            MultipartBackend::incomplete_key(&key, &v1, 8),
            "b/dir/file.v1.8.incomplete"
        );
        assert_ne!(
            MultipartBackend::incomplete_key(&key, &v1, 0),
            MultipartBackend::incomplete_key(&key, &v2, 0)
        );
    }
}
