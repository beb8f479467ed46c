//! Storage trait definitions.

use crate::context::RequestContext;
use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::UploadIdentifier;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;

/// Backend handle for one in-progress upload.
///
/// Serialized into the session's opaque `backend_state` after every call, so
/// any process can pick the upload up where the previous one stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    pub id: UploadIdentifier,
    /// Bytes durably accepted by the backend.
    pub offset: u64,
    pub state: BackendState,
}

/// Backend-specific part of an [`UploadHandle`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendState {
    /// Bytes appended to a part file on local disk.
    Local { path: PathBuf },
    /// Bytes uploaded as multipart parts plus an undersized trailing remainder.
    Multipart {
        upload_id: String,
        /// Object key the multipart upload completes into.
        key: String,
        /// Uploaded parts, ordered by part number.
        parts: Vec<CompletedPartInfo>,
        /// Length of the remainder held in the incomplete-part object.
        incomplete_len: u64,
        /// Start offset of a tail object left behind by the write that produced
        /// this handle; deleted once the handle is written from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        superseded_tail: Option<u64>,
        #[serde(with = "time::serde::rfc3339")]
        created_at: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        last_write_at: OffsetDateTime,
    },
}

/// A part accepted by the remote multipart API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

impl UploadHandle {
    /// Serialize for storage in the session's `backend_state`.
    pub fn to_state(&self) -> StorageResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restore a handle previously produced by [`UploadHandle::to_state`].
    pub fn from_state(state: &serde_json::Value) -> StorageResult<Self> {
        Ok(Self::deserialize(state)?)
    }
}

/// A published object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedObject {
    pub id: UploadIdentifier,
    /// Backend location of the object (path relative to the root, or object key).
    pub location: String,
    pub size: u64,
    /// Entity tag reported by the backend, if any.
    pub etag: Option<String>,
}

/// Chunked upload storage.
///
/// Callers serialize operations on one upload with the distributed lock; a
/// backend never guards against two writers on the same handle.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Start an upload, or resume `saved` after checking its offset.
    ///
    /// `saved` is authoritative: bytes the backend holds past `saved.offset`
    /// were never acknowledged and are discarded. Fails with `OffsetMismatch`
    /// when the backend holds fewer bytes than `expected_offset`, or when
    /// `expected_offset` disagrees with `saved`.
    async fn create_or_resume(
        &self,
        ctx: &RequestContext,
        id: &UploadIdentifier,
        expected_offset: u64,
        saved: Option<&UploadHandle>,
    ) -> StorageResult<UploadHandle>;

    /// Append `data` and return the new offset. `handle` is updated in place.
    async fn write_chunk(
        &self,
        ctx: &RequestContext,
        handle: &mut UploadHandle,
        data: Bytes,
    ) -> StorageResult<u64>;

    /// Publish the uploaded bytes as the final object.
    async fn finalize(
        &self,
        ctx: &RequestContext,
        handle: &UploadHandle,
    ) -> StorageResult<CommittedObject>;

    /// Discard the upload and free backend storage held for it.
    async fn abort(&self, ctx: &RequestContext, handle: &UploadHandle) -> StorageResult<()>;

    /// Get the name of this storage backend.
    fn backend_name(&self) -> &'static str;

    /// When the upload becomes eligible for cleanup, if the backend expires uploads.
    fn expires_at(&self, _handle: &UploadHandle) -> Option<OffsetDateTime> {
        None
    }

    /// Whether the upload is past its expiry as of `now`.
    fn is_expired(&self, handle: &UploadHandle, now: OffsetDateTime) -> bool {
        self.expires_at(handle).is_some_and(|at| now >= at)
    }

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// The subset of an S3-style multipart API the remote backend needs.
#[async_trait]
pub trait MultipartClient: Send + Sync + 'static {
    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String>;

    /// Upload one part and return its entity tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Complete the upload from `parts`, which are ordered by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<Option<String>>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    async fn put_object(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Fetch an object; `NotFound` if absent.
    async fn get_object(&self, key: &str) -> StorageResult<Bytes>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    fn client_name(&self) -> &'static str;

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
