//! Local filesystem storage backend.
//!
//! In-progress uploads are appended to `<root>/uploads/<bucket>/<key>/<version>.part`
//! and published by renaming to `<root>/objects/<bucket>/<key>`.

use crate::context::RequestContext;
use crate::error::{StorageError, StorageResult};
use crate::traits::{BackendState, CommittedObject, StorageBackend, UploadHandle};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::UploadIdentifier;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

const UPLOADS_DIR: &str = "uploads";
const OBJECTS_DIR: &str = "objects";
const PART_SUFFIX: &str = ".part";

/// Local filesystem upload backend.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn part_key(id: &UploadIdentifier) -> String {
        format!(
            "{UPLOADS_DIR}/{}/{}/{}{PART_SUFFIX}",
            id.bucket(),
            id.object_key(),
            id.version()
        )
    }

    fn object_key(id: &UploadIdentifier) -> String {
        format!("{OBJECTS_DIR}/{}/{}", id.bucket(), id.object_key())
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Runs `key_path_sync` on the blocking pool since it canonicalizes and stats.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve `key` under `root`, rejecting anything that would escape it,
    /// including through symlinks.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        // Also rejects empty segments such as "a//b", which would alias "a/b".
        if key.split('/').any(|segment| segment.is_empty() || segment == ".") {
            return Err(StorageError::InvalidKey(format!(
                "contains empty or relative path segment: {key}"
            )));
        }

        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // An existing path (or dangling symlink) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;

                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // A new path must not be created through a symlinked ancestor: the nearest
        // existing ancestor has to resolve inside the root.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;

                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// The part path recorded in `handle`, re-validated against the root.
    async fn handle_path(&self, handle: &UploadHandle) -> StorageResult<PathBuf> {
        match &handle.state {
            BackendState::Local { .. } => self.key_path(&Self::part_key(&handle.id)).await,
            other => Err(StorageError::Config(format!(
                "filesystem backend cannot use {} handle",
                state_kind(other)
            ))),
        }
    }

    async fn truncate(path: &Path, len: u64) -> StorageResult<()> {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn part_len(path: &Path) -> StorageResult<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

fn state_kind(state: &BackendState) -> &'static str {
    match state {
        BackendState::Local { .. } => "local",
        BackendState::Multipart { .. } => "multipart",
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    #[instrument(skip(self, ctx, saved), fields(backend = "filesystem", request_id = %ctx.request_id(), upload = %id))]
    async fn create_or_resume(
        &self,
        ctx: &RequestContext,
        id: &UploadIdentifier,
        expected_offset: u64,
        saved: Option<&UploadHandle>,
    ) -> StorageResult<UploadHandle> {
        if let Some(saved) = saved
            && &saved.id != id
        {
            return Err(StorageError::Config(format!(
                "saved handle belongs to {}, not {id}",
                saved.id
            )));
        }

        let path = self.key_path(&Self::part_key(id)).await?;
        self.ensure_parent(&path).await?;

        if expected_offset == 0 {
            // Creating the empty part file makes a fresh upload resumable.
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
        }

        if let Some(saved) = saved
            && saved.offset != expected_offset
        {
            return Err(StorageError::OffsetMismatch {
                expected: expected_offset,
                actual: saved.offset,
            });
        }

        let mut actual = Self::part_len(&path).await?;
        if saved.is_some() && actual > expected_offset {
            // Bytes past the saved offset were written by a call whose session
            // update never landed.
            tracing::warn!(
                saved = expected_offset,
                on_disk = actual,
                "Discarding unacknowledged bytes past the saved offset"
            );
            Self::truncate(&path, expected_offset).await?;
            actual = expected_offset;
        }
        if actual != expected_offset {
            return Err(StorageError::OffsetMismatch {
                expected: expected_offset,
                actual,
            });
        }

        Ok(UploadHandle {
            id: id.clone(),
            offset: actual,
            state: BackendState::Local {
                path: PathBuf::from(Self::part_key(id)),
            },
        })
    }

    #[instrument(skip(self, ctx, handle, data), fields(backend = "filesystem", request_id = %ctx.request_id(), upload = %handle.id, size = data.len()))]
    async fn write_chunk(
        &self,
        ctx: &RequestContext,
        handle: &mut UploadHandle,
        data: Bytes,
    ) -> StorageResult<u64> {
        let path = self.handle_path(handle).await?;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(Self::part_key(&handle.id))
                } else {
                    StorageError::Io(e)
                }
            })?;

        let actual = file.metadata().await?.len();
        if actual != handle.offset {
            return Err(StorageError::OffsetMismatch {
                expected: handle.offset,
                actual,
            });
        }

        // The reported offset must survive a crash.
        let written = match file.write_all(&data).await {
            Ok(()) => file.sync_data().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // A partial append would make every retry of this chunk a mismatch.
            if let Err(undo) = file.set_len(actual).await {
                tracing::warn!(
                    offset = actual,
                    error = %undo,
                    "Failed to truncate part file after failed write"
                );
            }
            return Err(StorageError::Io(e));
        }

        handle.offset = actual + data.len() as u64;
        Ok(handle.offset)
    }

    #[instrument(skip(self, ctx, handle), fields(backend = "filesystem", request_id = %ctx.request_id(), upload = %handle.id))]
    async fn finalize(
        &self,
        ctx: &RequestContext,
        handle: &UploadHandle,
    ) -> StorageResult<CommittedObject> {
        let part_path = self.handle_path(handle).await?;
        let object_key = Self::object_key(&handle.id);
        let object_path = self.key_path(&object_key).await?;

        let actual = Self::part_len(&part_path).await?;
        if actual != handle.offset {
            return Err(StorageError::OffsetMismatch {
                expected: handle.offset,
                actual,
            });
        }

        {
            let file = fs::File::open(&part_path).await?;
            file.sync_all().await?;
        }
        self.ensure_parent(&object_path).await?;
        fs::rename(&part_path, &object_path).await?;

        tracing::debug!(location = %object_key, size = actual, "Published upload");

        Ok(CommittedObject {
            id: handle.id.clone(),
            location: object_key,
            size: actual,
            etag: None,
        })
    }

    #[instrument(skip(self, ctx, handle), fields(backend = "filesystem", request_id = %ctx.request_id(), upload = %handle.id))]
    async fn abort(&self, ctx: &RequestContext, handle: &UploadHandle) -> StorageResult<()> {
        let path = self.handle_path(handle).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }

        if metadata.permissions().readonly() {
            return Err(StorageError::Config(format!(
                "storage root is read-only: {}",
                self.root.display()
            )));
        }

        Ok(())
    }
}
