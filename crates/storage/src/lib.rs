//! Chunked upload storage for Ferry.
//!
//! This crate provides:
//! - The `StorageBackend` contract used by the upload core
//! - A local filesystem backend that appends chunks to part files
//! - A remote multipart backend over an S3-compatible API
//! - The request-scoped `RequestContext` passed through every call

pub mod backends;
pub mod context;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::multipart::{MultipartBackend, MultipartOptions};
pub use backends::s3::S3MultipartClient;
pub use context::RequestContext;
pub use error::{StorageError, StorageResult};
pub use traits::{
    BackendState, CommittedObject, CompletedPartInfo, MultipartClient, StorageBackend,
    UploadHandle,
};

use ferry_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create the storage backend selected by configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Local { root } => {
            let backend = FilesystemBackend::new(root).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::RemoteMultipart {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            part_size_bytes,
            max_concurrent_parts,
            expiry_secs,
        } => {
            let client = S3MultipartClient::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            let backend = MultipartBackend::new(
                Arc::new(client),
                MultipartOptions {
                    part_size: *part_size_bytes,
                    max_concurrent_parts: *max_concurrent_parts,
                    expiry: Duration::from_secs(*expiry_secs),
                },
            )?;
            Ok(Arc::new(backend))
        }
    }
}
