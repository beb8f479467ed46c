//! Bucket lookups.

use crate::error::MetadataResult;
use crate::models::BucketRow;
use async_trait::async_trait;

/// Read-only access to bucket metadata.
#[async_trait]
pub trait BucketRepo: Send + Sync {
    /// Get a bucket by ID.
    async fn get_bucket(&self, bucket_id: &str) -> MetadataResult<Option<BucketRow>>;
}
