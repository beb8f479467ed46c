//! Upload size limit resolution.

use crate::error::{UploadError, UploadResult};
use ferry_core::config::LimitsConfig;
use ferry_metadata::models::BucketRow;
use ferry_metadata::{MetadataError, MetadataStore};
use ferry_storage::RequestContext;
use std::sync::Arc;

/// Resolves the largest upload a tenant may make into a bucket.
///
/// The result is `min(bucket limit, tenant limit)`: a bucket can tighten the
/// tenant limit, never loosen it. The configured global maximum stands in for
/// "no limit", so the result is always finite.
#[derive(Clone)]
pub struct SizeLimitResolver {
    store: Arc<dyn MetadataStore>,
    max_file_size: u64,
}

impl SizeLimitResolver {
    pub fn new(store: Arc<dyn MetadataStore>, config: &LimitsConfig) -> Self {
        Self {
            store,
            max_file_size: config.max_file_size_bytes,
        }
    }

    /// Resolve the size limit in bytes.
    ///
    /// Without a bucket id only the tenant limit applies (used before the
    /// bucket is known, e.g. when validating a declared length up front).
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        bucket_id: Option<&str>,
    ) -> UploadResult<u64> {
        let tenant_limit = self.tenant_limit(ctx, tenant_id).await?;
        let Some(bucket_id) = bucket_id else {
            return Ok(tenant_limit);
        };

        let bucket = self.bucket(ctx, bucket_id).await?;
        Ok(match bucket.file_size_limit_bytes() {
            Some(bucket_limit) => bucket_limit.min(tenant_limit),
            None => tenant_limit,
        })
    }

    /// Bucket row for `bucket_id`, fetched at most once per request.
    pub async fn bucket(&self, ctx: &RequestContext, bucket_id: &str) -> UploadResult<BucketRow> {
        let store = Arc::clone(&self.store);
        let row = ctx
            .get_or_try_init(&format!("bucket:{bucket_id}"), || async move {
                store.get_bucket(bucket_id).await
            })
            .await
            .map_err(UploadError::QuotaLookupFailed)?;

        (*row)
            .clone()
            .ok_or_else(|| UploadError::BucketNotFound(bucket_id.to_string()))
    }

    async fn tenant_limit(&self, ctx: &RequestContext, tenant_id: &str) -> UploadResult<u64> {
        let store = Arc::clone(&self.store);
        let limit = ctx
            .get_or_try_init(&format!("tenant-limit:{tenant_id}"), || async move {
                store.get_tenant_file_size_limit(tenant_id).await
            })
            .await
            .map_err(|e| match e {
                MetadataError::NotFound(_) => UploadError::TenantNotFound(tenant_id.to_string()),
                other => UploadError::QuotaLookupFailed(other),
            })?;

        Ok(match *limit {
            Some(limit) => limit.min(self.max_file_size),
            None => self.max_file_size,
        })
    }
}
