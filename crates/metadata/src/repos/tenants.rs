//! Tenant quota lookups.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// Read-only access to tenant-wide quotas.
#[async_trait]
pub trait TenantRepo: Send + Sync {
    /// Get the tenant-wide upload limit in bytes.
    ///
    /// Returns `None` when the tenant exists without an explicit limit, and
    /// `MetadataError::NotFound` when the tenant is unknown.
    async fn get_tenant_file_size_limit(&self, tenant_id: &str) -> MetadataResult<Option<u64>>;
}
