//! Repository traits for metadata operations.

pub mod buckets;
pub mod locks;
pub mod tenants;

pub use buckets::BucketRepo;
pub use locks::LockRepo;
pub use tenants::TenantRepo;
