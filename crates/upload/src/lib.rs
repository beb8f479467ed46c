//! Upload coordination for Ferry.
//!
//! This crate ties the other crates together for a protocol engine:
//! - `DistributedLocker` serializes offset-mutating operations per upload
//! - `SizeLimitResolver` bounds uploads by tenant and bucket quotas
//! - `UploadCoordinator` sequences lock, limits, backend and session calls
//! - `UploadError` is the error taxonomy surfaced to clients

pub mod error;
pub mod limits;
pub mod lock;
pub mod retry;
pub mod service;
pub mod session;
pub mod telemetry;

pub use error::{UploadError, UploadResult};
pub use limits::SizeLimitResolver;
pub use lock::{DistributedLocker, LockGuard};
pub use retry::{Retryable, retry_with_backoff};
pub use service::UploadCoordinator;
pub use session::{MemorySessionStore, SessionStore};
pub use telemetry::init_tracing;

pub use ferry_storage::RequestContext;
