//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Upload locks
// =============================================================================

/// A held lock on an upload resource. One row per resource at most.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LockRow {
    pub resource_id: String,
    /// Random token identifying the holder; release only deletes a row carrying it.
    pub holder_token: String,
    pub acquired_at: OffsetDateTime,
}

impl LockRow {
    /// How long the lock has been held as of `now`. Zero if the clock went backwards.
    pub fn age(&self, now: OffsetDateTime) -> std::time::Duration {
        (now - self.acquired_at)
            .try_into()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

// =============================================================================
// Buckets (read-only, owned by the object metadata schema)
// =============================================================================

/// The bucket columns consulted when resolving upload limits.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BucketRow {
    pub id: String,
    /// Per-bucket upload limit in bytes; `None` means the tenant limit applies.
    pub file_size_limit: Option<i64>,
}

impl BucketRow {
    /// The bucket limit as an unsigned byte count. Negative values are treated as zero.
    pub fn file_size_limit_bytes(&self) -> Option<u64> {
        self.file_size_limit.map(|limit| u64::try_from(limit).unwrap_or(0))
    }
}
