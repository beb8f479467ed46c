//! Upload error taxonomy handed to the protocol engine.

use ferry_metadata::MetadataError;
use ferry_storage::StorageError;
use http::StatusCode;
use std::time::Duration;

/// Upload operation errors.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("malformed upload identifier: {0}")]
    MalformedIdentifier(String),

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("upload already exists: {0}")]
    UploadExists(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("offset mismatch: expected {expected}, upload is at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("part {part_number} is {size} bytes, below the {min} byte minimum")]
    PartSizeViolation {
        part_number: i32,
        size: u64,
        min: u64,
    },

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("invalid upload state: {0}")]
    InvalidSession(String),

    #[error("upload expired: {0}")]
    UploadExpired(String),

    #[error("timed out after {waited:?} waiting for lock on {resource_id}")]
    LockTimeout {
        resource_id: String,
        waited: Duration,
    },

    #[error("quota lookup failed: {0}")]
    QuotaLookupFailed(#[source] MetadataError),

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("lock store error: {0}")]
    LockStore(#[source] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedIdentifier(_) => "malformed_identifier",
            Self::UploadNotFound(_) => "upload_not_found",
            Self::UploadExists(_) => "upload_exists",
            Self::BucketNotFound(_) => "bucket_not_found",
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::PartSizeViolation { .. } => "part_size_violation",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::InvalidSession(_) => "invalid_session",
            Self::UploadExpired(_) => "upload_expired",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::QuotaLookupFailed(_) => "quota_lookup_failed",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::LockStore(_) => "lock_store_error",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::UploadNotFound(_) => StatusCode::NOT_FOUND,
            Self::UploadExists(_) => StatusCode::CONFLICT,
            Self::BucketNotFound(_) => StatusCode::NOT_FOUND,
            Self::TenantNotFound(_) => StatusCode::NOT_FOUND,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::PartSizeViolation { .. } => StatusCode::BAD_REQUEST,
            Self::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidSession(_) => StatusCode::BAD_REQUEST,
            Self::UploadExpired(_) => StatusCode::GONE,
            // The client retries the same request once the holder finishes.
            Self::LockTimeout { .. } => StatusCode::LOCKED,
            Self::QuotaLookupFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::LockStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may repeat the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::QuotaLookupFailed(_) | Self::BackendUnavailable(_)
        )
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        if err.is_retryable() {
            return Self::BackendUnavailable(err.to_string());
        }
        match err {
            StorageError::OffsetMismatch { expected, actual } => {
                Self::OffsetMismatch { expected, actual }
            }
            StorageError::PartSizeViolation {
                part_number,
                size,
                min,
            } => Self::PartSizeViolation {
                part_number,
                size,
                min,
            },
            StorageError::NotFound(what) => Self::UploadNotFound(what),
            StorageError::Expired(what) => Self::UploadExpired(what),
            other => Self::Storage(other),
        }
    }
}

impl From<ferry_core::Error> for UploadError {
    fn from(err: ferry_core::Error) -> Self {
        match err {
            ferry_core::Error::MalformedIdentifier(msg) => Self::MalformedIdentifier(msg),
            ferry_core::Error::UploadSession(msg) => Self::InvalidSession(msg),
            ferry_core::Error::Config(msg) => Self::Internal(format!("configuration: {msg}")),
        }
    }
}

/// Result type for upload operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors_map_to_transient_statuses() {
        let lock = UploadError::LockTimeout {
            resource_id: "r".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(lock.is_retryable());
        assert_eq!(lock.status_code(), StatusCode::LOCKED);

        let quota = UploadError::QuotaLookupFailed(MetadataError::Internal("down".to_string()));
        assert!(quota.is_retryable());
        assert_eq!(quota.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let offset = UploadError::OffsetMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(!offset.is_retryable());
        assert_eq!(offset.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_storage_errors_keep_their_meaning() {
        let err: UploadError = StorageError::Unavailable("503".to_string()).into();
        assert!(matches!(err, UploadError::BackendUnavailable(_)));

        let err: UploadError = StorageError::OffsetMismatch {
            expected: 5,
            actual: 3,
        }
        .into();
        assert!(matches!(
            err,
            UploadError::OffsetMismatch {
                expected: 5,
                actual: 3
            }
        ));

        let err: UploadError = StorageError::InvalidKey("../x".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "storage_error");

        let err: UploadError = StorageError::PartSizeViolation {
            part_number: 2,
            size: 1,
            min: 5,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_malformed_identifier_is_client_error() {
        let err: UploadError = ferry_core::UploadIdentifier::decode("!!").unwrap_err().into();
        assert_eq!(err.code(), "malformed_identifier");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_retryable());
    }
}
