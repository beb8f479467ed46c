//! Core domain types and shared logic for Ferry.
//!
//! This crate defines the data model shared by the other crates:
//! - Upload identifiers and their opaque token codec
//! - Upload session offset/length bookkeeping
//! - Configuration for storage, metadata, locking and size limits

pub mod config;
pub mod error;
pub mod upload;

pub use error::{Error, Result};
pub use upload::{UploadIdentifier, UploadSession};

/// Bytes in one mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default remote multipart part size: 16 MiB
pub const DEFAULT_PART_SIZE: u64 = 16 * MIB;

/// Minimum part size accepted by S3-compatible multipart APIs: 5 MiB
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Default ceiling for any single upload when no tighter limit applies: 50 GiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * MIB;
