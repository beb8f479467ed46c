//! Storage backend implementations.

pub mod filesystem;
pub mod multipart;
pub mod s3;
