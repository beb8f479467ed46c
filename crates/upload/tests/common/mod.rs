pub mod metadata;

#[allow(unused_imports)]
pub use metadata::MemoryMetadataStore;

use ferry_core::UploadIdentifier;

#[allow(dead_code)]
pub fn upload_id(bucket: &str, key: &str, version: &str) -> UploadIdentifier {
    UploadIdentifier::new(bucket, key, version).expect("valid test identifier")
}
