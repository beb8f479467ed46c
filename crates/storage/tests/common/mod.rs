pub mod mocks;

#[allow(unused_imports)]
pub use mocks::MemoryMultipartClient;

use ferry_core::UploadIdentifier;

#[allow(dead_code)]
pub fn upload_id(bucket: &str, key: &str, version: &str) -> UploadIdentifier {
    UploadIdentifier::new(bucket, key, version).expect("valid test identifier")
}

/// Deterministic non-repeating payload so misordered parts are detected.
#[allow(dead_code)]
pub fn payload(len: usize) -> bytes::Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}
