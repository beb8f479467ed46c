use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_storage::error::{StorageError, StorageResult};
use ferry_storage::traits::{CompletedPartInfo, MultipartClient};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;

#[derive(Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Default)]
struct State {
    next_upload: u64,
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, Bytes>,
    aborted: Vec<String>,
    /// Part sizes of every completed upload, by upload id.
    completed: HashMap<String, Vec<u64>>,
    fail_part: Option<i32>,
}

/// In-memory multipart API that records what the backend sent.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryMultipartClient {
    state: Mutex<State>,
    part_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryMultipartClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every part upload take `delay`, so concurrent uploads overlap.
    pub fn with_part_delay(delay: Duration) -> Self {
        Self {
            part_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next upload of `part_number` with a transient error.
    pub fn fail_part_once(&self, part_number: i32) {
        self.state.lock().unwrap().fail_part = Some(part_number);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Keys of parked incomplete-part objects, sorted.
    pub fn incomplete_objects(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|k| k.ends_with(".incomplete"))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    /// Sizes of the parts an upload was completed from, in part-number order.
    pub fn completed_part_sizes(&self, upload_id: &str) -> Option<Vec<u64>> {
        self.state.lock().unwrap().completed.get(upload_id).cloned()
    }

    /// Sizes of the parts received so far for an open upload.
    pub fn pending_part_sizes(&self, upload_id: &str) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.values().map(|p| p.len() as u64).collect())
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn etag(upload_id: &str, part_number: i32) -> String {
        format!("\"{upload_id}-{part_number}\"")
    }
}

#[async_trait]
impl MultipartClient for MemoryMultipartClient {
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if state.fail_part == Some(part_number) {
            state.fail_part = None;
            return Err(StorageError::Unavailable(format!(
                "injected failure for part {part_number}"
            )));
        }
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;
        assert_eq!(upload.key, key, "part sent to the wrong key");
        upload.parts.insert(part_number, data);
        Ok(Self::etag(upload_id, part_number))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

        assert!(
            parts.windows(2).all(|w| w[0].part_number < w[1].part_number),
            "parts must be listed in ascending order"
        );

        let mut object = BytesMut::new();
        let mut sizes = Vec::with_capacity(parts.len());
        for part in parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::Config(format!("part {} was never uploaded", part.part_number))
            })?;
            assert_eq!(part.etag, Self::etag(upload_id, part.part_number));
            assert_eq!(part.size, data.len() as u64);
            object.extend_from_slice(data);
            sizes.push(part.size);
        }

        state.objects.insert(key.to_string(), object.freeze());
        state.completed.insert(upload_id.to_string(), sizes);
        Ok(Some(format!("\"{upload_id}-complete\"")))
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn put_object(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        self.object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.state.lock().unwrap().objects.remove(key);
        Ok(())
    }

    fn client_name(&self) -> &'static str {
        "memory"
    }
}
