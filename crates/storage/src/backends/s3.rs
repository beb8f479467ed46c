//! S3-compatible multipart client using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{CompletedPartInfo, MultipartClient};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use std::time::Duration;
use tracing::instrument;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_KEY: &str = ".ferry-health-check";

/// Convert an AWS SDK error to a StorageError, mapping 404 to NotFound.
fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err {
        let status = service_err.raw().status().as_u16();
        if status == 404 {
            return StorageError::NotFound(key.to_string());
        }
        // 4xx other than throttling is a request problem, not an outage.
        if (400..500).contains(&status) && status != 429 {
            return StorageError::Config(format!("S3 rejected request for {key}: {err}"));
        }
    }
    StorageError::Unavailable(format!("S3 request for {key} failed: {err}"))
}

/// Multipart client for S3 and S3-compatible services (MinIO, R2, ...).
pub struct S3MultipartClient {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3MultipartClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3MultipartClient")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3MultipartClient {
    /// Create a new S3 client.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style. Required for MinIO and some S3-compatible services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());

        let mut s3_config_builder = if let (Some(key_id), Some(secret)) =
            (access_key_id, secret_access_key)
        {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "ferry-config");
            aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(aws_config::Region::new(resolved_region.clone()))
                .credentials_provider(credentials)
        } else {
            // Ambient credential chain: env, profile, IMDS, ...
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(resolved_region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        };

        if let Some(endpoint_url) = endpoint {
            // Bare host:port endpoints (e.g. "minio:9000") default to http.
            let lower = endpoint_url.to_ascii_lowercase();
            let endpoint_url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            // "prefix/" would otherwise produce "prefix//key".
            prefix: prefix
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl MultipartClient for S3MultipartClient {
    #[instrument(skip(self), fields(client = "s3"))]
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Unavailable("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self, data), fields(client = "s3", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    #[instrument(skip(self, parts), fields(client = "s3", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<Option<String>> {
        let full_key = self.full_key(key);
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .e_tag(&p.etag)
                            .part_number(p.part_number)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(output.e_tag().map(str::to_string))
    }

    #[instrument(skip(self), fields(client = "s3"))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let full_key = self.full_key(key);
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(client = "s3", size = data.len()))]
    async fn put_object(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(client = "s3"))]
    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("S3 body read for {key}: {e}")))?
            .into_bytes();
        Ok(bytes)
    }

    #[instrument(skip(self), fields(client = "s3"))]
    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(key);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match map_sdk_error(e, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn client_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(client = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker_key = HEALTH_CHECK_KEY;

        let health_check_future = async {
            self.put_object(marker_key, Bytes::from_static(b"health-check"))
                .await?;
            self.delete_object(marker_key).await
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| {
                StorageError::Unavailable(format!(
                    "S3 health check timed out after {} seconds",
                    HEALTH_CHECK_TIMEOUT.as_secs()
                ))
            })?
    }
}
