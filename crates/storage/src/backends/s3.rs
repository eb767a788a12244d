//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{CompletedPart, NativeMultipart, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use bytes::Bytes;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use tracing::instrument;

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

/// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
        && service_err.raw().status().as_u16() == 404
    {
        return StorageError::NotFound(key.to_string());
    }
    map_s3_operation_error(err)
}

/// Handle bare `host:port` endpoints (e.g. `minio:9000`) by prepending `http://`.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// MD5 from a single-part entity tag. Multipart tags (`"<hex>-<n>"`) carry none.
fn md5_from_etag(etag: Option<&str>) -> Option<String> {
    let tag = etag?.trim_matches('"');
    (tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| tag.to_ascii_lowercase())
}

fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}

/// CopySource format: `bucket/key`, with the key percent-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, NON_ALPHANUMERIC))
}

/// S3-compatible object store using AWS SDK.
///
/// Buckets are chosen per call, so one backend serves every bucket the
/// credentials can reach.
pub struct S3Backend {
    client: Client,
    /// Normalized endpoint, or the canonical AWS endpoint for the region.
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs instead of
    /// `bucket.endpoint/key`; MinIO and some S3-compatible services need it.
    /// Without explicit credentials the ambient AWS credential chain is used.
    pub async fn new(
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let normalized_endpoint = endpoint.as_deref().map(normalize_endpoint);

        let mut s3_config_builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(aws_config::Region::new(resolved_region.clone()))
                .credentials_provider(aws_sdk_s3::config::Credentials::new(
                    key_id,
                    secret,
                    None,
                    None,
                    "splice-config",
                )),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(aws_config::Region::new(resolved_region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());
        let endpoint = normalized_endpoint
            .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com"));

        Ok(Self {
            client,
            endpoint,
            region: resolved_region,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn presigning(ttl: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Config(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or(0) as u64,
                md5_hex: md5_from_etag(output.e_tag()),
            })),
            Err(err) => match map_sdk_error(err, key) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys
        if self.exists(bucket, key).await?.is_none() {
            return Err(StorageError::NotFound(format!("{bucket}/{key}")));
        }

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn rename(&self, bucket: &str, src_key: &str, dest_key: &str) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(copy_source(bucket, src_key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, src_key))?;

        self.client
            .delete_object()
            .bucket(bucket)
            .key(src_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_s3_operation_error)?;

            results.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(request.uri().to_string())
    }

    fn native_multipart(&self) -> Option<&dyn NativeMultipart> {
        Some(self)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.client.list_buckets().send())
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[async_trait]
impl NativeMultipart for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        part_number: u32,
        source_key: &str,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(bucket)
            .key(key)
            .upload_id(token)
            .part_number(part_number as i32)
            .copy_source(copy_source(bucket, source_key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, source_key))?;

        output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(|tag| tag.trim_matches('"').to_string())
            .ok_or_else(|| StorageError::Config("S3 did not return a part ETag".to_string()))
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<u64> {
        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);
        let completed = ordered
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(quote_etag(&p.etag))
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(token)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(self.head(bucket, key).await?.size)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, bucket: &str, key: &str, token: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(token)
            .send()
            .await
            .map_err(|e| match map_sdk_error(e, key) {
                StorageError::NotFound(_) => StorageError::UploadNotFound(token.to_string()),
                other => other,
            })?;
        Ok(())
    }
}
