//! Pass-through to a provider's own multipart upload.

use crate::error::{UploadError, UploadResult};
use crate::strategy::{
    ComposeStrategy, UploadTarget, delete_best_effort, sweep_objects, verify_part,
};
use async_trait::async_trait;
use splice_core::StrategyKind;
use splice_metadata::MetadataStore;
use splice_storage::{CompletedPart, NativeMultipart, ObjectStore, StorageError};
use std::sync::Arc;
use tracing::instrument;

/// Copies each validated part into the provider upload; the provider
/// assembles them at completion.
pub struct NativeStrategy {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
}

impl NativeStrategy {
    pub fn new(store: Arc<dyn MetadataStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    pub fn is_supported(&self) -> bool {
        self.objects.native_multipart().is_some()
    }

    fn multipart(&self) -> UploadResult<&dyn NativeMultipart> {
        self.objects.native_multipart().ok_or_else(|| {
            UploadError::Storage(StorageError::Unsupported {
                backend: self.objects.backend_name(),
                operation: "native multipart",
            })
        })
    }
}

#[async_trait]
impl ComposeStrategy for NativeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Native
    }

    #[instrument(skip(self), fields(strategy = "native"))]
    async fn allocate(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> UploadResult<String> {
        Ok(self
            .multipart()?
            .initiate_multipart(bucket, key, content_type)
            .await?)
    }

    async fn discard_allocation(&self, bucket: &str, key: &str, token: &str) -> UploadResult<()> {
        Ok(self.multipart()?.abort_multipart(bucket, key, token).await?)
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "native"))]
    async fn add_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        part_md5: &str,
    ) -> UploadResult<()> {
        let part_key = self.part_key(target, part_number);
        verify_part(self.objects.as_ref(), &target.bucket, &part_key, part_md5).await?;

        self.multipart()?
            .upload_part_copy(
                &target.bucket,
                &target.key,
                &target.token,
                part_number,
                &part_key,
            )
            .await?;
        delete_best_effort(self.objects.as_ref(), target.upload_id, &target.bucket, &part_key)
            .await;
        Ok(())
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "native"))]
    async fn complete(&self, target: &UploadTarget) -> UploadResult<u64> {
        let parts: Vec<CompletedPart> = self
            .store
            .list_parts(target.upload_id)
            .await?
            .into_iter()
            .map(|p| {
                u32::try_from(p.part_number)
                    .map(|part_number| CompletedPart {
                        part_number,
                        etag: p.part_md5,
                    })
                    .map_err(|_| {
                        UploadError::Validation(format!(
                            "part number {} out of range",
                            p.part_number
                        ))
                    })
            })
            .collect::<UploadResult<_>>()?;

        let size = self
            .multipart()?
            .complete_multipart(&target.bucket, &target.key, &target.token, &parts)
            .await?;
        tracing::info!(
            upload_id = %target.upload_id,
            size,
            parts = parts.len(),
            "Assembled native upload"
        );
        Ok(size)
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "native"))]
    async fn abort(&self, target: &UploadTarget) -> UploadResult<()> {
        match self
            .multipart()?
            .abort_multipart(&target.bucket, &target.key, &target.token)
            .await
        {
            Ok(()) | Err(StorageError::UploadNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        sweep_objects(self.objects.as_ref(), target).await;
        Ok(())
    }
}
