//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use splice_core::{
    FinalObjectDescriptor, PartRange, StrategyKind, UploadId, UploadState, UploadStatus,
};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub owner_id: String,
    pub request_hash: String,
    /// The originating request as JSON.
    pub request_body: String,
    pub state: String,
    pub strategy: String,
    pub bucket: String,
    pub object_key: String,
    /// Provider handle for native uploads; empty for merge-tree uploads.
    pub upload_token: String,
    pub total_parts: i64,
    pub part_size: i64,
    pub result_object_id: Option<String>,
    pub result_size: Option<i64>,
    pub etag: String,
    pub source_object_id: Option<String>,
    pub source_etag: Option<String>,
    pub created_on: OffsetDateTime,
    pub updated_on: OffsetDateTime,
}

impl UploadSessionRow {
    pub fn upload_id(&self) -> UploadId {
        UploadId::from_uuid(self.upload_id)
    }

    pub fn state(&self) -> MetadataResult<UploadState> {
        Ok(self.state.parse()?)
    }

    pub fn strategy(&self) -> MetadataResult<StrategyKind> {
        Ok(self.strategy.parse()?)
    }

    pub fn total_parts(&self) -> MetadataResult<u32> {
        u32::try_from(self.total_parts).map_err(|_| {
            MetadataError::Corrupt(format!(
                "upload {} has total_parts {}",
                self.upload_id, self.total_parts
            ))
        })
    }

    /// The stored result, once the session has completed.
    pub fn final_object(&self) -> Option<FinalObjectDescriptor> {
        let size = self.result_size?;
        Some(FinalObjectDescriptor {
            bucket: self.bucket.clone(),
            key: self.object_key.clone(),
            size: u64::try_from(size).unwrap_or_default(),
        })
    }

    /// Build the client-facing status with the given parts bitmap.
    pub fn to_status(&self, parts_state: String) -> MetadataResult<UploadStatus> {
        Ok(UploadStatus {
            upload_id: self.upload_id(),
            owner_id: self.owner_id.clone(),
            state: self.state()?,
            strategy: self.strategy()?,
            bucket: self.bucket.clone(),
            key: self.object_key.clone(),
            total_parts: self.total_parts()?,
            part_size_bytes: u64::try_from(self.part_size).unwrap_or_default(),
            parts_state,
            result_object_id: self.result_object_id.clone(),
            result_size: self.result_size.and_then(|s| u64::try_from(s).ok()),
            etag: self.etag.clone(),
            created_on: self.created_on,
            updated_on: self.updated_on,
        })
    }
}

/// Fields supplied when creating a session.
#[derive(Debug, Clone)]
pub struct NewUploadSession {
    pub owner_id: String,
    pub request_hash: String,
    pub request_body: String,
    pub strategy: StrategyKind,
    pub bucket: String,
    pub object_key: String,
    pub upload_token: String,
    pub total_parts: u32,
    pub part_size: u64,
    pub source_object_id: Option<String>,
    pub source_etag: Option<String>,
}

/// A successfully added part.
#[derive(Debug, Clone, FromRow)]
pub struct PartRecordRow {
    pub upload_id: Uuid,
    pub part_number: i64,
    pub part_md5: String,
    pub added_on: OffsetDateTime,
}

/// The last failure recorded for a part.
#[derive(Debug, Clone, FromRow)]
pub struct PartErrorRow {
    pub upload_id: Uuid,
    pub part_number: i64,
    pub error_message: String,
    pub failed_on: OffsetDateTime,
}

// =============================================================================
// Part ranges
// =============================================================================

/// Range record; one physical object backs each row.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct PartRangeRow {
    pub lower_bound: i64,
    pub upper_bound: i64,
}

impl TryFrom<PartRangeRow> for PartRange {
    type Error = MetadataError;

    fn try_from(row: PartRangeRow) -> MetadataResult<Self> {
        let lower = bound(row.lower_bound)?;
        let upper = bound(row.upper_bound)?;
        Ok(PartRange::new(lower, upper)?)
    }
}

/// Adjacent range pair as returned by the self-join lookup.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct ContiguousPairRow {
    pub left_lower: i64,
    pub left_upper: i64,
    pub right_lower: i64,
    pub right_upper: i64,
}

fn bound(value: i64) -> MetadataResult<u32> {
    u32::try_from(value).map_err(|_| MetadataError::Corrupt(format!("range bound {value}")))
}

impl TryFrom<ContiguousPairRow> for splice_core::ContiguousPair {
    type Error = MetadataError;

    fn try_from(row: ContiguousPairRow) -> MetadataResult<Self> {
        let left = PartRange::new(bound(row.left_lower)?, bound(row.left_upper)?)?;
        let right = PartRange::new(bound(row.right_lower)?, bound(row.right_upper)?)?;
        Ok(splice_core::ContiguousPair::new(left, right)?)
    }
}
