//! Upload session types and lifecycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidUploadId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    /// Parts are still being accepted.
    Uploading,
    /// The final object exists.
    Completed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl FromStr for UploadState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UPLOADING" => Ok(Self::Uploading),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(Error::UnknownVariant {
                field: "upload state",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How parts of an upload become the final object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Provider-native multipart: parts handed over at completion.
    Native,
    /// Incremental pairwise composition of contiguous part ranges.
    MergeTree,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::MergeTree => "merge_tree",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(Self::Native),
            "merge_tree" => Ok(Self::MergeTree),
            other => Err(Error::UnknownVariant {
                field: "strategy",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Existing object a copy-upload draws its parts from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub object_id: String,
    pub etag: Option<String>,
}

/// A client's request to start a multipart upload.
///
/// Two requests from the same owner with identical fields share one session
/// while it is still uploading; see [`UploadRequest::request_hash`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub file_size_bytes: u64,
    pub part_size_bytes: u64,
    /// Expected MD5 of the whole file, hex encoded.
    pub content_md5_hex: String,
    /// Overrides the configured default strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceObject>,
}

/// Bounds applied when validating a request.
#[derive(Clone, Copy, Debug)]
pub struct PartLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u64,
}

impl UploadRequest {
    /// Check required fields and part geometry.
    ///
    /// The minimum part size only binds multi-part uploads; a file smaller than
    /// the minimum is uploaded as a single short part.
    pub fn validate(&self, limits: &PartLimits) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(Error::InvalidRequest("file name is required".to_string()));
        }
        if !is_md5_hex(&self.content_md5_hex) {
            return Err(Error::InvalidRequest(format!(
                "content MD5 must be 32 hex characters, got {:?}",
                self.content_md5_hex
            )));
        }
        if self.part_size_bytes == 0 || self.part_size_bytes > limits.max_part_size {
            return Err(Error::InvalidPartSize {
                size: self.part_size_bytes,
                min: limits.min_part_size,
                max: limits.max_part_size,
            });
        }
        let parts = self.part_count();
        if parts > 1 && self.part_size_bytes < limits.min_part_size {
            return Err(Error::InvalidPartSize {
                size: self.part_size_bytes,
                min: limits.min_part_size,
                max: limits.max_part_size,
            });
        }
        if parts > limits.max_parts {
            return Err(Error::TooManyParts {
                parts,
                max: limits.max_parts,
            });
        }
        Ok(())
    }

    /// Number of parts: `ceil(file_size / part_size)`, at least one.
    pub fn part_count(&self) -> u64 {
        if self.part_size_bytes == 0 {
            return 1;
        }
        self.file_size_bytes.div_ceil(self.part_size_bytes).max(1)
    }

    /// Stable hash of the request used to find a matching in-progress session.
    pub fn request_hash(&self) -> Result<String> {
        let body = self.canonical_json()?;
        Ok(format!("{:x}", md5::compute(body.as_bytes())))
    }

    /// JSON form persisted alongside the session.
    pub fn canonical_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// True when `s` is 32 hex characters.
pub fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Render which parts are present as a string of `'0'`/`'1'`, one per part.
pub fn parts_bitmap(total_parts: u32, present: impl IntoIterator<Item = u32>) -> String {
    let mut bits = vec![b'0'; total_parts as usize];
    for n in present {
        if n >= 1 && n <= total_parts {
            bits[(n - 1) as usize] = b'1';
        }
    }
    String::from_utf8(bits).unwrap_or_default()
}

/// Where the finished object lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalObjectDescriptor {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// Client-visible session status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatus {
    pub upload_id: UploadId,
    pub owner_id: String,
    pub state: UploadState,
    pub strategy: StrategyKind,
    pub bucket: String,
    pub key: String,
    pub total_parts: u32,
    pub part_size_bytes: u64,
    /// One character per part, `'1'` once the part has been added.
    pub parts_state: String,
    pub result_object_id: Option<String>,
    pub result_size: Option<u64>,
    pub etag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_on: OffsetDateTime,
}

/// A pre-signed URL for uploading one part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedPart {
    pub part_number: u32,
    pub url: String,
}
