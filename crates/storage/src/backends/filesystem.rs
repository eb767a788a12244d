//! Local filesystem storage backend.
//!
//! Each bucket is a directory under the root. Compose concatenates sources
//! into a temp file and renames it into place; native multipart parts are
//! staged under `.multipart/{token}/` until completion.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CompletedPart, NativeMultipart, ObjectMeta, ObjectStore, check_bucket,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Read buffer for hashing and concatenation (64 KiB).
const READ_CHUNK_SIZE: usize = 64 * 1024;

const STAGING_DIR: &str = ".multipart";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    /// Path of `key` inside `bucket`, rejecting keys that could leave the root.
    async fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        check_bucket(bucket)?;
        check_key(key)?;
        let root = self.root.clone();
        let path = root.join(bucket).join(key);
        tokio::task::spawn_blocking(move || ensure_within_root(&root, path))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    fn staging_path(&self, token: &str) -> StorageResult<PathBuf> {
        if Uuid::parse_str(token).is_err() {
            return Err(StorageError::UploadNotFound(token.to_string()));
        }
        Ok(self.root.join(STAGING_DIR).join(token))
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write `sources` back to back into `dest`, atomically.
    async fn concatenate(&self, dest: &Path, sources: &[PathBuf]) -> StorageResult<u64> {
        self.ensure_parent(dest).await?;
        let temp_path = temp_sibling(dest);
        let written = async {
            let mut out = fs::File::create(&temp_path).await?;
            let mut total = 0u64;
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            for source in sources {
                let mut file = fs::File::open(source).await?;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
            }
            out.sync_all().await?;
            Ok::<u64, std::io::Error>(total)
        }
        .await;

        match written {
            Ok(total) => {
                fs::rename(&temp_path, dest).await?;
                Ok(total)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::Io(e))
            }
        }
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let safe = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }
    Ok(())
}

/// Reject paths whose nearest existing ancestor resolves outside `root`,
/// which catches symlinked directories inside the store.
fn ensure_within_root(root: &Path, path: PathBuf) -> StorageResult<PathBuf> {
    let mut cursor = path.as_path();
    loop {
        match std::fs::symlink_metadata(cursor) {
            Ok(_) => {
                let resolved = cursor.canonicalize()?;
                if !resolved.starts_with(root) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {}",
                        path.display()
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match cursor.parent() {
                Some(parent) => cursor = parent,
                None => return Ok(path),
            },
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", Uuid::new_v4()))
}

fn not_found(bucket: &str, key: &str) -> impl FnOnce(std::io::Error) -> StorageError + use<> {
    let what = format!("{bucket}/{key}");
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(what)
        } else {
            StorageError::Io(e)
        }
    }
}

fn expiry(ttl: Duration) -> u64 {
    (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.finalize()))
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let path = self.object_path(bucket, key).await?;
        let metadata = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let md5_hex = file_md5(&path).await.map_err(not_found(bucket, key))?;
        Ok(Some(ObjectMeta {
            size: metadata.len(),
            md5_hex: Some(md5_hex),
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(bucket, key).await?;
        let data = fs::read(&path).await.map_err(not_found(bucket, key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.object_path(bucket, key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = temp_sibling(&path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem", sources = sources.len()))]
    async fn compose(
        &self,
        bucket: &str,
        dest_key: &str,
        sources: &[String],
    ) -> StorageResult<ObjectMeta> {
        let mut paths = Vec::with_capacity(sources.len());
        for source in sources {
            let path = self.object_path(bucket, source).await?;
            if !fs::try_exists(&path).await? {
                return Err(StorageError::NotFound(format!("{bucket}/{source}")));
            }
            paths.push(path);
        }
        let dest = self.object_path(bucket, dest_key).await?;
        let size = self.concatenate(&dest, &paths).await?;
        let md5_hex = file_md5(&dest).await?;
        Ok(ObjectMeta {
            size,
            md5_hex: Some(md5_hex),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key).await?;
        fs::remove_file(&path).await.map_err(not_found(bucket, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn rename(&self, bucket: &str, src_key: &str, dest_key: &str) -> StorageResult<()> {
        let src = self.object_path(bucket, src_key).await?;
        let dest = self.object_path(bucket, dest_key).await?;
        self.ensure_parent(&dest).await?;
        fs::rename(&src, &dest)
            .await
            .map_err(not_found(bucket, src_key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        check_bucket(bucket)?;
        let bucket_root = self.root.join(bucket);
        let mut results = Vec::new();
        if !fs::try_exists(&bucket_root).await? {
            return Ok(results);
        }

        let mut stack = vec![bucket_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks, so links are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&bucket_root)
                {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    let is_temp = rel
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().contains(".tmp."));
                    if key.starts_with(prefix) && !is_temp {
                        results.push(key);
                    }
                }
            }
        }
        Ok(results)
    }

    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        let path = self.object_path(bucket, key).await?;
        Ok(format!(
            "file://{}?method=PUT&expires={}",
            path.display(),
            expiry(ttl)
        ))
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        let path = self.object_path(bucket, key).await?;
        Ok(format!(
            "file://{}?method=GET&expires={}",
            path.display(),
            expiry(ttl)
        ))
    }

    fn native_multipart(&self) -> Option<&dyn NativeMultipart> {
        Some(self)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NativeMultipart for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
    ) -> StorageResult<String> {
        self.object_path(bucket, key).await?;
        let token = Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_path(&token)?).await?;
        Ok(token)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        part_number: u32,
        source_key: &str,
    ) -> StorageResult<String> {
        let staging = self.staging_path(token)?;
        if !fs::try_exists(&staging).await? {
            return Err(StorageError::UploadNotFound(token.to_string()));
        }
        let source = self.object_path(bucket, source_key).await?;
        let part_path = staging.join(part_number.to_string());
        fs::copy(&source, &part_path)
            .await
            .map_err(not_found(bucket, source_key))?;
        Ok(file_md5(&part_path).await?)
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<u64> {
        let staging = self.staging_path(token)?;
        if !fs::try_exists(&staging).await? {
            return Err(StorageError::UploadNotFound(token.to_string()));
        }

        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);
        let mut sources = Vec::with_capacity(ordered.len());
        for part in &ordered {
            let path = staging.join(part.part_number.to_string());
            let actual = file_md5(&path)
                .await
                .map_err(not_found(token, &part.part_number.to_string()))?;
            if actual != part.etag.trim_matches('"') {
                return Err(StorageError::PartMismatch {
                    part_number: part.part_number,
                });
            }
            sources.push(path);
        }

        let dest = self.object_path(bucket, key).await?;
        let size = self.concatenate(&dest, &sources).await?;
        fs::remove_dir_all(&staging).await?;
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_multipart(&self, _bucket: &str, _key: &str, token: &str) -> StorageResult<()> {
        let staging = self.staging_path(token)?;
        match fs::remove_dir_all(&staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::UploadNotFound(token.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
