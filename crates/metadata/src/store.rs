//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::lock::RangeLockTable;
use crate::repos::{PartRangeStore, RangeTransaction, UploadSessionStore};
use async_trait::async_trait;
use splice_core::{Clock, IdGenerator, RandomIdGenerator, SystemClock};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadSessionStore + PartRangeStore + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    locks: RangeLockTable,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; SQLite cannot do better.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIdGenerator),
            locks: RangeLockTable::new(),
        };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");
        Ok(store)
    }

    /// Replace the wall-clock source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the session id source.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Range transaction backed by a pooled SQLite transaction.
pub struct SqliteRangeTx {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteRangeTx {
    fn active(&mut self) -> MetadataResult<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or(MetadataError::NoTransaction)
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use splice_core::{ContiguousPair, PartRange, RangeOrder, UploadState};
    use time::Duration as TimeDuration;
    use uuid::Uuid;

    fn new_etag() -> String {
        Uuid::new_v4().to_string()
    }

    #[async_trait]
    impl UploadSessionStore for SqliteStore {
        async fn create_session(
            &self,
            session: &NewUploadSession,
        ) -> MetadataResult<UploadSessionRow> {
            if session.owner_id.trim().is_empty() {
                return Err(MetadataError::Validation("owner id is required".to_string()));
            }
            if session.request_hash.is_empty() {
                return Err(MetadataError::Validation("request hash is required".to_string()));
            }
            if session.request_body.is_empty() {
                return Err(MetadataError::Validation("request body is required".to_string()));
            }
            if session.part_size == 0 {
                return Err(MetadataError::Validation("part size is required".to_string()));
            }
            let part_size = i64::try_from(session.part_size)
                .map_err(|_| MetadataError::Validation("part size out of range".to_string()))?;

            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE owner_id = ? AND request_hash = ? AND state = 'UPLOADING'",
            )
            .bind(&session.owner_id)
            .bind(&session.request_hash)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(row);
            }

            let upload_id = self.ids.next_id();
            let now = self.clock.now();
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    upload_id, owner_id, request_hash, request_body, state, strategy,
                    bucket, object_key, upload_token, total_parts, part_size,
                    result_object_id, result_size, etag, source_object_id, source_etag,
                    created_on, updated_on
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(upload_id)
            .bind(&session.owner_id)
            .bind(&session.request_hash)
            .bind(&session.request_body)
            .bind(UploadState::Uploading.as_str())
            .bind(session.strategy.as_str())
            .bind(&session.bucket)
            .bind(&session.object_key)
            .bind(&session.upload_token)
            .bind(i64::from(session.total_parts))
            .bind(part_size)
            .bind(new_etag())
            .bind(&session.source_object_id)
            .bind(&session.source_etag)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| MetadataError::on_write(e, format!("upload {upload_id}")))?;

            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_session_by_owner_and_hash(
            &self,
            owner_id: &str,
            request_hash: &str,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE owner_id = ? AND request_hash = ? AND state = 'UPLOADING'",
            )
            .bind(owner_id)
            .bind(request_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_part_success(
            &self,
            upload_id: Uuid,
            part_number: u32,
            part_md5: &str,
        ) -> MetadataResult<()> {
            let now = self.clock.now();
            let mut tx = self.pool.begin().await?;

            let touched = sqlx::query(
                "UPDATE upload_sessions SET etag = ?, updated_on = ? WHERE upload_id = ?",
            )
            .bind(new_etag())
            .bind(now)
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
            if touched.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload {upload_id}")));
            }

            sqlx::query(
                r#"
                INSERT INTO upload_parts (upload_id, part_number, part_md5, added_on)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (upload_id, part_number)
                DO UPDATE SET part_md5 = excluded.part_md5, added_on = excluded.added_on
                "#,
            )
            .bind(upload_id)
            .bind(i64::from(part_number))
            .bind(part_md5)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| MetadataError::on_write(e, format!("upload {upload_id}")))?;

            sqlx::query("DELETE FROM upload_part_errors WHERE upload_id = ? AND part_number = ?")
                .bind(upload_id)
                .bind(i64::from(part_number))
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn record_part_failure(
            &self,
            upload_id: Uuid,
            part_number: u32,
            message: &str,
        ) -> MetadataResult<()> {
            let now = self.clock.now();
            let mut tx = self.pool.begin().await?;

            let touched = sqlx::query(
                "UPDATE upload_sessions SET etag = ?, updated_on = ? WHERE upload_id = ?",
            )
            .bind(new_etag())
            .bind(now)
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
            if touched.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload {upload_id}")));
            }

            sqlx::query(
                r#"
                INSERT INTO upload_part_errors (upload_id, part_number, error_message, failed_on)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (upload_id, part_number)
                DO UPDATE SET error_message = excluded.error_message, failed_on = excluded.failed_on
                "#,
            )
            .bind(upload_id)
            .bind(i64::from(part_number))
            .bind(message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| MetadataError::on_write(e, format!("upload {upload_id}")))?;

            tx.commit().await?;
            Ok(())
        }

        async fn parts_bitmap(&self, upload_id: Uuid, total_parts: u32) -> MetadataResult<String> {
            let numbers: Vec<i64> = sqlx::query_scalar(
                "SELECT part_number FROM upload_parts WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            let present = numbers.into_iter().filter_map(|n| u32::try_from(n).ok());
            Ok(splice_core::upload::parts_bitmap(total_parts, present))
        }

        async fn list_parts(&self, upload_id: Uuid) -> MetadataResult<Vec<PartRecordRow>> {
            let rows = sqlx::query_as::<_, PartRecordRow>(
                "SELECT * FROM upload_parts WHERE upload_id = ? ORDER BY part_number ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_part_errors(&self, upload_id: Uuid) -> MetadataResult<Vec<PartErrorRow>> {
            let rows = sqlx::query_as::<_, PartErrorRow>(
                "SELECT * FROM upload_part_errors WHERE upload_id = ? ORDER BY part_number ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn complete_session(
            &self,
            upload_id: Uuid,
            result_object_id: &str,
            result_size: u64,
        ) -> MetadataResult<UploadSessionRow> {
            let size = i64::try_from(result_size)
                .map_err(|_| MetadataError::Validation(format!("result size {result_size}")))?;
            let mut tx = self.pool.begin().await?;

            let current = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))?;

            if current.state != UploadState::Uploading.as_str() {
                return Err(MetadataError::InvalidStateTransition {
                    from: current.state,
                    to: UploadState::Completed.as_str().to_string(),
                });
            }

            sqlx::query(
                r#"
                UPDATE upload_sessions
                SET state = ?, result_object_id = ?, result_size = ?, etag = ?, updated_on = ?
                WHERE upload_id = ?
                "#,
            )
            .bind(UploadState::Completed.as_str())
            .bind(result_object_id)
            .bind(size)
            .bind(new_etag())
            .bind(self.clock.now())
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM upload_part_errors WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;

            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<bool> {
            // Parts, errors and ranges cascade.
            let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_stale(&self, older_than_days: u32, limit: u32) -> MetadataResult<Vec<Uuid>> {
            let cutoff = self.clock.now() - TimeDuration::days(i64::from(older_than_days));
            let ids = sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT upload_id FROM upload_sessions
                WHERE state = 'UPLOADING' AND updated_on < ?
                ORDER BY updated_on ASC
                LIMIT ?
                "#,
            )
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }
    }

    #[async_trait]
    impl PartRangeStore for SqliteStore {
        async fn add_range(&self, upload_id: Uuid, range: PartRange) -> MetadataResult<()> {
            sqlx::query(
                "INSERT OR IGNORE INTO upload_part_ranges (upload_id, lower_bound, upper_bound) VALUES (?, ?, ?)",
            )
            .bind(upload_id)
            .bind(i64::from(range.lower()))
            .bind(i64::from(range.upper()))
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::on_write(e, format!("upload {upload_id}")))?;
            Ok(())
        }

        async fn remove_range(&self, upload_id: Uuid, range: PartRange) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM upload_part_ranges WHERE upload_id = ? AND lower_bound = ? AND upper_bound = ?",
            )
            .bind(upload_id)
            .bind(i64::from(range.lower()))
            .bind(i64::from(range.upper()))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn find_contiguous_pairs(
            &self,
            upload_id: Uuid,
            order: RangeOrder,
            limit: u32,
        ) -> MetadataResult<Vec<ContiguousPair>> {
            let order_by = match order {
                RangeOrder::Random => "RANDOM()",
                RangeOrder::Ascending => "a.lower_bound ASC",
            };
            let sql = format!(
                r#"
                SELECT a.lower_bound AS left_lower, a.upper_bound AS left_upper,
                       b.lower_bound AS right_lower, b.upper_bound AS right_upper
                FROM upload_part_ranges a
                JOIN upload_part_ranges b
                  ON b.upload_id = a.upload_id AND b.lower_bound = a.upper_bound + 1
                WHERE a.upload_id = ?
                ORDER BY {order_by}
                LIMIT ?
                "#
            );
            let rows = sqlx::query_as::<_, ContiguousPairRow>(&sql)
                .bind(upload_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(ContiguousPair::try_from).collect()
        }

        async fn list_ranges(&self, upload_id: Uuid) -> MetadataResult<Vec<PartRange>> {
            let rows = sqlx::query_as::<_, PartRangeRow>(
                "SELECT lower_bound, upper_bound FROM upload_part_ranges WHERE upload_id = ? ORDER BY lower_bound ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(PartRange::try_from).collect()
        }

        async fn begin_ranges(&self) -> MetadataResult<Box<dyn RangeTransaction>> {
            let tx = self.pool.begin().await?;
            Ok(Box::new(SqliteRangeTx { tx: Some(tx) }))
        }

        fn range_locks(&self) -> &RangeLockTable {
            &self.locks
        }
    }

    #[async_trait]
    impl RangeTransaction for SqliteRangeTx {
        async fn ranges_in_bounds(
            &mut self,
            upload_id: Uuid,
            lower: u32,
            upper: u32,
        ) -> MetadataResult<Vec<PartRange>> {
            let tx = self.active()?;
            let rows = sqlx::query_as::<_, PartRangeRow>(
                r#"
                SELECT lower_bound, upper_bound FROM upload_part_ranges
                WHERE upload_id = ? AND lower_bound >= ? AND upper_bound <= ?
                ORDER BY lower_bound ASC
                "#,
            )
            .bind(upload_id)
            .bind(i64::from(lower))
            .bind(i64::from(upper))
            .fetch_all(&mut **tx)
            .await?;
            rows.into_iter().map(PartRange::try_from).collect()
        }

        async fn add_range(&mut self, upload_id: Uuid, range: PartRange) -> MetadataResult<()> {
            let tx = self.active()?;
            sqlx::query(
                "INSERT OR IGNORE INTO upload_part_ranges (upload_id, lower_bound, upper_bound) VALUES (?, ?, ?)",
            )
            .bind(upload_id)
            .bind(i64::from(range.lower()))
            .bind(i64::from(range.upper()))
            .execute(&mut **tx)
            .await
            .map_err(|e| MetadataError::on_write(e, format!("upload {upload_id}")))?;
            Ok(())
        }

        async fn remove_range(&mut self, upload_id: Uuid, range: PartRange) -> MetadataResult<bool> {
            let tx = self.active()?;
            let result = sqlx::query(
                "DELETE FROM upload_part_ranges WHERE upload_id = ? AND lower_bound = ? AND upper_bound = ?",
            )
            .bind(upload_id)
            .bind(i64::from(range.lower()))
            .bind(i64::from(range.upper()))
            .execute(&mut **tx)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn commit(&mut self) -> MetadataResult<()> {
            let tx = self.tx.take().ok_or(MetadataError::NoTransaction)?;
            tx.commit().await?;
            Ok(())
        }

        async fn rollback(&mut self) -> MetadataResult<()> {
            let tx = self.tx.take().ok_or(MetadataError::NoTransaction)?;
            tx.rollback().await?;
            Ok(())
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_body TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('UPLOADING', 'COMPLETED')),
    strategy TEXT NOT NULL,
    bucket TEXT NOT NULL,
    object_key TEXT NOT NULL,
    upload_token TEXT NOT NULL,
    total_parts INTEGER NOT NULL CHECK (total_parts >= 1),
    part_size INTEGER NOT NULL CHECK (part_size >= 1),
    result_object_id TEXT,
    result_size INTEGER,
    etag TEXT NOT NULL,
    source_object_id TEXT,
    source_etag TEXT,
    created_on TEXT NOT NULL,
    updated_on TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_sessions_owner_hash_uploading
    ON upload_sessions(owner_id, request_hash) WHERE state = 'UPLOADING';
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state_updated
    ON upload_sessions(state, updated_on);

CREATE TABLE IF NOT EXISTS upload_parts (
    upload_id BLOB NOT NULL,
    part_number INTEGER NOT NULL CHECK (part_number >= 1),
    part_md5 TEXT NOT NULL,
    added_on TEXT NOT NULL,
    PRIMARY KEY (upload_id, part_number),
    FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS upload_part_errors (
    upload_id BLOB NOT NULL,
    part_number INTEGER NOT NULL,
    error_message TEXT NOT NULL,
    failed_on TEXT NOT NULL,
    PRIMARY KEY (upload_id, part_number),
    FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS upload_part_ranges (
    upload_id BLOB NOT NULL,
    lower_bound INTEGER NOT NULL CHECK (lower_bound >= 1),
    upper_bound INTEGER NOT NULL CHECK (upper_bound >= lower_bound),
    PRIMARY KEY (upload_id, lower_bound, upper_bound),
    FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
);
"#;
