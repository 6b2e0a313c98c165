//! Embedded SQLite backend.
//!
//! Each entity has its own table with typed columns and a primary key, plus a
//! single-row `db_info` table for the schema version. Relational work (the
//! hotlink cascade, collection) happens inside transactions so the engine's
//! own locking keeps concurrent callers consistent.

mod rows;

use self::rows::{ApiKeyRow, EndToEndRow, FileRow, SessionRow, UploadStatusRow};
use crate::backend::Backend;
use crate::error::{Error, ErrorKind, Result};
use crate::gc::{CollectionStats, UPLOAD_STATUS_RETENTION};
use crate::models::{self, ApiKey, EndToEndInfo, File, Session, UploadStatus};
use async_trait::async_trait;
use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

// Writers are serialised by SQLite anyway; a handful of readers is plenty.
const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a driver error onto the category callers act on, keeping the
/// original as the child frame.
fn query_failed(err: sqlx::Error) -> Error {
    let kind = match &err {
        sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
        sqlx::Error::PoolClosed => ErrorKind::Closed,
        _ => ErrorKind::Database,
    };
    exn::Exn::from(err).raise(kind)
}

/// SQLite storage backend.
///
/// # Examples
///
/// ```no_run
/// use parcel_database::{Backend, SqliteBackend};
///
/// # async fn example() -> parcel_database::error::Result<()> {
/// let backend = SqliteBackend::connect("./data/parcel.sqlite").await?;
/// println!("schema version {}", backend.get_db_version().await?);
/// backend.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// Missing parent directories are created. Entity tables are created by
    /// the upgrade steps, not here; only the version table is guaranteed.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            // Use non-async here; it only happens once at startup.
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Connection("sqlite"))?;
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            // This is IMPORTANT to apply the query-based PRAGMAs to EVERY
            // connection instead of only the first one handed out.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Connection("sqlite"))?;
        sqlx::query(include_str!("../../../queries/create_db_info.sql"))
            .execute(&pool)
            .await
            .or_raise(|| ErrorKind::Connection("sqlite"))?;
        tracing::debug!(path = %path.display(), "Opened SQLite database");
        Ok(Self { pool })
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Concurrent downloads of a popular file all write the same row;
            // give the single WAL writer room before SQLITE_BUSY surfaces.
            .busy_timeout(BUSY_TIMEOUT)
    }

    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await.map_err(query_failed)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_db_version(&self) -> Result<u32> {
        let version: Option<i64> = sqlx::query_scalar(include_str!("../../../queries/get_db_version.sql"))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        version
            .map(|v| u32::try_from(v).or_raise(|| ErrorKind::InvalidData("schema version")))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    async fn set_db_version(&self, version: u32) -> Result<()> {
        sqlx::query(include_str!("../../../queries/set_db_version.sql"))
            .bind(i64::from(version))
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn apply_upgrade(&self, from_version: u32) -> Result<()> {
        match from_version {
            0 => self.execute_script(include_str!("../../../queries/upgrade_v1_base_tables.sql")).await,
            1 => self.execute_script(include_str!("../../../queries/upgrade_v2_upload_status.sql")).await,
            2 => self.execute_script(include_str!("../../../queries/upgrade_v3_hotlink_index.sql")).await,
            other => exn::bail!(ErrorKind::Upgrade(other)),
        }
    }

    // =========================================================================
    // API keys
    // =========================================================================

    async fn get_all_api_keys(&self) -> Result<HashMap<String, ApiKey>> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(include_str!("../../../queries/get_all_api_keys.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;
        rows.into_iter()
            .map(|row| ApiKey::try_from(row).map(|key| (key.id.clone(), key)))
            .collect()
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        let row: Option<ApiKeyRow> = sqlx::query_as(include_str!("../../../queries/get_api_key.sql"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        row.map(ApiKey::try_from).transpose()
    }

    async fn save_api_key(&self, key: &ApiKey) -> Result<()> {
        let row = ApiKeyRow::from(key);
        sqlx::query(include_str!("../../../queries/upsert_api_key.sql"))
            .bind(row.id)
            .bind(row.friendly_name)
            .bind(row.last_used)
            .bind(row.permissions)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn update_time_api_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(include_str!("../../../queries/update_time_api_key.sql"))
            .bind(&key.id)
            .bind(key.last_used)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> Result<()> {
        sqlx::query(include_str!("../../../queries/delete_api_key.sql"))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    // =========================================================================
    // End-to-end info
    // =========================================================================

    async fn save_end_to_end_info(&self, info: &EndToEndInfo) -> Result<()> {
        let row = EndToEndRow::from(info);
        sqlx::query(include_str!("../../../queries/upsert_e2e_config.sql"))
            .bind(row.version)
            .bind(row.nonce)
            .bind(row.content)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn get_end_to_end_info(&self) -> Result<Option<EndToEndInfo>> {
        let row: Option<EndToEndRow> = sqlx::query_as(include_str!("../../../queries/get_e2e_config.sql"))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        row.map(EndToEndInfo::try_from).transpose()
    }

    async fn delete_end_to_end_info(&self) -> Result<()> {
        self.execute_script(include_str!("../../../queries/delete_e2e_config.sql")).await
    }

    // =========================================================================
    // Hotlinks
    // =========================================================================

    async fn get_hotlink(&self, hotlink_id: &str) -> Result<Option<String>> {
        sqlx::query_scalar(include_str!("../../../queries/get_hotlink.sql"))
            .bind(hotlink_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)
    }

    async fn get_all_hotlinks(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../../../queries/get_all_hotlinks.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)
    }

    async fn save_hotlink(&self, hotlink_id: &str, file_id: &str) -> Result<()> {
        sqlx::query(include_str!("../../../queries/upsert_hotlink.sql"))
            .bind(hotlink_id)
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_hotlink(&self, hotlink_id: &str) -> Result<()> {
        sqlx::query(include_str!("../../../queries/delete_hotlink.sql"))
            .bind(hotlink_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(include_str!("../../../queries/get_session.sql"))
            .bind(token)
            .bind(models::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(row.map(Session::from))
    }

    async fn save_session(&self, token: &str, session: &Session) -> Result<()> {
        sqlx::query(include_str!("../../../queries/upsert_session.sql"))
            .bind(token)
            .bind(session.renew_at)
            .bind(session.valid_until)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query(include_str!("../../../queries/delete_session.sql"))
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_all_sessions(&self) -> Result<()> {
        self.execute_script(include_str!("../../../queries/delete_all_sessions.sql")).await
    }

    // =========================================================================
    // File metadata
    // =========================================================================

    async fn get_all_metadata(&self) -> Result<HashMap<String, File>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../../../queries/get_all_metadata.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;
        rows.into_iter()
            .map(|row| File::try_from(row).map(|file| (file.id.clone(), file)))
            .collect()
    }

    async fn get_all_metadata_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../../../queries/get_all_metadata_ids.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)
    }

    async fn get_metadata_by_id(&self, id: &str) -> Result<Option<File>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../../../queries/get_metadata.sql"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        row.map(File::try_from).transpose()
    }

    async fn save_metadata(&self, file: &File) -> Result<()> {
        let row = FileRow::try_from(file)?;
        sqlx::query(include_str!("../../../queries/upsert_metadata.sql"))
            .bind(row.id)
            .bind(row.name)
            .bind(row.size)
            .bind(row.sha1)
            .bind(row.password_hash)
            .bind(row.hotlink_id)
            .bind(row.content_type)
            .bind(row.bucket)
            .bind(row.expire_at_string)
            .bind(row.expire_at)
            .bind(row.size_bytes)
            .bind(row.downloads_remaining)
            .bind(row.download_count)
            .bind(row.is_encrypted)
            .bind(row.is_end_to_end_encrypted)
            .bind(row.decryption_key)
            .bind(row.nonce)
            .bind(row.unlimited_downloads)
            .bind(row.unlimited_time)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_metadata(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(query_failed)?;
        sqlx::query(include_str!("../../../queries/delete_hotlinks_for_file.sql"))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?;
        sqlx::query(include_str!("../../../queries/delete_metadata.sql"))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?;
        tx.commit().await.map_err(query_failed)?;
        Ok(())
    }

    async fn increase_download_count(&self, id: &str, has_download_limit: bool) -> Result<()> {
        sqlx::query(include_str!("../../../queries/increase_download_count.sql"))
            .bind(id)
            .bind(i64::from(has_download_limit))
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    // =========================================================================
    // Upload status
    // =========================================================================

    async fn get_all_upload_status(&self) -> Result<Vec<UploadStatus>> {
        let rows: Vec<UploadStatusRow> = sqlx::query_as(include_str!("../../../queries/get_all_upload_status.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;
        rows.into_iter().map(UploadStatus::try_from).collect()
    }

    async fn save_upload_status(&self, status: &UploadStatus) -> Result<()> {
        let row = UploadStatusRow::from(status);
        sqlx::query(include_str!("../../../queries/upsert_upload_status.sql"))
            .bind(row.chunk_id)
            .bind(row.current_status)
            .bind(row.last_update)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn delete_upload_status(&self, chunk_id: &str) -> Result<()> {
        sqlx::query(include_str!("../../../queries/delete_upload_status.sql"))
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    #[instrument("collecting expired sqlite records", skip(self))]
    async fn run_garbage_collection(&self) -> Result<CollectionStats> {
        let now = models::now();
        let stale_before = now - UPLOAD_STATUS_RETENTION.as_secs() as i64;
        // Every condition is evaluated by the DELETE itself, so a record
        // renewed a moment ago no longer matches and survives.
        let mut tx = self.pool.begin().await.map_err(query_failed)?;
        let sessions = sqlx::query(include_str!("../../../queries/gc_sessions.sql"))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?
            .rows_affected();
        let cascaded = sqlx::query(include_str!("../../../queries/gc_file_hotlinks.sql"))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?
            .rows_affected();
        let files = sqlx::query(include_str!("../../../queries/gc_files.sql"))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?
            .rows_affected();
        let orphans = sqlx::query(include_str!("../../../queries/gc_orphan_hotlinks.sql"))
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?
            .rows_affected();
        let upload_status = sqlx::query(include_str!("../../../queries/gc_upload_status.sql"))
            .bind(stale_before)
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?
            .rows_affected();
        tx.commit().await.map_err(query_failed)?;
        Ok(CollectionStats {
            sessions,
            files,
            hotlinks: cascaded + orphans,
            upload_status,
        })
    }

    async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::connect(dir.path().join("nested/parcel.sqlite")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directories() {
        let (dir, backend) = open().await;
        assert!(dir.path().join("nested/parcel.sqlite").is_file());
        assert_eq!(backend.get_db_version().await.unwrap(), 0);
        backend.close().await;
    }

    #[tokio::test]
    async fn test_upgrade_steps_are_idempotent() {
        let (_dir, backend) = open().await;
        for step in 0..crate::CURRENT_SCHEMA_VERSION {
            backend.apply_upgrade(step).await.unwrap();
            backend.apply_upgrade(step).await.unwrap();
        }
        assert!(backend.apply_upgrade(crate::CURRENT_SCHEMA_VERSION).await.is_err());
        backend.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let (_dir, backend) = open().await;
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(&backend.pool).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        let row: (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&backend.pool).await.unwrap();
        assert_eq!(row.0, "wal");
        backend.close().await;
    }

    #[tokio::test]
    async fn test_queries_fail_after_close() {
        let (_dir, backend) = open().await;
        backend.close().await;
        backend.close().await;
        let err = backend.get_db_version().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
    }
}
