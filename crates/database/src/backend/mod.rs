//! Storage backend trait and implementations.
//!
//! This module defines the [`Backend`] trait, the single contract every
//! storage medium implements, and [`connect`], the only place in the crate
//! that looks at a [`BackendKind`]. Everything downstream works with a
//! [`BackendHandle`] and never branches on which medium is behind it.

pub mod cache;
mod sqlite;
#[cfg(test)]
mod tests;

pub use self::cache::CacheBackend;
pub use self::sqlite::SqliteBackend;
use crate::connection::{BackendKind, ConnectionDescriptor};
use crate::error::Result;
use crate::gc::CollectionStats;
use crate::models::{ApiKey, EndToEndInfo, File, Session, UploadStatus};
use crate::upgrade::{self, CURRENT_SCHEMA_VERSION};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared, type-erased backend.
pub type BackendHandle = Arc<dyn Backend>;

/// Unified interface for storage backends.
///
/// Every operation is asynchronous and takes `&self`; implementations are
/// internally synchronised (connection pools, atomic server-side commands)
/// and safe to share between tasks. Lookups of a missing record return
/// `Ok(None)`: absence is not an error.
///
/// # Examples
///
/// ```
/// use parcel_database::Backend;
/// use parcel_database::error::Result;
///
/// async fn record_download(backend: &dyn Backend, file_id: &str) -> Result<u64> {
///     let Some(file) = backend.get_metadata_by_id(file_id).await? else {
///         return Ok(0);
///     };
///     backend.increase_download_count(file_id, !file.unlimited_downloads).await?;
///     Ok(file.download_count + 1)
/// }
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name of the storage medium, for logging only.
    fn name(&self) -> &str;

    // =========================================================================
    // Schema version
    // =========================================================================

    /// Version stored in this backend instance, `0` for an uninitialised store.
    async fn get_db_version(&self) -> Result<u32>;

    async fn set_db_version(&self, version: u32) -> Result<()>;

    /// Version this build expects, independent of anything stored.
    fn get_schema_version(&self) -> u32 {
        CURRENT_SCHEMA_VERSION
    }

    /// Apply the transformation that takes a store from `from_version` to
    /// `from_version + 1`. Steps must be idempotent; recording the new
    /// version is the caller's job.
    async fn apply_upgrade(&self, from_version: u32) -> Result<()>;

    // =========================================================================
    // API keys
    // =========================================================================

    async fn get_all_api_keys(&self) -> Result<HashMap<String, ApiKey>>;

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>>;

    /// Create or fully replace an API key.
    async fn save_api_key(&self, key: &ApiKey) -> Result<()>;

    /// Update only the last-used timestamp. Does nothing if the key is gone.
    async fn update_time_api_key(&self, key: &ApiKey) -> Result<()>;

    async fn delete_api_key(&self, id: &str) -> Result<()>;

    // =========================================================================
    // End-to-end info
    // =========================================================================

    /// Overwrite the singleton. `available_files` is never stored.
    async fn save_end_to_end_info(&self, info: &EndToEndInfo) -> Result<()>;

    async fn get_end_to_end_info(&self) -> Result<Option<EndToEndInfo>>;

    async fn delete_end_to_end_info(&self) -> Result<()>;

    // =========================================================================
    // Hotlinks
    // =========================================================================

    /// Resolve a hotlink to the id of the file it points at.
    async fn get_hotlink(&self, hotlink_id: &str) -> Result<Option<String>>;

    async fn get_all_hotlinks(&self) -> Result<Vec<String>>;

    async fn save_hotlink(&self, hotlink_id: &str, file_id: &str) -> Result<()>;

    async fn delete_hotlink(&self, hotlink_id: &str) -> Result<()>;

    // =========================================================================
    // Sessions
    // =========================================================================

    async fn get_session(&self, token: &str) -> Result<Option<Session>>;

    async fn save_session(&self, token: &str, session: &Session) -> Result<()>;

    async fn delete_session(&self, token: &str) -> Result<()>;

    async fn delete_all_sessions(&self) -> Result<()>;

    // =========================================================================
    // File metadata
    // =========================================================================

    async fn get_all_metadata(&self) -> Result<HashMap<String, File>>;

    async fn get_all_metadata_ids(&self) -> Result<Vec<String>>;

    async fn get_metadata_by_id(&self, id: &str) -> Result<Option<File>>;

    /// Create or fully replace a file record. Hotlinks are saved separately.
    async fn save_metadata(&self, file: &File) -> Result<()>;

    /// Delete a file record and every hotlink pointing at it.
    async fn delete_metadata(&self, id: &str) -> Result<()>;

    /// Atomically add one to the download count and, when the file has a
    /// download limit, subtract one from the remaining downloads. Does
    /// nothing if the file does not exist.
    async fn increase_download_count(&self, id: &str, has_download_limit: bool) -> Result<()>;

    // =========================================================================
    // Upload status
    // =========================================================================

    async fn get_all_upload_status(&self) -> Result<Vec<UploadStatus>>;

    async fn save_upload_status(&self, status: &UploadStatus) -> Result<()>;

    async fn delete_upload_status(&self, chunk_id: &str) -> Result<()>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete expired sessions, expired or exhausted files (with their
    /// hotlinks), orphaned hotlinks and stale upload statuses.
    async fn run_garbage_collection(&self) -> Result<CollectionStats>;

    /// Release all resources. Calling it more than once is harmless.
    async fn close(&self);
}

/// Open the backend described by `descriptor`.
///
/// A store that has never been initialised (stored version `0`) has every
/// upgrade step applied so it starts at [`CURRENT_SCHEMA_VERSION`]. Stores
/// at an older, non-zero version are left for an explicit
/// [`upgrade`](crate::Database::upgrade).
///
/// # Panics
///
/// Panics if the descriptor names a backend this build was compiled
/// without. That is a packaging mistake, not bad input.
pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<BackendHandle> {
    let handle: BackendHandle = match descriptor.kind {
        BackendKind::Sqlite => Arc::new(SqliteBackend::connect(&descriptor.host).await?),
        #[cfg(feature = "redis")]
        BackendKind::Redis => Arc::new(CacheBackend::connect_redis(descriptor).await?),
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => panic!("parcel-database was built without the `redis` feature"),
    };
    initialise(handle).await
}

/// Bring a never-initialised store to the current schema. The handle is
/// closed if that fails.
async fn initialise(handle: BackendHandle) -> Result<BackendHandle> {
    if let Err(err) = initialise_if_new(handle.as_ref()).await {
        handle.close().await;
        return Err(err);
    }
    Ok(handle)
}

async fn initialise_if_new(backend: &dyn Backend) -> Result<()> {
    if backend.get_db_version().await? == 0 {
        tracing::info!(backend = backend.name(), "Initialising new database");
        upgrade::upgrade(backend).await?;
    }
    Ok(())
}
