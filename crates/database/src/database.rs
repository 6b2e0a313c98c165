use crate::backend::{self, BackendHandle};
use crate::connection::{self, ConnectionDescriptor};
use crate::error::Result;
use crate::gc::CollectionStats;
use crate::models::{ApiKey, EndToEndInfo, File, Session, UploadStatus};
use crate::upgrade::{self, UpgradeReport};
use std::collections::HashMap;

/// Storage facade handed to every component that needs persistence.
///
/// Cloning is cheap and every clone shares the same backend. The facade
/// holds no lock of its own; backends are safe for concurrent use.
#[derive(Clone)]
pub struct Database {
    backend: BackendHandle,
}

impl Database {
    /// Connect to the backend described by `descriptor`, initialising it if
    /// it has never been used.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        tracing::debug!(database = %descriptor, "Connecting");
        Ok(Self { backend: backend::connect(descriptor).await? })
    }

    /// Parse `url` and connect. See [`parse_url`](crate::parse_url) for
    /// the accepted formats and what `strict` does.
    pub async fn open(url: &str, strict: bool) -> Result<Self> {
        Self::connect(&connection::parse_url(url, strict)?).await
    }

    /// Wrap an already constructed backend as-is.
    pub fn from_handle(backend: BackendHandle) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn get_db_version(&self) -> Result<u32> {
        self.backend.get_db_version().await
    }

    pub fn get_schema_version(&self) -> u32 {
        self.backend.get_schema_version()
    }

    pub async fn upgrade(&self) -> Result<UpgradeReport> {
        upgrade::upgrade(self.backend.as_ref()).await
    }

    pub async fn run_garbage_collection(&self) -> Result<CollectionStats> {
        self.backend.run_garbage_collection().await
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }

    pub async fn get_all_api_keys(&self) -> Result<HashMap<String, ApiKey>> {
        self.backend.get_all_api_keys().await
    }

    pub async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        self.backend.get_api_key(id).await
    }

    pub async fn save_api_key(&self, key: &ApiKey) -> Result<()> {
        self.backend.save_api_key(key).await
    }

    pub async fn update_time_api_key(&self, key: &ApiKey) -> Result<()> {
        self.backend.update_time_api_key(key).await
    }

    pub async fn delete_api_key(&self, id: &str) -> Result<()> {
        self.backend.delete_api_key(id).await
    }

    pub async fn save_end_to_end_info(&self, info: &EndToEndInfo) -> Result<()> {
        self.backend.save_end_to_end_info(info).await
    }

    pub async fn get_end_to_end_info(&self) -> Result<Option<EndToEndInfo>> {
        self.backend.get_end_to_end_info().await
    }

    pub async fn delete_end_to_end_info(&self) -> Result<()> {
        self.backend.delete_end_to_end_info().await
    }

    pub async fn get_hotlink(&self, hotlink_id: &str) -> Result<Option<String>> {
        self.backend.get_hotlink(hotlink_id).await
    }

    pub async fn get_all_hotlinks(&self) -> Result<Vec<String>> {
        self.backend.get_all_hotlinks().await
    }

    pub async fn save_hotlink(&self, hotlink_id: &str, file_id: &str) -> Result<()> {
        self.backend.save_hotlink(hotlink_id, file_id).await
    }

    pub async fn delete_hotlink(&self, hotlink_id: &str) -> Result<()> {
        self.backend.delete_hotlink(hotlink_id).await
    }

    pub async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        self.backend.get_session(token).await
    }

    pub async fn save_session(&self, token: &str, session: &Session) -> Result<()> {
        self.backend.save_session(token, session).await
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        self.backend.delete_session(token).await
    }

    pub async fn delete_all_sessions(&self) -> Result<()> {
        self.backend.delete_all_sessions().await
    }

    pub async fn get_all_metadata(&self) -> Result<HashMap<String, File>> {
        self.backend.get_all_metadata().await
    }

    pub async fn get_all_metadata_ids(&self) -> Result<Vec<String>> {
        self.backend.get_all_metadata_ids().await
    }

    pub async fn get_metadata_by_id(&self, id: &str) -> Result<Option<File>> {
        self.backend.get_metadata_by_id(id).await
    }

    pub async fn save_metadata(&self, file: &File) -> Result<()> {
        self.backend.save_metadata(file).await
    }

    pub async fn delete_metadata(&self, id: &str) -> Result<()> {
        self.backend.delete_metadata(id).await
    }

    pub async fn increase_download_count(&self, id: &str, has_download_limit: bool) -> Result<()> {
        self.backend.increase_download_count(id, has_download_limit).await
    }

    pub async fn get_all_upload_status(&self) -> Result<Vec<UploadStatus>> {
        self.backend.get_all_upload_status().await
    }

    pub async fn save_upload_status(&self, status: &UploadStatus) -> Result<()> {
        self.backend.save_upload_status(status).await
    }

    pub async fn delete_upload_status(&self, chunk_id: &str) -> Result<()> {
        self.backend.delete_upload_status(chunk_id).await
    }
}
