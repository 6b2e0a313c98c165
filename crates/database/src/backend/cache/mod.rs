//! Key-value cache backend.
//!
//! All domain logic lives in [`CacheBackend`]; the [`KeyValueStore`] beneath
//! it only moves strings and hashes. Keys follow `<prefix><entity>:<id>`,
//! with two reserved singletons: `<prefix>dbversion` and `<prefix>e2einfo`.
//!
//! | Entity        | Layout                                     | Expiry              |
//! |---------------|--------------------------------------------|---------------------|
//! | API key       | hash, one JSON-encoded value per field     | never               |
//! | File          | hash, one JSON-encoded value per field     | never (collected)   |
//! | Session       | JSON string                                | never (collected)   |
//! | Hotlink       | the target file id as a plain string       | never (cascaded)    |
//! | E2E info      | JSON string                                | never               |
//! | Upload status | JSON string                                | retention window    |
//!
//! Hashes keep integer fields as bare JSON numbers, which is exactly what
//! `HINCRBY` needs for the atomic download counter.

#[cfg(any(test, feature = "mock"))]
mod memory;
#[cfg(feature = "redis")]
mod remote;
mod store;

#[cfg(any(test, feature = "mock"))]
pub use self::memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::remote::RedisStore;
pub use self::store::{Expiry, Fields, KeyValueStore};

use crate::backend::Backend;
use crate::error::{ErrorKind, Result};
use crate::gc::{CollectionStats, UPLOAD_STATUS_RETENTION};
use crate::models::{self, ApiKey, EndToEndInfo, File, Session, UploadStatus};
use crate::upgrade::CURRENT_SCHEMA_VERSION;
use async_trait::async_trait;
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::instrument;

const API_KEY: &str = "apikey:";
const SESSION: &str = "session:";
const HOTLINK: &str = "hotlink:";
const FILE: &str = "file:";
const UPLOAD_STATUS: &str = "uploadstatus:";
const END_TO_END: &str = "e2einfo";
const DB_VERSION: &str = "dbversion";

const FIELD_DOWNLOAD_COUNT: &str = "download_count";
const FIELD_DOWNLOADS_REMAINING: &str = "downloads_remaining";
const FIELD_LAST_USED: &str = "last_used";

/// Encode a record as hash fields, each value JSON-encoded on its own.
fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value).or_raise(|| ErrorKind::InvalidData("record encoding"))? {
        Value::Object(map) => Ok(map.into_iter().map(|(field, value)| (field, value.to_string())).collect()),
        _ => exn::bail!(ErrorKind::InvalidData("record is not a map")),
    }
}

/// Decode hash fields back into a record. An empty hash is a missing record.
fn from_fields<T: DeserializeOwned>(fields: HashMap<String, String>) -> Result<Option<T>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut map = Map::with_capacity(fields.len());
    for (field, raw) in fields {
        let value: Value = serde_json::from_str(&raw).or_raise(|| ErrorKind::InvalidData("hash field"))?;
        map.insert(field, value);
    }
    Ok(Some(serde_json::from_value(Value::Object(map)).or_raise(|| ErrorKind::InvalidData("record decoding"))?))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).or_raise(|| ErrorKind::InvalidData("record encoding"))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).or_raise(|| ErrorKind::InvalidData("record decoding"))
}

/// Cache backend over any [`KeyValueStore`].
///
/// Build it with [`CacheBackend::connect_redis`] for a real server, or with
/// [`CacheBackend::new`] around a `MemoryStore` (cargo feature `mock`) in
/// tests of crates that depend on this one.
pub struct CacheBackend<S> {
    store: S,
    prefix: String,
}

impl<S: KeyValueStore> CacheBackend<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    fn key(&self, entity: &str, id: &str) -> String {
        format!("{}{entity}{id}", self.prefix)
    }

    /// Ids of every record of one entity type.
    async fn ids(&self, entity: &str) -> Result<Vec<String>> {
        let prefix = self.key(entity, "");
        let keys = self.store.keys_with_prefix(&prefix).await?;
        Ok(keys.into_iter().filter_map(|key| key.strip_prefix(&prefix).map(str::to_string)).collect())
    }

    /// Every hotlink as `(hotlink id, file id)`.
    async fn hotlink_pairs(&self) -> Result<Vec<(String, String)>> {
        let ids = self.ids(HOTLINK).await?;
        let keys: Vec<String> = ids.iter().map(|id| self.key(HOTLINK, id)).collect();
        let targets = self.store.get_many(&keys).await?;
        // A hotlink deleted between the scan and the fetch reads as `None`.
        Ok(ids.into_iter().zip(targets).filter_map(|(id, target)| Some((id, target?))).collect())
    }

    /// Delete the given hotlinks, returning how many existed.
    async fn delete_hotlinks(&self, hotlink_ids: &[String]) -> Result<u64> {
        let keys: Vec<String> = hotlink_ids.iter().map(|id| self.key(HOTLINK, id)).collect();
        self.store.delete(&keys).await
    }
}

#[cfg(feature = "redis")]
impl CacheBackend<RedisStore> {
    /// Connect to the Redis server named by `descriptor`.
    pub async fn connect_redis(descriptor: &crate::ConnectionDescriptor) -> Result<Self> {
        let store = RedisStore::connect(descriptor).await?;
        Ok(Self::new(store, descriptor.prefix.clone()))
    }
}

#[async_trait]
impl<S: KeyValueStore> Backend for CacheBackend<S> {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn get_db_version(&self) -> Result<u32> {
        let Some(raw) = self.store.get(&self.key(DB_VERSION, "")).await? else {
            return Ok(0);
        };
        raw.parse::<u32>().or_raise(|| ErrorKind::InvalidData("schema version"))
    }

    async fn set_db_version(&self, version: u32) -> Result<()> {
        self.store.set(&self.key(DB_VERSION, ""), &version.to_string(), Expiry::Never).await
    }

    async fn apply_upgrade(&self, from_version: u32) -> Result<()> {
        if from_version >= CURRENT_SCHEMA_VERSION {
            exn::bail!(ErrorKind::Upgrade(from_version));
        }
        // The key layout has been the same since version 1.
        tracing::debug!(from_version, "No key changes needed");
        Ok(())
    }

    // =========================================================================
    // API keys
    // =========================================================================

    async fn get_all_api_keys(&self) -> Result<HashMap<String, ApiKey>> {
        let mut keys = HashMap::new();
        for id in self.ids(API_KEY).await? {
            // Deleted since the scan: skip it.
            if let Some(key) = self.get_api_key(&id).await? {
                keys.insert(id, key);
            }
        }
        Ok(keys)
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        from_fields(self.store.hash_get_all(&self.key(API_KEY, id)).await?)
    }

    async fn save_api_key(&self, key: &ApiKey) -> Result<()> {
        self.store.hash_replace(&self.key(API_KEY, &key.id), &to_fields(key)?).await
    }

    async fn update_time_api_key(&self, key: &ApiKey) -> Result<()> {
        let fields = vec![(FIELD_LAST_USED.to_string(), key.last_used.to_string())];
        self.store.hash_set_existing(&self.key(API_KEY, &key.id), &fields).await?;
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> Result<()> {
        self.store.delete(&[self.key(API_KEY, id)]).await?;
        Ok(())
    }

    // =========================================================================
    // End-to-end info
    // =========================================================================

    async fn save_end_to_end_info(&self, info: &EndToEndInfo) -> Result<()> {
        self.store.set(&self.key(END_TO_END, ""), &to_json(info)?, Expiry::Never).await
    }

    async fn get_end_to_end_info(&self) -> Result<Option<EndToEndInfo>> {
        self.store.get(&self.key(END_TO_END, "")).await?.as_deref().map(from_json).transpose()
    }

    async fn delete_end_to_end_info(&self) -> Result<()> {
        self.store.delete(&[self.key(END_TO_END, "")]).await?;
        Ok(())
    }

    // =========================================================================
    // Hotlinks
    // =========================================================================

    async fn get_hotlink(&self, hotlink_id: &str) -> Result<Option<String>> {
        self.store.get(&self.key(HOTLINK, hotlink_id)).await
    }

    async fn get_all_hotlinks(&self) -> Result<Vec<String>> {
        self.ids(HOTLINK).await
    }

    async fn save_hotlink(&self, hotlink_id: &str, file_id: &str) -> Result<()> {
        self.store.set(&self.key(HOTLINK, hotlink_id), file_id, Expiry::Never).await
    }

    async fn delete_hotlink(&self, hotlink_id: &str) -> Result<()> {
        self.store.delete(&[self.key(HOTLINK, hotlink_id)]).await?;
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let Some(raw) = self.store.get(&self.key(SESSION, token)).await? else {
            return Ok(None);
        };
        let session: Session = from_json(&raw)?;
        Ok((!session.is_expired(models::now())).then_some(session))
    }

    async fn save_session(&self, token: &str, session: &Session) -> Result<()> {
        self.store.set(&self.key(SESSION, token), &to_json(session)?, Expiry::Never).await
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        self.store.delete(&[self.key(SESSION, token)]).await?;
        Ok(())
    }

    async fn delete_all_sessions(&self) -> Result<()> {
        let keys = self.store.keys_with_prefix(&self.key(SESSION, "")).await?;
        self.store.delete(&keys).await?;
        Ok(())
    }

    // =========================================================================
    // File metadata
    // =========================================================================

    async fn get_all_metadata(&self) -> Result<HashMap<String, File>> {
        let mut files = HashMap::new();
        for id in self.ids(FILE).await? {
            if let Some(file) = self.get_metadata_by_id(&id).await? {
                files.insert(id, file);
            }
        }
        Ok(files)
    }

    async fn get_all_metadata_ids(&self) -> Result<Vec<String>> {
        self.ids(FILE).await
    }

    async fn get_metadata_by_id(&self, id: &str) -> Result<Option<File>> {
        from_fields(self.store.hash_get_all(&self.key(FILE, id)).await?)
    }

    async fn save_metadata(&self, file: &File) -> Result<()> {
        self.store.hash_replace(&self.key(FILE, &file.id), &to_fields(file)?).await
    }

    async fn delete_metadata(&self, id: &str) -> Result<()> {
        let orphaned: Vec<String> = self
            .hotlink_pairs()
            .await?
            .into_iter()
            .filter_map(|(hotlink, target)| (target == id).then_some(hotlink))
            .collect();
        self.delete_hotlinks(&orphaned).await?;
        self.store.delete(&[self.key(FILE, id)]).await?;
        Ok(())
    }

    async fn increase_download_count(&self, id: &str, has_download_limit: bool) -> Result<()> {
        let mut deltas = vec![(FIELD_DOWNLOAD_COUNT, 1)];
        if has_download_limit {
            deltas.push((FIELD_DOWNLOADS_REMAINING, -1));
        }
        self.store.hash_increment_existing(&self.key(FILE, id), &deltas).await?;
        Ok(())
    }

    // =========================================================================
    // Upload status
    // =========================================================================

    async fn get_all_upload_status(&self) -> Result<Vec<UploadStatus>> {
        let keys = self.store.keys_with_prefix(&self.key(UPLOAD_STATUS, "")).await?;
        let values = self.store.get_many(&keys).await?;
        values.iter().flatten().map(|raw| from_json(raw)).collect()
    }

    async fn save_upload_status(&self, status: &UploadStatus) -> Result<()> {
        let key = self.key(UPLOAD_STATUS, &status.chunk_id);
        self.store.set(&key, &to_json(status)?, Expiry::After(UPLOAD_STATUS_RETENTION)).await
    }

    async fn delete_upload_status(&self, chunk_id: &str) -> Result<()> {
        self.store.delete(&[self.key(UPLOAD_STATUS, chunk_id)]).await?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    #[instrument("collecting expired cache records", skip(self), fields(store = self.store.name()))]
    async fn run_garbage_collection(&self) -> Result<CollectionStats> {
        let now = models::now();
        let mut stats = CollectionStats::default();

        // Every deletion below is conditional on the value still being the
        // one that was judged expired, so a record rewritten in between
        // survives until the next pass.
        let session_keys = self.store.keys_with_prefix(&self.key(SESSION, "")).await?;
        for (key, raw) in session_keys.iter().zip(self.store.get_many(&session_keys).await?) {
            if let Some(raw) = raw
                && from_json::<Session>(&raw)?.is_expired(now)
                && self.store.delete_if_unchanged(key, &raw).await?
            {
                stats.sessions += 1;
            }
        }

        // Upload statuses normally expire on the server; this catches
        // anything written before expiries were set.
        let stale_before = now - UPLOAD_STATUS_RETENTION.as_secs() as i64;
        let status_keys = self.store.keys_with_prefix(&self.key(UPLOAD_STATUS, "")).await?;
        for (key, raw) in status_keys.iter().zip(self.store.get_many(&status_keys).await?) {
            if let Some(raw) = raw
                && from_json::<UploadStatus>(&raw)?.last_update < stale_before
                && self.store.delete_if_unchanged(key, &raw).await?
            {
                stats.upload_status += 1;
            }
        }

        let mut remaining = HashSet::new();
        for id in self.ids(FILE).await? {
            let key = self.key(FILE, &id);
            let fields = self.store.hash_get_all(&key).await?;
            let Some(file) = from_fields::<File>(fields.clone())? else {
                continue;
            };
            if file.is_expired(now) && self.store.hash_delete_if_unchanged(&key, &fields).await? {
                stats.files += 1;
            } else {
                remaining.insert(id);
            }
        }

        // Hotlinks of collected files are orphans now too. A target missing
        // from the listing is looked up again in case it was just uploaded.
        let mut orphaned = Vec::new();
        let mut missing: HashMap<String, bool> = HashMap::new();
        for (hotlink, target) in self.hotlink_pairs().await? {
            if remaining.contains(&target) {
                continue;
            }
            let gone = match missing.get(&target) {
                Some(gone) => *gone,
                None => {
                    let gone = self.store.hash_get_all(&self.key(FILE, &target)).await?.is_empty();
                    missing.insert(target, gone);
                    gone
                },
            };
            if gone {
                orphaned.push(hotlink);
            }
        }
        stats.hotlinks = self.delete_hotlinks(&orphaned).await?;
        Ok(stats)
    }

    async fn close(&self) {
        self.store.close().await;
    }
}
