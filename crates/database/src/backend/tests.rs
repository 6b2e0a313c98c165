//! Behaviour every backend must share. Each test runs once per backend; the
//! Redis cases only connect when `PARCEL_TEST_REDIS` holds a server URL.

use super::cache::{Expiry, KeyValueStore, MemoryStore};
use super::{BackendHandle, CacheBackend, SqliteBackend};
use crate::error::ErrorKind;
use crate::gc::UPLOAD_STATUS_RETENTION;
use crate::models::{self, ApiKey, EncryptionInfo, EndToEndInfo, File, Permissions, Session, UploadState, UploadStatus};
use crate::upgrade::CURRENT_SCHEMA_VERSION;
use crate::{Database, migrate, migrate_urls};
use rstest::rstest;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Clone, Copy, Debug)]
enum Variant {
    Sqlite,
    Memory,
    #[cfg(feature = "redis")]
    Redis,
}

/// A connected backend plus whatever keeps it alive.
struct Harness {
    db: Database,
    backend: BackendHandle,
    _dir: Option<TempDir>,
}

#[cfg(feature = "redis")]
async fn open_redis() -> Option<BackendHandle> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let url = std::env::var("PARCEL_TEST_REDIS").ok()?;
    let mut descriptor = crate::parse_url(&url, false).unwrap();
    // Every harness gets its own namespace so tests can run in parallel.
    descriptor.prefix = format!("parcel_test_{}_{}_", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed));
    Some(Arc::new(CacheBackend::connect_redis(&descriptor).await.unwrap()))
}

async fn open(variant: Variant) -> Option<Harness> {
    let (backend, dir): (BackendHandle, _) = match variant {
        Variant::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let backend = SqliteBackend::connect(dir.path().join("parcel.sqlite")).await.unwrap();
            (Arc::new(backend), Some(dir))
        },
        Variant::Memory => (Arc::new(CacheBackend::new(MemoryStore::new(), "parcel_")), None),
        #[cfg(feature = "redis")]
        Variant::Redis => (open_redis().await?, None),
    };
    let db = Database::from_handle(backend.clone());
    db.upgrade().await.unwrap();
    Some(Harness { db, backend, _dir: dir })
}

fn test_file(id: &str) -> File {
    File {
        id: id.to_string(),
        name: "holiday.jpg".to_string(),
        size: "3 kB".to_string(),
        sha1: "f2ca1bb6c7e907d06dafe4687e579fce76b37e4e".to_string(),
        password_hash: None,
        hotlink_id: Some(format!("{id}.jpg")),
        content_type: "image/jpeg".to_string(),
        bucket: None,
        expire_at_string: "2099-01-01 00:00".to_string(),
        // 2100-01-01
        expire_at: 4_102_444_800,
        size_bytes: 3 * 1024,
        downloads_remaining: 5,
        download_count: 0,
        encryption: EncryptionInfo {
            is_encrypted: true,
            is_end_to_end_encrypted: false,
            decryption_key: vec![1, 2, 3, 4],
            nonce: vec![9, 8, 7],
        },
        unlimited_downloads: false,
        unlimited_time: false,
    }
}

fn test_key(id: &str) -> ApiKey {
    ApiKey {
        id: id.to_string(),
        friendly_name: "Uploader".to_string(),
        last_used: 0,
        permissions: Permissions(Permissions::VIEW.0 | Permissions::UPLOAD.0),
    }
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_api_keys(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    assert_eq!(db.get_api_key("missing").await.unwrap(), None);

    let mut key = test_key("key1");
    db.save_api_key(&key).await.unwrap();
    db.save_api_key(&test_key("key2")).await.unwrap();
    assert_eq!(db.get_api_key("key1").await.unwrap(), Some(key.clone()));

    key.last_used = 1_700_000_000;
    db.update_time_api_key(&key).await.unwrap();
    assert_eq!(db.get_api_key("key1").await.unwrap().unwrap().last_used, 1_700_000_000);

    // Touching a deleted key must not bring it back.
    db.delete_api_key("key2").await.unwrap();
    db.update_time_api_key(&test_key("key2")).await.unwrap();
    let all = db.get_all_api_keys().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["key1"], key);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_sessions(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let now = models::now();
    let session = Session { renew_at: now + 60, valid_until: now + 3600 };
    db.save_session("token1", &session).await.unwrap();
    db.save_session("token2", &session).await.unwrap();
    assert_eq!(db.get_session("token1").await.unwrap(), Some(session));
    assert_eq!(db.get_session("missing").await.unwrap(), None);

    db.delete_session("token1").await.unwrap();
    assert_eq!(db.get_session("token1").await.unwrap(), None);
    assert!(db.get_session("token2").await.unwrap().is_some());

    db.delete_all_sessions().await.unwrap();
    assert_eq!(db.get_session("token2").await.unwrap(), None);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_expired_sessions_are_hidden_until_collected(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let now = models::now();
    db.save_session("past", &Session { renew_at: now - 7200, valid_until: now - 3600 }).await.unwrap();
    db.save_session("ending", &Session { renew_at: now, valid_until: now + 60 }).await.unwrap();

    assert_eq!(db.get_session("past").await.unwrap(), None);
    assert!(db.get_session("ending").await.unwrap().is_some());

    let stats = db.run_garbage_collection().await.unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(db.run_garbage_collection().await.unwrap().sessions, 0);
    assert!(db.get_session("ending").await.unwrap().is_some());
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_hotlinks(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    db.save_hotlink("a.jpg", "file1").await.unwrap();
    db.save_hotlink("b.jpg", "file1").await.unwrap();
    assert_eq!(db.get_hotlink("a.jpg").await.unwrap().as_deref(), Some("file1"));
    assert_eq!(db.get_hotlink("missing").await.unwrap(), None);

    let mut all = db.get_all_hotlinks().await.unwrap();
    all.sort();
    assert_eq!(all, vec!["a.jpg".to_string(), "b.jpg".to_string()]);

    db.delete_hotlink("a.jpg").await.unwrap();
    assert_eq!(db.get_hotlink("a.jpg").await.unwrap(), None);
    assert_eq!(db.get_all_hotlinks().await.unwrap(), vec!["b.jpg".to_string()]);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_metadata(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let file = test_file("file1");
    let mut other = test_file("file2");
    other.password_hash = Some("hash".to_string());
    other.bucket = Some("bucket-a".to_string());
    other.hotlink_id = None;
    db.save_metadata(&file).await.unwrap();
    db.save_metadata(&other).await.unwrap();

    assert_eq!(db.get_metadata_by_id("file1").await.unwrap(), Some(file.clone()));
    assert_eq!(db.get_metadata_by_id("file2").await.unwrap(), Some(other.clone()));
    assert_eq!(db.get_metadata_by_id("missing").await.unwrap(), None);

    let mut ids = db.get_all_metadata_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["file1".to_string(), "file2".to_string()]);
    let all = db.get_all_metadata().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["file2"], other);

    // Saving again replaces the whole record.
    let mut renamed = file.clone();
    renamed.name = "renamed.jpg".to_string();
    renamed.encryption = EncryptionInfo::default();
    db.save_metadata(&renamed).await.unwrap();
    assert_eq!(db.get_metadata_by_id("file1").await.unwrap(), Some(renamed));
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_delete_metadata_cascades_to_hotlinks(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    db.save_metadata(&test_file("file1")).await.unwrap();
    db.save_metadata(&test_file("file2")).await.unwrap();
    db.save_hotlink("one.jpg", "file1").await.unwrap();
    db.save_hotlink("also-one.jpg", "file1").await.unwrap();
    db.save_hotlink("two.jpg", "file2").await.unwrap();

    db.delete_metadata("file1").await.unwrap();
    assert_eq!(db.get_metadata_by_id("file1").await.unwrap(), None);
    assert_eq!(db.get_hotlink("one.jpg").await.unwrap(), None);
    assert_eq!(db.get_hotlink("also-one.jpg").await.unwrap(), None);
    assert_eq!(db.get_hotlink("two.jpg").await.unwrap().as_deref(), Some("file2"));
    db.close().await;
}

#[rstest]
#[case::sqlite_limited(Variant::Sqlite, true)]
#[case::sqlite_unlimited(Variant::Sqlite, false)]
#[case::memory_limited(Variant::Memory, true)]
#[case::memory_unlimited(Variant::Memory, false)]
#[cfg_attr(feature = "redis", case::redis_limited(Variant::Redis, true))]
#[cfg_attr(feature = "redis", case::redis_unlimited(Variant::Redis, false))]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_download_counts(#[case] variant: Variant, #[case] has_download_limit: bool) {
    const DOWNLOADS: u64 = 50;
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let mut file = test_file("popular");
    file.downloads_remaining = 100;
    file.unlimited_downloads = !has_download_limit;
    db.save_metadata(&file).await.unwrap();

    let tasks: Vec<_> = (0..DOWNLOADS)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.increase_download_count("popular", has_download_limit).await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let stored = db.get_metadata_by_id("popular").await.unwrap().unwrap();
    assert_eq!(stored.download_count, DOWNLOADS);
    let expected_remaining = if has_download_limit { 100 - DOWNLOADS as i64 } else { 100 };
    assert_eq!(stored.downloads_remaining, expected_remaining);
    // Everything else is untouched.
    assert_eq!(stored.name, file.name);
    assert_eq!(stored.encryption, file.encryption);

    // Counting a missing file is a no-op and does not create it.
    db.increase_download_count("missing", true).await.unwrap();
    assert_eq!(db.get_metadata_by_id("missing").await.unwrap(), None);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_end_to_end_info_drops_available_files(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    assert_eq!(db.get_end_to_end_info().await.unwrap(), None);
    let info = EndToEndInfo {
        version: 1,
        nonce: b"test".to_vec(),
        content: b"test2".to_vec(),
        available_files: vec!["should".to_string(), "not".to_string(), "be".to_string(), "saved".to_string()],
    };
    db.save_end_to_end_info(&info).await.unwrap();
    let stored = db.get_end_to_end_info().await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.nonce, b"test");
    assert_eq!(stored.content, b"test2");
    assert!(stored.available_files.is_empty());

    db.delete_end_to_end_info().await.unwrap();
    assert_eq!(db.get_end_to_end_info().await.unwrap(), None);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_upload_status(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let now = models::now();
    let first = UploadStatus { chunk_id: "chunk1".to_string(), status: UploadState::UploadingToCloud, last_update: now };
    let second = UploadStatus { chunk_id: "chunk2".to_string(), status: UploadState::Finished, last_update: now };
    db.save_upload_status(&first).await.unwrap();
    db.save_upload_status(&second).await.unwrap();

    let mut all = db.get_all_upload_status().await.unwrap();
    all.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
    assert_eq!(all, vec![first.clone(), second]);

    db.delete_upload_status("chunk2").await.unwrap();
    assert_eq!(db.get_all_upload_status().await.unwrap(), vec![first]);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_upgrade_from_older_version(#[case] variant: Variant) {
    let Some(Harness { db, backend, _dir }) = open(variant).await else { return };
    assert_eq!(db.get_db_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    db.save_api_key(&test_key("survivor")).await.unwrap();

    backend.set_db_version(1).await.unwrap();
    let report = db.upgrade().await.unwrap();
    assert_eq!((report.from, report.to), (1, CURRENT_SCHEMA_VERSION));
    assert_eq!(db.get_db_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    assert!(db.get_api_key("survivor").await.unwrap().is_some());

    // Idempotent once current.
    assert!(db.upgrade().await.unwrap().is_noop());
    assert_eq!(db.get_db_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    db.close().await;
}

#[rstest]
#[case::sqlite(Variant::Sqlite)]
#[case::memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::redis(Variant::Redis))]
#[tokio::test]
async fn test_garbage_collection(#[case] variant: Variant) {
    let Some(Harness { db, _dir, .. }) = open(variant).await else { return };
    let now = models::now();

    db.save_session("expired", &Session { renew_at: now - 7200, valid_until: now - 3600 }).await.unwrap();
    db.save_session("live", &Session { renew_at: now + 60, valid_until: now + 3600 }).await.unwrap();

    let mut exhausted = test_file("exhausted");
    exhausted.downloads_remaining = 0;
    let mut timed_out = test_file("timed-out");
    timed_out.expire_at = now - 60;
    let mut unlimited_time = test_file("unlimited-time");
    unlimited_time.expire_at = now - 60;
    unlimited_time.unlimited_time = true;
    let mut unlimited_downloads = test_file("unlimited-downloads");
    unlimited_downloads.downloads_remaining = 0;
    unlimited_downloads.unlimited_downloads = true;
    let live = test_file("live");
    for file in [&exhausted, &timed_out, &unlimited_time, &unlimited_downloads, &live] {
        db.save_metadata(file).await.unwrap();
    }
    db.save_hotlink("exhausted.jpg", "exhausted").await.unwrap();
    db.save_hotlink("live.jpg", "live").await.unwrap();
    db.save_hotlink("orphan.jpg", "never-existed").await.unwrap();

    let stale_time = now - UPLOAD_STATUS_RETENTION.as_secs() as i64 - 60;
    let stale = UploadStatus { chunk_id: "stale".to_string(), status: UploadState::Finished, last_update: stale_time };
    let fresh = UploadStatus { chunk_id: "fresh".to_string(), status: UploadState::Finished, last_update: now };
    db.save_upload_status(&stale).await.unwrap();
    db.save_upload_status(&fresh).await.unwrap();

    let stats = db.run_garbage_collection().await.unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.files, 2);
    assert_eq!(stats.hotlinks, 2);
    assert_eq!(stats.upload_status, 1);

    assert_eq!(db.get_session("expired").await.unwrap(), None);
    assert!(db.get_session("live").await.unwrap().is_some());
    let mut remaining = db.get_all_metadata_ids().await.unwrap();
    remaining.sort();
    assert_eq!(remaining, vec!["live", "unlimited-downloads", "unlimited-time"]);
    assert_eq!(db.get_all_hotlinks().await.unwrap(), vec!["live.jpg".to_string()]);
    assert_eq!(db.get_all_upload_status().await.unwrap(), vec![fresh]);

    // A second pass finds nothing.
    assert_eq!(db.run_garbage_collection().await.unwrap().total(), 0);
    db.close().await;
}

#[rstest]
#[case::from_sqlite(Variant::Sqlite)]
#[case::from_memory(Variant::Memory)]
#[cfg_attr(feature = "redis", case::from_redis(Variant::Redis))]
#[tokio::test]
async fn test_migrate_to_sqlite(#[case] variant: Variant) {
    let Some(Harness { db: source, _dir, .. }) = open(variant).await else { return };
    source.save_api_key(&test_key("key1")).await.unwrap();
    source.save_metadata(&test_file("file1")).await.unwrap();
    source.save_metadata(&test_file("file2")).await.unwrap();
    source.save_hotlink("file1.jpg", "file1").await.unwrap();
    source.save_session("token", &Session { renew_at: 0, valid_until: models::now() + 3600 }).await.unwrap();
    let info = EndToEndInfo { version: 1, nonce: vec![1], content: vec![2], available_files: Vec::new() };
    source.save_end_to_end_info(&info).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("destination.sqlite").display());
    let destination = Database::open(&url, false).await.unwrap();
    // Pre-existing records with colliding ids are overwritten, others kept.
    destination.save_api_key(&ApiKey { friendly_name: "stale".to_string(), ..test_key("key1") }).await.unwrap();
    destination.save_api_key(&test_key("local-only")).await.unwrap();

    let report = migrate(&source, &destination).await.unwrap();
    assert_eq!(report.api_keys, 1);
    assert_eq!(report.files, 2);
    assert_eq!(report.hotlinks, 1);
    assert!(report.end_to_end_info);

    // Both handles are closed afterwards.
    assert!(source.get_db_version().await.is_err());
    assert!(destination.get_db_version().await.is_err());

    let reopened = Database::open(&url, true).await.unwrap();
    assert_eq!(reopened.get_api_key("key1").await.unwrap(), Some(test_key("key1")));
    assert!(reopened.get_api_key("local-only").await.unwrap().is_some());
    assert_eq!(reopened.get_metadata_by_id("file2").await.unwrap(), Some(test_file("file2")));
    assert_eq!(reopened.get_hotlink("file1.jpg").await.unwrap().as_deref(), Some("file1"));
    assert_eq!(reopened.get_end_to_end_info().await.unwrap(), Some(info));
    assert_eq!(reopened.get_session("token").await.unwrap(), None);
    reopened.close().await;
}

#[tokio::test]
async fn test_migrate_stops_at_first_write_error() {
    let source = open(Variant::Memory).await.unwrap().db;
    source.save_api_key(&test_key("key1")).await.unwrap();
    source.save_metadata(&test_file("file1")).await.unwrap();
    let destination = open(Variant::Memory).await.unwrap().db;
    destination.close().await;

    let err = migrate(&source, &destination).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Migration("api keys")));
    // The source was closed on the error path too.
    let err = source.get_api_key("key1").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Closed));
}

#[tokio::test]
async fn test_migrate_urls() {
    let dir = tempfile::tempdir().unwrap();
    let from = format!("sqlite://{}", dir.path().join("from.sqlite").display());
    let to = format!("sqlite://{}", dir.path().join("to.sqlite").display());

    let err = migrate_urls(&from, &to).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Migration("opening source")));
    assert!(!dir.path().join("to.sqlite").exists());

    let source = Database::open(&from, false).await.unwrap();
    source.save_metadata(&test_file("file1")).await.unwrap();
    source.save_hotlink("file1.jpg", "file1").await.unwrap();
    source.close().await;

    let report = migrate_urls(&from, &to).await.unwrap();
    assert_eq!(report.files, 1);
    assert_eq!(report.hotlinks, 1);
    let destination = Database::open(&to, true).await.unwrap();
    assert_eq!(destination.get_metadata_by_id("file1").await.unwrap(), Some(test_file("file1")));
    destination.close().await;
}

#[tokio::test]
async fn test_failed_initialisation_closes_backend() {
    let store = MemoryStore::new();
    store.set("parcel_dbversion", "not a number", Expiry::Never).await.unwrap();
    let backend: BackendHandle = Arc::new(CacheBackend::new(store, "parcel_"));

    let err = super::initialise(backend.clone()).await.err().expect("initialisation should fail");
    assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    let err = backend.get_hotlink("h").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Closed));
}

#[tokio::test]
async fn test_initialisation_upgrades_new_store() {
    let backend: BackendHandle = Arc::new(CacheBackend::new(MemoryStore::new(), "parcel_"));
    let backend = super::initialise(backend).await.unwrap();
    assert_eq!(backend.get_db_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
}

#[cfg(not(feature = "redis"))]
#[tokio::test]
#[should_panic(expected = "built without the `redis` feature")]
async fn test_connect_without_redis_support_panics() {
    let descriptor = crate::parse_url("redis://127.0.0.1:6379", false).unwrap();
    let _ = super::connect(&descriptor).await;
}
