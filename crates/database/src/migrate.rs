//! Copy every record from one backend instance into another.

use crate::Database;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use tracing::instrument;

/// Records written to the destination by [`migrate`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MigrationReport {
    pub api_keys: usize,
    pub files: usize,
    pub hotlinks: usize,
    pub end_to_end_info: bool,
}

/// Copy API keys, files, hotlinks and end-to-end info from `source` to
/// `destination`, then close both.
///
/// Sessions and upload statuses are transient and stay behind. The copy is
/// additive: colliding ids are overwritten and nothing is deleted, so a
/// failed run can simply be repeated. The first failure stops the copy and
/// keeps whatever was already written.
#[instrument("migrating", skip_all, fields(from = source.backend_name(), to = destination.backend_name()))]
pub async fn migrate(source: &Database, destination: &Database) -> Result<MigrationReport> {
    let result = copy_all(source, destination).await;
    source.close().await;
    destination.close().await;
    result
}

/// Open both sides from connection strings, then [`migrate`].
///
/// The source must already exist; the destination is created if needed and
/// is never touched when the source cannot be opened.
pub async fn migrate_urls(source_url: &str, destination_url: &str) -> Result<MigrationReport> {
    let source = Database::open(source_url, true).await.or_raise(|| ErrorKind::Migration("opening source"))?;
    let destination = match Database::open(destination_url, false).await {
        Ok(destination) => destination,
        Err(err) => {
            source.close().await;
            return Err(err.raise(ErrorKind::Migration("opening destination")));
        },
    };
    migrate(&source, &destination).await
}

async fn copy_all(source: &Database, destination: &Database) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    let api_keys = source.get_all_api_keys().await.or_raise(|| ErrorKind::Migration("api keys"))?;
    for key in api_keys.values() {
        destination.save_api_key(key).await.or_raise(|| ErrorKind::Migration("api keys"))?;
        report.api_keys += 1;
    }
    tracing::info!(count = report.api_keys, "Copied API keys");

    // Files before hotlinks, so no hotlink ever points at a missing file.
    let files = source.get_all_metadata().await.or_raise(|| ErrorKind::Migration("files"))?;
    for file in files.values() {
        destination.save_metadata(file).await.or_raise(|| ErrorKind::Migration("files"))?;
        report.files += 1;
    }
    tracing::info!(count = report.files, "Copied file metadata");

    let hotlinks = source.get_all_hotlinks().await.or_raise(|| ErrorKind::Migration("hotlinks"))?;
    for hotlink in hotlinks {
        let target = source.get_hotlink(&hotlink).await.or_raise(|| ErrorKind::Migration("hotlinks"))?;
        // Deleted in the meantime.
        let Some(file_id) = target else { continue };
        destination.save_hotlink(&hotlink, &file_id).await.or_raise(|| ErrorKind::Migration("hotlinks"))?;
        report.hotlinks += 1;
    }
    tracing::info!(count = report.hotlinks, "Copied hotlinks");

    if let Some(info) = source.get_end_to_end_info().await.or_raise(|| ErrorKind::Migration("end-to-end info"))? {
        destination.save_end_to_end_info(&info).await.or_raise(|| ErrorKind::Migration("end-to-end info"))?;
        report.end_to_end_info = true;
        tracing::info!("Copied end-to-end info");
    }
    Ok(report)
}
