//! Expiry-driven collection of stale records.
//!
//! What counts as stale is decided by each backend in
//! [`Backend::run_garbage_collection`](crate::Backend::run_garbage_collection):
//!
//! - sessions whose `valid_until` has passed;
//! - files that are out of downloads or past their expiry (see
//!   [`File::is_expired`](crate::File::is_expired)), with their hotlinks;
//! - hotlinks pointing at files that no longer exist;
//! - upload statuses older than [`UPLOAD_STATUS_RETENTION`].
//!
//! Every deletion re-evaluates its condition at the moment it runs, so a
//! session renewed or a file replaced during a collection survives it.

use crate::Database;
use derive_more::Display;
use std::time::Duration;

/// How long upload progress is kept for replay to late subscribers.
pub const UPLOAD_STATUS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Records removed by one collection run.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
#[display("{sessions} sessions, {files} files, {hotlinks} hotlinks, {upload_status} upload statuses")]
pub struct CollectionStats {
    pub sessions: u64,
    pub files: u64,
    pub hotlinks: u64,
    pub upload_status: u64,
}

impl CollectionStats {
    pub fn total(&self) -> u64 {
        self.sessions + self.files + self.hotlinks + self.upload_status
    }
}

/// Run a collection every `interval`, forever.
///
/// The first run happens immediately. Failures are logged and the loop
/// carries on with the next tick; stop it by dropping or aborting the task.
pub async fn collect_periodically(db: Database, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match db.run_garbage_collection().await {
            Ok(stats) if stats.total() > 0 => tracing::info!(%stats, "Collected expired records"),
            Ok(_) => tracing::debug!("Nothing to collect"),
            Err(err) => tracing::warn!(error = ?err, "Garbage collection failed"),
        }
    }
}
