//! Schema version tracking and in-place upgrade.

use crate::backend::Backend;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use tracing::instrument;

/// Schema version this build reads and writes.
///
/// - `1`: base entity tables / key layout.
/// - `2`: upload status persistence.
/// - `3`: hotlink lookup by file (SQLite index).
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Outcome of an [`upgrade`] run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UpgradeReport {
    pub from: u32,
    pub to: u32,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Bring a backend up to [`CURRENT_SCHEMA_VERSION`].
///
/// Steps run in increasing order and the stored version is written after each
/// one, so an interrupted upgrade resumes where it stopped. A store already at
/// the current version is left alone; a newer store is refused.
#[instrument("upgrading schema", skip(backend), fields(backend = backend.name()))]
pub async fn upgrade(backend: &dyn Backend) -> Result<UpgradeReport> {
    let from = backend.get_db_version().await?;
    let target = backend.get_schema_version();
    if from > target {
        exn::bail!(ErrorKind::UnsupportedVersion(from, target));
    }
    for version in from..target {
        tracing::info!(from = version, to = version + 1, "Applying schema upgrade");
        backend.apply_upgrade(version).await.or_raise(|| ErrorKind::Upgrade(version))?;
        backend.set_db_version(version + 1).await.or_raise(|| ErrorKind::Upgrade(version))?;
    }
    Ok(UpgradeReport { from, to: target })
}
