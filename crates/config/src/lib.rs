//! Layered configuration for the parcel tooling.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. built-in defaults;
//! 2. a TOML file, either the path given explicitly or `config.toml` in the
//!    platform configuration directory (skipped when it does not exist);
//! 3. environment variables prefixed with `PARCEL_`, where `__` separates
//!    nested keys (`PARCEL_DATABASE__URL`, `PARCEL_GC__INTERVAL`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "PARCEL_";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/parcel.sqlite";
const DEFAULT_GC_INTERVAL_SECS: u64 = 60 * 60;

// Unknown top-level keys are tolerated: every `PARCEL_*` variable lands here.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gc: GcConfig,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string, `sqlite://<path>` or `redis://...`.
    pub url: String,
    /// Refuse to create a SQLite file that does not exist yet.
    pub strict: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: DEFAULT_DATABASE_URL.to_string(), strict: false }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Seconds between collection runs in watch mode.
    pub interval: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_GC_INTERVAL_SECS }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// `config.toml` inside the platform configuration directory, if the
/// platform has one.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "parcel").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// The merged provider stack, before extraction.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path.map(Path::to_path_buf).or_else(default_path) {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                figment = figment.merge(Toml::file(path));
            },
            Some(path) => tracing::debug!(path = %path.display(), "No configuration file found"),
            None => {},
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(path))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("database.url", "must not be empty"));
        }
        if self.gc.interval == 0 {
            exn::bail!(ErrorKind::Invalid("gc.interval", "must be at least one second"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert!(!config.database.strict);
        assert_eq!(config.gc.interval(), Duration::from_secs(3600));
        config.validate().unwrap();
    }

    #[test]
    fn test_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "parcel.toml",
                r#"
                    [database]
                    url = "redis://localhost:6379/?prefix=p_"
                    strict = true

                    [gc]
                    interval = 120
                "#,
            )?;
            jail.set_env("PARCEL_GC__INTERVAL", "30");
            let config = Config::load(Some(Path::new("parcel.toml"))).unwrap();
            assert_eq!(config.database.url, "redis://localhost:6379/?prefix=p_");
            assert!(config.database.strict);
            assert_eq!(config.gc.interval, 30);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_| {
            let config = Config::load(Some(Path::new("does-not-exist.toml"))).unwrap();
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("parcel.toml", "[database]\nuri = \"sqlite://typo\"\n")?;
            let err = Config::load(Some(Path::new("parcel.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }

    #[rstest]
    #[case("[database]\nurl = \"\"\n", "database.url")]
    #[case("[database]\nurl = \"   \"\n", "database.url")]
    #[case("[gc]\ninterval = 0\n", "gc.interval")]
    fn test_validation(#[case] contents: &str, #[case] field: &str) {
        Jail::expect_with(|jail| {
            jail.create_file("parcel.toml", contents)?;
            let err = Config::load(Some(Path::new("parcel.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(name, _) if *name == field));
            Ok(())
        });
    }

    #[test]
    fn test_unrelated_env_is_ignored() {
        Jail::expect_with(|jail| {
            jail.set_env("PARCEL_TEST_REDIS", "redis://localhost");
            jail.set_env("PARCEL_DATABASE__STRICT", "true");
            let config = Config::load(Some(Path::new("none.toml"))).unwrap();
            assert!(config.database.strict);
            Ok(())
        });
    }
}
