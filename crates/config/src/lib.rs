//! Layered configuration for folio.
//!
//! Values are resolved in order, later layers overriding earlier ones:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. A configuration file (TOML, YAML or JSON, chosen by extension).
//! 3. Environment variables prefixed with `FOLIO_`, using `__` to separate
//!    nested keys (e.g. `FOLIO_PAGE_CACHE__MAX_BYTES=268435456`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FOLIO_";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub page_cache: PageCacheConfig,
    pub prefetch: PrefetchConfig,
    pub solid: SolidConfig,
    pub index: IndexConfig,
    pub workers: WorkersConfig,
}

/// Directory scanning defaults, used when a stream is opened without
/// explicit options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    /// Entries per batch. Clamped to `15..=50` by the scanner.
    pub batch_size: usize,
    pub skip_hidden: bool,
    pub recursive: bool,
}
impl Default for ScannerConfig {
    fn default() -> Self {
        Self { batch_size: 15, skip_hidden: true, recursive: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageCacheConfig {
    pub max_bytes: u64,
}
impl Default for PageCacheConfig {
    fn default() -> Self {
        Self { max_bytes: 256 * MIB }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Pages fetched in the direction of travel.
    pub ahead: usize,
    /// Pages fetched against the direction of travel.
    pub behind: usize,
    pub concurrency: usize,
}
impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { enabled: true, ahead: 3, behind: 1, concurrency: 2 }
    }
}

/// Background extraction of archives without random access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SolidConfig {
    /// Entries larger than this are written to a temporary file instead of
    /// being held in memory.
    pub memory_threshold: u64,
    /// Upper bound on the bytes one extraction holds in memory.
    pub memory_budget: u64,
    pub timeout_secs: u64,
    /// Where spill files go. Defaults to the system temporary directory.
    pub temp_dir: Option<PathBuf>,
}
impl Default for SolidConfig {
    fn default() -> Self {
        Self { memory_threshold: 10 * MIB, memory_budget: 500 * MIB, timeout_secs: 120, temp_dir: None }
    }
}
impl SolidConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub enabled: bool,
    pub database: PathBuf,
    /// Maximum number of directory snapshots kept.
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
    /// Recency credit, in seconds, that each recorded access earns a
    /// snapshot when choosing what to evict.
    pub frequency_weight_secs: u64,
}
impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database: default_database_path(),
            capacity: 1_000,
            ttl_secs: None,
            frequency_weight_secs: 60,
        }
    }
}
impl IndexConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn frequency_weight(&self) -> Duration {
        Duration::from_secs(self.frequency_weight_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    /// Scans and extractions running at once.
    pub max_concurrency: usize,
}
impl Default for WorkersConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "folio")
}

/// Location of the snapshot index when none is configured.
pub fn default_database_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("folio"))
        .join("index.sqlite")
}

/// Location of the configuration file read when no path is given.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Build the layered provider without extracting it.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };
        let figment = match file {
            Some(file) => {
                tracing::debug!(path = %file.display(), "reading configuration file");
                let extension = file.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
                match extension.as_str() {
                    "toml" => figment.merge(Toml::file(&file)),
                    "yaml" | "yml" => figment.merge(Yaml::file(&file)),
                    "json" => figment.merge(Json::file(&file)),
                    _ => exn::bail!(ErrorKind::UnsupportedFormat(file.display().to_string())),
                }
            },
            None => figment,
        };
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| exn::Exn::from(ErrorKind::Invalid(message.to_string()));
        if self.page_cache.max_bytes == 0 {
            return Err(invalid("page_cache.max_bytes must be greater than zero"));
        }
        if self.solid.memory_budget == 0 {
            return Err(invalid("solid.memory_budget must be greater than zero"));
        }
        if self.solid.memory_threshold > self.solid.memory_budget {
            return Err(invalid("solid.memory_threshold must not exceed solid.memory_budget"));
        }
        if self.solid.timeout_secs == 0 {
            return Err(invalid("solid.timeout_secs must be greater than zero"));
        }
        if self.prefetch.enabled && self.prefetch.concurrency == 0 {
            return Err(invalid("prefetch.concurrency must be greater than zero"));
        }
        if self.index.capacity == 0 {
            return Err(invalid("index.capacity must be greater than zero"));
        }
        if self.workers.max_concurrency == 0 {
            return Err(invalid("workers.max_concurrency must be greater than zero"));
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
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_default_database_path() {
        assert!(default_database_path().ends_with("index.sqlite"));
    }

    #[rstest]
    #[case("folio.toml", "[page_cache]\nmax_bytes = 1024\n[prefetch]\nahead = 5\n")]
    #[case("folio.yaml", "page_cache:\n  max_bytes: 1024\nprefetch:\n  ahead: 5\n")]
    #[case("folio.json", r#"{"page_cache": {"max_bytes": 1024}, "prefetch": {"ahead": 5}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.page_cache.max_bytes, 1024);
        assert_eq!(config.prefetch.ahead, 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.prefetch.behind, PrefetchConfig::default().behind);
        assert_eq!(config.index.capacity, IndexConfig::default().capacity);
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("folio.toml", "[solid]\ntimeout_secs = 30\nmemory_threshold = 1024\n")?;
            jail.set_env("FOLIO_SOLID__TIMEOUT_SECS", "45");
            jail.set_env("FOLIO_SCANNER__RECURSIVE", "true");
            let config = Config::load(Some(Path::new("folio.toml"))).unwrap();
            assert_eq!(config.solid.timeout(), Duration::from_secs(45));
            assert_eq!(config.solid.memory_threshold, 1024);
            assert!(config.scanner.recursive);
            Ok(())
        });
    }

    #[test]
    fn test_explicit_missing_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.ini");
        std::fs::write(&path, "max_bytes=1").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(&path, "[page_cache]\nmax_bytes = \"lots\"\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load));
    }

    #[rstest]
    #[case::zero_cache(|c: &mut Config| c.page_cache.max_bytes = 0)]
    #[case::zero_budget(|c: &mut Config| { c.solid.memory_budget = 0; c.solid.memory_threshold = 0 })]
    #[case::threshold_over_budget(|c: &mut Config| c.solid.memory_threshold = c.solid.memory_budget + 1)]
    #[case::zero_timeout(|c: &mut Config| c.solid.timeout_secs = 0)]
    #[case::zero_prefetch_concurrency(|c: &mut Config| c.prefetch.concurrency = 0)]
    #[case::zero_capacity(|c: &mut Config| c.index.capacity = 0)]
    #[case::zero_workers(|c: &mut Config| c.workers.max_concurrency = 0)]
    fn test_validation_rejects(#[case] mutate: fn(&mut Config)) {
        let mut config = Config::default();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_disabled_prefetch_ignores_concurrency() {
        let mut config = Config::default();
        config.prefetch.enabled = false;
        config.prefetch.concurrency = 0;
        config.validate().unwrap();
    }
}
