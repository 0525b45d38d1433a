//! `ot.toml` loading.
//!
//! ```toml
//! [sync]
//! max_merge_retries = 3
//! snapshot_interval = 100
//!
//! [sqlite]
//! journal_mode = "wal"
//! delete_margin_secs = 600
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ot_kit::SyncConfig;
use ot_store::{Format, SqliteConfig};
use serde::Deserialize;
use thiserror::Error;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "ot.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid [sqlite] section: {0}")]
    Invalid(String),
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub sync: SyncConfig,
    pub sqlite: SqliteSection,
}

/// `[sqlite]` table, converted into an [`SqliteConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteSection {
    pub journal_mode: String,
    pub busy_timeout_ms: u32,
    pub page_size: u32,
    pub delete_margin_secs: u64,
    pub created_by: String,
    pub format: String,
}

impl Default for SqliteSection {
    fn default() -> Self {
        let defaults = SqliteConfig::default();
        Self {
            journal_mode: "wal".to_string(),
            busy_timeout_ms: defaults.busy_timeout_ms,
            page_size: defaults.page_size,
            delete_margin_secs: defaults.delete_margin.as_secs(),
            created_by: "ot-cli".to_string(),
            format: defaults.format.to_string(),
        }
    }
}

impl SqliteSection {
    pub fn to_sqlite_config(&self) -> Result<SqliteConfig, ConfigError> {
        let format: Format = self
            .format
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{e}")))?;
        Ok(SqliteConfig {
            journal_mode: self.journal_mode.parse().map_err(ConfigError::Invalid)?,
            busy_timeout_ms: self.busy_timeout_ms,
            page_size: self.page_size,
            delete_margin: Duration::from_secs(self.delete_margin_secs),
            created_by: self.created_by.clone(),
            format,
        })
    }
}

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CliConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `explicit` if given, else `ot.toml` if it exists, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ot_store::JournalMode;

    #[test]
    fn empty_file_uses_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        let sqlite = config.sqlite.to_sqlite_config().unwrap();
        assert_eq!(sqlite.journal_mode, JournalMode::Wal);
        assert_eq!(sqlite.delete_margin, Duration::from_secs(3600));
        assert_eq!(sqlite.format, Format::Postcard);
    }

    #[test]
    fn sections_override_defaults() {
        let config: CliConfig = toml::from_str(
            r#"
            [sync]
            max_merge_retries = 2
            snapshot_interval = 50

            [sqlite]
            journal_mode = "delete"
            delete_margin_secs = 60
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.max_merge_retries, 2);
        assert_eq!(config.sync.snapshot_interval, 50);
        assert!(config.sync.squash_on_commit);

        let sqlite = config.sqlite.to_sqlite_config().unwrap();
        assert_eq!(sqlite.journal_mode, JournalMode::Delete);
        assert_eq!(sqlite.delete_margin, Duration::from_secs(60));
        assert_eq!(sqlite.format, Format::Json);
        assert_eq!(sqlite.busy_timeout_ms, 5000);
    }

    #[test]
    fn bad_values_are_reported() {
        let config: CliConfig = toml::from_str("[sqlite]\nformat = \"cbor\"").unwrap();
        assert!(matches!(
            config.sqlite.to_sqlite_config(),
            Err(ConfigError::Invalid(_))
        ));
        let config: CliConfig = toml::from_str("[sqlite]\njournal_mode = \"off\"").unwrap();
        assert!(config.sqlite.to_sqlite_config().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ot.toml");
        std::fs::write(&path, "[sync]\nsquash_on_commit = false\n").unwrap();
        let config = CliConfig::discover(Some(&path)).unwrap();
        assert!(!config.sync.squash_on_commit);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            CliConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));
    }
}
