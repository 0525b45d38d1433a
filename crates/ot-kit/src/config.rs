use serde::{Deserialize, Serialize};

/// Tuning knobs for merging and synchronization.
///
/// Deserializable so applications can keep it in their own config files;
/// missing fields take their defaults.
///
/// # Example
///
/// ```
/// use ot_kit::SyncConfig;
///
/// let config = SyncConfig::default()
///     .with_max_merge_retries(2)
///     .with_snapshot_interval(50);
/// assert_eq!(config.max_merge_retries, 2);
/// assert!(config.squash_on_commit);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many times a merge is retried after losing a head update race.
    pub max_merge_retries: u32,
    /// Save a snapshot after `sync` whenever the new level is a multiple of
    /// this value. Zero disables automatic snapshots.
    pub snapshot_interval: u64,
    /// Squash local operations before committing them.
    pub squash_on_commit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_merge_retries: 5,
            snapshot_interval: 0,
            squash_on_commit: true,
        }
    }
}

impl SyncConfig {
    /// Set the merge retry bound.
    #[must_use]
    pub fn with_max_merge_retries(mut self, retries: u32) -> Self {
        self.max_merge_retries = retries;
        self
    }

    /// Set the automatic snapshot interval.
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Enable or disable squashing on commit.
    #[must_use]
    pub fn with_squash_on_commit(mut self, squash: bool) -> Self {
        self.squash_on_commit = squash;
        self
    }

    pub(crate) fn snapshot_due(&self, level: u64) -> bool {
        self.snapshot_interval != 0 && level % self.snapshot_interval == 0
    }
}
