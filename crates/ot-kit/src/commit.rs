//! Commit records forming the history DAG.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a commit, issued by the repository.
///
/// Ids are monotonically increasing within one repository, so their order
/// also reflects creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(u64);

impl CommitId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for CommitId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// One immutable node of the commit graph.
///
/// `parents` maps every parent to the operations that turn the parent's
/// state into this commit's state. A commit without parents is a root.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use ot_kit::{Commit, CommitId};
///
/// let root: Commit<i64> = Commit::root(CommitId::new(1));
/// assert!(root.is_root());
///
/// let child = Commit::new(
///     CommitId::new(2),
///     BTreeMap::from([(root.id, vec![5])]),
///     root.level + 1,
/// );
/// assert_eq!(child.parent_ids().collect::<Vec<_>>(), vec![CommitId::new(1)]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit<D> {
    /// Repository-issued id.
    pub id: CommitId,
    /// Diffs from each parent to this commit.
    pub parents: BTreeMap<CommitId, Vec<D>>,
    /// Longest path length from a root. Strictly greater than every parent's level.
    pub level: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Whether a materialized snapshot is stored for this commit.
    pub snapshot_hint: bool,
}

impl<D> Commit<D> {
    /// Create a commit stamped with the current time.
    pub fn new(id: CommitId, parents: BTreeMap<CommitId, Vec<D>>, level: u64) -> Self {
        Self {
            id,
            parents,
            level,
            timestamp: now_ms(),
            snapshot_hint: false,
        }
    }

    /// Create a root commit at level 1.
    pub fn root(id: CommitId) -> Self {
        Self::new(id, BTreeMap::new(), 1)
    }

    /// Override the creation timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this commit has no parents.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Iterate parent ids in ascending order.
    pub fn parent_ids(&self) -> impl Iterator<Item = CommitId> + '_ {
        self.parents.keys().copied()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
