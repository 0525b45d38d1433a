use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::commit::{Commit, CommitId};
use crate::error::OtError;
use crate::repository::{reachable_from, Repository};

/// In-memory repository backed by ordered maps.
///
/// Ideal for tests and for replicas sharing one process. Cloning is not
/// supported; share it behind an `Arc`.
///
/// # Example
///
/// ```
/// # tokio_test_block(async {
/// use std::collections::{BTreeMap, BTreeSet};
/// use ot_kit::{MemoryRepository, Repository};
///
/// let repo: MemoryRepository<i64> = MemoryRepository::new();
/// let root = repo.create_commit(BTreeMap::new(), 1).await?;
/// repo.push(vec![root.clone()]).await?;
/// repo.update_heads(&BTreeSet::from([root.id]), &BTreeSet::new()).await?;
///
/// assert_eq!(repo.get_heads().await?, BTreeSet::from([root.id]));
/// # Ok::<(), ot_kit::OtError>(())
/// # }).unwrap();
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct MemoryRepository<D> {
    inner: Mutex<Inner<D>>,
    delete_margin: Duration,
}

struct Inner<D> {
    next_id: u64,
    commits: BTreeMap<CommitId, Commit<D>>,
    heads: BTreeSet<CommitId>,
    snapshots: BTreeMap<CommitId, Vec<D>>,
    backups: BTreeMap<CommitId, (u64, Vec<D>)>,
}

/// Default retention margin applied by `cleanup`.
pub const DEFAULT_DELETE_MARGIN: Duration = Duration::from_secs(60 * 60);

impl<D> MemoryRepository<D> {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                commits: BTreeMap::new(),
                heads: BTreeSet::new(),
                snapshots: BTreeMap::new(),
                backups: BTreeMap::new(),
            }),
            delete_margin: DEFAULT_DELETE_MARGIN,
        }
    }

    /// Set the retention margin used by `cleanup`.
    #[must_use]
    pub fn with_delete_margin(mut self, margin: Duration) -> Self {
        self.delete_margin = margin;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<D>>, OtError> {
        self.inner
            .lock()
            .map_err(|_| OtError::storage("memory repository lock poisoned"))
    }

    /// Number of stored commits.
    pub fn commit_count(&self) -> Result<usize, OtError> {
        Ok(self.lock()?.commits.len())
    }

    /// Whether a commit is stored.
    pub fn contains(&self, id: CommitId) -> Result<bool, OtError> {
        Ok(self.lock()?.commits.contains_key(&id))
    }

    /// The backup written for `id`: its level and state.
    pub fn load_backup(&self, id: CommitId) -> Result<Option<(u64, Vec<D>)>, OtError>
    where
        D: Clone,
    {
        Ok(self.lock()?.backups.get(&id).cloned())
    }
}

impl<D> Default for MemoryRepository<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> Repository<D> for MemoryRepository<D>
where
    D: Clone + Send + Sync + 'static,
{
    async fn create_commit(
        &self,
        parents: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<Commit<D>, OtError> {
        let mut inner = self.lock()?;
        let id = CommitId::new(inner.next_id);
        inner.next_id += 1;
        Ok(Commit::new(id, parents, level))
    }

    async fn push(&self, commits: Vec<Commit<D>>) -> Result<(), OtError> {
        let mut inner = self.lock()?;
        for commit in commits {
            // keep id allocation ahead of externally built commits
            inner.next_id = inner.next_id.max(commit.id.get() + 1);
            if let Some(stored) = inner.commits.get(&commit.id) {
                debug!(id = %stored.id, "commit already stored");
                continue;
            }
            debug!(id = %commit.id, level = commit.level, "stored commit");
            inner.commits.insert(commit.id, commit);
        }
        Ok(())
    }

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, OtError> {
        Ok(self.lock()?.heads.clone())
    }

    async fn update_heads(
        &self,
        new_heads: &BTreeSet<CommitId>,
        excluded_heads: &BTreeSet<CommitId>,
    ) -> Result<(), OtError> {
        let mut inner = self.lock()?;
        let stale: BTreeSet<CommitId> = excluded_heads
            .iter()
            .filter(|id| !inner.heads.contains(*id))
            .copied()
            .collect();
        if !stale.is_empty() {
            return Err(OtError::ConcurrentHeadUpdate { stale });
        }
        if let Some(missing) = new_heads.iter().find(|id| !inner.commits.contains_key(*id)) {
            return Err(OtError::CommitNotFound(*missing));
        }
        for id in excluded_heads {
            inner.heads.remove(id);
        }
        inner.heads.extend(new_heads.iter().copied());
        debug!(heads = ?inner.heads, "heads updated");
        Ok(())
    }

    async fn load_commit(&self, id: CommitId) -> Result<Commit<D>, OtError> {
        self.lock()?
            .commits
            .get(&id)
            .cloned()
            .ok_or(OtError::CommitNotFound(id))
    }

    async fn load_snapshot(&self, id: CommitId) -> Result<Option<Vec<D>>, OtError> {
        Ok(self.lock()?.snapshots.get(&id).cloned())
    }

    async fn save_snapshot(&self, id: CommitId, snapshot: Vec<D>) -> Result<(), OtError> {
        let mut inner = self.lock()?;
        let commit = inner
            .commits
            .get_mut(&id)
            .ok_or(OtError::CommitNotFound(id))?;
        commit.snapshot_hint = true;
        inner.snapshots.insert(id, snapshot);
        Ok(())
    }

    async fn cleanup(&self, min_id: CommitId) -> Result<usize, OtError> {
        let mut inner = self.lock()?;
        let min_timestamp = inner
            .commits
            .get(&min_id)
            .ok_or(OtError::CommitNotFound(min_id))?
            .timestamp;
        let threshold = min_timestamp.saturating_sub(self.delete_margin.as_millis() as u64);

        let live = reachable_from(inner.heads.iter().copied(), |id| {
            inner
                .commits
                .get(&id)
                .map(|c| c.parent_ids().collect())
                .unwrap_or_default()
        });
        let doomed: Vec<CommitId> = inner
            .commits
            .values()
            .filter(|c| c.timestamp < threshold && !live.contains(&c.id))
            .map(|c| c.id)
            .collect();
        for id in &doomed {
            inner.commits.remove(id);
            inner.snapshots.remove(id);
        }
        info!(removed = doomed.len(), %min_id, "cleanup finished");
        Ok(doomed.len())
    }

    async fn backup(&self, commit: &Commit<D>, snapshot: Vec<D>) -> Result<(), OtError> {
        self.lock()?
            .backups
            .insert(commit.id, (commit.level, snapshot));
        Ok(())
    }
}
