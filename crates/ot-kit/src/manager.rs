//! Per-replica synchronization facade.
//!
//! A [`StateManager`] owns one materialized state, the commit it is based
//! on and the local operations not yet shared. Replicas never share memory;
//! they meet only through the repository.
//!
//! ```text
//! Uninitialized --checkout--> CheckedOut --add--> CheckedOut (working ops)
//!                                  ^                    |
//!                                  +------- sync -------+
//! CheckedOut --fatal error--> Failed --checkout--> CheckedOut
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::algorithms::{FoundPath, OtAlgorithms};
use crate::commit::{Commit, CommitId};
use crate::config::SyncConfig;
use crate::error::OtError;
use crate::repository::Repository;
use crate::state::{replay, OtState};
use crate::system::OtSystem;

/// Lifecycle of a [`StateManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    /// No checkout has happened yet.
    Uninitialized,
    /// State reflects a commit plus local operations.
    CheckedOut,
    /// A fatal error occurred; only a new checkout recovers.
    Failed,
}

/// Synchronizes one replica's state with a shared repository.
///
/// # Example
///
/// ```
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use std::collections::{BTreeMap, BTreeSet};
/// use std::sync::Arc;
/// use ot_kit::counter::{CounterOp, CounterSystem};
/// use ot_kit::{MemoryRepository, Repository, StateManager};
///
/// let repo = Arc::new(MemoryRepository::new());
/// let root = repo.create_commit(BTreeMap::new(), 1).await?;
/// repo.push(vec![root.clone()]).await?;
/// repo.update_heads(&BTreeSet::from([root.id]), &BTreeSet::new()).await?;
///
/// let mut alice = StateManager::new(CounterSystem, repo.clone(), 0i64);
/// let mut bob = StateManager::new(CounterSystem, repo.clone(), 0i64);
/// alice.checkout().await?;
/// bob.checkout().await?;
///
/// alice.add(CounterOp::Add(2))?;
/// bob.add(CounterOp::Add(3))?;
/// alice.sync().await?;
/// bob.sync().await?;
/// alice.pull().await?;
///
/// assert_eq!(*alice.state(), 5);
/// assert_eq!(*bob.state(), 5);
/// # Ok::<(), ot_kit::OtError>(())
/// # }).unwrap();
/// ```
pub struct StateManager<S: OtSystem, R, St> {
    algorithms: OtAlgorithms<S, R>,
    state: St,
    status: ManagerStatus,
    revision: Option<CommitId>,
    level: u64,
    working: Vec<S::Op>,
    pending: Vec<Commit<S::Op>>,
    // published local work that has not been merged into a single head yet
    unmerged: bool,
}

impl<S, R, St> StateManager<S, R, St>
where
    S: OtSystem,
    S::Op: Send + Sync + 'static,
    R: Repository<S::Op>,
    St: OtState<S::Op>,
{
    /// Create an unchecked-out manager with default settings.
    pub fn new(system: S, repository: Arc<R>, state: St) -> Self {
        Self::with_config(system, repository, state, SyncConfig::default())
    }

    /// Create an unchecked-out manager.
    pub fn with_config(system: S, repository: Arc<R>, state: St, config: SyncConfig) -> Self {
        Self {
            algorithms: OtAlgorithms::with_config(system, repository, config),
            state,
            status: ManagerStatus::Uninitialized,
            revision: None,
            level: 0,
            working: Vec::new(),
            pending: Vec::new(),
            unmerged: false,
        }
    }

    /// The materialized state, including local operations.
    pub fn state(&self) -> &St {
        &self.state
    }

    /// The commit the state is based on, including unpublished local commits.
    pub fn revision(&self) -> Option<CommitId> {
        self.revision
    }

    /// Level of [`StateManager::revision`].
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Local operations not yet committed.
    pub fn working(&self) -> &[S::Op] {
        &self.working
    }

    /// Local commits created but not yet published.
    pub fn pending(&self) -> &[Commit<S::Op>] {
        &self.pending
    }

    /// Whether there is local work the repository has not seen.
    pub fn has_pending_changes(&self) -> bool {
        !self.working.is_empty() || !self.pending.is_empty()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ManagerStatus {
        self.status
    }

    /// The merge engine this manager drives.
    pub fn algorithms(&self) -> &OtAlgorithms<S, R> {
        &self.algorithms
    }

    /// Check out the newest head.
    ///
    /// Discards local operations and unpublished commits.
    pub async fn checkout(&mut self) -> Result<CommitId, OtError> {
        let heads = self.algorithms.repository().get_heads().await?;
        let head = heads.iter().next_back().copied().ok_or(OtError::NoHeads)?;
        self.checkout_at(head).await?;
        Ok(head)
    }

    /// Check out a specific commit.
    ///
    /// Nothing changes unless the whole checkout succeeds.
    pub async fn checkout_at(&mut self, id: CommitId) -> Result<(), OtError> {
        let ops = self.algorithms.checkout(id).await?;
        let commit = self.algorithms.repository().load_commit(id).await?;

        self.state.init();
        replay(&mut self.state, &ops);
        self.revision = Some(id);
        self.level = commit.level;
        self.working.clear();
        self.pending.clear();
        self.unmerged = false;
        self.status = ManagerStatus::CheckedOut;
        debug!(%id, level = commit.level, ops = ops.len(), "checked out");
        Ok(())
    }

    /// Apply a local operation and buffer it for the next commit.
    pub fn add(&mut self, op: S::Op) -> Result<(), OtError> {
        self.ready()?;
        if self.algorithms.system().is_empty(&op) {
            return Ok(());
        }
        self.state.apply(&op);
        self.working.push(op);
        Ok(())
    }

    /// Apply several local operations in order.
    pub fn add_all(&mut self, ops: impl IntoIterator<Item = S::Op>) -> Result<(), OtError> {
        for op in ops {
            self.add(op)?;
        }
        Ok(())
    }

    /// Undo every uncommitted local operation.
    pub fn reset(&mut self) -> Result<(), OtError> {
        self.ready()?;
        let undo = self.algorithms.system().invert(&self.working);
        replay(&mut self.state, &undo);
        self.working.clear();
        Ok(())
    }

    /// Turn the working operations into an unpublished commit.
    ///
    /// Returns `None` if there was nothing to commit.
    pub async fn commit(&mut self) -> Result<Option<CommitId>, OtError> {
        let parent = self.ready()?;
        let system = self.algorithms.system();
        let ops = if self.algorithms.config().squash_on_commit {
            system.squash(&self.working)
        } else {
            self.working.clone()
        };
        if ops.is_empty() {
            self.working.clear();
            return Ok(None);
        }

        let parents = [(parent, ops)].into_iter().collect();
        let commit = self
            .algorithms
            .repository()
            .create_commit(parents, self.level + 1)
            .await?;
        let id = commit.id;
        self.working.clear();
        self.revision = Some(id);
        self.level = commit.level;
        self.pending.push(commit);
        debug!(%id, %parent, "committed local operations");
        Ok(Some(id))
    }

    /// Publish unpublished commits and make the newest one a head.
    pub async fn push(&mut self) -> Result<(), OtError> {
        self.ready()?;
        let (Some(first), Some(tip)) = (self.pending.first(), self.pending.last()) else {
            return Ok(());
        };
        let base: BTreeSet<CommitId> = first.parent_ids().collect();
        let tip = BTreeSet::from([tip.id]);

        let repository = self.algorithms.repository();
        repository.push(self.pending.clone()).await?;
        match repository.update_heads(&tip, &base).await {
            Ok(()) => {}
            Err(OtError::ConcurrentHeadUpdate { stale }) => {
                // the base already has another child; an inner commit never becomes a head again
                debug!(?stale, "base consumed by another replica");
                repository.update_heads(&tip, &BTreeSet::new()).await?;
            }
            Err(err) => return Err(err),
        }
        info!(commits = self.pending.len(), head = ?tip, "pushed");
        self.pending.clear();
        Ok(())
    }

    /// Diffs from the current revision to a head of the repository.
    pub async fn fetch(&mut self) -> Result<FoundPath<S::Op>, OtError> {
        let revision = self.ready()?;
        let heads = self.algorithms.repository().get_heads().await?;
        let result = self.algorithms.find_path(&heads, revision).await;
        self.guard(result)
    }

    /// Fetch and rebase local work on top of a head.
    ///
    /// Publishes unpublished commits first. Returns whether the revision moved.
    pub async fn pull(&mut self) -> Result<bool, OtError> {
        self.ready()?;
        self.push().await?;
        let found = self.fetch().await?;
        if Some(found.head) == self.revision {
            return Ok(false);
        }
        let result = self.rebase(found);
        self.guard(result)?;
        Ok(true)
    }

    async fn pull_to(&mut self, head: CommitId) -> Result<(), OtError> {
        let revision = self.ready()?;
        if head == revision {
            return Ok(());
        }
        let result = self
            .algorithms
            .find_path(&BTreeSet::from([head]), revision)
            .await;
        let found = self.guard(result)?;
        let result = self.rebase(found);
        self.guard(result)
    }

    fn rebase(&mut self, found: FoundPath<S::Op>) -> Result<(), OtError> {
        let system = self.algorithms.system();
        let working = system.squash(&self.working);
        let fetched = system.squash(&found.diffs);
        let transformed = system.transform(&working, &fetched)?;

        replay(&mut self.state, &transformed.right);
        self.working = transformed.left;
        self.revision = Some(found.head);
        self.level = found.level;
        debug!(head = %found.head, fetched = fetched.len(), "rebased");
        Ok(())
    }

    /// Commit local work, publish it, merge concurrent heads and catch up.
    ///
    /// Succeeds immediately when there is no local work and the previous
    /// sync finished. On a retriable error the state, working operations and
    /// unpublished commits are kept and a later `sync` resumes where this one
    /// stopped, including a merge that did not complete.
    pub async fn sync(&mut self) -> Result<CommitId, OtError> {
        let revision = self.ready()?;
        if !self.has_pending_changes() && !self.unmerged {
            return Ok(revision);
        }

        self.commit().await?;
        self.push().await?;
        self.unmerged = true;
        let result = self.algorithms.merge_heads_and_push().await;
        let head = self.guard(result)?;
        self.pull_to(head).await?;
        self.unmerged = false;

        let level = self.level;
        if self.algorithms.config().snapshot_due(level) {
            if let Err(err) = self.algorithms.save_snapshot(head).await {
                warn!(%head, error = %err, "automatic snapshot failed");
            }
        }
        info!(%head, level, "synced");
        Ok(head)
    }

    /// Store a snapshot of the current revision, publishing local commits first.
    pub async fn save_snapshot(&mut self) -> Result<(), OtError> {
        self.push().await?;
        let revision = self.ready()?;
        self.algorithms.save_snapshot(revision).await
    }

    fn ready(&self) -> Result<CommitId, OtError> {
        match (self.status, self.revision) {
            (ManagerStatus::CheckedOut, Some(revision)) => Ok(revision),
            (ManagerStatus::Failed, _) => Err(OtError::Invalidated),
            _ => Err(OtError::NotCheckedOut),
        }
    }

    fn guard<T>(&mut self, result: Result<T, OtError>) -> Result<T, OtError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(error = %err, "state manager invalidated");
                self.status = ManagerStatus::Failed;
            }
        }
        result
    }
}
