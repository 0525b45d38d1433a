use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::commit::{Commit, CommitId};
use crate::error::OtError;

/// Durable storage for the commit graph, its heads and snapshots.
///
/// Every method is a suspension point; implementations must be safe to call
/// from several replicas at once. The head set is the only state replicas
/// race on, and [`Repository::update_heads`] is its compare-and-swap.
#[async_trait]
pub trait Repository<D>: Send + Sync
where
    D: Send + Sync + 'static,
{
    /// Allocate an id and build a commit. Nothing is stored until [`Repository::push`].
    async fn create_commit(
        &self,
        parents: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<Commit<D>, OtError>;

    /// Store commits. Ids that are already stored are skipped.
    async fn push(&self, commits: Vec<Commit<D>>) -> Result<(), OtError>;

    /// The current head set.
    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, OtError>;

    /// Atomically mark `new_heads` as heads and `excluded_heads` as inner nodes.
    ///
    /// Fails with [`OtError::ConcurrentHeadUpdate`] and changes nothing if
    /// any id in `excluded_heads` is no longer a head.
    async fn update_heads(
        &self,
        new_heads: &BTreeSet<CommitId>,
        excluded_heads: &BTreeSet<CommitId>,
    ) -> Result<(), OtError>;

    /// Load a stored commit, failing with [`OtError::CommitNotFound`].
    async fn load_commit(&self, id: CommitId) -> Result<Commit<D>, OtError>;

    /// The snapshot stored for `id`, if any.
    async fn load_snapshot(&self, id: CommitId) -> Result<Option<Vec<D>>, OtError>;

    /// Store a squashed snapshot for `id` and set its snapshot hint.
    async fn save_snapshot(&self, id: CommitId, snapshot: Vec<D>) -> Result<(), OtError>;

    /// Delete unreachable commits older than `min_id` by the retention margin.
    ///
    /// Returns the number of commits removed.
    async fn cleanup(&self, min_id: CommitId) -> Result<usize, OtError>;

    /// Write a point-in-time copy of `commit` and its state to backup storage.
    async fn backup(&self, commit: &Commit<D>, snapshot: Vec<D>) -> Result<(), OtError>;
}

/// Ids reachable from `heads` through the parent edges in `parents`.
///
/// Used by backends to decide what `cleanup` must keep.
pub fn reachable_from<I>(heads: I, parents: impl Fn(CommitId) -> Vec<CommitId>) -> BTreeSet<CommitId>
where
    I: IntoIterator<Item = CommitId>,
{
    let mut seen = BTreeSet::new();
    let mut stack: Vec<CommitId> = heads.into_iter().collect();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(parents(id));
        }
    }
    seen
}
