//! Repository-level algorithms: graph loading, merging, checkout and path search.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::commit::{Commit, CommitId};
use crate::config::SyncConfig;
use crate::error::OtError;
use crate::graph::{CommitGraph, Node};
use crate::repository::Repository;
use crate::system::OtSystem;

/// Diffs from a commit up to one of the heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPath<D> {
    /// The head the path ends at.
    pub head: CommitId,
    /// Level of that head.
    pub level: u64,
    /// Operations leading from the start commit to `head`, oldest first.
    pub diffs: Vec<D>,
}

/// Heap entry ordered by level, highest first.
struct ByLevel<T> {
    level: u64,
    id: CommitId,
    payload: T,
}

impl<T> PartialEq for ByLevel<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.level, self.id) == (other.level, other.id)
    }
}

impl<T> Eq for ByLevel<T> {}

impl<T> PartialOrd for ByLevel<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ByLevel<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.level, self.id).cmp(&(other.level, other.id))
    }
}

/// Merge engine bound to one algebra and one repository.
pub struct OtAlgorithms<S, R> {
    system: S,
    repository: Arc<R>,
    config: SyncConfig,
}

impl<S, R> OtAlgorithms<S, R>
where
    S: OtSystem,
    S::Op: Send + Sync + 'static,
    R: Repository<S::Op>,
{
    /// Bind an algebra to a repository with default settings.
    pub fn new(system: S, repository: Arc<R>) -> Self {
        Self::with_config(system, repository, SyncConfig::default())
    }

    /// Bind with explicit settings.
    pub fn with_config(system: S, repository: Arc<R>, config: SyncConfig) -> Self {
        Self {
            system,
            repository,
            config,
        }
    }

    /// The algebra.
    pub fn system(&self) -> &S {
        &self.system
    }

    /// The repository.
    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// The active settings.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load the part of history needed to merge `heads`.
    ///
    /// Commits are pulled highest level first until one head reaches every
    /// root of the loaded slice, which means all heads meet below it.
    ///
    /// # Errors
    ///
    /// [`OtError::DivergentHistory`] if history runs out before the heads meet.
    #[instrument(skip(self))]
    pub async fn load_graph(
        &self,
        heads: &BTreeSet<CommitId>,
    ) -> Result<CommitGraph<S::Op>, OtError> {
        let mut graph = CommitGraph::new();
        let mut queue = BinaryHeap::new();
        let mut queued: BTreeSet<CommitId> = heads.iter().copied().collect();

        for head in heads {
            let commit = self.repository.load_commit(*head).await?;
            self.enqueue_parents(&commit, &mut queue, &mut queued).await?;
            graph.add_commit(&commit);
        }

        loop {
            if heads_meet(&graph, heads) {
                debug!(heads = ?heads, "graph loaded");
                return Ok(graph);
            }
            let Some(entry) = queue.pop() else {
                return Err(OtError::DivergentHistory {
                    heads: heads.clone(),
                });
            };
            let commit: Commit<S::Op> = entry.payload;
            self.enqueue_parents(&commit, &mut queue, &mut queued).await?;
            graph.add_commit(&commit);
        }
    }

    async fn enqueue_parents(
        &self,
        commit: &Commit<S::Op>,
        queue: &mut BinaryHeap<ByLevel<Commit<S::Op>>>,
        queued: &mut BTreeSet<CommitId>,
    ) -> Result<(), OtError> {
        for parent in commit.parent_ids() {
            if queued.insert(parent) {
                let loaded = self.repository.load_commit(parent).await?;
                queue.push(ByLevel {
                    level: loaded.level,
                    id: loaded.id,
                    payload: loaded,
                });
            }
        }
        Ok(())
    }

    /// Compute the catch-up diffs of every head and the level of their merge.
    pub async fn merge(
        &self,
        heads: &BTreeSet<CommitId>,
    ) -> Result<(BTreeMap<CommitId, Vec<S::Op>>, u64), OtError> {
        let mut graph = self.load_graph(heads).await?;
        let nodes: BTreeSet<Node> = heads.iter().copied().map(Node::Commit).collect();
        let merged = graph.merge(&self.system, &nodes)?;

        let level = heads
            .iter()
            .filter_map(|head| graph.level(*head))
            .max()
            .unwrap_or(0)
            + 1;
        let parents = merged
            .into_iter()
            .filter_map(|(node, diffs)| node.commit_id().map(|id| (id, diffs)))
            .collect();
        Ok((parents, level))
    }

    /// Merge all current heads into one commit and publish it.
    ///
    /// Returns the single head afterwards. A lost compare-and-swap on the
    /// head set is retried up to `max_merge_retries` times; the merge commit
    /// of a lost attempt stays unreachable and is reclaimed by cleanup.
    #[instrument(skip(self))]
    pub async fn merge_heads_and_push(&self) -> Result<CommitId, OtError> {
        let mut attempt = 0;
        loop {
            let heads = self.repository.get_heads().await?;
            match heads.len() {
                0 => return Err(OtError::NoHeads),
                1 => return heads.into_iter().next().ok_or(OtError::NoHeads),
                _ => {}
            }

            let (parents, level) = self.merge(&heads).await?;
            let commit = self.repository.create_commit(parents, level).await?;
            let id = commit.id;
            self.repository.push(vec![commit]).await?;

            match self
                .repository
                .update_heads(&BTreeSet::from([id]), &heads)
                .await
            {
                Ok(()) => {
                    info!(%id, merged = heads.len(), "merged heads");
                    return Ok(id);
                }
                Err(OtError::ConcurrentHeadUpdate { stale }) if attempt < self.config.max_merge_retries => {
                    attempt += 1;
                    warn!(%id, ?stale, attempt, "heads moved during merge, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Heads that are not ancestors of other heads.
    pub async fn exclude_parents(
        &self,
        heads: &BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>, OtError> {
        let graph = self.load_graph(heads).await?;
        let nodes: BTreeSet<Node> = heads.iter().copied().map(Node::Commit).collect();
        Ok(graph
            .exclude_parents(&nodes)
            .into_iter()
            .filter_map(Node::commit_id)
            .collect())
    }

    /// Full state at `id` as a squashed operation list.
    ///
    /// Replays from the nearest ancestor that has a snapshot; a root counts
    /// as the empty snapshot.
    #[instrument(skip(self))]
    pub async fn checkout(&self, id: CommitId) -> Result<Vec<S::Op>, OtError> {
        let start = self.repository.load_commit(id).await?;
        let mut queue = BinaryHeap::from([ByLevel {
            level: start.level,
            id: start.id,
            payload: (start, Vec::new()),
        }]);
        let mut seen = BTreeSet::from([id]);

        while let Some(ByLevel {
            payload: (commit, suffix),
            ..
        }) = queue.pop()
        {
            if commit.snapshot_hint {
                if let Some(mut snapshot) = self.repository.load_snapshot(commit.id).await? {
                    debug!(%id, from = %commit.id, replayed = suffix.len(), "checkout from snapshot");
                    snapshot.extend(suffix);
                    return Ok(self.system.squash(&snapshot));
                }
                warn!(id = %commit.id, "snapshot hint set but no snapshot stored");
            }
            if commit.is_root() {
                debug!(%id, root = %commit.id, replayed = suffix.len(), "checkout from root");
                return Ok(self.system.squash(&suffix));
            }
            for (parent, diffs) in &commit.parents {
                if !seen.insert(*parent) {
                    continue;
                }
                let loaded = self.repository.load_commit(*parent).await?;
                let mut path = diffs.clone();
                path.extend(suffix.iter().cloned());
                queue.push(ByLevel {
                    level: loaded.level,
                    id: loaded.id,
                    payload: (loaded, path),
                });
            }
        }
        Err(OtError::SnapshotNotFound(id))
    }

    /// Diffs from `target` up to the first of `heads` that descends from it.
    ///
    /// Commits at or below `target`'s level are never expanded.
    #[instrument(skip(self))]
    pub async fn find_path(
        &self,
        heads: &BTreeSet<CommitId>,
        target: CommitId,
    ) -> Result<FoundPath<S::Op>, OtError> {
        let target_level = self.repository.load_commit(target).await?.level;
        let mut queue = BinaryHeap::new();
        let mut seen = BTreeSet::new();
        for head in heads {
            let commit = self.repository.load_commit(*head).await?;
            seen.insert(commit.id);
            queue.push(ByLevel {
                level: commit.level,
                id: commit.id,
                payload: (commit.id, commit.level, commit, Vec::new()),
            });
        }

        while let Some(ByLevel {
            payload: (head, head_level, commit, suffix),
            ..
        }) = queue.pop()
        {
            if commit.id == target {
                return Ok(FoundPath {
                    head,
                    level: head_level,
                    diffs: suffix,
                });
            }
            if commit.level <= target_level {
                continue;
            }
            for (parent, diffs) in &commit.parents {
                if !seen.insert(*parent) {
                    continue;
                }
                let loaded = self.repository.load_commit(*parent).await?;
                let mut path = diffs.clone();
                path.extend(suffix.iter().cloned());
                queue.push(ByLevel {
                    level: loaded.level,
                    id: loaded.id,
                    payload: (head, head_level, loaded, path),
                });
            }
        }
        Err(OtError::CommitNotFound(target))
    }

    /// Materialize `id` and store it as a snapshot.
    pub async fn save_snapshot(&self, id: CommitId) -> Result<(), OtError> {
        let snapshot = self.checkout(id).await?;
        info!(%id, ops = snapshot.len(), "saving snapshot");
        self.repository.save_snapshot(id, snapshot).await
    }

    /// Materialize `id` and write it to the backup store.
    pub async fn backup(&self, id: CommitId) -> Result<(), OtError> {
        let commit = self.repository.load_commit(id).await?;
        let snapshot = self.checkout(id).await?;
        self.repository.backup(&commit, snapshot).await
    }
}

fn heads_meet<D: Clone>(graph: &CommitGraph<D>, heads: &BTreeSet<CommitId>) -> bool {
    let per_head: Vec<BTreeSet<Node>> = heads
        .iter()
        .map(|head| graph.roots(Node::Commit(*head)))
        .collect();
    let all: BTreeSet<Node> = per_head.iter().flatten().copied().collect();
    per_head.iter().any(|roots| *roots == all)
}
