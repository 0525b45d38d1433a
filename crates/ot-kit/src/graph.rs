//! In-memory commit graph and the merge algorithm that runs on it.
//!
//! Commits live in an arena keyed by [`Node`]; edges are stored as
//! `child -> parent -> diffs`. Merging adds virtual [`Node::Merge`] nodes
//! for intermediate results, so the loaded commits are never modified.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use tracing::trace;

use crate::commit::{Commit, CommitId};
use crate::error::OtError;
use crate::system::OtSystem;

/// A vertex of a [`CommitGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Node {
    /// A stored commit.
    Commit(CommitId),
    /// An intermediate merge result that only exists in this graph.
    Merge(u64),
}

impl Node {
    /// The commit id, unless this is a virtual merge node.
    #[must_use]
    pub fn commit_id(self) -> Option<CommitId> {
        match self {
            Self::Commit(id) => Some(id),
            Self::Merge(_) => None,
        }
    }
}

impl From<CommitId> for Node {
    fn from(id: CommitId) -> Self {
        Self::Commit(id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(id) => write!(f, "{id}"),
            Self::Merge(n) => write!(f, "merge-{n}"),
        }
    }
}

/// A partially loaded slice of the commit DAG.
///
/// Nodes whose parents are not loaded count as roots of the slice.
#[derive(Debug, Clone)]
pub struct CommitGraph<D> {
    parents: BTreeMap<Node, BTreeMap<Node, Vec<D>>>,
    levels: BTreeMap<CommitId, u64>,
    next_merge: u64,
}

impl<D: Clone> CommitGraph<D> {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parents: BTreeMap::new(),
            levels: BTreeMap::new(),
            next_merge: 0,
        }
    }

    /// Add a loaded commit and the edges to its parents.
    pub fn add_commit(&mut self, commit: &Commit<D>) {
        self.levels.insert(commit.id, commit.level);
        for (parent, diffs) in &commit.parents {
            self.add_edge(Node::Commit(*parent), Node::Commit(commit.id), diffs.clone());
        }
    }

    /// Add an edge carrying the diffs from `parent` to `child`.
    pub fn add_edge(&mut self, parent: Node, child: Node, diffs: Vec<D>) {
        self.parents.entry(child).or_default().insert(parent, diffs);
    }

    /// Whether the commit has been added with [`CommitGraph::add_commit`].
    #[must_use]
    pub fn is_loaded(&self, id: CommitId) -> bool {
        self.levels.contains_key(&id)
    }

    /// Level of a loaded commit.
    #[must_use]
    pub fn level(&self, id: CommitId) -> Option<u64> {
        self.levels.get(&id).copied()
    }

    /// Parent edges of `node`.
    #[must_use]
    pub fn parents(&self, node: Node) -> Option<&BTreeMap<Node, Vec<D>>> {
        self.parents.get(&node).filter(|p| !p.is_empty())
    }

    /// Nodes without parent edges that `node` descends from (itself, if it has none).
    #[must_use]
    pub fn roots(&self, node: Node) -> BTreeSet<Node> {
        let mut roots = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            match self.parents(current) {
                Some(parents) => stack.extend(parents.keys().copied()),
                None => {
                    roots.insert(current);
                }
            }
        }
        roots
    }

    /// Whether `ancestor` is a strict ancestor of `node`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: Node, node: Node) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Node> = self
            .parents(node)
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                if let Some(parents) = self.parents(current) {
                    stack.extend(parents.keys().copied());
                }
            }
        }
        false
    }

    /// Drop every node that is an ancestor of another node in the set.
    #[must_use]
    pub fn exclude_parents(&self, nodes: &BTreeSet<Node>) -> BTreeSet<Node> {
        nodes
            .iter()
            .filter(|candidate| {
                !nodes
                    .iter()
                    .any(|other| other != *candidate && self.is_ancestor(**candidate, *other))
            })
            .copied()
            .collect()
    }

    /// Diffs leading from `ancestor` to `node`, oldest first.
    ///
    /// Searches upward from `node`; returns `None` if `ancestor` is not reachable.
    #[must_use]
    pub fn path(&self, ancestor: Node, node: Node) -> Option<Vec<D>> {
        let mut queue = VecDeque::from([(node, Vec::new())]);
        let mut seen = BTreeSet::from([node]);
        while let Some((current, suffix)) = queue.pop_front() {
            if current == ancestor {
                return Some(suffix);
            }
            let Some(parents) = self.parents(current) else {
                continue;
            };
            for (parent, diffs) in parents {
                if seen.insert(*parent) {
                    let mut path = diffs.clone();
                    path.extend(suffix.iter().cloned());
                    queue.push_back((*parent, path));
                }
            }
        }
        None
    }

    /// Merge `heads`, returning for each head the squashed diffs that bring
    /// it to the merged state.
    ///
    /// # Errors
    ///
    /// [`OtError::DivergentHistory`] if the heads share no ancestor in the
    /// loaded slice, [`OtError::Transform`] if the algebra rejects a pair.
    pub fn merge<S>(
        &mut self,
        system: &S,
        heads: &BTreeSet<Node>,
    ) -> Result<BTreeMap<Node, Vec<D>>, OtError>
    where
        S: OtSystem<Op = D>,
    {
        let top = self.exclude_parents(heads);
        let merged = self.merge_nodes(system, top, heads)?;
        heads
            .iter()
            .map(|head| {
                let diffs = self
                    .path(*head, merged)
                    .ok_or_else(|| divergent(heads))?;
                Ok((*head, system.squash(&diffs)))
            })
            .collect()
    }

    fn merge_nodes<S>(
        &mut self,
        system: &S,
        nodes: BTreeSet<Node>,
        heads: &BTreeSet<Node>,
    ) -> Result<Node, OtError>
    where
        S: OtSystem<Op = D>,
    {
        if nodes.len() == 1 {
            return nodes.into_iter().next().ok_or_else(|| divergent(heads));
        }

        let pivot = nodes
            .iter()
            .filter(|node| self.parents(**node).is_some())
            .min_by_key(|node| (self.roots(**node).len(), **node))
            .copied()
            .ok_or_else(|| divergent(heads))?;
        let pivot_parents = self.parents(pivot).cloned().unwrap_or_default();

        let mut rest: BTreeSet<Node> = nodes.into_iter().filter(|n| *n != pivot).collect();
        rest.extend(pivot_parents.keys().copied());
        let rest = self.exclude_parents(&rest);
        let merged = self.merge_nodes(system, rest, heads)?;

        let (parent, parent_to_pivot) = pivot_parents
            .iter()
            .next()
            .ok_or_else(|| divergent(heads))?;
        let parent_to_merged = self.path(*parent, merged).ok_or_else(|| divergent(heads))?;

        let result = Node::Merge(self.next_merge);
        self.next_merge += 1;
        if pivot_parents.len() > 1 {
            // the pivot already is a merge of its parents: step back and replay forward
            let mut detour = system.invert(parent_to_pivot);
            detour.extend(parent_to_merged);
            self.add_edge(merged, result, Vec::new());
            self.add_edge(pivot, result, system.squash(&detour));
        } else {
            let transformed = system.transform(parent_to_pivot, &parent_to_merged)?;
            self.add_edge(merged, result, transformed.left);
            self.add_edge(pivot, result, transformed.right);
        }
        trace!(%pivot, %merged, %result, "merged pivot");
        Ok(result)
    }
}

impl<D: Clone> Default for CommitGraph<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn divergent(heads: &BTreeSet<Node>) -> OtError {
    OtError::DivergentHistory {
        heads: heads.iter().filter_map(|n| n.commit_id()).collect(),
    }
}
