use std::collections::BTreeSet;

use thiserror::Error;

use crate::commit::CommitId;

/// Failure of a pairwise transform.
///
/// Either variant means the domain algebra cannot reconcile two operations.
/// It is never retried and never skipped: a replica that hits it stops
/// synchronizing until it is checked out again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// No rule exists for this pair of operation variants.
    #[error("no transform defined for {left} against {right}")]
    Unsupported {
        /// Debug rendering of the left operation.
        left: String,
        /// Debug rendering of the right operation.
        right: String,
    },
    /// The two operations cannot both be valid against the same state.
    #[error("incompatible concurrent operations: {reason}")]
    Incompatible {
        /// Human-readable description of the mismatch.
        reason: String,
    },
}

impl TransformError {
    /// Build an [`TransformError::Unsupported`] from two operations.
    pub fn unsupported<D: std::fmt::Debug>(left: &D, right: &D) -> Self {
        Self::Unsupported {
            left: format!("{left:?}"),
            right: format!("{right:?}"),
        }
    }

    /// Build an [`TransformError::Incompatible`] with a reason.
    pub fn incompatible(reason: impl Into<String>) -> Self {
        Self::Incompatible {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by repositories, the merge engine and the state manager.
#[derive(Debug, Error)]
pub enum OtError {
    /// A referenced commit does not exist in the repository.
    #[error("commit {0} not found")]
    CommitNotFound(CommitId),

    /// A snapshot was expected for this commit but none is stored.
    #[error("snapshot for commit {0} not found")]
    SnapshotNotFound(CommitId),

    /// The storage backend failed. The caller may retry.
    #[error("storage error: {0}")]
    Storage(String),

    /// The heads share no common ancestor and cannot be merged.
    #[error("heads {heads:?} have no common ancestor")]
    DivergentHistory {
        /// The heads that were being merged.
        heads: BTreeSet<CommitId>,
    },

    /// The domain algebra rejected a pair of operations.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A compare-and-swap on the head set lost against another writer.
    #[error("concurrent head update: {stale:?} are no longer heads")]
    ConcurrentHeadUpdate {
        /// Excluded ids that were no longer heads when the update ran.
        stale: BTreeSet<CommitId>,
    },

    /// The repository has no heads, so there is nothing to check out or merge.
    #[error("repository has no heads")]
    NoHeads,

    /// The state manager has not been checked out yet.
    #[error("state manager is not checked out")]
    NotCheckedOut,

    /// The state manager hit a fatal error and needs a fresh checkout.
    #[error("state manager was invalidated by a previous error, checkout required")]
    Invalidated,
}

impl OtError {
    /// Wrap any backend error as [`OtError::Storage`].
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether the caller may reasonably retry the failed call.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::ConcurrentHeadUpdate { .. })
    }

    /// Whether the error leaves a state manager unusable until the next checkout.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transform(_)
                | Self::DivergentHistory { .. }
                | Self::CommitNotFound(_)
                | Self::SnapshotNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(OtError::storage("disk full").is_retriable());
        assert!(OtError::ConcurrentHeadUpdate {
            stale: BTreeSet::from([CommitId::new(3)])
        }
        .is_retriable());
        assert!(!OtError::CommitNotFound(CommitId::new(1)).is_retriable());
        assert!(!OtError::from(TransformError::incompatible("x")).is_retriable());
    }

    #[test]
    fn fatal_classification() {
        assert!(OtError::from(TransformError::incompatible("x")).is_fatal());
        assert!(OtError::DivergentHistory {
            heads: BTreeSet::new()
        }
        .is_fatal());
        assert!(!OtError::storage("io").is_fatal());
        assert!(!OtError::NotCheckedOut.is_fatal());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            OtError::CommitNotFound(CommitId::new(7)).to_string(),
            "commit #7 not found"
        );
        let err = TransformError::unsupported(&1u8, &2u8);
        assert_eq!(err.to_string(), "no transform defined for 1 against 2");
    }
}
