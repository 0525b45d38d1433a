//! # ot-kit
//!
//! Operational transformation sync engine for local-first applications.
//!
//! Replicas record domain operations locally, commit them into a shared
//! commit graph and converge by transforming concurrent work against each
//! other. Convergence rests on the algebra each domain supplies through
//! [`OtSystem`]: `transform`, `invert`, `squash` and `is_empty`.
//!
//! ## Quick Start
//!
//! ```
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use std::collections::{BTreeMap, BTreeSet};
//! use std::sync::Arc;
//! use ot_kit::prelude::*;
//! use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
//!
//! let repo = Arc::new(MemoryRepository::<CallOp>::new());
//! let root = repo.create_commit(BTreeMap::new(), 1).await?;
//! repo.push(vec![root.clone()]).await?;
//! repo.update_heads(&BTreeSet::from([root.id]), &BTreeSet::new()).await?;
//!
//! let mut a = StateManager::new(CallSystem, repo.clone(), CallState::default());
//! let mut b = StateManager::new(CallSystem, repo.clone(), CallState::default());
//! a.checkout().await?;
//! b.checkout().await?;
//!
//! a.add(CallOp::call(None, CallInfo::new("user1", 1, 100)))?;
//! b.add(CallOp::call(None, CallInfo::new("user2", 2, 200)))?;
//! a.sync().await?;
//! b.sync().await?;
//! a.pull().await?;
//!
//! assert_eq!(a.state(), b.state());
//! assert_eq!(a.state().call.as_ref().unwrap().caller, "user2");
//! # Ok::<(), OtError>(())
//! # }).unwrap();
//! ```
//!
//! ## Components
//!
//! - [`OtSystem`] / [`TransformResult`] - the operation algebra, with
//!   [`MergedSystem`] for running two algebras side by side
//! - [`Commit`] / [`Repository`] - the commit graph and its storage contract,
//!   with [`MemoryRepository`] as the in-process backend
//! - [`CommitGraph`] / [`OtAlgorithms`] - ancestor search, merging, checkout
//! - [`OtState`] - materialized state that operations are applied to
//! - [`StateManager`] - the per-replica sync facade
//!
//! ## Bundled Domains
//!
//! - [`call`] - call signaling with accept/reject/drop precedence
//! - [`counter`] - an integer register with additions and assignments

#![warn(missing_docs)]

mod algorithms;
mod commit;
mod config;
mod error;
mod graph;
mod manager;
mod memory;
mod merged;
mod repository;
mod state;
mod system;

pub mod call;
pub mod counter;
pub mod prelude;

pub use algorithms::{FoundPath, OtAlgorithms};
pub use commit::{Commit, CommitId};
pub use config::SyncConfig;
pub use error::{OtError, TransformError};
pub use graph::{CommitGraph, Node};
pub use manager::{ManagerStatus, StateManager};
pub use memory::{MemoryRepository, DEFAULT_DELETE_MARGIN};
pub use merged::{MergedOp, MergedState, MergedSystem};
pub use repository::{reachable_from, Repository};
pub use state::{materialize, replay, OtState};
pub use system::{OtSystem, SquashResult, TransformResult};
