//! Convenient re-exports for common usage.
//!
//! ```
//! use ot_kit::prelude::*;
//! ```

pub use crate::{
    Commit, CommitId, MemoryRepository, OtError, OtState, OtSystem, Repository, StateManager,
    SyncConfig, TransformResult,
};
