//! # ot-store
//!
//! Persistence backends for [`ot-kit`](https://docs.rs/ot-kit).
//!
//! Provides a durable [`Repository`](ot_kit::Repository) over SQLite and the
//! versioned codec it uses for diff and snapshot blobs.
//!
//! ## Quick Start
//!
//! ```
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use std::collections::{BTreeMap, BTreeSet};
//! use ot_kit::counter::CounterOp;
//! use ot_kit::Repository;
//! use ot_store::SqliteRepository;
//!
//! let repo: SqliteRepository<CounterOp> = SqliteRepository::open_in_memory()?;
//! let root = repo.create_commit(BTreeMap::new(), 1).await?;
//! repo.push(vec![root.clone()]).await?;
//! repo.update_heads(&BTreeSet::from([root.id]), &BTreeSet::new()).await?;
//! assert_eq!(repo.stats()?.heads, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|----------|
//! | [`MemoryRepository`](ot_kit::MemoryRepository) | *(in ot-kit)* | Testing, single process |
//! | `SqliteRepository` | `sqlite` | Desktop, mobile, edge |

pub mod codec;
mod error;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use codec::{decode_diffs, encode_diffs, CodecError, DiffEnvelope, Format};
pub use error::StoreError;
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, RepositoryStats, SqliteConfig, SqliteRepository};
