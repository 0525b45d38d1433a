//! SQLite commit repository using rusqlite.
//!
//! The primary durable backend for desktop, mobile and edge replicas. Uses
//! WAL mode by default so readers are not blocked while a replica pushes.
//!
//! # Schema
//!
//! | Table | Contents |
//! |-------|----------|
//! | `ot_revisions` | one row per commit: level, kind, optional snapshot, timestamp |
//! | `ot_diffs` | one row per parent edge: the encoded diff from parent to child |
//! | `ot_revisions_backup` | point-in-time copies written by `backup` |
//!
//! A revision row starts as `NEW` when its id is reserved by
//! `create_commit`, becomes `INNER` once pushed and is `HEAD` while it is
//! part of the head set. `NEW` rows are invisible to readers.
//!
//! # Example
//!
//! ```no_run
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use std::collections::{BTreeMap, BTreeSet};
//! use ot_kit::call::CallOp;
//! use ot_kit::Repository;
//! use ot_store::SqliteRepository;
//!
//! let repo: SqliteRepository<CallOp> = SqliteRepository::open("calls.db")?;
//! let root = repo.create_commit(BTreeMap::new(), 1).await?;
//! repo.push(vec![root.clone()]).await?;
//! repo.update_heads(&BTreeSet::from([root.id]), &BTreeSet::new()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ot_kit::{reachable_from, Commit, CommitId, OtError, Repository, DEFAULT_DELETE_MARGIN};
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::codec::{decode_diffs, encode_diffs, Format};
use crate::error::StoreError;

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
    /// SQLite page size. Defaults to 4096.
    pub page_size: u32,
    /// Retention margin applied by `cleanup`. Defaults to one hour.
    pub delete_margin: Duration,
    /// Tag stored with every revision this process creates.
    pub created_by: String,
    /// Encoding used for newly written diffs and snapshots.
    pub format: Format,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            page_size: 4096,
            delete_margin: DEFAULT_DELETE_MARGIN,
            created_by: "ot-store".to_string(),
            format: Format::default(),
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-Ahead Logging, allows concurrent reads during writes.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

impl FromStr for JournalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAL" => Ok(Self::Wal),
            "DELETE" => Ok(Self::Delete),
            "MEMORY" => Ok(Self::Memory),
            _ => Err(format!("unknown journal mode {s:?}")),
        }
    }
}

/// Lifecycle of a revision row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitKind {
    /// Id reserved, commit not pushed yet.
    New,
    /// Pushed, not a head.
    Inner,
    /// Pushed and part of the head set.
    Head,
}

impl CommitKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Inner => "INNER",
            Self::Head => "HEAD",
        }
    }
}

impl FromStr for CommitKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "INNER" => Ok(Self::Inner),
            "HEAD" => Ok(Self::Head),
            other => Err(StoreError::UnknownCommitKind(other.to_string())),
        }
    }
}

/// Row counts reported by [`SqliteRepository::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepositoryStats {
    /// Pushed commits.
    pub commits: u64,
    /// Current heads.
    pub heads: u64,
    /// Commits carrying a snapshot.
    pub snapshots: u64,
    /// Rows in the backup table.
    pub backups: u64,
}

impl fmt::Display for RepositoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commits, {} heads, {} snapshots, {} backups",
            self.commits, self.heads, self.snapshots, self.backups
        )
    }
}

enum HeadSwap {
    Applied,
    Stale(BTreeSet<CommitId>),
    Missing(CommitId),
}

/// SQLite-backed [`Repository`] storing diffs of type `D`.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex` for safe shared access.
/// Creates the schema automatically on first open. Every call runs to
/// completion on the calling task.
pub struct SqliteRepository<D> {
    conn: Mutex<Connection>,
    config: SqliteConfig,
    _diff: PhantomData<fn() -> D>,
}

impl<D> SqliteRepository<D> {
    /// Open (or create) a SQLite database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open_in_memory_with_config(SqliteConfig::default())
    }

    /// Open an in-memory database with custom configuration.
    pub fn open_in_memory_with_config(config: SqliteConfig) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: SqliteConfig) -> Result<Self, StoreError> {
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            _diff: PhantomData,
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), StoreError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA page_size = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
            config.page_size,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ot_revisions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                level       INTEGER NOT NULL,
                kind        TEXT NOT NULL,
                snapshot    BLOB,
                timestamp   INTEGER NOT NULL,
                created_by  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_revisions_kind
                ON ot_revisions(kind);

            CREATE TABLE IF NOT EXISTS ot_diffs (
                revision_id INTEGER NOT NULL,
                parent_id   INTEGER NOT NULL,
                diff        BLOB NOT NULL,
                PRIMARY KEY (revision_id, parent_id)
            );

            CREATE INDEX IF NOT EXISTS idx_diffs_parent
                ON ot_diffs(parent_id);

            CREATE TABLE IF NOT EXISTS ot_revisions_backup (
                id          INTEGER PRIMARY KEY,
                level       INTEGER NOT NULL,
                snapshot    BLOB NOT NULL,
                timestamp   INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// The configuration this repository was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Ids of all pushed commits, ascending.
    pub fn all_commit_ids(&self) -> Result<Vec<CommitId>, StoreError> {
        let conn = self.lock()?;
        query_ids(
            &conn,
            "SELECT id FROM ot_revisions WHERE kind != 'NEW' ORDER BY id",
            [],
        )
    }

    /// Row counts for commits, heads, snapshots and backups.
    pub fn stats(&self) -> Result<RepositoryStats, StoreError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };
        Ok(RepositoryStats {
            commits: count("SELECT COUNT(*) FROM ot_revisions WHERE kind != 'NEW'")?,
            heads: count("SELECT COUNT(*) FROM ot_revisions WHERE kind = 'HEAD'")?,
            snapshots: count("SELECT COUNT(*) FROM ot_revisions WHERE snapshot IS NOT NULL")?,
            backups: count("SELECT COUNT(*) FROM ot_revisions_backup")?,
        })
    }

    /// Get the database file size in bytes (0 for in-memory).
    pub fn file_size(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    fn kind_of(tx: &Connection, id: CommitId) -> Result<Option<CommitKind>, StoreError> {
        let kind: Option<String> = tx
            .query_row(
                "SELECT kind FROM ot_revisions WHERE id = ?1",
                params![id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        kind.map(|k| k.parse()).transpose()
    }

    fn set_kind(tx: &Transaction<'_>, id: CommitId, kind: CommitKind) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE ot_revisions SET kind = ?1 WHERE id = ?2",
            params![kind.as_str(), id.get() as i64],
        )?;
        Ok(())
    }

    fn reserve(&self, level: u64) -> Result<(CommitId, u64), StoreError> {
        let conn = self.lock()?;
        let timestamp = Self::now_ms();
        conn.execute(
            "INSERT INTO ot_revisions (level, kind, timestamp, created_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                level as i64,
                CommitKind::New.as_str(),
                timestamp as i64,
                self.config.created_by
            ],
        )?;
        Ok((CommitId::new(conn.last_insert_rowid() as u64), timestamp))
    }

    fn get_heads_sync(&self) -> Result<BTreeSet<CommitId>, StoreError> {
        let conn = self.lock()?;
        let heads = query_ids(&conn, "SELECT id FROM ot_revisions WHERE kind = 'HEAD'", [])?;
        Ok(heads.into_iter().collect())
    }

    fn swap_heads(
        &self,
        new_heads: &BTreeSet<CommitId>,
        excluded_heads: &BTreeSet<CommitId>,
    ) -> Result<HeadSwap, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut stale = BTreeSet::new();
        for id in excluded_heads {
            if Self::kind_of(&tx, *id)? != Some(CommitKind::Head) {
                stale.insert(*id);
            }
        }
        if !stale.is_empty() {
            return Ok(HeadSwap::Stale(stale));
        }
        for id in new_heads {
            match Self::kind_of(&tx, *id)? {
                None | Some(CommitKind::New) => return Ok(HeadSwap::Missing(*id)),
                Some(_) => {}
            }
        }

        for id in excluded_heads {
            Self::set_kind(&tx, *id, CommitKind::Inner)?;
        }
        for id in new_heads {
            Self::set_kind(&tx, *id, CommitKind::Head)?;
        }
        tx.commit()?;
        Ok(HeadSwap::Applied)
    }

    fn save_snapshot_blob(&self, id: CommitId, blob: &[u8]) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE ot_revisions SET snapshot = ?1 WHERE id = ?2 AND kind != 'NEW'",
            params![blob, id.get() as i64],
        )?;
        Ok(updated > 0)
    }

    /// Returns `None` when `min_id` is not a pushed commit.
    fn cleanup_sync(&self, min_id: CommitId) -> Result<Option<usize>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let min_timestamp: Option<i64> = tx
            .query_row(
                "SELECT timestamp FROM ot_revisions WHERE id = ?1 AND kind != 'NEW'",
                params![min_id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(min_timestamp) = min_timestamp else {
            return Ok(None);
        };
        let threshold =
            (min_timestamp as u64).saturating_sub(self.config.delete_margin.as_millis() as u64);

        let heads = query_ids(&tx, "SELECT id FROM ot_revisions WHERE kind = 'HEAD'", [])?;
        let mut edges: BTreeMap<CommitId, Vec<CommitId>> = BTreeMap::new();
        {
            let mut stmt = tx.prepare("SELECT revision_id, parent_id FROM ot_diffs")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (child, parent) = row?;
                edges
                    .entry(CommitId::new(child as u64))
                    .or_default()
                    .push(CommitId::new(parent as u64));
            }
        }
        let live = reachable_from(heads, |id| edges.get(&id).cloned().unwrap_or_default());

        let old = query_ids(
            &tx,
            "SELECT id FROM ot_revisions WHERE timestamp < ?1",
            params![threshold as i64],
        )?;
        let doomed: Vec<CommitId> = old.into_iter().filter(|id| !live.contains(id)).collect();
        for id in &doomed {
            tx.execute(
                "DELETE FROM ot_diffs WHERE revision_id = ?1",
                params![id.get() as i64],
            )?;
            tx.execute(
                "DELETE FROM ot_revisions WHERE id = ?1",
                params![id.get() as i64],
            )?;
        }
        tx.commit()?;
        Ok(Some(doomed.len()))
    }
}

impl<D> SqliteRepository<D>
where
    D: Serialize + DeserializeOwned,
{
    fn push_sync(&self, commits: &[Commit<D>]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for commit in commits {
            let raw_id = commit.id.get() as i64;
            match Self::kind_of(&tx, commit.id)? {
                Some(CommitKind::New) => {
                    tx.execute(
                        "UPDATE ot_revisions SET kind = ?1, level = ?2, timestamp = ?3
                         WHERE id = ?4",
                        params![
                            CommitKind::Inner.as_str(),
                            commit.level as i64,
                            commit.timestamp as i64,
                            raw_id
                        ],
                    )?;
                }
                Some(_) => {
                    debug!(id = %commit.id, "commit already stored");
                    continue;
                }
                None => {
                    tx.execute(
                        "INSERT INTO ot_revisions (id, level, kind, timestamp, created_by)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            raw_id,
                            commit.level as i64,
                            CommitKind::Inner.as_str(),
                            commit.timestamp as i64,
                            self.config.created_by
                        ],
                    )?;
                }
            }
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO ot_diffs (revision_id, parent_id, diff) VALUES (?1, ?2, ?3)",
                )?;
                for (parent, diffs) in &commit.parents {
                    let blob = encode_diffs(diffs, self.config.format)?;
                    stmt.execute(params![raw_id, parent.get() as i64, blob])?;
                }
            }
            debug!(id = %commit.id, level = commit.level, "stored commit");
        }
        tx.commit()?;
        Ok(())
    }

    fn load_commit_sync(&self, id: CommitId) -> Result<Option<Commit<D>>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(i64, String, bool, i64)> = conn
            .query_row(
                "SELECT level, kind, snapshot IS NOT NULL, timestamp
                 FROM ot_revisions WHERE id = ?1",
                params![id.get() as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((level, kind, snapshot_hint, timestamp)) = row else {
            return Ok(None);
        };
        if kind.parse::<CommitKind>()? == CommitKind::New {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT parent_id, diff FROM ot_diffs WHERE revision_id = ?1 ORDER BY parent_id",
        )?;
        let rows = stmt.query_map(params![id.get() as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut parents = BTreeMap::new();
        for row in rows {
            let (parent, blob) = row?;
            parents.insert(CommitId::new(parent as u64), decode_diffs(&blob)?);
        }

        let mut commit = Commit::new(id, parents, level as u64).with_timestamp(timestamp as u64);
        commit.snapshot_hint = snapshot_hint;
        Ok(Some(commit))
    }

    fn load_snapshot_sync(&self, id: CommitId) -> Result<Option<Vec<D>>, StoreError> {
        let conn = self.lock()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT snapshot FROM ot_revisions WHERE id = ?1",
                params![id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        match blob.flatten() {
            Some(blob) => Ok(Some(decode_diffs(&blob)?)),
            None => Ok(None),
        }
    }

    fn backup_sync(&self, commit: &Commit<D>, snapshot: &[D]) -> Result<(), StoreError> {
        let blob = encode_diffs(snapshot, self.config.format)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ot_revisions_backup (id, level, snapshot, timestamp)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id)
             DO UPDATE SET level = excluded.level, snapshot = excluded.snapshot,
                           timestamp = excluded.timestamp",
            params![
                commit.id.get() as i64,
                commit.level as i64,
                blob,
                Self::now_ms() as i64
            ],
        )?;
        Ok(())
    }

    /// The backup written for `id`: its level and state.
    pub fn load_backup(&self, id: CommitId) -> Result<Option<(u64, Vec<D>)>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT level, snapshot FROM ot_revisions_backup WHERE id = ?1",
                params![id.get() as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((level, blob)) => Ok(Some((level as u64, decode_diffs(&blob)?))),
            None => Ok(None),
        }
    }
}

fn query_ids<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<CommitId>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, i64>(0))?
        .map(|id| id.map(|id| CommitId::new(id as u64)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[async_trait]
impl<D> Repository<D> for SqliteRepository<D>
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create_commit(
        &self,
        parents: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<Commit<D>, OtError> {
        let (id, timestamp) = self.reserve(level)?;
        Ok(Commit::new(id, parents, level).with_timestamp(timestamp))
    }

    async fn push(&self, commits: Vec<Commit<D>>) -> Result<(), OtError> {
        Ok(self.push_sync(&commits)?)
    }

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, OtError> {
        Ok(self.get_heads_sync()?)
    }

    async fn update_heads(
        &self,
        new_heads: &BTreeSet<CommitId>,
        excluded_heads: &BTreeSet<CommitId>,
    ) -> Result<(), OtError> {
        match self.swap_heads(new_heads, excluded_heads)? {
            HeadSwap::Applied => {
                debug!(?new_heads, ?excluded_heads, "heads updated");
                Ok(())
            }
            HeadSwap::Stale(stale) => Err(OtError::ConcurrentHeadUpdate { stale }),
            HeadSwap::Missing(id) => Err(OtError::CommitNotFound(id)),
        }
    }

    async fn load_commit(&self, id: CommitId) -> Result<Commit<D>, OtError> {
        self.load_commit_sync(id)?.ok_or(OtError::CommitNotFound(id))
    }

    async fn load_snapshot(&self, id: CommitId) -> Result<Option<Vec<D>>, OtError> {
        Ok(self.load_snapshot_sync(id)?)
    }

    async fn save_snapshot(&self, id: CommitId, snapshot: Vec<D>) -> Result<(), OtError> {
        let blob = encode_diffs(&snapshot, self.config.format).map_err(StoreError::from)?;
        if self.save_snapshot_blob(id, &blob)? {
            Ok(())
        } else {
            Err(OtError::CommitNotFound(id))
        }
    }

    async fn cleanup(&self, min_id: CommitId) -> Result<usize, OtError> {
        let removed = self
            .cleanup_sync(min_id)?
            .ok_or(OtError::CommitNotFound(min_id))?;
        info!(removed, %min_id, "cleanup finished");
        Ok(removed)
    }

    async fn backup(&self, commit: &Commit<D>, snapshot: Vec<D>) -> Result<(), OtError> {
        Ok(self.backup_sync(commit, &snapshot)?)
    }
}
