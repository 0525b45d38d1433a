use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
use ot_kit::{CommitId, OtAlgorithms, Repository, StateManager};
use ot_store::{SqliteConfig, SqliteRepository};
use tracing::info;

use crate::config::CliConfig;

type Result = std::result::Result<(), Box<dyn std::error::Error>>;
type Repo = SqliteRepository<CallOp>;

/// Database path and configuration shared by every subcommand.
pub struct Context {
    db: PathBuf,
    config: CliConfig,
}

impl Context {
    pub fn new(db: PathBuf, config: CliConfig) -> Self {
        Self { db, config }
    }

    fn sqlite_config(&self) -> std::result::Result<SqliteConfig, Box<dyn std::error::Error>> {
        Ok(self.config.sqlite.to_sqlite_config()?)
    }

    fn open(&self) -> std::result::Result<Arc<Repo>, Box<dyn std::error::Error>> {
        let repo = SqliteRepository::open_with_config(&self.db, self.sqlite_config()?)?;
        Ok(Arc::new(repo))
    }

    /// Open the database, failing if `ot init` has not run yet.
    async fn open_initialized(&self) -> std::result::Result<Arc<Repo>, Box<dyn std::error::Error>> {
        let repo = self.open()?;
        if repo.get_heads().await?.is_empty() {
            return Err(format!("{} is not initialized, run `ot init` first", self.db.display()).into());
        }
        Ok(repo)
    }

    fn algorithms(&self, repo: Arc<Repo>) -> OtAlgorithms<CallSystem, Repo> {
        OtAlgorithms::with_config(CallSystem, repo, self.config.sync.clone())
    }
}

/// `ot init` creates the root commit.
pub async fn init(ctx: &Context) -> Result {
    let repo = ctx.open()?;
    let heads = repo.get_heads().await?;
    if !heads.is_empty() {
        println!("Already initialized: heads {}", format_ids(&heads));
        return Ok(());
    }
    let root_id = seed_root(&repo).await?;
    println!("Initialized {} with root commit {root_id}", ctx.db.display());
    Ok(())
}

/// `ot status` shows heads and row counts.
pub async fn status(ctx: &Context) -> Result {
    let repo = ctx.open()?;
    let stats = repo.stats()?;
    let heads = repo.get_heads().await?;
    let size = repo.file_size()?;

    println!("Database: {} (SQLite)", ctx.db.display());
    println!("Size: {}", format_bytes(size));
    println!();
    if heads.is_empty() {
        println!("  (not initialized)");
        return Ok(());
    }
    println!("  {:<12} {}", "Heads", format_ids(&heads));
    println!("  {:<12} {:>8}", "Commits", stats.commits);
    println!("  {:<12} {:>8}", "Snapshots", stats.snapshots);
    println!("  {:<12} {:>8}", "Backups", stats.backups);
    if heads.len() > 1 {
        println!();
        println!("  {} heads pending merge, run `ot merge`", heads.len());
    }
    Ok(())
}

/// `ot log` lists commits, newest first.
pub async fn log(ctx: &Context, last: usize) -> Result {
    let repo = ctx.open_initialized().await?;
    let heads = repo.get_heads().await?;
    let ids = repo.all_commit_ids()?;

    println!(
        "  {:>8}  {:>6}  {:<23}  {:<16}  {}",
        "Commit", "Level", "Created", "Parents", "Flags"
    );
    println!("  {}", "-".repeat(70));
    for id in ids.iter().rev().take(last) {
        let commit = repo.load_commit(*id).await?;
        let parents: BTreeSet<CommitId> = commit.parent_ids().collect();
        let mut flags = Vec::new();
        if heads.contains(id) {
            flags.push("head");
        }
        if commit.snapshot_hint {
            flags.push("snapshot");
        }
        println!(
            "  {:>8}  {:>6}  {:<23}  {:<16}  {}",
            commit.id.to_string(),
            commit.level,
            format_timestamp(commit.timestamp),
            format_ids(&parents),
            flags.join(","),
        );
    }
    if ids.len() > last {
        println!("  ... {} older commits", ids.len() - last);
    }
    Ok(())
}

/// `ot show <id>` prints a commit as JSON.
pub async fn show(ctx: &Context, id: u64) -> Result {
    let repo = ctx.open_initialized().await?;
    let commit = repo.load_commit(CommitId::new(id)).await?;
    println!("{}", serde_json::to_string_pretty(&commit)?);
    Ok(())
}

/// `ot checkout [id]` prints a materialized state as JSON.
pub async fn checkout(ctx: &Context, id: Option<u64>) -> Result {
    let repo = ctx.open_initialized().await?;
    let mut manager =
        StateManager::with_config(CallSystem, repo, CallState::default(), ctx.config.sync.clone());
    let id = match id {
        Some(raw) => {
            let id = CommitId::new(raw);
            manager.checkout_at(id).await?;
            id
        }
        None => manager.checkout().await?,
    };
    eprintln!("state at {id} (level {})", manager.level());
    println!("{}", serde_json::to_string_pretty(manager.state())?);
    Ok(())
}

/// `ot merge` merges all heads into one.
pub async fn merge(ctx: &Context) -> Result {
    let repo = ctx.open_initialized().await?;
    let before = repo.get_heads().await?;
    let head = ctx.algorithms(repo).merge_heads_and_push().await?;
    if before.len() == 1 {
        println!("Nothing to merge: single head {head}");
    } else {
        println!("Merged heads {} into {head}", format_ids(&before));
    }
    Ok(())
}

/// `ot snapshot <id>` stores a snapshot.
pub async fn snapshot(ctx: &Context, id: u64) -> Result {
    let repo = ctx.open_initialized().await?;
    let id = CommitId::new(id);
    ctx.algorithms(repo).save_snapshot(id).await?;
    println!("Saved snapshot for {id}");
    Ok(())
}

/// `ot cleanup <min-id>` deletes unreachable commits.
pub async fn cleanup(ctx: &Context, min_id: u64) -> Result {
    let repo = ctx.open_initialized().await?;
    let margin = repo.config().delete_margin;
    let removed = repo.cleanup(CommitId::new(min_id)).await?;
    println!(
        "Removed {removed} unreachable commits older than #{min_id} minus {}s",
        margin.as_secs()
    );
    Ok(())
}

/// `ot backup <id>` writes a backup row.
pub async fn backup(ctx: &Context, id: u64) -> Result {
    let repo = ctx.open_initialized().await?;
    let id = CommitId::new(id);
    ctx.algorithms(repo.clone()).backup(id).await?;
    let level = repo.load_backup(id)?.map(|(level, _)| level).unwrap_or_default();
    println!("Backed up {id} (level {level})");
    Ok(())
}

/// `ot demo` runs two replicas racing concurrent calls.
pub async fn demo(ctx: &Context) -> Result {
    let repo: Arc<Repo> = Arc::new(SqliteRepository::open_in_memory_with_config(
        ctx.sqlite_config()?,
    )?);
    seed_root(&repo).await?;

    let sync = ctx.config.sync.clone();
    let mut phone =
        StateManager::with_config(CallSystem, repo.clone(), CallState::default(), sync.clone());
    let mut laptop =
        StateManager::with_config(CallSystem, repo.clone(), CallState::default(), sync);
    phone.checkout().await?;
    laptop.checkout().await?;

    println!("Both replicas place a call while offline:");
    phone.add(CallOp::call(None, CallInfo::new("alice", 1, 100)))?;
    laptop.add(CallOp::call(None, CallInfo::new("bob", 2, 200)))?;
    println!("  phone  {}", serde_json::to_string(phone.state())?);
    println!("  laptop {}", serde_json::to_string(laptop.state())?);

    phone.sync().await?;
    laptop.sync().await?;
    phone.pull().await?;
    println!("After sync:");
    println!("  phone  {}", serde_json::to_string(phone.state())?);
    println!("  laptop {}", serde_json::to_string(laptop.state())?);

    println!("Carol accepts on the phone while the laptop drops the call:");
    let active = laptop.state().call.clone();
    phone.add(CallOp::accept("carol", None))?;
    if let Some(call) = active {
        laptop.add(CallOp::drop_call(call, BTreeMap::new(), 300))?;
    }
    phone.sync().await?;
    laptop.sync().await?;
    phone.pull().await?;
    println!("  phone  {}", serde_json::to_string(phone.state())?);
    println!("  laptop {}", serde_json::to_string(laptop.state())?);

    let converged = phone.state() == laptop.state();
    info!(converged, revision = ?phone.revision(), "demo finished");
    println!("Converged: {converged} ({})", repo.stats()?);
    Ok(())
}

async fn seed_root(repo: &Repo) -> std::result::Result<CommitId, ot_kit::OtError> {
    let root = repo.create_commit(BTreeMap::new(), 1).await?;
    let root_id = root.id;
    repo.push(vec![root]).await?;
    repo.update_heads(&BTreeSet::from([root_id]), &BTreeSet::new())
        .await?;
    Ok(root_id)
}

// ── Helpers ──────────────────────────────────────────────────────────

fn format_ids(ids: &BTreeSet<CommitId>) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

fn format_timestamp(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
