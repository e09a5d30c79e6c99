use anyhow::{Context, Result, bail};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing_subscriber::EnvFilter;

use bucket_sync_worker::{
    config::{RunMode, SyncConfig},
    services::{
        coordinator::SyncCoordinator,
        data_path::DataPath,
        run_lock::{self, LockStatus, RunLock},
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = SyncConfig::from_env_and_args()?;

    if mode == RunMode::Status {
        match run_lock::status(&cfg.lock_file) {
            LockStatus::Running(pid) => {
                println!("worker running, pid {pid} (lock file {})", cfg.lock_file);
            }
            LockStatus::Stale => {
                println!("worker not running (stale lock file {})", cfg.lock_file);
            }
            LockStatus::NotRunning => {
                println!("worker not running (no lock file {})", cfg.lock_file);
            }
        }
        return Ok(());
    }

    if cfg.multi_thread {
        tracing::warn!(
            "starting in multi-thread mode, max_threads={}, node_num={}, node_count={}",
            cfg.max_threads,
            cfg.node_num,
            cfg.node_count
        );
    } else {
        tracing::warn!(
            "starting in single-thread mode, node_num={}, node_count={}",
            cfg.node_num,
            cfg.node_count
        );
    }
    if !cfg.buckets.is_empty() {
        tracing::warn!("only synchronizing buckets: {:?}", cfg.buckets);
    }
    if cfg.small_size_first {
        tracing::warn!("synchronizing smallest objects first");
    }
    if cfg.test {
        tracing::warn!("test mode: candidates are selected but not transferred");
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&cfg.database_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );

    // --- Handle migration mode ---
    if mode == RunMode::Migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Local "already running" self-check ---
    let _lock = RunLock::acquire(&cfg.lock_file)?;

    if !Path::new(&cfg.data_dir).exists() {
        bail!("data directory {} does not exist", cfg.data_dir);
    }

    // --- Cancellation: stop submitting, drain in-flight transfers ---
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight transfers");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    // --- Run one full pass ---
    let data_path = DataPath::new(cfg.data_dir.clone());
    let coordinator = SyncCoordinator::new(db, data_path, cfg, shutdown);
    coordinator.run_pass().await;

    tracing::warn!("exit");
    Ok(())
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}
