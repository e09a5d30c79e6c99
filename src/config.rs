use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

/// Hard upper bound on the worker pool, enforced at startup.
pub const MAX_THREADS_CEILING: usize = 100;

/// Centralized worker configuration.
/// Combines environment variables and CLI arguments, then validates the
/// partition parameters before a pass is allowed to start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 1-indexed worker number within the fleet.
    pub node_num: u32,

    /// Total fleet size. Must be identical across all workers for the
    /// duration of a pass.
    pub node_count: u32,

    pub multi_thread: bool,
    pub max_threads: usize,

    /// Restrict the pass to these bucket names, when non-empty.
    pub buckets: Vec<String>,

    /// Page candidates smallest-first instead of by id, so a backlog of
    /// small objects drains before large transfers monopolize the pass.
    pub small_size_first: bool,

    /// Dry run: sleep instead of transferring.
    pub test: bool,

    pub database_url: String,
    pub data_dir: String,
    pub lock_file: String,

    /// Minimum minutes since last modification before an object is
    /// considered stable enough to synchronize.
    pub quiescence_minutes: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket backup synchronization worker")]
pub struct Args {
    /// Worker node number; defaults from the host name (e.g. "ip12" -> 12)
    #[arg(long)]
    pub node_num: Option<u32>,

    /// Total number of worker nodes in the fleet
    #[arg(long, required_unless_present_any = ["migrate", "status"])]
    pub node_count: Option<u32>,

    /// Run object transfers on a bounded worker pool
    #[arg(long)]
    pub multi_thread: bool,

    /// Pool size in multi-thread mode
    #[arg(long, default_value_t = 10)]
    pub max_threads: usize,

    /// Only synchronize the named buckets (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub buckets: Vec<String>,

    /// Synchronize smaller objects before larger ones
    #[arg(long)]
    pub small_size_first: bool,

    /// Dry run: select candidates but sleep instead of transferring
    #[arg(long)]
    pub test: bool,

    /// Database URL (overrides SYNC_WORKER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory holding object payloads (overrides SYNC_WORKER_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Run-lock file path (overrides SYNC_WORKER_LOCK_FILE)
    #[arg(long)]
    pub lock_file: Option<String>,

    /// Quiescence window in minutes (overrides SYNC_WORKER_QUIESCENCE_MINUTES)
    #[arg(long)]
    pub quiescence_minutes: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Report the run-lock holder and exit
    #[arg(long)]
    pub status: bool,
}

/// What the process does after parsing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sync,
    Migrate,
    Status,
}

impl SyncConfig {
    /// Parse environment variables + CLI args into SyncConfig and the run
    /// mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        let mode = if args.status {
            RunMode::Status
        } else if args.migrate {
            RunMode::Migrate
        } else {
            RunMode::Sync
        };
        let cfg = Self::from_args(&args, mode)?;
        Ok((cfg, mode))
    }

    fn from_args(args: &Args, mode: RunMode) -> Result<Self> {
        let env_db = env::var("SYNC_WORKER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_store.db".into());
        let env_data = env::var("SYNC_WORKER_DATA_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_lock = env::var("SYNC_WORKER_LOCK_FILE")
            .unwrap_or_else(|_| "/tmp/bucket-sync-worker.lock".into());
        let env_quiescence = match env::var("SYNC_WORKER_QUIESCENCE_MINUTES") {
            Ok(value) => value.parse::<i64>().with_context(|| {
                format!("parsing SYNC_WORKER_QUIESCENCE_MINUTES value `{}`", value)
            })?,
            Err(_) => 60,
        };

        // Partition identity only matters for an actual sync run; migration
        // and status invocations may omit it.
        let (node_num, node_count) = if mode == RunMode::Sync {
            let node_num = match args.node_num {
                Some(num) => num,
                None => node_num_from_hostname()?,
            };
            (node_num, args.node_count.unwrap_or(0))
        } else {
            (args.node_num.unwrap_or(1), args.node_count.unwrap_or(1))
        };

        let cfg = Self {
            node_num,
            node_count,
            multi_thread: args.multi_thread,
            max_threads: args.max_threads,
            buckets: args.buckets.clone(),
            small_size_first: args.small_size_first,
            test: args.test,
            database_url: args.database_url.clone().unwrap_or(env_db),
            data_dir: args.data_dir.clone().unwrap_or(env_data),
            lock_file: args.lock_file.clone().unwrap_or(env_lock),
            quiescence_minutes: args.quiescence_minutes.unwrap_or(env_quiescence),
        };
        if mode == RunMode::Sync {
            cfg.validate()?;
        }
        Ok(cfg)
    }

    /// Partition and pool constraints. A misconfigured fleet member would
    /// silently skip or double-claim objects, so this fails hard.
    pub fn validate(&self) -> Result<()> {
        if self.node_num == 0 {
            bail!("node-num ({}) must be greater than 0", self.node_num);
        }
        if self.node_count == 0 {
            bail!("node-count ({}) must be greater than 0", self.node_count);
        }
        if self.node_num > self.node_count {
            bail!(
                "node-num ({}) cannot be greater than node-count ({})",
                self.node_num,
                self.node_count
            );
        }
        if self.max_threads == 0 {
            bail!("max-threads must be greater than 0");
        }
        if self.max_threads > MAX_THREADS_CEILING {
            bail!(
                "max-threads ({}) set too large, ceiling is {}",
                self.max_threads,
                MAX_THREADS_CEILING
            );
        }
        if self.quiescence_minutes < 0 {
            bail!("quiescence-minutes cannot be negative");
        }
        Ok(())
    }
}

/// Derive the node number from the host name, `ipN` or plain digits.
fn node_num_from_hostname() -> Result<u32> {
    let hostname = env::var("HOSTNAME").context("node-num not given and HOSTNAME is not set")?;
    let trimmed = hostname.trim();
    let digits = trimmed.strip_prefix("ip").unwrap_or(trimmed);
    digits.parse::<u32>().with_context(|| {
        format!("cannot derive node number from host name `{}`", hostname)
    })
}
