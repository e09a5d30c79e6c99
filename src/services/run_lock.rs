//! Pid-file run lock.
//!
//! Partition assignment assumes at most one process per node number on a
//! host; a second instance would double-claim objects. The lock is a
//! create-new pid file, removed on drop, and a leftover file from a dead
//! process (stale pid) is reclaimed.

use anyhow::{Context, Result, bail};
use std::{
    fs,
    io::{ErrorKind, Write},
    path::Path,
};
use tracing::warn;

/// Holds the lock for the process lifetime; the file is removed on drop.
pub struct RunLock {
    path: String,
}

impl RunLock {
    pub fn acquire(path: &str) -> Result<Self> {
        let pid = std::process::id();
        loop {
            match fs::OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}")?;
                    return Ok(Self {
                        path: path.to_string(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => match status(path) {
                    LockStatus::Running(other) => {
                        bail!("another instance appears to be running (pid {other}, lock {path})");
                    }
                    _ => {
                        warn!("removing stale lock file {}", path);
                        fs::remove_file(path)
                            .with_context(|| format!("removing stale lock file {path}"))?;
                    }
                },
                Err(err) => {
                    return Err(err).with_context(|| format!("creating lock file {path}"));
                }
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// What the lock file currently says about a worker on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// No lock file exists.
    NotRunning,
    /// The recorded pid is alive.
    Running(u32),
    /// A lock file exists but its pid is gone or unreadable.
    Stale,
}

pub fn status(path: &str) -> LockStatus {
    let Ok(contents) = fs::read_to_string(path) else {
        return LockStatus::NotRunning;
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) if Path::new(&format!("/proc/{pid}")).exists() => LockStatus::Running(pid),
        _ => LockStatus::Stale,
    }
}
