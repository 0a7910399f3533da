//! Host-wide process lock
//!
//! One lock file guards certificate issuance and renewal so two runs never
//! race on the challenge directory or certbot's state. The file is created
//! with exclusive-create semantics and holds JSON describing the owner:
//!
//! ```json
//! {"pid": 4242, "acquired_at": "2026-01-01T00:00:00Z", "hostname": "web1", "operation": "renew"}
//! ```
//!
//! The JSON is written to a private staging file first and hard-linked into
//! place, so the lock file is never seen half-written. A holder whose PID is
//! gone is stale and gets cleared; a file that does not parse is only treated
//! as stale once it is older than [`UNREADABLE_GRACE`]. Release happens on
//! `Drop`; the signal path calls [`release_if_owned`] directly.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{IpcertError, Result};
use crate::exec::CommandRunner;

/// Times a stale lock may be cleared within a single attempt
const MAX_STALE_CLEARS: usize = 3;

/// Age below which an unreadable lock file is assumed to be mid-write
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
    /// Command that took the lock
    pub operation: String,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            pid: process::id(),
            acquired_at: Utc::now(),
            hostname,
            operation: operation.to_string(),
        }
    }

    /// Check liveness with signal 0
    pub fn process_alive(&self) -> bool {
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Wait policy for [`ProcessLock::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub wait: Duration,
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(300),
            poll: Duration::from_secs(5),
        }
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            wait: Duration::from_secs(config.timeout_secs),
            poll: Duration::from_secs(config.poll_secs.max(1)),
        }
    }
}

impl LockOptions {
    /// Fail immediately when the lock is held
    pub fn no_wait() -> Self {
        Self {
            wait: Duration::ZERO,
            poll: Duration::from_secs(1),
        }
    }

    fn attempts(&self) -> u64 {
        let poll = self.poll.as_millis().max(1);
        1 + (self.wait.as_millis() / poll) as u64
    }
}

enum Attempt {
    Acquired(LockInfo),
    Held(LockInfo),
}

/// Lock handle, released on drop
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    info: LockInfo,
}

impl ProcessLock {
    /// Acquire the lock, polling until `options.wait` is used up
    pub fn acquire(
        path: &Path,
        operation: &str,
        options: LockOptions,
        runner: &dyn CommandRunner,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IpcertError::io(parent, e))?;
        }

        let attempts = options.attempts();
        let mut holder = None;
        for attempt in 1..=attempts {
            match try_create(path, operation)? {
                Attempt::Acquired(info) => {
                    info!(
                        target: "audit",
                        "lock acquired for {} (pid {})", operation, info.pid
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        info,
                    });
                }
                Attempt::Held(info) => {
                    if attempt == 1 {
                        info!(
                            "Waiting for pid {} ({}) to release {}",
                            info.pid,
                            info.operation,
                            path.display()
                        );
                    }
                    holder = Some(info);
                    if attempt < attempts {
                        runner.sleep(options.poll);
                    }
                }
            }
        }

        let holder = holder.unwrap_or_else(|| LockInfo::new("unknown"));
        warn!(
            "Lock still held by pid {} ({}) after {}s",
            holder.pid,
            holder.operation,
            options.wait.as_secs()
        );
        Err(IpcertError::LockContention {
            pid: holder.pid,
            operation: holder.operation,
        })
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current holder of the lock at `path`, if any
    pub fn holder(path: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if release_if_owned(&self.path) {
            debug!("lock released: {}", self.path.display());
        }
    }
}

/// Remove the lock file when this process owns it
pub fn release_if_owned(path: &Path) -> bool {
    match ProcessLock::holder(path) {
        Some(info) if info.pid == process::id() => match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not release lock {}: {}", path.display(), e);
                false
            }
        },
        _ => false,
    }
}

/// What sits at the lock path right now
enum Occupant {
    Live(LockInfo),
    /// Dead holder or old unreadable file; carries the bytes that were read
    Stale(String),
    Gone,
}

fn try_create(path: &Path, operation: &str) -> Result<Attempt> {
    let info = LockInfo::new(operation);
    let staged = stage(path, &info)?;
    let result = link_into_place(&staged, path, info);
    if let Err(e) = fs::remove_file(&staged) {
        debug!("could not remove staging file {}: {}", staged.display(), e);
    }
    result
}

/// Sibling path private to this process and call
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "ipcert.lock".to_string());
    path.with_file_name(format!(
        ".{}.{}.{}.{}",
        name,
        tag,
        process::id(),
        Uuid::new_v4().simple()
    ))
}

fn stage(path: &Path, info: &LockInfo) -> Result<PathBuf> {
    let staged = sibling(path, "new");
    let content =
        serde_json::to_string(info).map_err(|e| IpcertError::io(path, io::Error::other(e)))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged)
        .map_err(|e| IpcertError::io(&staged, e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| IpcertError::io(&staged, e))?;
    Ok(staged)
}

fn link_into_place(staged: &Path, path: &Path, info: LockInfo) -> Result<Attempt> {
    for _ in 0..MAX_STALE_CLEARS {
        match fs::hard_link(staged, path) {
            Ok(()) => return Ok(Attempt::Acquired(info)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match inspect(path)? {
                Occupant::Live(holder) => return Ok(Attempt::Held(holder)),
                Occupant::Stale(seen) => clear_stale(path, &seen)?,
                Occupant::Gone => {}
            },
            Err(e) => return Err(IpcertError::io(path, e)),
        }
    }

    // Another process keeps recreating it; report whoever holds it now
    Ok(Attempt::Held(
        ProcessLock::holder(path).unwrap_or_else(|| LockInfo::new("unknown")),
    ))
}

fn inspect(path: &Path) -> Result<Occupant> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Occupant::Gone),
        Err(e) => return Err(IpcertError::io(path, e)),
    };

    if let Ok(holder) = serde_json::from_str::<LockInfo>(&content) {
        if holder.process_alive() {
            return Ok(Occupant::Live(holder));
        }
        info!(
            target: "audit",
            "clearing stale lock from dead pid {} ({})", holder.pid, holder.operation
        );
        return Ok(Occupant::Stale(content));
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Occupant::Gone),
        Err(e) => return Err(IpcertError::io(path, e)),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < UNREADABLE_GRACE {
        return Ok(Occupant::Live(LockInfo {
            pid: 0,
            acquired_at: DateTime::<Utc>::from(modified),
            hostname: "unknown".to_string(),
            operation: "unknown (lock file being written)".to_string(),
        }));
    }
    warn!(
        "Lock file {} is unreadable and {}s old, treating as stale",
        path.display(),
        age.as_secs()
    );
    Ok(Occupant::Stale(content))
}

/// Move the stale file aside and delete it only if it is still the one that
/// was judged stale; a lock created in the meantime is linked back.
fn clear_stale(path: &Path, seen: &str) -> Result<()> {
    let aside = sibling(path, "stale");
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(IpcertError::io(path, e)),
    }

    let moved = fs::read_to_string(&aside).unwrap_or_default();
    if moved != seen {
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => warn!("Could not put back lock {}: {}", path.display(), e),
        }
    }
    fs::remove_file(&aside).map_err(|e| IpcertError::io(&aside, e))
}
