//! Per-slot advisory locks, backed by `flock` (via the `fs2` crate)
//! on files under `<workspaces_dir>/locks/`. The lock is advisory
//! between participants that all go through this manager; it is
//! effective across threads of one process and across processes
//! sharing the filesystem. Dropping the returned guard releases the
//! lock on every exit path. The lock file itself is left behind on
//! release; presence plus mtime is what the stale-lock detector
//! observes.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use anyhow::Result;
use fs2::{lock_contended_error, FileExt};
use lazy_static::lazy_static;

use crate::{ctx, debug, errors::LockTimeoutError, serde::slot_id::SlotId, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const LOCK_FILE_SUFFIX: &str = ".lock";

lazy_static! {
    static ref DEBUGGING: bool = match std::env::var_os("DEBUG_SLOT_LOCKS") {
        Some(val) => match val
            .into_string()
            .expect("utf-8 for env var DEBUG_SLOT_LOCKS")
            .as_str()
        {
            "0" => false,
            "1" | "" => true,
            _ => panic!("need 1|0 or empty string for DEBUG_SLOT_LOCKS"),
        },
        None => false,
    };
}

/// Holds the exclusive lock for one slot until dropped.
#[must_use]
#[derive(Debug)]
pub struct SlotLockGuard {
    slot_id: SlotId,
    file: File,
}

impl SlotLockGuard {
    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }
}

impl Drop for SlotLockGuard {
    fn drop(&mut self) {
        self.file
            .unlock()
            .expect("no other path to unlock exists");
        if *DEBUGGING {
            eprintln!("released slot lock {}", self.slot_id);
        }
    }
}

#[derive(Debug)]
pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Result<Self> {
        let locks_dir = locks_dir.into();
        std::fs::create_dir_all(&locks_dir)
            .map_err(ctx!("creating locks directory {locks_dir:?}"))?;
        debug!("LockManager initialized with locks_dir {locks_dir:?}");
        Ok(Self { locks_dir })
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    fn lock_path(&self, slot_id: &SlotId) -> PathBuf {
        self.locks_dir.join(slot_id.lock_file_name())
    }

    fn open_lock_file(&self, slot_id: &SlotId) -> Result<File> {
        let path = self.lock_path(slot_id);
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(ctx!("opening lock file {path:?}"))
    }

    /// Acquire the slot's lock, blocking up to `timeout`. With a zero
    /// timeout this degenerates to a single non-blocking attempt.
    pub fn acquire(&self, slot_id: &SlotId, timeout: Duration) -> Result<SlotLockGuard> {
        let start = Instant::now();
        let file = self.open_lock_file(slot_id)?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if *DEBUGGING {
                        eprintln!(
                            "acquired slot lock {slot_id} after {:?}",
                            start.elapsed()
                        );
                    }
                    // Refresh the mtime: stale-lock detection keys off it.
                    let mut file = file;
                    let _ = writeln!(file, "pid {}", std::process::id());
                    let _ = file.flush();
                    return Ok(SlotLockGuard {
                        slot_id: slot_id.clone(),
                        file,
                    });
                }
                Err(e) => {
                    if e.kind() != lock_contended_error().kind() {
                        return Err(e).map_err(ctx!("locking {:?}", self.lock_path(slot_id)));
                    }
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!("lock acquisition timed out for {slot_id} after {elapsed:?}");
                return Err(LockTimeoutError {
                    slot_id: slot_id.clone(),
                    timeout,
                }
                .into());
            }
            let remaining = timeout - elapsed;
            std::thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    /// Non-blocking probe: attempt to take the lock and release it
    /// again. True iff some other holder currently has it.
    pub fn is_held(&self, slot_id: &SlotId) -> bool {
        if !self.lock_path(slot_id).exists() {
            return false;
        }
        let file = match self.open_lock_file(slot_id) {
            Ok(file) => file,
            Err(e) => {
                warn!("lock probe for {slot_id} failed to open lock file: {e:#}");
                return false;
            }
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    /// Remove the backing file unconditionally. Dangerous: a holder's
    /// flock survives on its open handle, but the *next* acquirer
    /// locks a fresh file and no longer excludes it. Only for
    /// orphaned-lock recovery.
    pub fn force_release(&self, lock_name: &str) -> Result<()> {
        let path = self.locks_dir.join(format!("{lock_name}{LOCK_FILE_SUFFIX}"));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                warn!("force-released lock {lock_name:?} by removing {path:?}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("force release of {lock_name:?}: no lock file present");
                Ok(())
            }
            Err(e) => Err(e).map_err(ctx!("removing lock file {path:?}")),
        }
    }

    /// Names (file stems) of lock files whose mtime is older than
    /// `max_age_hours`. Stale locks usually mean a crashed process.
    pub fn detect_stale(&self, max_age_hours: u32) -> Result<Vec<String>> {
        let mut stale = vec![];
        if !self.locks_dir.exists() {
            return Ok(stale);
        }
        let cutoff =
            SystemTime::now() - Duration::from_secs(u64::from(max_age_hours) * 3600);
        for entry in std::fs::read_dir(&self.locks_dir)
            .map_err(ctx!("reading locks directory {:?}", self.locks_dir))?
        {
            let entry = entry.map_err(ctx!("reading locks directory {:?}", self.locks_dir))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(LOCK_FILE_SUFFIX) else {
                continue;
            };
            let mtime = match entry.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    warn!("cannot stat lock file {path:?}: {e}");
                    continue;
                }
            };
            if mtime < cutoff {
                debug!("stale lock {stem:?} (mtime {mtime:?})");
                stale.push(stem.to_owned());
            }
        }
        Ok(stale)
    }

    /// Detect and force-release every stale lock; returns how many
    /// were removed.
    pub fn cleanup_stale(&self, max_age_hours: u32) -> Result<u32> {
        let stale = self.detect_stale(max_age_hours)?;
        let mut cleaned = 0;
        for name in &stale {
            match self.force_release(name) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("failed to clean up stale lock {name:?}: {e:#}"),
            }
        }
        Ok(cleaned)
    }
}
