//! The cleanup pipeline that restores a slot to a deterministic
//! state: `fetch --all --prune`, `clean -fdx`, `reset --hard HEAD`,
//! followed by a refresh of the slot's observed branch and commit.
//! Also: warm-up (fetch only), integrity verification, and
//! repair-by-reclone for corrupted slots. Batch execution runs on a
//! bounded rayon pool, fire-and-forget execution on the long-lived
//! background worker pool.
//!
//! The cleaner mutates the in-memory slot (state, branch, commit); it
//! never persists records and never takes locks. Callers hold the
//! slot lock and save the slot afterwards.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    backend::register_slot_record_exclude,
    background::{BackgroundRunner, DEFAULT_BACKGROUND_WORKERS},
    debug,
    git::GitRunner,
    info,
    serde::{date_and_time::DateTimeWithOffset, slot_id::SlotId},
    slot::{Slot, SlotState},
    store::SLOT_FILE_NAME,
    warn,
};

pub const CLEANUP_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_CLEANUP_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKind {
    BeforeAllocation,
    AfterRelease,
    Warmup,
}

impl CleanupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupKind::BeforeAllocation => "before_allocation",
            CleanupKind::AfterRelease => "after_release",
            CleanupKind::Warmup => "warmup",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub slot_id: SlotId,
    pub success: bool,
    pub duration_seconds: f64,
    pub operations: Vec<String>,
    pub errors: Vec<String>,
}

/// One entry of the bounded in-memory cleanup log.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupRecord {
    pub slot_id: SlotId,
    pub operation: CleanupKind,
    pub success: bool,
    pub duration_seconds: f64,
    pub operations: Vec<String>,
    pub errors: Vec<String>,
    pub timestamp: DateTimeWithOffset,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub slot_id: SlotId,
    pub success: bool,
    pub actions_taken: Vec<String>,
    pub errors: Vec<String>,
    pub timestamp: DateTimeWithOffset,
}

pub struct SlotCleaner {
    git: GitRunner,
    log: Mutex<VecDeque<CleanupRecord>>,
    background: BackgroundRunner,
}

impl SlotCleaner {
    pub fn new(git: GitRunner) -> Self {
        Self {
            git,
            log: Mutex::new(VecDeque::new()),
            background: BackgroundRunner::new(DEFAULT_BACKGROUND_WORKERS),
        }
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    pub fn background(&self) -> &BackgroundRunner {
        &self.background
    }

    /// fetch, clean, reset, then refresh the observed branch/commit.
    /// Failures of individual steps are collected, not short-circuited.
    fn run_pipeline(
        &self,
        slot: &mut Slot,
        fetch: bool,
        operations: &mut Vec<String>,
        errors: &mut Vec<String>,
    ) {
        let dir = slot.slot_path.clone();

        if fetch {
            match self.git.fetch_all_prune(&dir) {
                Ok(_) => operations.push("fetch".to_owned()),
                Err(e) => errors.push(format!("fetch failed: {e:#}")),
            }
        }
        match self.git.clean_force_untracked(&dir, &[SLOT_FILE_NAME]) {
            Ok(_) => operations.push("clean".to_owned()),
            Err(e) => errors.push(format!("clean failed: {e:#}")),
        }
        match self.git.reset_hard(&dir, "HEAD") {
            Ok(_) => operations.push("reset".to_owned()),
            Err(e) => errors.push(format!("reset failed: {e:#}")),
        }

        self.refresh_git_info(slot, errors);
    }

    fn refresh_git_info(&self, slot: &mut Slot, errors: &mut Vec<String>) {
        match self.git.current_branch(&slot.slot_path) {
            Ok(branch) => slot.current_branch = Some(branch),
            Err(e) => errors.push(format!("failed to read current branch: {e:#}")),
        }
        match self.git.current_commit(&slot.slot_path) {
            Ok(commit) => slot.current_commit = Some(commit),
            Err(e) => errors.push(format!("failed to read current commit: {e:#}")),
        }
    }

    /// The pre-allocation cleanup. The slot is CLEANING while the
    /// pipeline runs; on success the prior state is restored, on any
    /// failure the slot goes to ERROR.
    pub fn cleanup_before_allocation(&self, slot: &mut Slot) -> CleanupResult {
        self.cleanup_before_allocation_inner(slot, true)
    }

    /// Variant used for pools configured with `fetch_on_allocate:
    /// false`: clean and reset still run, only the network round trip
    /// is skipped.
    pub fn cleanup_before_allocation_without_fetch(&self, slot: &mut Slot) -> CleanupResult {
        self.cleanup_before_allocation_inner(slot, false)
    }

    fn cleanup_before_allocation_inner(&self, slot: &mut Slot, fetch: bool) -> CleanupResult {
        let start = Instant::now();
        let mut operations = vec![];
        let mut errors = vec![];

        let original_state = slot.state;
        slot.state = SlotState::Cleaning;
        self.run_pipeline(slot, fetch, &mut operations, &mut errors);

        let success = errors.is_empty();
        slot.state = if success {
            original_state
        } else {
            SlotState::Error
        };
        slot.touch();

        self.finish(
            slot,
            CleanupKind::BeforeAllocation,
            success,
            start,
            operations,
            errors,
        )
    }

    /// The post-release cleanup. On success the slot becomes
    /// AVAILABLE, on failure ERROR.
    pub fn cleanup_after_release(&self, slot: &mut Slot) -> CleanupResult {
        let start = Instant::now();
        let mut operations = vec![];
        let mut errors = vec![];

        slot.state = SlotState::Cleaning;
        self.run_pipeline(slot, true, &mut operations, &mut errors);

        let success = errors.is_empty();
        slot.state = if success {
            SlotState::Available
        } else {
            SlotState::Error
        };
        slot.touch();

        self.finish(
            slot,
            CleanupKind::AfterRelease,
            success,
            start,
            operations,
            errors,
        )
    }

    /// Fetch-only warm-up to pre-pay network latency before demand
    /// arrives. Only legal on AVAILABLE slots; others get a failure
    /// result, not an error.
    pub fn warmup(&self, slot: &mut Slot) -> CleanupResult {
        let start = Instant::now();
        let mut operations = vec![];
        let mut errors = vec![];

        if slot.state != SlotState::Available {
            return CleanupResult {
                slot_id: slot.slot_id.clone(),
                success: false,
                duration_seconds: 0.,
                operations,
                errors: vec![format!(
                    "slot not available for warmup (state: {})",
                    slot.state
                )],
            };
        }

        match self.git.fetch_all_prune(&slot.slot_path) {
            Ok(_) => operations.push("fetch".to_owned()),
            Err(e) => errors.push(format!("fetch failed: {e:#}")),
        }

        if self.verify_slot_integrity(slot) {
            operations.push("verify_integrity".to_owned());
        } else {
            errors.push("integrity verification failed".to_owned());
        }

        self.refresh_git_info(slot, &mut errors);
        slot.touch();
        operations.push("update_metadata".to_owned());

        let success = errors.is_empty();
        self.finish(slot, CleanupKind::Warmup, success, start, operations, errors)
    }

    pub fn run(&self, kind: CleanupKind, slot: &mut Slot) -> CleanupResult {
        match kind {
            CleanupKind::BeforeAllocation => self.cleanup_before_allocation(slot),
            CleanupKind::AfterRelease => self.cleanup_after_release(slot),
            CleanupKind::Warmup => self.warmup(slot),
        }
    }

    fn finish(
        &self,
        slot: &Slot,
        operation: CleanupKind,
        success: bool,
        start: Instant,
        operations: Vec<String>,
        errors: Vec<String>,
    ) -> CleanupResult {
        let duration_seconds = start.elapsed().as_secs_f64();
        if success {
            info!(
                "{} cleanup of {} ok in {duration_seconds:.2}s",
                operation.as_str(),
                slot.slot_id
            );
        } else {
            warn!(
                "{} cleanup of {} failed: {}",
                operation.as_str(),
                slot.slot_id,
                errors.join("; ")
            );
        }
        let record = CleanupRecord {
            slot_id: slot.slot_id.clone(),
            operation,
            success,
            duration_seconds,
            operations: operations.clone(),
            errors: errors.clone(),
            timestamp: DateTimeWithOffset::now(),
        };
        {
            let mut log = self.log.lock().expect("cleanup log mutex");
            if log.len() == CLEANUP_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(record);
        }
        CleanupResult {
            slot_id: slot.slot_id.clone(),
            success,
            duration_seconds,
            operations,
            errors,
        }
    }

    /// The cleanup log, newest last, optionally filtered to one slot.
    pub fn cleanup_log(&self, slot_id: Option<&SlotId>) -> Vec<CleanupRecord> {
        let log = self.log.lock().expect("cleanup log mutex");
        log.iter()
            .filter(|record| slot_id.map_or(true, |id| &record.slot_id == id))
            .cloned()
            .collect()
    }

    /// Checks, in order: the slot directory exists; `.git` exists in
    /// it (a directory for clones, a gitfile for worktrees); branch
    /// and commit can be read; `git status` runs.
    pub fn verify_slot_integrity(&self, slot: &Slot) -> bool {
        let dir: &Path = &slot.slot_path;
        if !dir.exists() {
            debug!("integrity: {:?} does not exist", slot.slot_path);
            return false;
        }
        if !dir.join(".git").exists() {
            debug!("integrity: {:?} has no .git", slot.slot_path);
            return false;
        }
        match self.git.current_branch(dir) {
            Ok(branch) if !branch.is_empty() => (),
            _ => return false,
        }
        match self.git.current_commit(dir) {
            Ok(commit) if !commit.is_empty() => (),
            _ => return false,
        }
        // Not interested in whether the tree is clean here, only that
        // `git status` works at all.
        self.git.status_ok(dir)
    }

    /// Repair a slot that fails the integrity check: `git fsck`, then
    /// a full cleanup and re-verify; if anything still fails, delete
    /// the directory and re-clone from the recorded URL. The result
    /// lists every action attempted.
    pub fn repair_slot(&self, slot: &mut Slot) -> RepairResult {
        let mut actions_taken = vec![];
        let mut errors = vec![];

        if self.verify_slot_integrity(slot) {
            return RepairResult {
                slot_id: slot.slot_id.clone(),
                success: true,
                actions_taken: vec!["verified_integrity".to_owned()],
                errors,
                timestamp: DateTimeWithOffset::now(),
            };
        }
        actions_taken.push("integrity_check_failed".to_owned());

        if slot.slot_path.join(".git").exists() {
            actions_taken.push("attempting_git_fsck".to_owned());
            match self.git.fsck(&slot.slot_path) {
                Ok(outcome) if outcome.success => {
                    actions_taken.push("fsck_passed".to_owned());
                    let cleanup = self.cleanup_before_allocation(slot);
                    if cleanup.success {
                        actions_taken.push("cleanup_successful".to_owned());
                        if self.verify_slot_integrity(slot) {
                            slot.state = SlotState::Available;
                            slot.touch();
                            return RepairResult {
                                slot_id: slot.slot_id.clone(),
                                success: true,
                                actions_taken,
                                errors,
                                timestamp: DateTimeWithOffset::now(),
                            };
                        }
                    } else {
                        errors.extend(cleanup.errors);
                    }
                }
                Ok(outcome) => errors.push(format!("fsck failed: {}", outcome.stderr)),
                Err(e) => errors.push(format!("fsck error: {e:#}")),
            }
        }

        actions_taken.push("attempting_reclone".to_owned());
        if slot.slot_path.exists() {
            match std::fs::remove_dir_all(&slot.slot_path) {
                Ok(()) => actions_taken.push("deleted_corrupted_directory".to_owned()),
                Err(e) => {
                    errors.push(format!("failed to delete directory: {e}"));
                    slot.state = SlotState::Error;
                    return RepairResult {
                        slot_id: slot.slot_id.clone(),
                        success: false,
                        actions_taken,
                        errors,
                        timestamp: DateTimeWithOffset::now(),
                    };
                }
            }
        }

        match self.git.clone_repo(&slot.repo_url, &slot.slot_path) {
            Ok(_) => {
                actions_taken.push("recloned_repository".to_owned());
                if let Err(e) = register_slot_record_exclude(&slot.slot_path) {
                    warn!(
                        "could not re-register record exclude in {:?}: {e:#}",
                        slot.slot_path
                    );
                }
                self.refresh_git_info(slot, &mut errors);
                slot.state = SlotState::Available;
                slot.touch();
                if self.verify_slot_integrity(slot) {
                    return RepairResult {
                        slot_id: slot.slot_id.clone(),
                        success: true,
                        actions_taken,
                        errors,
                        timestamp: DateTimeWithOffset::now(),
                    };
                }
                errors.push("verification failed after re-clone".to_owned());
            }
            Err(e) => errors.push(format!("re-clone error: {e:#}")),
        }

        slot.state = SlotState::Error;
        RepairResult {
            slot_id: slot.slot_id.clone(),
            success: false,
            actions_taken,
            errors,
            timestamp: DateTimeWithOffset::now(),
        }
    }

    /// Run one cleanup kind over many slots on a bounded worker pool.
    /// Per-slot failures are contained in the per-slot results; the
    /// output is in input order.
    pub fn cleanup_many(
        &self,
        slots: &mut [Slot],
        kind: CleanupKind,
        max_workers: Option<usize>,
    ) -> Result<Vec<CleanupResult>> {
        if slots.is_empty() {
            return Ok(vec![]);
        }
        let workers = max_workers
            .unwrap_or(DEFAULT_CLEANUP_WORKERS)
            .clamp(1, DEFAULT_CLEANUP_WORKERS)
            .min(slots.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| anyhow!("building cleanup worker pool: {e}"))?;
        Ok(pool.install(|| {
            slots
                .par_iter_mut()
                .map(|slot| self.run(kind, slot))
                .collect()
        }))
    }

    /// Submit one cleanup to the background pool and return its task
    /// id immediately. The job works on its own copy of the slot
    /// record and persists nothing; callers that let the slot escape
    /// back into AVAILABLE state must re-take the slot lock and
    /// re-check state inside the job (see the pool manager's
    /// `release_slot_background`).
    pub fn cleanup_background(
        self: Arc<Self>,
        slot: &Slot,
        kind: CleanupKind,
        callback: Option<Box<dyn FnOnce(&CleanupResult) + Send>>,
    ) -> Result<String> {
        let cleaner = self.clone();
        let mut slot = slot.clone();
        let label = format!("{}_{}", slot.slot_id, kind.as_str());
        self.background.submit(&label, move || {
            let result = cleaner.run(kind, &mut slot);
            if let Some(callback) = callback {
                callback(&result);
            }
            result
        })
    }
}

impl std::fmt::Debug for SlotCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotCleaner").finish_non_exhaustive()
    }
}

// Test helpers and unit tests that need a real repository live in the
// integration tests; here only the parts that work without git state.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::serde::git_url::GitUrl;
    use anyhow::Result;
    use std::path::PathBuf;

    fn offline_slot(dir: PathBuf) -> Result<Slot> {
        Ok(Slot::new(
            "workspace-demo-slot1".parse()?,
            "https://example.test/r.git".parse::<GitUrl>()?,
            dir,
            None,
            None,
        ))
    }

    #[test]
    fn t_warmup_rejects_non_available() -> Result<()> {
        let cleaner = SlotCleaner::new(GitRunner::new());
        let tmp = tempfile::tempdir()?;
        let mut slot = offline_slot(tmp.path().to_owned())?;
        slot.state = SlotState::Allocated;
        let result = cleaner.warmup(&mut slot);
        assert!(!result.success);
        assert!(result.operations.is_empty());
        assert!(result.errors[0].contains("allocated"));
        // A rejected warmup is not a pipeline run and is not logged.
        assert!(cleaner.cleanup_log(None).is_empty());
        Ok(())
    }

    #[test]
    fn t_background_cleanup_returns_result() -> Result<()> {
        let cleaner = Arc::new(SlotCleaner::new(GitRunner::with_limits(
            1,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_secs(5),
        )));
        let tmp = tempfile::tempdir()?;
        let slot = offline_slot(tmp.path().to_owned())?;
        let task_id =
            cleaner
                .clone()
                .cleanup_background(&slot, CleanupKind::AfterRelease, None)?;
        let result = cleaner
            .background()
            .await_result(&task_id, Some(std::time::Duration::from_secs(30)))
            .expect("background cleanup finished");
        // The tempdir is not a repository, so the pipeline fails, but
        // the failure is contained in the result.
        assert!(!result.success);
        assert_eq!(result.slot_id, slot.slot_id);
        Ok(())
    }

    #[test]
    fn t_cleanup_many_contains_per_slot_failures() -> Result<()> {
        let cleaner = SlotCleaner::new(GitRunner::with_limits(
            1,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_secs(5),
        ));
        let tmp = tempfile::tempdir()?;
        let mut slots = vec![];
        for n in 1..=3 {
            let mut slot = offline_slot(tmp.path().join(format!("slot{n}")))?;
            slot.slot_id = format!("workspace-demo-slot{n}").parse()?;
            std::fs::create_dir_all(&slot.slot_path)?;
            slots.push(slot);
        }
        let results = cleaner.cleanup_many(&mut slots, CleanupKind::AfterRelease, Some(2))?;
        assert_eq!(results.len(), 3);
        // None of the directories is a repository: each failure is
        // reported for its own slot, in input order.
        for (n, result) in results.iter().enumerate() {
            assert!(!result.success);
            assert_eq!(result.slot_id.index(), n as u32 + 1);
        }
        assert!(slots.iter().all(|s| s.state == SlotState::Error));
        Ok(())
    }

    #[test]
    fn t_integrity_fails_without_directory() -> Result<()> {
        let cleaner = SlotCleaner::new(GitRunner::new());
        let slot = offline_slot(PathBuf::from("/nonexistent/slot1"))?;
        assert!(!cleaner.verify_slot_integrity(&slot));
        Ok(())
    }

    #[test]
    fn t_cleanup_log_filterable() -> Result<()> {
        let cleaner = SlotCleaner::new(GitRunner::with_limits(
            1,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_secs(5),
        ));
        let tmp = tempfile::tempdir()?;
        // Not a git repository: every pipeline run fails but still logs.
        let mut slot = offline_slot(tmp.path().to_owned())?;
        for _ in 0..3 {
            slot.state = SlotState::Available;
            let result = cleaner.cleanup_after_release(&mut slot);
            assert!(!result.success);
            assert_eq!(slot.state, SlotState::Error);
        }
        assert_eq!(cleaner.cleanup_log(None).len(), 3);
        assert_eq!(cleaner.cleanup_log(Some(&slot.slot_id)).len(), 3);
        let other: SlotId = "workspace-demo-slot2".parse()?;
        assert!(cleaner.cleanup_log(Some(&other)).is_empty());
        Ok(())
    }
}
