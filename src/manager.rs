//! The public façade: pool lifecycle, the allocate/release protocol,
//! status queries, and the anomaly-detection / auto-recovery sweeps.
//!
//! Lock discipline: the slot lock is acquired for every transition
//! out of or into AVAILABLE and released when the call returns; it is
//! *not* retained while an agent works in the slot. Mutual exclusion
//! during the agent's tenure rests on the slot being persisted as
//! ALLOCATED. Managers in different processes coordinate purely via
//! the shared workspaces directory and these advisory locks.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    allocator::SlotAllocator,
    backend::BackendKind,
    cleaner::{CleanupKind, CleanupResult, SlotCleaner},
    config::{CleanupOptions, PoolConfig},
    config_file::LoadConfigFile,
    ctx,
    errors::{NoAvailableSlotError, PoolNotFoundError, SlotAllocationError},
    git::GitRunner,
    info,
    lock_manager::LockManager,
    path_util::dir_size,
    serde::{date_and_time::DateTimeWithOffset, git_url::GitUrl, repo_name::RepoName, slot_id::SlotId},
    slot::{AllocationMetrics, Metadata, Pool, PoolSummary, Slot, SlotState, SlotStatus},
    store::SlotStore,
    warn,
};

const TIMING_HISTORY_CAPACITY: usize = 1000;

/// Result of one batch (warm-up or cleanup) pass over a pool.
#[derive(Debug, Serialize)]
pub struct PoolBatchReport {
    pub repo_name: RepoName,
    pub slots_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub results: Vec<CleanupResult>,
}

/// What one `detect_anomalies` sweep found.
#[derive(Debug, Serialize)]
pub struct Anomalies {
    pub long_allocated_slots: Vec<Slot>,
    pub corrupted_slots: Vec<Slot>,
    pub orphaned_locks: Vec<String>,
}

impl Anomalies {
    pub fn total(&self) -> usize {
        self.long_allocated_slots.len() + self.corrupted_slots.len() + self.orphaned_locks.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutoRecoverOptions {
    pub max_allocation_hours: u32,
    pub recover_corrupted: bool,
    pub cleanup_orphaned_locks: bool,
    pub force_release_long_allocated: bool,
}

impl Default for AutoRecoverOptions {
    fn default() -> Self {
        Self {
            max_allocation_hours: 24,
            recover_corrupted: true,
            cleanup_orphaned_locks: true,
            force_release_long_allocated: false,
        }
    }
}

/// Outcome of one `auto_recover` run; best-effort, per-item errors
/// are collected instead of raised.
#[derive(Debug, Default, Serialize)]
pub struct AutoRecoverReport {
    pub long_allocated_released: u32,
    pub corrupted_recovered: u32,
    pub corrupted_isolated: u32,
    pub orphaned_locks_cleaned: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupStats {
    pub total_cleanups: usize,
    pub successful_cleanups: usize,
    pub failed_cleanups: usize,
    pub average_time_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct PoolPerformance {
    pub allocation: AllocationMetrics,
    pub cleanup: CleanupStats,
    pub summary: Option<PoolSummary>,
}

#[derive(Default)]
struct ManagerMetrics {
    allocation_times: HashMap<RepoName, Vec<f64>>,
    cleanup_times: HashMap<RepoName, Vec<f64>>,
}

impl ManagerMetrics {
    fn record(map: &mut HashMap<RepoName, Vec<f64>>, repo_name: &RepoName, seconds: f64) {
        let times = map.entry(repo_name.clone()).or_default();
        times.push(seconds);
        if times.len() > TIMING_HISTORY_CAPACITY {
            let excess = times.len() - TIMING_HISTORY_CAPACITY;
            times.drain(..excess);
        }
    }
}

pub struct PoolManager {
    config: PoolConfig,
    store: Arc<SlotStore>,
    locks: Arc<LockManager>,
    git: GitRunner,
    cleaner: Arc<SlotCleaner>,
    allocator: SlotAllocator,
    metrics: Mutex<ManagerMetrics>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SlotStore::new(&config.workspaces_dir)?);
        let locks = Arc::new(LockManager::new(store.locks_dir())?);
        let git = GitRunner::new();
        let cleaner = Arc::new(SlotCleaner::new(git.clone()));
        let allocator = SlotAllocator::new(store.clone(), config.enable_metrics);
        info!(
            "pool manager initialized with workspaces_dir {:?}",
            config.workspaces_dir
        );
        Ok(Self {
            config,
            store,
            locks,
            git,
            cleaner,
            allocator,
            metrics: Mutex::new(Default::default()),
        })
    }

    /// Build a manager from a configuration file (or the default
    /// config location, or built-in defaults when no file exists),
    /// optionally creating all configured pools that are missing.
    pub fn from_config_file(path: Option<&Path>, auto_init_pools: bool) -> Result<Self> {
        let config = PoolConfig::load_config(path, |tried| {
            info!("no configuration file found ({tried}); using defaults");
            Ok(PoolConfig::default())
        })?;
        let manager = Self::new(config)?;
        if auto_init_pools {
            manager.initialize_pools_from_config()?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn cleaner(&self) -> &Arc<SlotCleaner> {
        &self.cleaner
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    fn cleanup_options(&self, repo_name: &RepoName) -> CleanupOptions {
        self.config
            .pools
            .get(repo_name)
            .map(|definition| definition.cleanup_options.clone())
            .unwrap_or_default()
    }

    // ===== pool lifecycle ===========================================

    /// Create every pool the configuration defines that does not
    /// exist yet. Failures are logged and do not abort the remaining
    /// pools; returns the names actually created.
    pub fn initialize_pools_from_config(&self) -> Result<Vec<RepoName>> {
        let mut created = vec![];
        for (repo_name, definition) in &self.config.pools {
            if self.store.pool_exists(repo_name) {
                info!("pool {repo_name} already exists, skipping");
                continue;
            }
            let num_slots = self.config.num_slots_for(definition);
            let backend = definition.backend.unwrap_or(BackendKind::Clones);
            match self.create_pool(repo_name, &definition.repo_url, num_slots, backend) {
                Ok(_) => {
                    created.push(repo_name.clone());
                    if definition.cleanup_options.warmup_enabled {
                        if let Err(e) = self.warmup_pool(repo_name, None) {
                            warn!("initial warmup of pool {repo_name} failed: {e:#}");
                        }
                    }
                }
                Err(e) => warn!("failed to create pool {repo_name}: {e:#}"),
            }
        }
        Ok(created)
    }

    /// Re-read the configuration file and create any newly defined
    /// pools.
    pub fn reload_config(&mut self, path: Option<&Path>) -> Result<()> {
        let config = PoolConfig::load_config(path, |tried| {
            Err(anyhow!("cannot reload configuration: {tried}"))
        })?;
        config.validate()?;
        self.config = config;
        info!("configuration reloaded");
        self.initialize_pools_from_config()?;
        Ok(())
    }

    /// Create a pool with `num_slots` freshly provisioned slots.
    /// Refuses when the pool already exists. When a slot fails to
    /// provision the whole operation aborts, leaving the partial
    /// state on disk for inspection (no automatic rollback).
    pub fn create_pool(
        &self,
        repo_name: &RepoName,
        repo_url: &GitUrl,
        num_slots: u32,
        backend: BackendKind,
    ) -> Result<Pool> {
        if num_slots < 1 {
            return Err(anyhow!("num_slots must be at least 1"));
        }
        if self.store.pool_exists(repo_name) {
            return Err(anyhow!("pool {repo_name:?} already exists"));
        }
        info!(
            "creating pool {repo_name} with {num_slots} {backend} slot(s) from {repo_url}"
        );

        let pool_dir = self.store.pool_dir(repo_name);
        let provisioner = backend.provisioner();
        provisioner.prepare_pool(&self.git, &pool_dir, repo_url)?;

        let mut pool = Pool::new(repo_name.clone(), repo_url.clone(), num_slots);
        for index in 1..=num_slots {
            let slot_id = SlotId::new(repo_name.clone(), index)?;
            info!("creating slot {index}/{num_slots}: {slot_id}");
            let slot = self
                .provision_slot(provisioner, &pool_dir, &slot_id, repo_url)
                .map_err(|e| SlotAllocationError {
                    message: format!("failed to create slot {slot_id}: {e:#}"),
                })?;
            pool.slots.push(slot);
        }

        self.store.save_pool(&pool)?;
        info!("created pool {repo_name} with {num_slots} slot(s)");
        Ok(pool)
    }

    fn provision_slot(
        &self,
        provisioner: &dyn crate::backend::SlotProvisioner,
        pool_dir: &Path,
        slot_id: &SlotId,
        repo_url: &GitUrl,
    ) -> Result<Slot> {
        let tree = provisioner.provision(&self.git, pool_dir, slot_id, repo_url)?;
        let current_branch = self.git.current_branch(&tree).ok();
        let current_commit = self.git.current_commit(&tree).ok();
        let slot = Slot::new(
            slot_id.clone(),
            repo_url.clone(),
            tree,
            current_branch,
            current_commit,
        );
        self.store.save_slot(&slot)?;
        Ok(slot)
    }

    pub fn get_pool(&self, repo_name: &RepoName) -> Result<Pool> {
        self.store.load_pool(repo_name)
    }

    pub fn list_pools(&self) -> Result<Vec<RepoName>> {
        self.store.list_pools()
    }

    /// Explicit teardown: remove every slot (refusing on ALLOCATED
    /// slots unless `force`), then the pool directory itself.
    pub fn destroy_pool(&self, repo_name: &RepoName, force: bool) -> Result<()> {
        let pool = self.store.load_pool(repo_name)?;
        if !force {
            if let Some(slot) = pool.slots.iter().find(|s| s.state == SlotState::Allocated) {
                return Err(SlotAllocationError {
                    message: format!(
                        "cannot destroy pool {repo_name:?}: slot {} is allocated \
                         (use force to destroy anyway)",
                        slot.slot_id
                    ),
                }
                .into());
            }
        }
        for slot in &pool.slots {
            self.remove_slot(&slot.slot_id, force)?;
        }
        let pool_dir = self.store.pool_dir(repo_name);
        std::fs::remove_dir_all(&pool_dir)
            .map_err(ctx!("removing pool directory {pool_dir:?}"))?;
        info!("destroyed pool {repo_name}");
        Ok(())
    }

    // ===== allocation / release =====================================

    /// The hot path. Finds an AVAILABLE slot, takes its lock, re-reads
    /// it (another process may have won the race, in which case the
    /// search repeats), runs the pre-allocation cleanup, and hands
    /// the slot out in ALLOCATED state. The lock is dropped before
    /// returning.
    pub fn allocate_slot(
        &self,
        repo_name: &RepoName,
        metadata: Option<Metadata>,
    ) -> Result<Slot> {
        let start = Instant::now();
        if !self.store.pool_exists(repo_name) {
            return Err(PoolNotFoundError {
                repo_name: repo_name.to_string(),
            }
            .into());
        }
        let options = self.cleanup_options(repo_name);

        loop {
            let Some(candidate) = self.allocator.find_available(repo_name)? else {
                return Err(NoAvailableSlotError {
                    repo_name: repo_name.to_string(),
                }
                .into());
            };
            let slot_id = candidate.slot_id.clone();
            let _guard = self
                .locks
                .acquire(&slot_id, self.config.lock_timeout_duration())?;

            let mut slot = self.store.load_slot(&slot_id)?;
            if !slot.is_available() {
                info!(
                    "slot {slot_id} taken by someone else between find and lock \
                     (state: {}), retrying",
                    slot.state
                );
                continue;
            }

            let cleanup = if options.fetch_on_allocate {
                self.cleaner.cleanup_before_allocation(&mut slot)
            } else {
                self.cleaner.cleanup_before_allocation_without_fetch(&mut slot)
            };
            if !cleanup.success {
                // The cleaner set the slot to ERROR; persist that and
                // surface the failure.
                self.store.save_slot(&slot)?;
                return Err(SlotAllocationError {
                    message: format!(
                        "cleanup failed for slot {slot_id}: {}",
                        cleanup.errors.iter().join("; ")
                    ),
                }
                .into());
            }
            // Persist the refreshed branch/commit before the state flip.
            self.store.save_slot(&slot)?;

            let slot = self.allocator.mark_allocated(&slot_id, metadata)?;
            let elapsed = start.elapsed().as_secs_f64();
            {
                let mut metrics = self.metrics.lock().expect("manager metrics mutex");
                ManagerMetrics::record(&mut metrics.allocation_times, repo_name, elapsed);
                ManagerMetrics::record(
                    &mut metrics.cleanup_times,
                    repo_name,
                    cleanup.duration_seconds,
                );
            }
            info!(
                "allocated slot {slot_id} (allocation #{}, {elapsed:.2}s)",
                slot.allocation_count
            );
            return Ok(slot);
        }
    }

    /// Release a slot back to the pool, running the post-release
    /// cleanup while still holding the lock. A failing cleanup does
    /// not raise: the slot ends up in ERROR (with its usage time
    /// still accounted) and stays out of rotation until recovered.
    pub fn release_slot(&self, slot_id: &SlotId, cleanup: bool) -> Result<()> {
        let _guard = self
            .locks
            .acquire(slot_id, self.config.lock_timeout_duration())?;
        let mut slot = self.store.load_slot(slot_id)?;
        let options = self.cleanup_options(slot_id.repo_name());

        if cleanup && options.clean_on_release {
            let result = self.cleaner.cleanup_after_release(&mut slot);
            {
                let mut metrics = self.metrics.lock().expect("manager metrics mutex");
                ManagerMetrics::record(
                    &mut metrics.cleanup_times,
                    slot_id.repo_name(),
                    result.duration_seconds,
                );
            }
            if result.success {
                self.store.save_slot(&slot)?;
                self.allocator.mark_available(slot_id)?;
            } else {
                warn!(
                    "cleanup on release of {slot_id} failed, slot goes to ERROR: {}",
                    result.errors.iter().join("; ")
                );
                // Account the usage, then pin the ERROR state.
                slot.mark_released();
                slot.state = SlotState::Error;
                self.store.save_slot(&slot)?;
            }
        } else {
            self.allocator.mark_available(slot_id)?;
        }
        info!("released slot {slot_id}");
        Ok(())
    }

    /// Release the slot immediately and run the cleanup
    /// asynchronously; returns the background task id (None when
    /// cleanup was not requested). The background job re-acquires the
    /// slot lock and re-checks that the slot is still AVAILABLE
    /// before touching the tree, so a slot re-allocated in the
    /// meantime is left alone; the next allocation's pre-cleanup
    /// restores cleanliness.
    pub fn release_slot_background(
        &self,
        slot_id: &SlotId,
        cleanup: bool,
    ) -> Result<Option<String>> {
        let guard = self
            .locks
            .acquire(slot_id, self.config.lock_timeout_duration())?;
        self.allocator.mark_available(slot_id)?;
        info!("slot {slot_id} marked available, cleanup deferred to background");
        drop(guard);

        if !(cleanup && self.cleanup_options(slot_id.repo_name()).clean_on_release) {
            return Ok(None);
        }

        let store = self.store.clone();
        let locks = self.locks.clone();
        let cleaner = self.cleaner.clone();
        let lock_timeout = self.config.lock_timeout_duration();
        let job_slot_id = slot_id.clone();
        let label = format!("{slot_id}_after_release");
        let task_id = self.cleaner.background().submit(&label, move || {
            background_release_cleanup(&store, &locks, &cleaner, &job_slot_id, lock_timeout)
        })?;
        Ok(Some(task_id))
    }

    // ===== status ===================================================

    pub fn get_slot_status(&self, slot_id: &SlotId) -> Result<SlotStatus> {
        let slot = self.store.load_slot(slot_id)?;
        let is_locked = self.locks.is_held(slot_id);
        let disk_usage_mb = if slot.slot_path.exists() {
            dir_size(&slot.slot_path) as f64 / (1024. * 1024.)
        } else {
            0.
        };
        Ok(SlotStatus {
            slot_id: slot.slot_id,
            state: slot.state,
            is_locked,
            current_branch: slot.current_branch,
            current_commit: slot.current_commit,
            allocation_count: slot.allocation_count,
            last_allocated_at: slot.last_allocated_at,
            disk_usage_mb,
        })
    }

    pub fn get_pool_summary(&self) -> Result<BTreeMap<RepoName, PoolSummary>> {
        let mut summaries = BTreeMap::new();
        for repo_name in self.list_pools()? {
            let pool = match self.get_pool(&repo_name) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("failed to summarize pool {repo_name}: {e:#}");
                    continue;
                }
            };
            let count = |state: SlotState| pool.slots.iter().filter(|s| s.state == state).count();
            let total_allocations: u64 = pool.slots.iter().map(|s| s.allocation_count).sum();
            let total_usage: f64 = pool.slots.iter().map(|s| s.total_usage_seconds).sum();
            let average_allocation_time_seconds = if total_allocations > 0 {
                total_usage / total_allocations as f64
            } else {
                0.
            };
            summaries.insert(
                repo_name.clone(),
                PoolSummary {
                    repo_name,
                    total_slots: pool.num_slots,
                    available_slots: count(SlotState::Available),
                    allocated_slots: count(SlotState::Allocated),
                    cleaning_slots: count(SlotState::Cleaning),
                    error_slots: count(SlotState::Error),
                    total_allocations,
                    average_allocation_time_seconds,
                },
            );
        }
        Ok(summaries)
    }

    // ===== dynamic sizing ===========================================

    /// Add one slot to an existing pool. The new index is one past
    /// the highest ever used; indices of removed slots are not
    /// reused.
    pub fn add_slot(&self, repo_name: &RepoName) -> Result<Slot> {
        let mut pool = self.store.load_pool(repo_name)?;
        let next_index = pool
            .slots
            .iter()
            .map(|slot| slot.slot_id.index())
            .max()
            .unwrap_or(0)
            + 1;
        let slot_id = SlotId::new(repo_name.clone(), next_index)?;
        info!("adding slot {slot_id} to pool {repo_name}");

        let pool_dir = self.store.pool_dir(repo_name);
        let provisioner = BackendKind::detect(&pool_dir).provisioner();
        let repo_url = pool.repo_url.clone();
        let slot = self
            .provision_slot(provisioner, &pool_dir, &slot_id, &repo_url)
            .map_err(|e| SlotAllocationError {
                message: format!("failed to add slot {slot_id}: {e:#}"),
            })?;

        pool.num_slots += 1;
        pool.updated_at = DateTimeWithOffset::now();
        self.store.save_pool(&pool)?;
        info!("added slot {slot_id} (pool now has {} slots)", pool.num_slots);
        Ok(slot)
    }

    /// Remove a slot, its working tree, and its record. Refuses on an
    /// ALLOCATED slot unless `force` is set. The deletion happens
    /// under the slot lock.
    pub fn remove_slot(&self, slot_id: &SlotId, force: bool) -> Result<()> {
        let slot = self.store.load_slot(slot_id)?;
        if !force && slot.state == SlotState::Allocated {
            return Err(SlotAllocationError {
                message: format!(
                    "cannot remove slot {slot_id}: currently allocated \
                     (use force to remove anyway)"
                ),
            }
            .into());
        }

        let _guard = self
            .locks
            .acquire(slot_id, self.config.lock_timeout_duration())?;
        let pool_dir = self.store.pool_dir(slot_id.repo_name());
        let provisioner = BackendKind::detect(&pool_dir).provisioner();
        provisioner.deprovision(&self.git, &pool_dir, &slot);
        self.store.delete_slot(slot_id)?;

        let mut pool = self.store.load_pool(slot_id.repo_name())?;
        pool.num_slots = pool.slots.len() as u32;
        pool.updated_at = DateTimeWithOffset::now();
        self.store.save_pool(&pool)?;
        info!(
            "removed slot {slot_id} (pool now has {} slots)",
            pool.num_slots
        );
        Ok(())
    }

    // ===== batch maintenance ========================================

    /// Warm up all AVAILABLE slots of a pool in parallel (fetch +
    /// verify only).
    pub fn warmup_pool(
        &self,
        repo_name: &RepoName,
        max_workers: Option<usize>,
    ) -> Result<PoolBatchReport> {
        self.batch_over_available_slots(repo_name, CleanupKind::Warmup, max_workers)
    }

    /// Run a full cleanup kind over all AVAILABLE slots of a pool in
    /// parallel.
    pub fn cleanup_pool(
        &self,
        repo_name: &RepoName,
        kind: CleanupKind,
        max_workers: Option<usize>,
    ) -> Result<PoolBatchReport> {
        self.batch_over_available_slots(repo_name, kind, max_workers)
    }

    /// Each slot's job independently takes that slot's lock (skipping
    /// busy slots instead of waiting), re-reads the record, runs the
    /// operation, and persists the outcome. No job ever holds more
    /// than one slot lock.
    fn batch_over_available_slots(
        &self,
        repo_name: &RepoName,
        kind: CleanupKind,
        max_workers: Option<usize>,
    ) -> Result<PoolBatchReport> {
        let start = Instant::now();
        let pool = self.store.load_pool(repo_name)?;
        let available: Vec<SlotId> = pool
            .slots
            .iter()
            .filter(|slot| slot.is_available())
            .map(|slot| slot.slot_id.clone())
            .collect();
        if available.is_empty() {
            warn!("no available slots to {} in pool {repo_name}", kind.as_str());
            return Ok(PoolBatchReport {
                repo_name: repo_name.clone(),
                slots_processed: 0,
                successful: 0,
                failed: 0,
                duration_seconds: 0.,
                results: vec![],
            });
        }

        let workers = max_workers.unwrap_or(16).clamp(1, 16).min(available.len());
        let pool_threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| anyhow!("building batch worker pool: {e}"))?;
        let results: Vec<CleanupResult> = pool_threads.install(|| {
            available
                .par_iter()
                .map(|slot_id| self.locked_cleanup(slot_id, kind))
                .collect()
        });

        let successful = results.iter().filter(|r| r.success).count();
        let report = PoolBatchReport {
            repo_name: repo_name.clone(),
            slots_processed: results.len(),
            successful,
            failed: results.len() - successful,
            duration_seconds: start.elapsed().as_secs_f64(),
            results,
        };
        info!(
            "batch {} over pool {repo_name}: {}/{} ok in {:.2}s",
            kind.as_str(),
            report.successful,
            report.slots_processed,
            report.duration_seconds
        );
        Ok(report)
    }

    fn locked_cleanup(&self, slot_id: &SlotId, kind: CleanupKind) -> CleanupResult {
        let failure = |error: String| CleanupResult {
            slot_id: slot_id.clone(),
            success: false,
            duration_seconds: 0.,
            operations: vec![],
            errors: vec![error],
        };
        let _guard = match self.locks.acquire(slot_id, Duration::ZERO) {
            Ok(guard) => guard,
            Err(_) => return failure("slot is locked; skipped".to_owned()),
        };
        let mut slot = match self.store.load_slot(slot_id) {
            Ok(slot) => slot,
            Err(e) => return failure(format!("failed to load slot: {e:#}")),
        };
        let result = self.cleaner.run(kind, &mut slot);
        if let Err(e) = self.store.save_slot(&slot) {
            return failure(format!("failed to persist slot after cleanup: {e:#}"));
        }
        result
    }

    // ===== anomaly detection ========================================

    /// Slots sitting in ALLOCATED longer than `max_allocation_hours`;
    /// usually a crashed or stuck agent.
    pub fn detect_long_allocated_slots(&self, max_allocation_hours: u32) -> Vec<Slot> {
        let mut long_allocated = vec![];
        for repo_name in self.list_pools().unwrap_or_default() {
            let pool = match self.get_pool(&repo_name) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("skipping pool {repo_name} in long-allocation sweep: {e:#}");
                    continue;
                }
            };
            for slot in pool.slots {
                if slot.state != SlotState::Allocated {
                    continue;
                }
                let Some(allocated_at) = &slot.last_allocated_at else {
                    continue;
                };
                if allocated_at.age_hours() > f64::from(max_allocation_hours) {
                    warn!(
                        "slot {} allocated for {:.1}h (threshold {max_allocation_hours}h)",
                        slot.slot_id,
                        allocated_at.age_hours()
                    );
                    long_allocated.push(slot);
                }
            }
        }
        long_allocated
    }

    /// Slots already in ERROR plus slots failing the integrity check.
    pub fn detect_corrupted_slots(&self) -> Vec<Slot> {
        let mut corrupted = vec![];
        for repo_name in self.list_pools().unwrap_or_default() {
            let pool = match self.get_pool(&repo_name) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("skipping pool {repo_name} in corruption sweep: {e:#}");
                    continue;
                }
            };
            for slot in pool.slots {
                if slot.state == SlotState::Error || !self.cleaner.verify_slot_integrity(&slot) {
                    corrupted.push(slot);
                }
            }
        }
        corrupted
    }

    /// Stale lock files whose name matches no slot of any pool.
    pub fn detect_orphaned_locks(&self) -> Vec<String> {
        let mut valid: Vec<String> = vec![];
        for repo_name in self.list_pools().unwrap_or_default() {
            match self.store.list_slot_ids(&repo_name) {
                Ok(ids) => valid.extend(ids.iter().map(|id| id.to_string())),
                Err(e) => warn!("skipping pool {repo_name} in orphan sweep: {e:#}"),
            }
        }
        let stale = match self.locks.detect_stale(self.config.stale_lock_hours) {
            Ok(stale) => stale,
            Err(e) => {
                warn!("stale lock detection failed: {e:#}");
                return vec![];
            }
        };
        stale
            .into_iter()
            .filter(|name| !valid.iter().any(|v| v == name))
            .collect()
    }

    pub fn detect_anomalies(&self, max_allocation_hours: u32) -> Anomalies {
        let anomalies = Anomalies {
            long_allocated_slots: self.detect_long_allocated_slots(max_allocation_hours),
            corrupted_slots: self.detect_corrupted_slots(),
            orphaned_locks: self.detect_orphaned_locks(),
        };
        info!("anomaly sweep found {} issue(s)", anomalies.total());
        anomalies
    }

    // ===== recovery =================================================

    /// Attempt repair under the slot lock. On success the repaired
    /// slot is persisted AVAILABLE. When repair fails and `force` is
    /// set, the slot is asserted AVAILABLE anyway (operator's call);
    /// otherwise it stays ERROR and `false` is returned.
    pub fn recover_slot(&self, slot_id: &SlotId, force: bool) -> Result<bool> {
        let _guard = self
            .locks
            .acquire(slot_id, self.config.lock_timeout_duration())?;
        let mut slot = self.store.load_slot(slot_id)?;
        let repair = self.cleaner.repair_slot(&mut slot);
        if repair.success {
            info!(
                "recovered slot {slot_id}: {}",
                repair.actions_taken.iter().join(", ")
            );
            let pool_dir = self.store.pool_dir(slot_id.repo_name());
            if BackendKind::detect(&pool_dir) == BackendKind::Worktrees {
                // A repair re-clone leaves a dangling worktree
                // registration behind in the shared bare repository.
                let _ = self
                    .git
                    .worktree_prune(&pool_dir.join(crate::backend::MAIN_REPO_DIR_NAME));
            }
            self.store.save_slot(&slot)?;
            return Ok(true);
        }
        warn!(
            "failed to recover slot {slot_id}: {}",
            repair.errors.iter().join("; ")
        );
        if force {
            warn!("force recovery: marking {slot_id} AVAILABLE despite repair failure");
            slot.state = SlotState::Available;
            slot.touch();
            self.store.save_slot(&slot)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Park a slot in ERROR with an isolation marker in its metadata;
    /// it stays out of allocation until an operator intervenes.
    pub fn isolate_slot(&self, slot_id: &SlotId, reason: Option<&str>) -> Result<()> {
        let _guard = self
            .locks
            .acquire(slot_id, self.config.lock_timeout_duration())?;
        let mut slot = self.store.load_slot(slot_id)?;
        slot.state = SlotState::Error;
        slot.touch();
        slot.metadata.insert(
            "isolated_at".to_owned(),
            serde_json::json!(DateTimeWithOffset::now().to_string()),
        );
        slot.metadata.insert(
            "isolation_reason".to_owned(),
            serde_json::json!(reason.unwrap_or("manual isolation or recovery failure")),
        );
        self.store.save_slot(&slot)?;
        warn!("slot {slot_id} isolated; manual recovery required");
        Ok(())
    }

    /// Run the anomaly sweep and take the configured actions.
    /// Best-effort: per-item failures land in the report's error
    /// list, the sweep itself never raises.
    pub fn auto_recover(&self, options: AutoRecoverOptions) -> AutoRecoverReport {
        let mut report = AutoRecoverReport::default();
        let anomalies = self.detect_anomalies(options.max_allocation_hours);

        if options.force_release_long_allocated {
            for slot in &anomalies.long_allocated_slots {
                match self.release_slot(&slot.slot_id, true) {
                    Ok(()) => report.long_allocated_released += 1,
                    Err(e) => report
                        .errors
                        .push(format!("failed to release slot {}: {e:#}", slot.slot_id)),
                }
            }
        } else if !anomalies.long_allocated_slots.is_empty() {
            info!(
                "{} long-allocated slot(s) found, force release disabled",
                anomalies.long_allocated_slots.len()
            );
        }

        if options.recover_corrupted {
            for slot in &anomalies.corrupted_slots {
                match self.recover_slot(&slot.slot_id, false) {
                    Ok(true) => report.corrupted_recovered += 1,
                    Ok(false) => match self.isolate_slot(&slot.slot_id, None) {
                        Ok(()) => report.corrupted_isolated += 1,
                        Err(e) => report
                            .errors
                            .push(format!("failed to isolate slot {}: {e:#}", slot.slot_id)),
                    },
                    Err(e) => report
                        .errors
                        .push(format!("error recovering slot {}: {e:#}", slot.slot_id)),
                }
            }
        }

        if options.cleanup_orphaned_locks {
            for name in &anomalies.orphaned_locks {
                match self.locks.force_release(name) {
                    Ok(()) => report.orphaned_locks_cleaned += 1,
                    Err(e) => report
                        .errors
                        .push(format!("failed to clean orphaned lock {name:?}: {e:#}")),
                }
            }
        }

        info!(
            "auto-recovery: {} released, {} recovered, {} isolated, {} locks cleaned, {} error(s)",
            report.long_allocated_released,
            report.corrupted_recovered,
            report.corrupted_isolated,
            report.orphaned_locks_cleaned,
            report.errors.len()
        );
        report
    }

    // ===== metrics ==================================================

    /// Allocator counters for one pool, with the manager's own
    /// end-to-end timing samples (which include lock wait and
    /// cleanup) taking precedence for the average.
    pub fn allocation_metrics(&self, repo_name: &RepoName) -> AllocationMetrics {
        let mut metrics = self.allocator.allocation_metrics(repo_name);
        let manager_metrics = self.metrics.lock().expect("manager metrics mutex");
        if let Some(times) = manager_metrics.allocation_times.get(repo_name) {
            if !times.is_empty() {
                metrics.average_allocation_time_seconds =
                    times.iter().sum::<f64>() / times.len() as f64;
            }
        }
        metrics
    }

    pub fn performance_metrics(
        &self,
        repo_name: Option<&RepoName>,
    ) -> Result<BTreeMap<RepoName, PoolPerformance>> {
        let repos = match repo_name {
            Some(repo_name) => vec![repo_name.clone()],
            None => self.list_pools()?,
        };
        let summaries = self.get_pool_summary()?;
        let mut out = BTreeMap::new();
        for repo in repos {
            let records: Vec<_> = self
                .cleaner
                .cleanup_log(None)
                .into_iter()
                .filter(|record| record.slot_id.repo_name() == &repo)
                .collect();
            let successful_cleanups = records.iter().filter(|r| r.success).count();
            let average_time_seconds = if records.is_empty() {
                0.
            } else {
                records.iter().map(|r| r.duration_seconds).sum::<f64>() / records.len() as f64
            };
            let cleanup = CleanupStats {
                total_cleanups: records.len(),
                successful_cleanups,
                failed_cleanups: records.len() - successful_cleanups,
                average_time_seconds,
            };
            out.insert(
                repo.clone(),
                PoolPerformance {
                    allocation: self.allocation_metrics(&repo),
                    cleanup,
                    summary: summaries.get(&repo).cloned(),
                },
            );
        }
        Ok(out)
    }

    pub fn clear_metrics(&self, repo_name: Option<&RepoName>) {
        {
            let mut metrics = self.metrics.lock().expect("manager metrics mutex");
            match repo_name {
                Some(repo_name) => {
                    metrics.allocation_times.remove(repo_name);
                    metrics.cleanup_times.remove(repo_name);
                }
                None => {
                    metrics.allocation_times.clear();
                    metrics.cleanup_times.clear();
                }
            }
        }
        self.allocator.clear_metrics(repo_name);
    }
}

/// The deferred half of `release_slot_background`; runs on a
/// background worker. Re-takes the slot lock and re-checks the state
/// so that a slot which has been re-allocated (or removed) in the
/// meantime is never touched.
fn background_release_cleanup(
    store: &SlotStore,
    locks: &LockManager,
    cleaner: &SlotCleaner,
    slot_id: &SlotId,
    lock_timeout: Duration,
) -> CleanupResult {
    let failure = |error: String| CleanupResult {
        slot_id: slot_id.clone(),
        success: false,
        duration_seconds: 0.,
        operations: vec![],
        errors: vec![error],
    };
    let _guard = match locks.acquire(slot_id, lock_timeout) {
        Ok(guard) => guard,
        Err(e) => return failure(format!("background cleanup could not lock slot: {e:#}")),
    };
    let mut slot = match store.load_slot(slot_id) {
        Ok(slot) => slot,
        Err(e) => return failure(format!("background cleanup could not load slot: {e:#}")),
    };
    if !slot.is_available() {
        info!(
            "background cleanup of {slot_id} skipped, slot is {} by now",
            slot.state
        );
        return CleanupResult {
            slot_id: slot_id.clone(),
            success: true,
            duration_seconds: 0.,
            operations: vec!["skipped".to_owned()],
            errors: vec![],
        };
    }
    let result = cleaner.cleanup_after_release(&mut slot);
    if let Err(e) = store.save_slot(&slot) {
        return failure(format!("failed to persist slot after background cleanup: {e:#}"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{LockTimeoutError, SlotNotFoundError};
    use anyhow::Result;
    use std::path::PathBuf;

    fn manager() -> Result<(tempfile::TempDir, PoolManager)> {
        let tmp = tempfile::tempdir()?;
        let mut config = PoolConfig::default();
        config.workspaces_dir = tmp.path().join("workspaces");
        config.lock_timeout = 2.;
        config.stale_lock_hours = 0;
        Ok((tmp, PoolManager::new(config)?))
    }

    /// A slot record without any git state behind it; enough for the
    /// protocol-level paths (locking, state transitions, sweeps).
    fn write_bare_slot(manager: &PoolManager, index: u32, state: SlotState) -> Result<Slot> {
        let slot_id: SlotId = format!("workspace-demo-slot{index}").parse()?;
        let mut slot = Slot::new(
            slot_id,
            "https://example.test/r.git".parse()?,
            PathBuf::from("/nonexistent"),
            None,
            None,
        );
        slot.state = state;
        manager.store().save_slot(&slot)?;
        Ok(slot)
    }

    fn write_bare_pool(manager: &PoolManager, num_slots: u32) -> Result<RepoName> {
        let repo_name: RepoName = "demo".parse().map_err(anyhow::Error::msg)?;
        let pool = Pool::new(repo_name.clone(), "https://example.test/r.git".parse()?, num_slots);
        manager.store().save_pool(&pool)?;
        Ok(repo_name)
    }

    #[test]
    fn t_allocate_unknown_pool() -> Result<()> {
        let (_tmp, manager) = manager()?;
        let repo_name: RepoName = "ghost".parse().map_err(anyhow::Error::msg)?;
        let err = manager
            .allocate_slot(&repo_name, None)
            .expect_err("unknown pool");
        assert!(err.downcast_ref::<PoolNotFoundError>().is_some());
        Ok(())
    }

    #[test]
    fn t_allocate_exhausted_pool() -> Result<()> {
        let (_tmp, manager) = manager()?;
        let repo_name = write_bare_pool(&manager, 1)?;
        write_bare_slot(&manager, 1, SlotState::Allocated)?;
        let err = manager
            .allocate_slot(&repo_name, None)
            .expect_err("no available slot");
        assert!(err.downcast_ref::<NoAvailableSlotError>().is_some());
        // and nothing was mutated
        let slot_id: SlotId = "workspace-demo-slot1".parse()?;
        assert_eq!(
            manager.store().load_slot(&slot_id)?.state,
            SlotState::Allocated
        );
        Ok(())
    }

    #[test]
    fn t_release_without_cleanup() -> Result<()> {
        let (_tmp, manager) = manager()?;
        write_bare_pool(&manager, 1)?;
        let mut slot = write_bare_slot(&manager, 1, SlotState::Available)?;
        slot.mark_allocated(None);
        manager.store().save_slot(&slot)?;

        manager.release_slot(&slot.slot_id, false)?;
        let released = manager.store().load_slot(&slot.slot_id)?;
        assert_eq!(released.state, SlotState::Available);
        assert_eq!(released.allocation_count, 1);
        assert!(released.last_released_at.is_some());
        Ok(())
    }

    #[test]
    fn t_release_missing_slot() -> Result<()> {
        let (_tmp, manager) = manager()?;
        let slot_id: SlotId = "workspace-demo-slot7".parse()?;
        let err = manager
            .release_slot(&slot_id, false)
            .expect_err("missing slot");
        assert!(err.downcast_ref::<SlotNotFoundError>().is_some());
        Ok(())
    }

    #[test]
    fn t_remove_allocated_slot_refused() -> Result<()> {
        let (_tmp, manager) = manager()?;
        write_bare_pool(&manager, 1)?;
        let slot = write_bare_slot(&manager, 1, SlotState::Allocated)?;
        let err = manager
            .remove_slot(&slot.slot_id, false)
            .expect_err("allocated slot must not be removed");
        assert!(err.downcast_ref::<SlotAllocationError>().is_some());
        assert!(manager.store().slot_exists(&slot.slot_id));
        Ok(())
    }

    #[test]
    fn t_release_respects_held_lock() -> Result<()> {
        let (_tmp, manager) = manager()?;
        write_bare_pool(&manager, 1)?;
        let slot = write_bare_slot(&manager, 1, SlotState::Allocated)?;

        let mut config = PoolConfig::default();
        config.workspaces_dir = manager.config().workspaces_dir.clone();
        config.lock_timeout = 0.05;
        let second = PoolManager::new(config)?;

        let _guard = manager
            .lock_manager()
            .acquire(&slot.slot_id, Duration::from_secs(1))?;
        let err = second
            .release_slot(&slot.slot_id, false)
            .expect_err("lock is held elsewhere");
        assert!(err.downcast_ref::<LockTimeoutError>().is_some());
        Ok(())
    }

    #[test]
    fn t_isolate_slot_sets_marker() -> Result<()> {
        let (_tmp, manager) = manager()?;
        write_bare_pool(&manager, 1)?;
        let slot = write_bare_slot(&manager, 1, SlotState::Available)?;
        manager.isolate_slot(&slot.slot_id, Some("flaky disk"))?;
        let isolated = manager.store().load_slot(&slot.slot_id)?;
        assert_eq!(isolated.state, SlotState::Error);
        assert_eq!(isolated.metadata["isolation_reason"], "flaky disk");
        assert!(isolated.metadata.contains_key("isolated_at"));
        Ok(())
    }

    #[test]
    fn t_orphaned_lock_detection() -> Result<()> {
        let (_tmp, manager) = manager()?;
        let repo_name = write_bare_pool(&manager, 1)?;
        write_bare_slot(&manager, 1, SlotState::Available)?;

        // A lock for an existing slot is stale but not orphaned; one
        // for slot99 has no slot record behind it.
        let known: SlotId = "workspace-demo-slot1".parse()?;
        let orphan: SlotId = "workspace-demo-slot99".parse()?;
        drop(manager.lock_manager().acquire(&known, Duration::from_secs(1))?);
        drop(manager.lock_manager().acquire(&orphan, Duration::from_secs(1))?);

        let orphaned = manager.detect_orphaned_locks();
        assert_eq!(orphaned, vec![orphan.to_string()]);

        let report = manager.auto_recover(AutoRecoverOptions {
            recover_corrupted: false,
            ..Default::default()
        });
        assert_eq!(report.orphaned_locks_cleaned, 1);
        assert!(report.errors.is_empty());
        assert!(manager.detect_orphaned_locks().is_empty());
        let _ = repo_name;
        Ok(())
    }

    #[test]
    fn t_long_allocated_detection() -> Result<()> {
        let (_tmp, manager) = manager()?;
        write_bare_pool(&manager, 2)?;
        let mut slot = write_bare_slot(&manager, 1, SlotState::Available)?;
        slot.mark_allocated(None);
        // Backdate the allocation far beyond any threshold.
        slot.last_allocated_at = Some("2001-01-01T00:00:00+00:00".parse()?);
        manager.store().save_slot(&slot)?;
        write_bare_slot(&manager, 2, SlotState::Available)?;

        let long_allocated = manager.detect_long_allocated_slots(24);
        assert_eq!(long_allocated.len(), 1);
        assert_eq!(long_allocated[0].slot_id, slot.slot_id);
        assert!(manager.detect_long_allocated_slots(u32::MAX).is_empty());
        Ok(())
    }

    #[test]
    fn t_pool_summary_counts_states() -> Result<()> {
        let (_tmp, manager) = manager()?;
        let repo_name = write_bare_pool(&manager, 3)?;
        write_bare_slot(&manager, 1, SlotState::Available)?;
        write_bare_slot(&manager, 2, SlotState::Allocated)?;
        write_bare_slot(&manager, 3, SlotState::Error)?;

        let summaries = manager.get_pool_summary()?;
        let summary = &summaries[&repo_name];
        assert_eq!(summary.total_slots, 3);
        assert_eq!(summary.available_slots, 1);
        assert_eq!(summary.allocated_slots, 1);
        assert_eq!(summary.error_slots, 1);
        assert_eq!(summary.cleaning_slots, 0);
        Ok(())
    }
}
