//! Slot selection under a most-recently-used policy, plus the
//! per-pool allocation metrics. Selection is a heuristic only:
//! correctness does not depend on the MRU ordering, and the cache is
//! strictly per-process.
//!
//! The allocator takes no locks itself; callers mutate slots only
//! with the slot lock held (the pool manager's responsibility).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::Result;
use indexmap::IndexMap;

use crate::{
    debug,
    serde::{repo_name::RepoName, slot_id::SlotId},
    slot::{AllocationMetrics, Metadata, Slot},
    store::SlotStore,
};

pub const MRU_CACHE_CAPACITY: usize = 100;
pub const TIMING_HISTORY_CAPACITY: usize = 1000;

#[derive(Default)]
struct AllocatorState {
    /// Per pool: slot ids ordered by recency of allocation, most
    /// recent last.
    mru: HashMap<RepoName, IndexMap<SlotId, Instant>>,
    allocation_times: HashMap<RepoName, Vec<f64>>,
    failed_allocations: HashMap<RepoName, u64>,
    cache_hits: HashMap<RepoName, u64>,
    cache_misses: HashMap<RepoName, u64>,
}

pub struct SlotAllocator {
    store: Arc<SlotStore>,
    /// Gates the timing samples (hit/miss counters are always kept).
    record_timings: bool,
    state: Mutex<AllocatorState>,
}

impl SlotAllocator {
    pub fn new(store: Arc<SlotStore>, record_timings: bool) -> Self {
        Self {
            store,
            record_timings,
            state: Mutex::new(Default::default()),
        }
    }

    /// Pick an AVAILABLE slot: a cached "warm" slot when the MRU
    /// cache has one, otherwise the slot with the most recent
    /// `last_allocated_at` (never-allocated slots last; ties broken
    /// by slot id). `None` when the pool has no available slot.
    pub fn find_available(&self, repo_name: &RepoName) -> Result<Option<Slot>> {
        let start = Instant::now();
        let slots = self.store.list_slots(repo_name)?;
        let mut available: Vec<Slot> = slots.into_iter().filter(Slot::is_available).collect();

        let mut state = self.state.lock().expect("allocator state mutex");
        if available.is_empty() {
            *state.failed_allocations.entry(repo_name.clone()).or_insert(0) += 1;
            return Ok(None);
        }

        if let Some(cache) = state.mru.get(repo_name) {
            for slot_id in cache.keys().rev() {
                if let Some(pos) = available.iter().position(|s| &s.slot_id == slot_id) {
                    debug!("allocator: warm pick {slot_id} for {repo_name}");
                    *state.cache_hits.entry(repo_name.clone()).or_insert(0) += 1;
                    Self::record_time(&mut state, repo_name, start, self.record_timings);
                    return Ok(Some(available.swap_remove(pos)));
                }
            }
        }

        available.sort_by(|a, b| {
            let at = a.last_allocated_at.as_ref().map(|t| t.to_datetime());
            let bt = b.last_allocated_at.as_ref().map(|t| t.to_datetime());
            bt.cmp(&at).then_with(|| a.slot_id.cmp(&b.slot_id))
        });
        let selected = available.into_iter().next().expect("non-empty checked above");
        debug!("allocator: cold pick {} for {repo_name}", selected.slot_id);
        *state.cache_misses.entry(repo_name.clone()).or_insert(0) += 1;
        Self::record_time(&mut state, repo_name, start, self.record_timings);
        Ok(Some(selected))
    }

    fn record_time(
        state: &mut AllocatorState,
        repo_name: &RepoName,
        start: Instant,
        enabled: bool,
    ) {
        if !enabled {
            return;
        }
        let times = state.allocation_times.entry(repo_name.clone()).or_default();
        times.push(start.elapsed().as_secs_f64());
        if times.len() > TIMING_HISTORY_CAPACITY {
            let excess = times.len() - TIMING_HISTORY_CAPACITY;
            times.drain(..excess);
        }
    }

    /// Load, transition to ALLOCATED, persist, and remember the slot
    /// as most recently used. Caller holds the slot lock.
    pub fn mark_allocated(&self, slot_id: &SlotId, metadata: Option<Metadata>) -> Result<Slot> {
        let mut slot = self.store.load_slot(slot_id)?;
        slot.mark_allocated(metadata);
        self.store.save_slot(&slot)?;
        self.push_mru(slot_id);
        Ok(slot)
    }

    /// Load, transition to AVAILABLE (adding the elapsed usage time),
    /// persist. Caller holds the slot lock.
    pub fn mark_available(&self, slot_id: &SlotId) -> Result<Slot> {
        let mut slot = self.store.load_slot(slot_id)?;
        slot.mark_released();
        self.store.save_slot(&slot)?;
        Ok(slot)
    }

    fn push_mru(&self, slot_id: &SlotId) {
        let mut state = self.state.lock().expect("allocator state mutex");
        let cache = state.mru.entry(slot_id.repo_name().clone()).or_default();
        cache.shift_remove(slot_id);
        cache.insert(slot_id.clone(), Instant::now());
        while cache.len() > MRU_CACHE_CAPACITY {
            cache.shift_remove_index(0);
        }
    }

    pub fn allocation_metrics(&self, repo_name: &RepoName) -> AllocationMetrics {
        let state = self.state.lock().expect("allocator state mutex");
        let cache_hits = state.cache_hits.get(repo_name).copied().unwrap_or(0);
        let cache_misses = state.cache_misses.get(repo_name).copied().unwrap_or(0);
        let total_allocations = cache_hits + cache_misses;
        let times = state
            .allocation_times
            .get(repo_name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let average_allocation_time_seconds = if times.is_empty() {
            0.
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        let cache_hit_rate = if total_allocations > 0 {
            cache_hits as f64 / total_allocations as f64
        } else {
            0.
        };
        AllocationMetrics {
            repo_name: repo_name.clone(),
            total_allocations,
            average_allocation_time_seconds,
            cache_hit_rate,
            failed_allocations: state.failed_allocations.get(repo_name).copied().unwrap_or(0),
        }
    }

    pub fn clear_metrics(&self, repo_name: Option<&RepoName>) {
        let mut state = self.state.lock().expect("allocator state mutex");
        match repo_name {
            Some(repo_name) => {
                state.allocation_times.remove(repo_name);
                state.failed_allocations.remove(repo_name);
                state.cache_hits.remove(repo_name);
                state.cache_misses.remove(repo_name);
            }
            None => {
                state.allocation_times.clear();
                state.failed_allocations.clear();
                state.cache_hits.clear();
                state.cache_misses.clear();
            }
        }
    }
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator").finish_non_exhaustive()
    }
}
