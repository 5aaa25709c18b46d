//! The persisted data model: pools, slots, and the read-only status
//! views derived from them.

use std::{fmt::Display, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::serde::{
    date_and_time::DateTimeWithOffset, git_url::GitUrl, repo_name::RepoName, slot_id::SlotId,
};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Clean (or cleanable) and free to be handed out
    Available,
    /// Handed to an agent, excluded from allocation
    Allocated,
    /// Cleanup pipeline currently running (transient)
    Cleaning,
    /// Set aside after a failure, excluded until recovered
    Error,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Available => "available",
            SlotState::Allocated => "allocated",
            SlotState::Cleaning => "cleaning",
            SlotState::Error => "error",
        }
    }
}

impl Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One working copy, the unit of allocation. Stored as
/// `slot.json`. The in-memory value is a transient view; writers
/// re-read from disk under the slot lock before mutating.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Slot {
    pub slot_id: SlotId,
    pub repo_name: RepoName,
    pub repo_url: GitUrl,
    pub slot_path: PathBuf,
    pub state: SlotState,
    pub current_branch: Option<String>,
    pub current_commit: Option<String>,
    pub allocation_count: u64,
    pub total_usage_seconds: f64,
    pub created_at: DateTimeWithOffset,
    pub updated_at: DateTimeWithOffset,
    pub last_allocated_at: Option<DateTimeWithOffset>,
    pub last_released_at: Option<DateTimeWithOffset>,
    pub metadata: Metadata,
}

impl Slot {
    pub fn new(
        slot_id: SlotId,
        repo_url: GitUrl,
        slot_path: PathBuf,
        current_branch: Option<String>,
        current_commit: Option<String>,
    ) -> Self {
        let now = DateTimeWithOffset::now();
        let repo_name = slot_id.repo_name().clone();
        Self {
            slot_id,
            repo_name,
            repo_url,
            slot_path,
            state: SlotState::Available,
            current_branch,
            current_commit,
            allocation_count: 0,
            total_usage_seconds: 0.,
            created_at: now.clone(),
            updated_at: now,
            last_allocated_at: None,
            last_released_at: None,
            metadata: Metadata::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == SlotState::Available
    }

    pub fn touch(&mut self) {
        self.updated_at = DateTimeWithOffset::now();
    }

    /// Transition to ALLOCATED. The metadata map is replaced by the
    /// caller's map on every allocation (emptied when none given).
    pub fn mark_allocated(&mut self, metadata: Option<Metadata>) {
        let now = DateTimeWithOffset::now();
        self.state = SlotState::Allocated;
        self.allocation_count += 1;
        self.last_allocated_at = Some(now.clone());
        self.updated_at = now;
        self.metadata = metadata.unwrap_or_default();
    }

    /// Transition to AVAILABLE, adding the elapsed allocation time to
    /// the cumulative usage counter.
    pub fn mark_released(&mut self) {
        let now = DateTimeWithOffset::now();
        if let Some(allocated_at) = &self.last_allocated_at {
            let used = allocated_at.seconds_until(&now);
            if used > 0. {
                self.total_usage_seconds += used;
            }
        }
        self.state = SlotState::Available;
        self.last_released_at = Some(now.clone());
        self.updated_at = now;
    }
}

/// The per-pool record stored as `pool.json`. The slot list is not
/// part of the file; it is reconstructed from the sibling slot
/// directories at load time.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Pool {
    pub repo_name: RepoName,
    pub repo_url: GitUrl,
    pub num_slots: u32,
    pub created_at: DateTimeWithOffset,
    pub updated_at: DateTimeWithOffset,
    #[serde(skip)]
    pub slots: Vec<Slot>,
}

impl Pool {
    pub fn new(repo_name: RepoName, repo_url: GitUrl, num_slots: u32) -> Self {
        let now = DateTimeWithOffset::now();
        Self {
            repo_name,
            repo_url,
            num_slots,
            created_at: now.clone(),
            updated_at: now,
            slots: vec![],
        }
    }
}

/// Live view of one slot, as returned by status queries.
#[derive(Debug, Serialize, Clone)]
pub struct SlotStatus {
    pub slot_id: SlotId,
    pub state: SlotState,
    pub is_locked: bool,
    pub current_branch: Option<String>,
    pub current_commit: Option<String>,
    pub allocation_count: u64,
    pub last_allocated_at: Option<DateTimeWithOffset>,
    pub disk_usage_mb: f64,
}

/// Per-pool totals, as returned by `get_pool_summary`.
#[derive(Debug, Serialize, Clone)]
pub struct PoolSummary {
    pub repo_name: RepoName,
    pub total_slots: u32,
    pub available_slots: usize,
    pub allocated_slots: usize,
    pub cleaning_slots: usize,
    pub error_slots: usize,
    pub total_allocations: u64,
    pub average_allocation_time_seconds: f64,
}

/// Allocator-side counters for one pool.
#[derive(Debug, Serialize, Clone)]
pub struct AllocationMetrics {
    pub repo_name: RepoName,
    pub total_allocations: u64,
    pub average_allocation_time_seconds: f64,
    pub cache_hit_rate: f64,
    pub failed_allocations: u64,
}
