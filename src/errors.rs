//! The typed failure kinds of the pool. Public operations return
//! `anyhow::Result`; callers that need to react to a specific kind
//! downcast to these types.

use std::time::Duration;

use crate::serde::slot_id::SlotId;

#[derive(thiserror::Error, Debug)]
#[error("pool not found: {repo_name}")]
pub struct PoolNotFoundError {
    pub repo_name: String,
}

#[derive(thiserror::Error, Debug)]
#[error("slot not found: {slot_id}")]
pub struct SlotNotFoundError {
    pub slot_id: String,
}

#[derive(thiserror::Error, Debug)]
#[error("no available slots in pool {repo_name:?}")]
pub struct NoAvailableSlotError {
    pub repo_name: String,
}

#[derive(thiserror::Error, Debug)]
#[error("slot allocation failed: {message}")]
pub struct SlotAllocationError {
    pub message: String,
}

#[derive(thiserror::Error, Debug)]
#[error("git {command:?} failed after {attempts} attempt(s): {stderr}")]
pub struct GitOperationError {
    pub command: String,
    pub attempts: u32,
    pub stderr: String,
}

#[derive(thiserror::Error, Debug)]
#[error("failed to acquire lock for slot {slot_id} within {:.1}s", .timeout.as_secs_f64())]
pub struct LockTimeoutError {
    pub slot_id: SlotId,
    pub timeout: Duration,
}
