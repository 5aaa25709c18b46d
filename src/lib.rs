//! A pool of pre-provisioned git working copies ("slots") for fleets
//! of automated coding agents. Agents ask for a clean, up-to-date
//! checkout of a named repository and get one of the pool's slots,
//! with advisory file locks guaranteeing exclusive hand-over, a
//! deterministic cleanup pipeline (fetch, clean, reset) restoring
//! every slot to a known state, and recovery sweeps for slots left
//! behind by crashed agents.

pub mod allocator;
pub mod backend;
pub mod background;
pub mod cleaner;
pub mod config;
pub mod config_file;
pub mod ctx;
pub mod errors;
pub mod git;
pub mod lock_manager;
pub mod manager;
pub mod path_util;
pub mod serde;
pub mod slot;
pub mod store;
pub mod utillib;
