//! Persistence of pool and slot records as JSON documents under the
//! workspaces directory:
//!
//! ```text
//! <workspaces_dir>/
//!   <repo_name>/
//!     pool.json
//!     slot1/slot.json        (directory doubles as the clone working tree)
//!     slot2/...
//!   locks/<slot_id>.lock
//! ```
//!
//! Writes go to a temporary sibling file first and are renamed into
//! place, so a crash mid-write never leaves an unparseable record. A
//! slot directory whose `slot.json` fails to parse is logged and
//! skipped during enumeration instead of poisoning the pool load.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    ctx, debug,
    errors::{PoolNotFoundError, SlotNotFoundError},
    path_util::add_extension,
    serde::{repo_name::RepoName, repo_name::LOCKS_DIR_NAME, slot_id::SlotId},
    slot::{Pool, Slot},
    warn,
};

pub const POOL_FILE_NAME: &str = "pool.json";
pub const SLOT_FILE_NAME: &str = "slot.json";

#[derive(Debug)]
pub struct SlotStore {
    workspaces_dir: PathBuf,
}

impl SlotStore {
    pub fn new(workspaces_dir: impl Into<PathBuf>) -> Result<Self> {
        let workspaces_dir = workspaces_dir.into();
        std::fs::create_dir_all(&workspaces_dir)
            .map_err(ctx!("creating workspaces directory {workspaces_dir:?}"))?;
        // Slot records carry absolute paths; resolve once here so
        // every derived path inherits it.
        let workspaces_dir = workspaces_dir
            .canonicalize()
            .map_err(ctx!("canonicalizing workspaces directory {workspaces_dir:?}"))?;
        Ok(Self { workspaces_dir })
    }

    pub fn workspaces_dir(&self) -> &Path {
        &self.workspaces_dir
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.workspaces_dir.join(LOCKS_DIR_NAME)
    }

    pub fn pool_dir(&self, repo_name: &RepoName) -> PathBuf {
        self.workspaces_dir.join(repo_name.as_str())
    }

    fn pool_file(&self, repo_name: &RepoName) -> PathBuf {
        self.pool_dir(repo_name).join(POOL_FILE_NAME)
    }

    /// The per-slot metadata directory. For the clone backend this is
    /// also the slot working tree; the worktree backend keeps its
    /// trees under `<pool>/worktrees/` and only the record lives here.
    pub fn slot_dir(&self, slot_id: &SlotId) -> PathBuf {
        self.pool_dir(slot_id.repo_name()).join(slot_id.dir_name())
    }

    fn slot_file(&self, slot_id: &SlotId) -> PathBuf {
        self.slot_dir(slot_id).join(SLOT_FILE_NAME)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(ctx!("serializing record for {path:?}"))?;
        let tmp_path = add_extension(path, "tmp")
            .ok_or_else(|| anyhow::anyhow!("record path {path:?} has no file name"))?;
        std::fs::write(&tmp_path, json.as_bytes())
            .map_err(ctx!("writing temporary record file {tmp_path:?}"))?;
        std::fs::rename(&tmp_path, path)
            .map_err(ctx!("renaming {tmp_path:?} into place at {path:?}"))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let s =
            std::fs::read_to_string(path).map_err(ctx!("reading record file {path:?}"))?;
        serde_json::from_str(&s).map_err(ctx!("decoding JSON record {path:?}"))
    }

    pub fn save_pool(&self, pool: &Pool) -> Result<()> {
        let pool_dir = self.pool_dir(&pool.repo_name);
        std::fs::create_dir_all(&pool_dir)
            .map_err(ctx!("creating pool directory {pool_dir:?}"))?;
        self.write_json(&self.pool_file(&pool.repo_name), pool)
    }

    /// Load the pool record and reconstruct its slot list by
    /// enumerating the sibling slot directories.
    pub fn load_pool(&self, repo_name: &RepoName) -> Result<Pool> {
        let pool_file = self.pool_file(repo_name);
        if !pool_file.exists() {
            return Err(PoolNotFoundError {
                repo_name: repo_name.to_string(),
            }
            .into());
        }
        let mut pool: Pool = self.read_json(&pool_file)?;
        pool.slots = self.list_slots(repo_name)?;
        Ok(pool)
    }

    pub fn save_slot(&self, slot: &Slot) -> Result<()> {
        let slot_dir = self.slot_dir(&slot.slot_id);
        std::fs::create_dir_all(&slot_dir)
            .map_err(ctx!("creating slot directory {slot_dir:?}"))?;
        self.write_json(&self.slot_file(&slot.slot_id), slot)
    }

    pub fn load_slot(&self, slot_id: &SlotId) -> Result<Slot> {
        let slot_file = self.slot_file(slot_id);
        if !slot_file.exists() {
            return Err(SlotNotFoundError {
                slot_id: slot_id.to_string(),
            }
            .into());
        }
        self.read_json(&slot_file)
    }

    /// All readable slots of a pool, sorted by slot index. Corrupted
    /// `slot.json` files are skipped with a warning.
    pub fn list_slots(&self, repo_name: &RepoName) -> Result<Vec<Slot>> {
        let pool_dir = self.pool_dir(repo_name);
        if !pool_dir.exists() {
            return Ok(vec![]);
        }
        let mut slots: Vec<Slot> = vec![];
        for entry in
            std::fs::read_dir(&pool_dir).map_err(ctx!("reading pool directory {pool_dir:?}"))?
        {
            let entry = entry.map_err(ctx!("reading pool directory {pool_dir:?}"))?;
            if !entry.file_type().map_or(false, |ft| ft.is_dir()) {
                continue;
            }
            let slot_file = entry.path().join(SLOT_FILE_NAME);
            if !slot_file.exists() {
                continue;
            }
            match self.read_json::<Slot>(&slot_file) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    warn!("skipping unreadable slot record {slot_file:?}: {e:#}");
                }
            }
        }
        slots.sort_by_key(|slot| slot.slot_id.index());
        Ok(slots)
    }

    /// The slot ids present on disk for one pool, sorted by index.
    pub fn list_slot_ids(&self, repo_name: &RepoName) -> Result<Vec<SlotId>> {
        Ok(self
            .list_slots(repo_name)?
            .into_iter()
            .map(|slot| slot.slot_id)
            .collect())
    }

    /// Names of all pools with a readable `pool.json`, sorted.
    pub fn list_pools(&self) -> Result<Vec<RepoName>> {
        if !self.workspaces_dir.exists() {
            return Ok(vec![]);
        }
        let mut pools: Vec<RepoName> = vec![];
        for entry in std::fs::read_dir(&self.workspaces_dir)
            .map_err(ctx!("reading workspaces directory {:?}", self.workspaces_dir))?
        {
            let entry = entry.map_err(ctx!("reading workspaces directory {:?}", self.workspaces_dir))?;
            if !entry.file_type().map_or(false, |ft| ft.is_dir()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name == LOCKS_DIR_NAME {
                continue;
            }
            let Ok(repo_name) = name.parse::<RepoName>() else {
                debug!("ignoring non-pool directory {name:?}");
                continue;
            };
            let pool_file = self.pool_file(&repo_name);
            if !pool_file.exists() {
                continue;
            }
            match self.read_json::<Pool>(&pool_file) {
                Ok(_) => pools.push(repo_name),
                Err(e) => warn!("skipping unreadable pool record {pool_file:?}: {e:#}"),
            }
        }
        pools.sort();
        Ok(pools)
    }

    /// Remove the slot's metadata directory tree. For the clone
    /// backend this deletes the working tree as well.
    pub fn delete_slot(&self, slot_id: &SlotId) -> Result<()> {
        let slot_dir = self.slot_dir(slot_id);
        if !slot_dir.exists() {
            return Err(SlotNotFoundError {
                slot_id: slot_id.to_string(),
            }
            .into());
        }
        std::fs::remove_dir_all(&slot_dir)
            .map_err(ctx!("deleting slot directory {slot_dir:?}"))?;
        Ok(())
    }

    pub fn pool_exists(&self, repo_name: &RepoName) -> bool {
        self.pool_file(repo_name).exists()
    }

    pub fn slot_exists(&self, slot_id: &SlotId) -> bool {
        self.slot_file(slot_id).exists()
    }
}
