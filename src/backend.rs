//! The two slot-provisioning strategies behind one interface: one
//! full clone per slot, or one shared bare repository with a worktree
//! per slot. The metadata layout is identical for both; only where
//! the working tree comes from (and how it is torn down) differs.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{
    ctx, debug,
    git::GitRunner,
    info,
    serde::{git_url::GitUrl, slot_id::SlotId},
    slot::Slot,
    store::SLOT_FILE_NAME,
    warn,
};

/// The shared bare repository of a worktree-backed pool.
pub const MAIN_REPO_DIR_NAME: &str = ".main_repo";
/// Parent directory of worktree-backed slot trees within the pool.
pub const WORKTREES_DIR_NAME: &str = "worktrees";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Independent full clone per slot
    Clones,
    /// Shared bare repository, worktree per slot
    Worktrees,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Clones => "clones",
            BackendKind::Worktrees => "worktrees",
        }
    }

    /// Recognize the backend of an existing pool directory: worktree
    /// pools carry the shared bare repository, clone pools do not.
    pub fn detect(pool_dir: &Path) -> Self {
        if pool_dir.join(MAIN_REPO_DIR_NAME).is_dir() {
            BackendKind::Worktrees
        } else {
            BackendKind::Clones
        }
    }

    pub fn provisioner(self) -> &'static dyn SlotProvisioner {
        match self {
            BackendKind::Clones => &ClonesProvisioner,
            BackendKind::Worktrees => &WorktreesProvisioner,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registers the slot record file in the tree's `.git/info/exclude`
/// so that neither `git status` reports it nor the cleanup pipeline's
/// `clean` removes it. A no-op for worktree checkouts (gitfile
/// instead of a `.git` directory; their record lives outside the
/// tree).
pub fn register_slot_record_exclude(tree: &Path) -> Result<()> {
    let git_dir = tree.join(".git");
    if !git_dir.is_dir() {
        return Ok(());
    }
    let info_dir = git_dir.join("info");
    std::fs::create_dir_all(&info_dir)
        .map_err(ctx!("creating git info directory {info_dir:?}"))?;
    let exclude_path = info_dir.join("exclude");
    let mut content = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    let line = format!("/{SLOT_FILE_NAME}");
    if content.lines().any(|l| l == line) {
        return Ok(());
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&line);
    content.push('\n');
    std::fs::write(&exclude_path, content)
        .map_err(ctx!("writing git exclude file {exclude_path:?}"))?;
    debug!("registered {line:?} in {exclude_path:?}");
    Ok(())
}

pub trait SlotProvisioner: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;

    /// One-time pool setup before the first slot is provisioned.
    fn prepare_pool(&self, git: &GitRunner, pool_dir: &Path, repo_url: &GitUrl) -> Result<()>;

    /// Where the slot's working tree lives within the pool directory.
    fn slot_tree_path(&self, pool_dir: &Path, slot_id: &SlotId) -> PathBuf;

    /// Create the working tree for a new slot; returns its path.
    fn provision(
        &self,
        git: &GitRunner,
        pool_dir: &Path,
        slot_id: &SlotId,
        repo_url: &GitUrl,
    ) -> Result<PathBuf>;

    /// Tear down whatever `provision` created beyond the slot's
    /// metadata directory (which the store deletes separately).
    /// Best-effort: a half-removed slot must still be deletable.
    fn deprovision(&self, git: &GitRunner, pool_dir: &Path, slot: &Slot);
}

#[derive(Debug)]
pub struct ClonesProvisioner;

impl SlotProvisioner for ClonesProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Clones
    }

    fn prepare_pool(&self, _git: &GitRunner, pool_dir: &Path, _repo_url: &GitUrl) -> Result<()> {
        std::fs::create_dir_all(pool_dir).map_err(ctx!("creating pool directory {pool_dir:?}"))
    }

    fn slot_tree_path(&self, pool_dir: &Path, slot_id: &SlotId) -> PathBuf {
        pool_dir.join(slot_id.dir_name())
    }

    fn provision(
        &self,
        git: &GitRunner,
        pool_dir: &Path,
        slot_id: &SlotId,
        repo_url: &GitUrl,
    ) -> Result<PathBuf> {
        let tree = self.slot_tree_path(pool_dir, slot_id);
        git.clone_repo(repo_url, &tree)
            .map_err(ctx!("cloning {repo_url} into slot {slot_id}"))?;
        register_slot_record_exclude(&tree)?;
        info!("provisioned clone slot {slot_id} at {tree:?}");
        Ok(tree)
    }

    fn deprovision(&self, _git: &GitRunner, _pool_dir: &Path, _slot: &Slot) {
        // The working tree is the metadata directory; the store's
        // delete removes both.
    }
}

fn main_repo_path(pool_dir: &Path) -> PathBuf {
    pool_dir.join(MAIN_REPO_DIR_NAME)
}

/// The branch each worktree slot is parked on; worktrees cannot share
/// a checked-out branch.
pub fn worktree_branch_name(slot_id: &SlotId) -> String {
    format!("worktree/{}/{}", slot_id.repo_name(), slot_id.dir_name())
}

#[derive(Debug)]
pub struct WorktreesProvisioner;

impl SlotProvisioner for WorktreesProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Worktrees
    }

    fn prepare_pool(&self, git: &GitRunner, pool_dir: &Path, repo_url: &GitUrl) -> Result<()> {
        std::fs::create_dir_all(pool_dir)
            .map_err(ctx!("creating pool directory {pool_dir:?}"))?;
        let main_repo = main_repo_path(pool_dir);
        if !main_repo.exists() {
            info!("cloning shared bare repository {repo_url} to {main_repo:?}");
            git.bare_clone(repo_url, &main_repo)
                .map_err(ctx!("bare-cloning {repo_url} to {main_repo:?}"))?;
        }
        let worktrees_dir = pool_dir.join(WORKTREES_DIR_NAME);
        std::fs::create_dir_all(&worktrees_dir)
            .map_err(ctx!("creating worktrees directory {worktrees_dir:?}"))
    }

    fn slot_tree_path(&self, pool_dir: &Path, slot_id: &SlotId) -> PathBuf {
        pool_dir.join(WORKTREES_DIR_NAME).join(slot_id.dir_name())
    }

    fn provision(
        &self,
        git: &GitRunner,
        pool_dir: &Path,
        slot_id: &SlotId,
        _repo_url: &GitUrl,
    ) -> Result<PathBuf> {
        let main_repo = main_repo_path(pool_dir);
        let tree = self.slot_tree_path(pool_dir, slot_id);
        let branch = worktree_branch_name(slot_id);
        git.worktree_add(&main_repo, &tree, &branch)
            .map_err(ctx!("adding worktree for slot {slot_id} at {tree:?}"))?;
        info!("provisioned worktree slot {slot_id} at {tree:?} on branch {branch}");
        Ok(tree)
    }

    fn deprovision(&self, git: &GitRunner, pool_dir: &Path, slot: &Slot) {
        let main_repo = main_repo_path(pool_dir);
        if let Err(e) = git.worktree_remove(&main_repo, &slot.slot_path, true) {
            warn!(
                "failed to remove worktree {:?} of slot {}: {e:#}",
                slot.slot_path, slot.slot_id
            );
        }
        let branch = worktree_branch_name(&slot.slot_id);
        if let Err(e) = git.branch_delete(&main_repo, &branch) {
            warn!("failed to delete branch {branch:?}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn t_detect() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert_eq!(BackendKind::detect(tmp.path()), BackendKind::Clones);
        std::fs::create_dir_all(tmp.path().join(MAIN_REPO_DIR_NAME))?;
        assert_eq!(BackendKind::detect(tmp.path()), BackendKind::Worktrees);
        Ok(())
    }

    #[test]
    fn t_register_exclude_idempotent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let tree = tmp.path();
        std::fs::create_dir_all(tree.join(".git"))?;
        register_slot_record_exclude(tree)?;
        register_slot_record_exclude(tree)?;
        let content = std::fs::read_to_string(tree.join(".git/info/exclude"))?;
        assert_eq!(content.matches("/slot.json").count(), 1);
        Ok(())
    }

    #[test]
    fn t_register_exclude_skips_gitfile() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let tree = tmp.path();
        std::fs::write(tree.join(".git"), "gitdir: ../.main_repo/worktrees/slot1\n")?;
        register_slot_record_exclude(tree)?;
        assert!(!tree.join(".git/info").exists());
        Ok(())
    }

    #[test]
    fn t_worktree_branch_name() -> Result<()> {
        let slot_id: SlotId = "workspace-chat-app-slot2".parse()?;
        assert_eq!(worktree_branch_name(&slot_id), "worktree/chat-app/slot2");
        Ok(())
    }
}
