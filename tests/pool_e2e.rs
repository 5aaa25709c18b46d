//! End-to-end tests over real (local) git repositories, driving the
//! public pool manager API through both backends.

use std::{
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::Result;

use repo_pool::{
    backend::{BackendKind, MAIN_REPO_DIR_NAME, WORKTREES_DIR_NAME},
    config::PoolConfig,
    errors::{NoAvailableSlotError, SlotNotFoundError},
    manager::{AutoRecoverOptions, PoolManager},
    path_util::dir_size,
    serde::{git_url::GitUrl, repo_name::RepoName, slot_id::SlotId},
    slot::{Metadata, SlotState},
    store::SLOT_FILE_NAME,
};

fn sh_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("running git for test fixture");
    assert!(status.success(), "git {args:?} failed in {dir:?}");
}

/// A throwaway origin repository with one commit on `main`.
fn make_origin(base: &Path) -> Result<(GitUrl, String)> {
    let dir = base.join("origin");
    std::fs::create_dir_all(&dir)?;
    sh_git(&dir, &["init", "-q", "-b", "main"]);
    sh_git(&dir, &["config", "user.email", "pool@test.invalid"]);
    sh_git(&dir, &["config", "user.name", "pool test"]);
    std::fs::write(dir.join("README.md"), "fixture repository\n")?;
    std::fs::write(dir.join("app.py"), "print('hi')\n")?;
    sh_git(&dir, &["add", "."]);
    sh_git(&dir, &["commit", "-q", "-m", "initial"]);
    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&dir)
        .output()?;
    let tip = String::from_utf8(head.stdout)?.trim().to_owned();
    let url: GitUrl = dir.to_str().expect("utf-8 tmpdir").parse()?;
    Ok((url, tip))
}

fn make_manager(base: &Path) -> Result<PoolManager> {
    let mut config = PoolConfig::default();
    config.workspaces_dir = base.join("workspaces");
    config.lock_timeout = 5.;
    config.stale_lock_hours = 0;
    PoolManager::new(config)
}

fn repo(name: &str) -> RepoName {
    name.parse().expect("valid repo name in test")
}

#[test]
fn s1_happy_path_clone_backend() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, origin_tip) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");

    let pool = manager.create_pool(&demo, &url, 2, BackendKind::Clones)?;
    assert_eq!(pool.num_slots, 2);
    assert_eq!(pool.slots.len(), 2);

    let pool_dir = manager.store().pool_dir(&demo);
    assert!(pool_dir.join("pool.json").exists());
    for n in 1..=2 {
        let slot_dir = pool_dir.join(format!("slot{n}"));
        assert!(slot_dir.join(".git").is_dir());
        assert!(slot_dir.join("README.md").exists());
        assert!(slot_dir.join(SLOT_FILE_NAME).exists());
    }
    assert!(pool.slots.iter().all(|s| s.state == SlotState::Available));
    assert_eq!(manager.get_pool(&demo)?.num_slots, 2);

    let mut metadata = Metadata::new();
    metadata.insert("task".to_owned(), serde_json::json!("t1"));
    let slot = manager.allocate_slot(&demo, Some(metadata))?;
    assert_eq!(slot.state, SlotState::Allocated);
    assert_eq!(slot.allocation_count, 1);
    assert_eq!(slot.metadata["task"], "t1");
    assert_eq!(slot.current_commit.as_deref(), Some(origin_tip.as_str()));
    // The tree handed to the agent is clean; the record file is
    // excluded from git's view.
    assert!(manager.cleaner().git().is_clean_worktree(&slot.slot_path));

    std::thread::sleep(Duration::from_millis(50));
    manager.release_slot(&slot.slot_id, true)?;
    let released = manager.store().load_slot(&slot.slot_id)?;
    assert_eq!(released.state, SlotState::Available);
    assert_eq!(released.allocation_count, 1);
    assert!(released.total_usage_seconds > 0.);
    assert!(released.last_released_at.is_some());
    Ok(())
}

#[test]
fn b1_exhausted_pool_is_not_mutated() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 2, BackendKind::Clones)?;

    let a = manager.allocate_slot(&demo, None)?;
    let b = manager.allocate_slot(&demo, None)?;
    assert_ne!(a.slot_id, b.slot_id);

    let err = manager
        .allocate_slot(&demo, None)
        .expect_err("pool is exhausted");
    assert!(err.downcast_ref::<NoAvailableSlotError>().is_some());
    for slot_id in [&a.slot_id, &b.slot_id] {
        assert_eq!(
            manager.store().load_slot(slot_id)?.state,
            SlotState::Allocated
        );
    }

    // R2: after a release, allocation succeeds again (not necessarily
    // the same slot).
    manager.release_slot(&a.slot_id, true)?;
    let again = manager.allocate_slot(&demo, None)?;
    assert_eq!(again.state, SlotState::Allocated);
    Ok(())
}

#[test]
fn b4_add_slot_never_reuses_indices() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 2, BackendKind::Clones)?;

    let slot2: SlotId = "workspace-demo-slot2".parse()?;
    manager.remove_slot(&slot2, false)?;
    assert_eq!(manager.get_pool(&demo)?.num_slots, 1);
    assert!(!manager.store().pool_dir(&demo).join("slot2").exists());

    // Indices are max(existing) + 1, never derived by counting.
    let added = manager.add_slot(&demo)?;
    assert_eq!(added.slot_id.index(), 2);
    // Removing a lower index must not hand it out again.
    let slot1: SlotId = "workspace-demo-slot1".parse()?;
    manager.remove_slot(&slot1, false)?;
    let added = manager.add_slot(&demo)?;
    assert_eq!(added.slot_id.index(), 3);
    assert_eq!(manager.get_pool(&demo)?.num_slots, 2);

    let ghost: SlotId = "workspace-demo-slot42".parse()?;
    let err = manager.remove_slot(&ghost, false).expect_err("no such slot");
    assert!(err.downcast_ref::<SlotNotFoundError>().is_some());
    Ok(())
}

#[test]
fn s4_corruption_detected_and_repaired() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, origin_tip) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    let slot = manager.allocate_slot(&demo, None)?;
    manager.release_slot(&slot.slot_id, true)?;

    // Externally destroy the repository.
    std::fs::remove_dir_all(slot.slot_path.join(".git"))?;

    let anomalies = manager.detect_anomalies(24);
    assert!(anomalies
        .corrupted_slots
        .iter()
        .any(|s| s.slot_id == slot.slot_id));

    assert!(manager.recover_slot(&slot.slot_id, false)?);
    let recovered = manager.store().load_slot(&slot.slot_id)?;
    assert_eq!(recovered.state, SlotState::Available);
    assert_eq!(
        recovered.current_commit.as_deref(),
        Some(origin_tip.as_str())
    );
    assert!(manager
        .cleaner()
        .verify_slot_integrity(&recovered));

    // The repaired slot allocates normally again.
    let again = manager.allocate_slot(&demo, None)?;
    assert_eq!(again.slot_id, slot.slot_id);
    Ok(())
}

#[test]
fn s5_orphaned_lock_swept_exactly_once() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 2, BackendKind::Clones)?;

    // Leave a lock file behind for a slot that does not exist.
    let orphan: SlotId = "workspace-demo-slot99".parse()?;
    drop(
        manager
            .lock_manager()
            .acquire(&orphan, Duration::from_secs(1))?,
    );

    let anomalies = manager.detect_anomalies(24);
    assert_eq!(anomalies.orphaned_locks, vec![orphan.to_string()]);

    let report = manager.auto_recover(AutoRecoverOptions::default());
    assert_eq!(report.orphaned_locks_cleaned, 1);
    assert!(report.errors.is_empty());

    // R4: a second quiet sweep reports nothing to do.
    let report = manager.auto_recover(AutoRecoverOptions::default());
    assert_eq!(report.orphaned_locks_cleaned, 0);
    assert_eq!(report.corrupted_recovered, 0);
    assert_eq!(report.long_allocated_released, 0);
    Ok(())
}

#[test]
fn r3_pre_allocation_cleanup_is_idempotent() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    let slot_id: SlotId = "workspace-demo-slot1".parse()?;
    let mut slot = manager.store().load_slot(&slot_id)?;
    let first = manager.cleaner().cleanup_before_allocation(&mut slot);
    assert!(first.success);
    let state_after_first = slot.state;
    let second = manager.cleaner().cleanup_before_allocation(&mut slot);
    assert!(second.success);
    assert_eq!(second.operations, first.operations);
    assert_eq!(slot.state, state_after_first);
    Ok(())
}

#[test]
fn background_release_recleans_or_skips() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    let slot = manager.allocate_slot(&demo, None)?;
    // Leave litter behind, as a crashed agent would.
    std::fs::write(slot.slot_path.join("litter.txt"), "scratch")?;

    let task_id = manager
        .release_slot_background(&slot.slot_id, true)?
        .expect("cleanup was requested");
    // The slot is available immediately, before the cleanup ran.
    assert_eq!(
        manager.store().load_slot(&slot.slot_id)?.state,
        SlotState::Available
    );

    let result = manager
        .cleaner()
        .background()
        .await_result(&task_id, Some(Duration::from_secs(60)))
        .expect("background cleanup finished");
    assert!(result.success);
    if !result.operations.contains(&"skipped".to_owned()) {
        assert!(!slot.slot_path.join("litter.txt").exists());
    }
    assert_eq!(
        manager.store().load_slot(&slot.slot_id)?.state,
        SlotState::Available
    );
    Ok(())
}

#[test]
fn s6_worktree_backend_equivalence() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, origin_tip) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;

    let wt = repo("demo-wt");
    let pool = manager.create_pool(&wt, &url, 2, BackendKind::Worktrees)?;
    let pool_dir = manager.store().pool_dir(&wt);

    // Shape: one shared bare repository plus worktrees per slot, and
    // exactly num_slots slot records directly under the pool dir.
    assert!(pool_dir.join(MAIN_REPO_DIR_NAME).is_dir());
    for n in 1..=2 {
        let tree = pool_dir.join(WORKTREES_DIR_NAME).join(format!("slot{n}"));
        assert!(tree.join(".git").exists());
        assert!(tree.join("README.md").exists());
        assert!(pool_dir.join(format!("slot{n}")).join(SLOT_FILE_NAME).exists());
    }
    assert_eq!(pool.slots.len(), 2);
    assert_eq!(BackendKind::detect(&pool_dir), BackendKind::Worktrees);

    // S1 behaviors hold identically.
    let slot = manager.allocate_slot(&wt, None)?;
    assert_eq!(slot.state, SlotState::Allocated);
    assert_eq!(slot.current_commit.as_deref(), Some(origin_tip.as_str()));
    assert!(manager.cleaner().git().is_clean_worktree(&slot.slot_path));
    manager.release_slot(&slot.slot_id, true)?;
    assert_eq!(
        manager.store().load_slot(&slot.slot_id)?.state,
        SlotState::Available
    );

    // Dynamic sizing: removal tears the worktree down, the next slot
    // index is still never reused.
    let slot2: SlotId = "workspace-demo-wt-slot2".parse()?;
    manager.remove_slot(&slot2, false)?;
    assert!(!pool_dir.join(WORKTREES_DIR_NAME).join("slot2").exists());
    let added = manager.add_slot(&wt)?;
    assert_eq!(added.slot_id.index(), 3);

    // Disk usage: the shared object store makes the worktree pool
    // materially smaller than a clone pool of the same size.
    let clones = repo("demo-cl");
    manager.create_pool(&clones, &url, 2, BackendKind::Clones)?;
    let clone_size = dir_size(&manager.store().pool_dir(&clones));
    let worktree_size = dir_size(&pool_dir);
    assert!(
        worktree_size < clone_size,
        "worktree pool ({worktree_size} bytes) should be smaller than clone pool ({clone_size} bytes)"
    );
    Ok(())
}

#[test]
fn duplicate_pool_refused_and_destroy_works() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    assert!(manager
        .create_pool(&demo, &url, 1, BackendKind::Clones)
        .is_err());
    assert_eq!(manager.list_pools()?, vec![demo.clone()]);

    manager.destroy_pool(&demo, false)?;
    assert!(manager.list_pools()?.is_empty());
    assert!(!manager.store().pool_dir(&demo).exists());
    Ok(())
}

#[test]
fn s3_long_allocation_force_released() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    let slot = manager.allocate_slot(&demo, None)?;
    // Simulate an agent that crashed long ago.
    let mut stuck = manager.store().load_slot(&slot.slot_id)?;
    stuck.last_allocated_at = Some("2001-01-01T00:00:00+00:00".parse()?);
    manager.store().save_slot(&stuck)?;

    let anomalies = manager.detect_anomalies(24);
    assert_eq!(anomalies.long_allocated_slots.len(), 1);

    let report = manager.auto_recover(AutoRecoverOptions {
        force_release_long_allocated: true,
        ..Default::default()
    });
    assert_eq!(report.long_allocated_released, 1);
    assert!(report.errors.is_empty());

    let released = manager.store().load_slot(&slot.slot_id)?;
    assert_eq!(released.state, SlotState::Available);
    assert!(released.total_usage_seconds > 0.);
    Ok(())
}

#[test]
fn s2_two_contenders_one_slot() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = std::sync::Arc::new(make_manager(tmp.path())?);
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 1, BackendKind::Clones)?;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let manager = manager.clone();
            let demo = demo.clone();
            std::thread::spawn(move || manager.allocate_slot(&demo, None))
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("allocator thread panicked"))
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one contender gets the slot");
    for result in results {
        match result {
            Ok(slot) => assert_eq!(slot.state, SlotState::Allocated),
            Err(e) => assert!(
                e.downcast_ref::<NoAvailableSlotError>().is_some(),
                "loser fails with NoAvailableSlot, got: {e:#}"
            ),
        }
    }
    Ok(())
}

#[test]
fn warmup_pool_touches_only_available_slots() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (url, _) = make_origin(tmp.path())?;
    let manager = make_manager(tmp.path())?;
    let demo = repo("demo");
    manager.create_pool(&demo, &url, 2, BackendKind::Clones)?;

    let allocated = manager.allocate_slot(&demo, None)?;
    let report = manager.warmup_pool(&demo, Some(2))?;
    assert_eq!(report.slots_processed, 1);
    assert_eq!(report.successful, 1);
    assert!(report
        .results
        .iter()
        .all(|r| r.slot_id != allocated.slot_id));
    Ok(())
}
