//! The small set of primitive git operations the pool needs, executed
//! by shelling out to the system `git`. Mutating operations (clone,
//! fetch, clean, reset) are retried a bounded number of times with a
//! fixed delay; introspection commands (`rev-parse`, `branch`,
//! `status`) are not retried, they either work immediately or
//! indicate real corruption. Every invocation is bounded by a hard
//! timeout after which the child process is killed.

use std::{
    io::Read,
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use wait_timeout::ChildExt;

use crate::{ctx, debug, errors::GitOperationError, serde::git_url::GitUrl};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// What one finished (or killed) git invocation looked like.
#[derive(Debug, Clone)]
pub struct GitOutcome {
    pub success: bool,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed (timeout) or terminated by
    /// a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct GitRunner {
    max_retries: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl Default for GitRunner {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

fn command_string(args: &[&str]) -> String {
    let mut s = String::from("git");
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}

impl GitRunner {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_limits(max_retries: u32, retry_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
            timeout,
        }
    }

    /// Run `git <args>` once, capturing output. The child's pipes are
    /// drained on separate threads so a chatty command cannot
    /// dead-lock against a full pipe buffer while we wait on it.
    fn run_once(&self, args: &[&str], cwd: Option<&Path>) -> Result<GitOutcome> {
        let command = command_string(args);
        let start = Instant::now();

        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .map_err(ctx!("spawning `{command}` (cwd {cwd:?})"))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf);
            buf
        });

        let status = child
            .wait_timeout(self.timeout)
            .map_err(ctx!("waiting for `{command}`"))?;
        let status = match status {
            Some(status) => Some(status),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                None
            }
        };

        let stdout =
            String::from_utf8_lossy(&stdout_reader.join().unwrap_or_default()).into_owned();
        let mut stderr =
            String::from_utf8_lossy(&stderr_reader.join().unwrap_or_default()).into_owned();
        if status.is_none() {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "`{command}` timed out after {:.0}s and was killed",
                self.timeout.as_secs_f64()
            ));
        }

        Ok(GitOutcome {
            success: status.map_or(false, |s| s.success()),
            command,
            stdout,
            stderr,
            exit_code: status.and_then(|s| s.code()),
            duration: start.elapsed(),
        })
    }

    /// Run with the retry policy. Returns `Ok` only for a successful
    /// exit; on exhaustion the error carries the last stderr.
    fn run(&self, args: &[&str], cwd: Option<&Path>, retry: bool) -> Result<GitOutcome> {
        let attempts = if retry { self.max_retries } else { 1 };
        let mut last: Option<GitOutcome> = None;
        for attempt in 1..=attempts {
            let outcome = self.run_once(args, cwd)?;
            debug!(
                "`{}` attempt {attempt}/{attempts}: exit {:?} in {:?}",
                outcome.command, outcome.exit_code, outcome.duration
            );
            if outcome.success {
                return Ok(outcome);
            }
            last = Some(outcome);
            if attempt < attempts {
                std::thread::sleep(self.retry_delay);
            }
        }
        let last = last.expect("at least one attempt was made");
        Err(GitOperationError {
            command: last.command,
            attempts,
            stderr: last.stderr,
        }
        .into())
    }

    // -- clone-style provisioning ------------------------------------

    pub fn clone_repo(&self, url: &GitUrl, dest: &Path) -> Result<GitOutcome> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(ctx!("creating parent directory for clone {dest:?}"))?;
        }
        let dest_str = path_str(dest)?;
        self.run(&["clone", url.as_str(), dest_str], None, true)
    }

    pub fn bare_clone(&self, url: &GitUrl, dest: &Path) -> Result<GitOutcome> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(ctx!("creating parent directory for bare clone {dest:?}"))?;
        }
        let dest_str = path_str(dest)?;
        self.run(&["clone", "--bare", url.as_str(), dest_str], None, true)
    }

    // -- the cleanup pipeline primitives -----------------------------

    pub fn fetch_all_prune(&self, dir: &Path) -> Result<GitOutcome> {
        self.run(&["fetch", "--all", "--prune"], Some(dir), true)
    }

    /// `git clean -fdx`, removing untracked and ignored files and
    /// directories. Paths in `keep` are excluded (`-e`); the pool
    /// keeps its `slot.json` record inside clone working trees.
    pub fn clean_force_untracked(&self, dir: &Path, keep: &[&str]) -> Result<GitOutcome> {
        let mut args = vec!["clean", "-fdx"];
        for pattern in keep {
            args.push("-e");
            args.push(pattern);
        }
        self.run(&args, Some(dir), true)
    }

    pub fn reset_hard(&self, dir: &Path, reference: &str) -> Result<GitOutcome> {
        self.run(&["reset", "--hard", reference], Some(dir), true)
    }

    pub fn checkout(&self, dir: &Path, reference: &str) -> Result<GitOutcome> {
        self.run(&["checkout", reference], Some(dir), false)
    }

    // -- introspection (not retried) ---------------------------------

    pub fn current_branch(&self, dir: &Path) -> Result<String> {
        let outcome = self.run(&["rev-parse", "--abbrev-ref", "HEAD"], Some(dir), false)?;
        Ok(outcome.stdout.trim().to_owned())
    }

    pub fn current_commit(&self, dir: &Path) -> Result<String> {
        let outcome = self.run(&["rev-parse", "HEAD"], Some(dir), false)?;
        Ok(outcome.stdout.trim().to_owned())
    }

    /// Remote branch names with the `origin/` prefix stripped; the
    /// symbolic HEAD pointer line is skipped.
    pub fn list_remote_branches(&self, dir: &Path) -> Result<Vec<String>> {
        let outcome = self.run(&["branch", "-r"], Some(dir), false)?;
        let branches = outcome
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.contains("->"))
            .map(|line| line.strip_prefix("origin/").unwrap_or(line).to_owned())
            .collect();
        Ok(branches)
    }

    pub fn is_clean_worktree(&self, dir: &Path) -> bool {
        match self.run(&["status", "--porcelain"], Some(dir), false) {
            Ok(outcome) => outcome.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Whether `git status` runs at all in `dir`, regardless of the
    /// tree being clean or dirty.
    pub fn status_ok(&self, dir: &Path) -> bool {
        self.run(&["status", "--porcelain"], Some(dir), false).is_ok()
    }

    pub fn fsck(&self, dir: &Path) -> Result<GitOutcome> {
        self.run(&["fsck", "--full"], Some(dir), false)
    }

    // -- worktree primitives -----------------------------------------

    pub fn worktree_add(&self, bare: &Path, path: &Path, branch: &str) -> Result<GitOutcome> {
        let path_str = path_str(path)?;
        self.run(
            &["worktree", "add", path_str, "-b", branch, "HEAD"],
            Some(bare),
            false,
        )
    }

    pub fn worktree_remove(&self, bare: &Path, path: &Path, force: bool) -> Result<GitOutcome> {
        let path_str = path_str(path)?;
        let mut args = vec!["worktree", "remove", path_str];
        if force {
            args.push("--force");
        }
        self.run(&args, Some(bare), false)
    }

    pub fn worktree_prune(&self, bare: &Path) -> Result<GitOutcome> {
        self.run(&["worktree", "prune"], Some(bare), false)
    }

    pub fn branch_delete(&self, bare: &Path, name: &str) -> Result<GitOutcome> {
        self.run(&["branch", "-D", name], Some(bare), false)
    }

    // -- batch operations --------------------------------------------

    /// Fetch many repositories on a bounded worker pool, one result
    /// per input directory, in input order.
    pub fn fetch_all_prune_many(
        &self,
        dirs: &[&Path],
        max_workers: Option<usize>,
    ) -> Result<Vec<Result<GitOutcome>>> {
        if dirs.is_empty() {
            return Ok(vec![]);
        }
        let workers = max_workers.unwrap_or(32).clamp(1, 32).min(dirs.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .context("building fetch worker pool")?;
        Ok(pool.install(|| {
            dirs.par_iter()
                .map(|dir| self.fetch_all_prune(dir))
                .collect()
        }))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("path {path:?} is not representable as unicode"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn sh_git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("running git in test fixture");
        assert!(status.success(), "git {args:?} failed in {dir:?}");
    }

    fn init_repo(dir: &Path) {
        sh_git(dir, &["init", "-q", "-b", "main"]);
        sh_git(dir, &["config", "user.email", "pool@test.invalid"]);
        sh_git(dir, &["config", "user.name", "pool test"]);
        std::fs::write(dir.join("README"), "fixture\n").unwrap();
        sh_git(dir, &["add", "."]);
        sh_git(dir, &["commit", "-q", "-m", "initial"]);
    }

    #[test]
    fn t_introspection_and_clean() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        init_repo(dir);
        let git = GitRunner::new();

        assert_eq!(git.current_branch(dir)?, "main");
        let commit = git.current_commit(dir)?;
        assert_eq!(commit.len(), 40);
        assert!(git.is_clean_worktree(dir));

        std::fs::write(dir.join("scratch.txt"), "junk")?;
        std::fs::write(dir.join("slot.json"), "{}")?;
        assert!(!git.is_clean_worktree(dir));

        git.clean_force_untracked(dir, &["slot.json"])?;
        assert!(!dir.join("scratch.txt").exists());
        assert!(dir.join("slot.json").exists());

        git.reset_hard(dir, "HEAD")?;
        assert_eq!(git.current_commit(dir)?, commit);
        Ok(())
    }

    #[test]
    fn t_failure_carries_stderr() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        init_repo(dir);
        let git = GitRunner::with_limits(1, Duration::from_millis(1), Duration::from_secs(30));

        let err = git
            .checkout(dir, "no-such-branch")
            .expect_err("checkout of unknown ref must fail");
        let op = err
            .downcast_ref::<GitOperationError>()
            .expect("a GitOperationError");
        assert_eq!(op.attempts, 1);
        assert!(!op.stderr.is_empty());
        Ok(())
    }

    #[test]
    fn t_fetch_many_keeps_input_order() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        for dir in [&a, &b] {
            std::fs::create_dir_all(dir)?;
            init_repo(dir);
        }
        let git = GitRunner::new();
        // A repository without remotes fetches trivially; the point
        // here is one result per input, in order.
        let results = git.fetch_all_prune_many(&[a.as_path(), b.as_path()], Some(2))?;
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(result?.success);
        }
        Ok(())
    }

    #[test]
    fn t_fsck_and_branches() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        init_repo(dir);
        let git = GitRunner::new();
        assert!(git.fsck(dir)?.success);
        // No remotes configured: no remote branches
        assert!(git.list_remote_branches(dir)?.is_empty());
        Ok(())
    }
}
