//! Pool manager configuration: global knobs plus the per-pool
//! definitions, loadable from `~/.necrocode/config/pools.json5` (or
//! `.json`).

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::{
    backend::BackendKind,
    config_file::LoadConfigFile,
    serde::{git_url::GitUrl, repo_name::RepoName},
};

pub const APP_DIR_NAME: &str = ".necrocode";

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME environment variable is not set"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CleanupOptions {
    pub fetch_on_allocate: bool,
    pub clean_on_release: bool,
    pub warmup_enabled: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            fetch_on_allocate: true,
            clean_on_release: true,
            warmup_enabled: false,
        }
    }
}

/// One pool as defined in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolDefinition {
    pub repo_url: GitUrl,
    /// Falls back to `default_num_slots` when absent.
    #[serde(default)]
    pub num_slots: Option<u32>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub cleanup_options: CleanupOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    /// Root for all pools; each pool is one subdirectory.
    pub workspaces_dir: PathBuf,
    /// Used when a pool definition omits `num_slots`.
    pub default_num_slots: u32,
    /// Default for lock acquisition, seconds.
    pub lock_timeout: f64,
    /// Advisory per-cleanup upper bound, seconds.
    pub cleanup_timeout: f64,
    /// Locks older than this count as stale.
    pub stale_lock_hours: u32,
    /// Whether the allocator records timing samples.
    pub enable_metrics: bool,
    pub pools: BTreeMap<RepoName, PoolDefinition>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workspaces_dir = match home_dir() {
            Ok(home) => home.join(APP_DIR_NAME).join("workspaces"),
            // No HOME (e.g. some daemon contexts): relative fallback,
            // callers that care set `workspaces_dir` explicitly.
            Err(_) => PathBuf::from("workspaces"),
        };
        Self {
            workspaces_dir,
            default_num_slots: 2,
            lock_timeout: 30.,
            cleanup_timeout: 60.,
            stale_lock_hours: 24,
            enable_metrics: true,
            pools: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.lock_timeout)
    }

    pub fn cleanup_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_timeout)
    }

    /// Slot count for one pool definition, with the global default
    /// applied.
    pub fn num_slots_for(&self, definition: &PoolDefinition) -> u32 {
        definition.num_slots.unwrap_or(self.default_num_slots)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_num_slots < 1 {
            bail!("default_num_slots must be at least 1");
        }
        if !(self.lock_timeout > 0.) {
            bail!("lock_timeout must be positive");
        }
        if !(self.cleanup_timeout > 0.) {
            bail!("cleanup_timeout must be positive");
        }
        for (repo_name, definition) in &self.pools {
            if let Some(num_slots) = definition.num_slots {
                if num_slots < 1 {
                    bail!("pool {repo_name:?}: num_slots must be at least 1");
                }
            }
        }
        Ok(())
    }
}

impl LoadConfigFile for PoolConfig {
    fn default_config_path_without_suffix() -> Result<Option<PathBuf>> {
        Ok(Some(home_dir()?.join(APP_DIR_NAME).join("config").join("pools")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_defaults_validate() -> Result<()> {
        PoolConfig::default().validate()
    }

    #[test]
    fn t_parse_full_config() -> Result<()> {
        let config: PoolConfig = json5::from_str(
            r#"{
                workspaces_dir: "/srv/pool/workspaces",
                default_num_slots: 3,
                lock_timeout: 10.5,
                stale_lock_hours: 6,
                pools: {
                    "chat-app": {
                        repo_url: "https://example.test/chat-app.git",
                        num_slots: 4,
                        backend: "worktrees",
                        cleanup_options: { warmup_enabled: true },
                    },
                    "demo": { repo_url: "https://example.test/demo.git" },
                },
            }"#,
        )
        .map_err(|e| anyhow!("{e}"))?;
        config.validate()?;
        assert_eq!(config.default_num_slots, 3);
        assert_eq!(config.lock_timeout, 10.5);
        // unset fields keep their defaults
        assert_eq!(config.cleanup_timeout, 60.);
        assert!(config.enable_metrics);

        let chat_key: RepoName = "chat-app".parse().unwrap();
        let chat = &config.pools[&chat_key];
        assert_eq!(config.num_slots_for(chat), 4);
        assert_eq!(chat.backend, Some(BackendKind::Worktrees));
        assert!(chat.cleanup_options.warmup_enabled);
        assert!(chat.cleanup_options.fetch_on_allocate);

        let demo_key: RepoName = "demo".parse().unwrap();
        let demo = &config.pools[&demo_key];
        assert_eq!(config.num_slots_for(demo), 3);
        assert_eq!(demo.backend, None);
        Ok(())
    }

    #[test]
    fn t_validation_failures() {
        let mut config = PoolConfig::default();
        config.default_num_slots = 0;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::default();
        config.lock_timeout = 0.;
        assert!(config.validate().is_err());
    }

    #[test]
    fn t_rejects_unknown_fields() {
        let parsed: Result<PoolConfig, _> = json5::from_str("{ lock_timout: 3 }");
        assert!(parsed.is_err());
    }
}
