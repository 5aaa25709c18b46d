//! Operator front-end for the slot pool: pool lifecycle, manual
//! allocate/release, status queries, and the recovery sweeps. All
//! structured output is JSON on stdout so it can be piped into `jq`.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use repo_pool::{
    backend::BackendKind,
    manager::{AutoRecoverOptions, PoolManager},
    serde::{git_url::GitUrl, repo_name::RepoName, slot_id::SlotId},
    slot::Metadata,
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// Manage pools of pre-provisioned git working copies ("slots") that
/// automated coding agents check out, use, and hand back. Slots are
/// restored to a deterministic clean state around every allocation.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    /// Path to the configuration file. By default
    /// `~/.necrocode/config/pools.json5` (then `.json`) is tried, and
    /// built-in defaults are used when neither exists.
    #[clap(long)]
    config: Option<PathBuf>,

    /// The subcommand to run. Use `--help` after the sub-command to
    /// get a list of the allowed options there.
    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Create every pool the configuration defines that is missing
    Init,
    /// Create a pool with freshly provisioned slots
    Create {
        repo_name: RepoName,
        repo_url: GitUrl,

        /// How many slots to provision
        #[clap(long, default_value_t = 2)]
        num_slots: u32,

        /// Slot backing strategy
        #[clap(long, value_enum, default_value_t = BackendKind::Clones)]
        backend: BackendKind,
    },
    /// List the names of all pools
    Pools,
    /// Allocate one slot and print it
    Allocate {
        repo_name: RepoName,

        /// Metadata to attach to the allocation, as a JSON object
        #[clap(long)]
        metadata: Option<String>,
    },
    /// Release a slot back to its pool
    Release {
        slot_id: SlotId,

        /// Skip the post-release cleanup pipeline
        #[clap(long)]
        no_cleanup: bool,

        /// Mark the slot available immediately and clean up in the
        /// background
        #[clap(long)]
        background: bool,
    },
    /// Add one slot to an existing pool
    AddSlot { repo_name: RepoName },
    /// Remove a slot, its working tree, and its record
    RemoveSlot {
        slot_id: SlotId,

        /// Remove even when the slot is currently allocated
        #[clap(long)]
        force: bool,
    },
    /// Remove a whole pool including all its slots
    Destroy {
        repo_name: RepoName,

        /// Destroy even when slots are currently allocated
        #[clap(long)]
        force: bool,
    },
    /// Detailed status of one slot
    Status { slot_id: SlotId },
    /// Per-pool totals over all pools
    Summary,
    /// Fetch upfront in all available slots of a pool
    Warmup {
        repo_name: RepoName,

        /// Bound on parallel workers
        #[clap(long)]
        max_workers: Option<usize>,
    },
    /// Report long-allocated slots, corrupted slots, and orphaned locks
    Anomalies {
        /// Allocation age after which a slot counts as stuck
        #[clap(long, default_value_t = 24)]
        max_allocation_hours: u32,
    },
    /// Repair one slot (fsck, cleanup, re-clone as needed)
    Recover {
        slot_id: SlotId,

        /// Assert the slot available even if repair failed
        #[clap(long)]
        force: bool,
    },
    /// Park a slot in ERROR until an operator looks at it
    Isolate {
        slot_id: SlotId,

        #[clap(long)]
        reason: Option<String>,
    },
    /// Run the anomaly sweep and act on what it finds
    AutoRecover {
        #[clap(long, default_value_t = 24)]
        max_allocation_hours: u32,

        /// Also force-release slots allocated longer than the threshold
        #[clap(long)]
        release_long_allocated: bool,

        /// Leave corrupted slots alone instead of repairing them
        #[clap(long)]
        no_repair: bool,

        /// Leave orphaned lock files alone
        #[clap(long)]
        keep_orphaned_locks: bool,
    },
    /// Allocation and cleanup metrics of this manager process
    Metrics {
        repo_name: Option<RepoName>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        config,
        subcommand,
    } = Opts::parse();
    set_log_level(log_level.into());

    let auto_init = matches!(subcommand, SubCommand::Init);
    let manager = PoolManager::from_config_file(config.as_deref(), auto_init)?;

    match subcommand {
        SubCommand::Init => {
            for repo_name in manager.list_pools()? {
                println!("{repo_name}");
            }
        }
        SubCommand::Create {
            repo_name,
            repo_url,
            num_slots,
            backend,
        } => {
            let pool = manager.create_pool(&repo_name, &repo_url, num_slots, backend)?;
            print_json(&pool)?;
        }
        SubCommand::Pools => {
            for repo_name in manager.list_pools()? {
                println!("{repo_name}");
            }
        }
        SubCommand::Allocate {
            repo_name,
            metadata,
        } => {
            let metadata: Option<Metadata> = metadata
                .map(|s| {
                    serde_json::from_str(&s)
                        .map_err(|e| anyhow!("--metadata must be a JSON object: {e}"))
                })
                .transpose()?;
            let slot = manager.allocate_slot(&repo_name, metadata)?;
            print_json(&slot)?;
        }
        SubCommand::Release {
            slot_id,
            no_cleanup,
            background,
        } => {
            if background {
                match manager.release_slot_background(&slot_id, !no_cleanup)? {
                    Some(task_id) => println!("{task_id}"),
                    None => println!("released without cleanup"),
                }
                // Give the deferred cleanup a chance to finish before
                // this short-lived process exits.
                manager
                    .cleaner()
                    .background()
                    .await_all(Some(manager.config().cleanup_timeout_duration()));
            } else {
                manager.release_slot(&slot_id, !no_cleanup)?;
            }
        }
        SubCommand::AddSlot { repo_name } => {
            let slot = manager.add_slot(&repo_name)?;
            print_json(&slot)?;
        }
        SubCommand::RemoveSlot { slot_id, force } => {
            manager.remove_slot(&slot_id, force)?;
        }
        SubCommand::Destroy { repo_name, force } => {
            manager.destroy_pool(&repo_name, force)?;
        }
        SubCommand::Status { slot_id } => {
            print_json(&manager.get_slot_status(&slot_id)?)?;
        }
        SubCommand::Summary => {
            print_json(&manager.get_pool_summary()?)?;
        }
        SubCommand::Warmup {
            repo_name,
            max_workers,
        } => {
            print_json(&manager.warmup_pool(&repo_name, max_workers)?)?;
        }
        SubCommand::Anomalies {
            max_allocation_hours,
        } => {
            print_json(&manager.detect_anomalies(max_allocation_hours))?;
        }
        SubCommand::Recover { slot_id, force } => {
            let recovered = manager.recover_slot(&slot_id, force)?;
            if !recovered {
                return Err(anyhow!("slot {slot_id} could not be recovered"));
            }
        }
        SubCommand::Isolate { slot_id, reason } => {
            manager.isolate_slot(&slot_id, reason.as_deref())?;
        }
        SubCommand::AutoRecover {
            max_allocation_hours,
            release_long_allocated,
            no_repair,
            keep_orphaned_locks,
        } => {
            let report = manager.auto_recover(AutoRecoverOptions {
                max_allocation_hours,
                recover_corrupted: !no_repair,
                cleanup_orphaned_locks: !keep_orphaned_locks,
                force_release_long_allocated: release_long_allocated,
            });
            print_json(&report)?;
        }
        SubCommand::Metrics { repo_name } => {
            print_json(&manager.performance_metrics(repo_name.as_ref())?)?;
        }
    }
    Ok(())
}
