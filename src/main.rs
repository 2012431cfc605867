use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tandem::config::EngineConfig;
use tandem::lifecycle::{HistoryDisposition, WorkspaceManager};
use tandem::model::records::{Commit, MergeConflictResolution, Workspace};
use tandem::model::types::{AgentId, WorkspaceId, WorkspaceStatus};
use tandem::registry::WorkspaceFilter;
use tandem::retention::CleanupScheduler;
use tandem::{model, telemetry};

mod format;

use format::OutputFormat;

/// Isolated workspaces for concurrent agents
///
/// Every agent gets its own git worktree on its own branch, rooted at main
/// history or at another agent's latest checkpoint. Work is checkpointed as
/// commits and merged back automatically: when both sides changed a file,
/// the most recently checkpointed version wins.
///
/// Concurrent invocations against one registry wait for each other per
/// workspace and per merge target, through lock files next to the registry.
///
/// WORKFLOW:
///
///   1. tandem create --agent <name>          # prints the workspace path
///   2. edit files in that directory
///   3. tandem checkpoint <workspace>         # before each validation run
///   4. tandem merge <workspace>              # or: tandem abandon <workspace>
///   5. tandem sweep                          # reclaim finished workspaces
#[derive(Parser)]
#[command(name = "tandem")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'tandem <command> --help' for more information on a specific command.")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "TANDEM_CONFIG", default_value = "tandem.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the repository for tandem workspaces
    ///
    /// Creates the registry and workspace directory and keeps them out of
    /// git. Safe to run multiple times.
    Init,

    /// Allocate a workspace for an agent
    Create {
        /// Agent that will own the workspace
        #[arg(long)]
        agent: AgentId,

        /// Start from this workspace's latest checkpoint instead of main
        #[arg(long)]
        parent: Option<WorkspaceId>,
    },

    /// Commit everything in a workspace as the next iteration
    Checkpoint {
        workspace: WorkspaceId,

        /// Commit message (default: "[agent <id>] iteration <n> - ready for validation")
        #[arg(short = 'm', long = "message")]
        label: Option<String>,
    },

    /// Show what a workspace changed
    Changes {
        workspace: WorkspaceId,

        /// Compare from this commit instead of the base point
        #[arg(long)]
        since: Option<String>,

        /// Include the unified diff
        #[arg(long)]
        patch: bool,
    },

    /// Merge a workspace back into its parent or main
    Merge {
        workspace: WorkspaceId,

        /// Show the conflict decisions without merging
        #[arg(long)]
        dry_run: bool,
    },

    /// Release a workspace without merging it
    Abandon {
        workspace: WorkspaceId,

        #[arg(long)]
        reason: Option<String>,

        /// Mark the workspace failed (auto-checkpoints first when enabled)
        #[arg(long)]
        failed: bool,
    },

    /// Delete a finished workspace's directory
    Cleanup {
        workspace: WorkspaceId,

        /// Delete the branch instead of archiving it
        #[arg(long)]
        discard_history: bool,
    },

    /// List workspaces
    List {
        #[arg(long)]
        status: Option<WorkspaceStatus>,

        #[arg(long)]
        agent: Option<AgentId>,
    },

    /// Show a workspace with its commits and merge records
    Show { workspace: WorkspaceId },

    /// Run one retention sweep
    Sweep,

    /// Run retention sweeps in the foreground until interrupted
    Scheduler,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let out = OutputFormat::from_json_flag(cli.json);

    let config = EngineConfig::load(&cli.config)?;
    let manager = Arc::new(WorkspaceManager::open(config)?);

    match cli.command {
        Commands::Init => init(&manager, out),
        Commands::Create { agent, parent } => {
            let alloc = manager.create_workspace(&agent, parent.as_ref())?;
            out.emit(&alloc, |a| {
                println!("Created {} for agent {agent}", a.workspace_id);
                println!("  path: {}", a.working_directory.display());
                println!("  base: {}", a.base_point.short());
            })
        }
        Commands::Checkpoint { workspace, label } => {
            let commit = manager.checkpoint(&workspace, label.as_deref())?;
            out.emit(&commit, |c| {
                println!(
                    "Checkpoint {} of {workspace}: {} ({} file(s))",
                    c.iteration,
                    c.commit_id.short(),
                    c.files_changed
                );
            })
        }
        Commands::Changes {
            workspace,
            since,
            patch,
        } => {
            let mut changes = manager.get_changes(&workspace, since.as_deref())?;
            if !patch {
                changes.patch.clear();
            }
            out.emit(&changes, |c| {
                for path in &c.created {
                    println!("A {path}");
                }
                for path in &c.modified {
                    println!("M {path}");
                }
                for path in &c.deleted {
                    println!("D {path}");
                }
                println!(
                    "{} file(s), +{} -{}",
                    c.total(),
                    c.insertions,
                    c.deletions
                );
                if !c.patch.is_empty() {
                    print!("\n{}", c.patch);
                }
            })
        }
        Commands::Merge { workspace, dry_run } => {
            if dry_run {
                let preview = manager.preview_merge(&workspace)?;
                out.emit(&preview, |p| {
                    println!(
                        "Merging {} into {} would change {} file(s).",
                        p.workspace_id, p.target_branch, p.files_changed
                    );
                    print_conflicts(&p.conflicts);
                })
            } else {
                let result = manager.merge_to_parent(&workspace)?;
                out.emit(&result, |r| {
                    println!(
                        "Merged {workspace} into {}: {} ({})",
                        r.resolution.target_branch,
                        r.status,
                        r.resolution.resulting_commit_id.short()
                    );
                    print_conflicts(&r.resolution.conflicts);
                })
            }
        }
        Commands::Abandon {
            workspace,
            reason,
            failed,
        } => {
            let ws = if failed {
                manager.fail_workspace(&workspace, reason.as_deref())?
            } else {
                manager.abandon_workspace(&workspace, reason.as_deref())?
            };
            out.emit(&ws, |w| println!("{} is {}", w.id, w.status))
        }
        Commands::Cleanup {
            workspace,
            discard_history,
        } => {
            let result = manager.cleanup_workspace(&workspace, !discard_history)?;
            out.emit(&result, |r| {
                println!(
                    "Cleaned {}: reclaimed {} bytes",
                    r.workspace_id, r.reclaimed_bytes
                );
                if let HistoryDisposition::Archived { reference } = &r.history {
                    println!("  history kept at {reference}");
                }
            })
        }
        Commands::List { status, agent } => {
            let workspaces = manager.list_workspaces(&WorkspaceFilter { status, agent })?;
            out.emit(&workspaces, |list| {
                if list.is_empty() {
                    println!("No workspaces.");
                }
                for ws in list {
                    print_workspace_line(ws);
                }
            })
        }
        Commands::Show { workspace } => {
            let details = WorkspaceDetails {
                workspace: manager.get_workspace(&workspace)?,
                commits: manager.list_commits(&workspace)?,
                resolutions: manager.list_resolutions(&workspace)?,
            };
            out.emit(&details, print_details)
        }
        Commands::Sweep => {
            let report = CleanupScheduler::new(Arc::clone(&manager))
                .sweep(model::types::now_unix_ms())?;
            out.emit(&report, |r| {
                println!(
                    "Sweep: {} cleaned, {} force-reclaimed, {} skipped; {} bytes tracked",
                    r.cleaned.len(),
                    r.force_reclaimed.len(),
                    r.skipped.len(),
                    r.total_bytes_after
                );
                for s in &r.skipped {
                    println!("  skipped {}: {}", s.workspace_id, s.reason);
                }
            })
        }
        Commands::Scheduler => {
            let scheduler = CleanupScheduler::new(Arc::clone(&manager));
            eprintln!(
                "Sweeping every {}s. Press Ctrl-C to stop.",
                scheduler.policy().cleanup_interval_secs
            );
            scheduler.spawn().wait();
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct InitReport {
    repo: PathBuf,
    workspaces: PathBuf,
    registry: PathBuf,
}

/// Opening the manager already created the registry and excluded the
/// internal directories; only the workspace directory is left.
fn init(manager: &WorkspaceManager, out: OutputFormat) -> Result<()> {
    let config = manager.config();
    std::fs::create_dir_all(&config.workspace.base_dir).with_context(|| {
        format!(
            "could not create {}",
            config.workspace.base_dir.display()
        )
    })?;
    let report = InitReport {
        repo: config.repo.path.clone(),
        workspaces: config.workspace.base_dir.clone(),
        registry: config.workspace.registry.clone(),
    };
    out.emit(&report, |r| {
        println!("Initialized tandem in {}", r.repo.display());
        println!("  workspaces: {}", r.workspaces.display());
        println!("  registry:   {}", r.registry.display());
    })
}

#[derive(Serialize)]
struct WorkspaceDetails {
    workspace: Workspace,
    commits: Vec<Commit>,
    resolutions: Vec<MergeConflictResolution>,
}

fn print_workspace_line(ws: &Workspace) {
    let parent = ws
        .parent_id
        .as_ref()
        .map_or_else(|| "main".to_owned(), ToString::to_string);
    println!(
        "{:<22} {:<18} {:<16} from {parent}",
        ws.id.as_str(),
        ws.status.as_str(),
        ws.agent_id.as_str()
    );
}

fn print_details(d: &WorkspaceDetails) {
    let ws = &d.workspace;
    println!("{} ({})", ws.id, ws.status);
    println!("  agent:  {}", ws.agent_id);
    println!("  path:   {}", ws.working_directory.display());
    println!("  branch: {}", ws.branch);
    println!("  base:   {}", ws.base_point.short());
    println!("  depth:  {}", ws.ancestry_depth);
    println!("  disk:   {} bytes", ws.disk_bytes_estimate);
    if let Some(reason) = &ws.status_reason {
        println!("  reason: {reason}");
    }
    if let Some(archive) = &ws.archive_ref {
        println!("  archive: {archive}");
    }
    if !d.commits.is_empty() {
        println!("\nCommits:");
        for c in &d.commits {
            println!(
                "  {:>3} {} {:<15} {}",
                c.iteration,
                c.commit_id.short(),
                c.kind.as_str(),
                c.message.lines().next().unwrap_or_default()
            );
        }
    }
    for r in &d.resolutions {
        println!(
            "\nMerged into {} as {}",
            r.target_branch,
            r.resulting_commit_id.short()
        );
        print_conflicts(&r.conflicts);
    }
}

fn print_conflicts(conflicts: &[model::records::ConflictEntry]) {
    if conflicts.is_empty() {
        println!("  no conflicts");
        return;
    }
    for c in conflicts {
        let tie = if c.tie_broken_by_preference {
            " (tie)"
        } else {
            ""
        };
        println!("  {} <- {}{tie}", c.file_path, c.winner.as_str());
    }
}
