//! Cephalon: a local-first knowledge core for coordinating agents.
//!
//! **Cephalon is NOT an agent runtime.** It is the state plane agents call
//! on demand while executing multi-step tasks against a codebase. It keeps
//! a living three-layer model of a project:
//!
//! - **Skill layer** — what the documentation claims the code does
//! - **Code Graph layer** — what the tree structurally contains
//! - **Memory layer** — experiential knowledge from past task runs
//!
//! plus the machinery that keeps the layers honest and the work moving:
//!
//! - `graph`: structural entity/relation graph with atomic generation swaps
//! - `skills`: documented-flow model parsed from the project skill doc
//! - `drift`: skill-vs-code reconciliation with immutable reports
//! - `memory`: immutable records, vector embeddings, semantic recall, rerank
//! - `tasks`: task/subtask state machines, CAS assignment, checkpoints
//! - `context`: one query-scoped snapshot composed from all three layers
//!
//! # Architecture
//!
//! All state lives in per-bin SQLite databases under `<repo>/.cephalon/data/`.
//! Mutations route through the `DbBroker` thin waist for serialization and
//! audit logging (`broker.events.jsonl`). In-memory graph structures are
//! derived and rebuildable; the store is the only authority.

pub mod core;
pub mod plugins;

use core::{
    config::CephalonConfig,
    db, error,
    store::{Store, StoreKind},
    time::command_envelope,
};
use plugins::{context, drift, graph, memory, skills, tasks};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "cephalon",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local-first knowledge core for coordinating agents"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the .cephalon store in a repository
    #[clap(name = "init", visible_alias = "i")]
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },

    /// Sync the project code graph
    #[clap(name = "sync", visible_alias = "s")]
    Sync {
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        path: Option<PathBuf>,
        /// Full rebuild instead of incremental re-sync.
        #[clap(long)]
        full: bool,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show graph and skill status for a project
    #[clap(name = "status")]
    Status {
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        path: Option<PathBuf>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Skill-vs-code drift detection
    #[clap(name = "drift", visible_alias = "d")]
    Drift(DriftCli),

    /// Experiential memory store
    #[clap(name = "memory", visible_alias = "m")]
    Memory(MemoryCli),

    /// Task lifecycle management
    #[clap(name = "task", visible_alias = "t")]
    Task(TaskCli),

    /// Compose the three-layer context for a flow
    #[clap(name = "context", visible_alias = "c")]
    Context {
        /// Flow id or bare name, e.g. `flow.auth` or `auth`.
        flow: String,
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        path: Option<PathBuf>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
struct DriftCli {
    #[clap(subcommand)]
    command: DriftCommand,
}

#[derive(Subcommand, Debug)]
enum DriftCommand {
    /// Run a drift check (all flows, or one with --flow)
    Check {
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        path: Option<PathBuf>,
        #[clap(long)]
        flow: Option<String>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show the latest stored report
    Latest {
        #[clap(long)]
        project: Option<String>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
struct MemoryCli {
    #[clap(subcommand)]
    command: MemoryCommand,
}

#[derive(Subcommand, Debug)]
enum MemoryCommand {
    /// Store a new memory record
    Add {
        #[clap(long, default_value = "")]
        category: String,
        #[clap(long)]
        title: String,
        #[clap(long)]
        content: String,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, default_value_t = 5.0)]
        importance: f64,
    },
    /// Semantic similarity search
    Search {
        query: String,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, default_value_t = 5)]
        limit: usize,
        /// Apply the reranking pass over the similarity candidates.
        #[clap(long)]
        rerank: bool,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List stored memories
    List {
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        category: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct TaskCli {
    #[clap(subcommand)]
    command: TaskCommand,
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Create a task
    Add {
        description: String,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, default_value_t = 5.0)]
        priority: f64,
    },
    /// Append a subtask to a task
    Subtask {
        #[clap(long)]
        task: String,
        description: String,
    },
    /// created -> planned
    Plan {
        #[clap(long)]
        id: String,
    },
    /// planned -> in_progress
    Start {
        #[clap(long)]
        id: String,
    },
    /// Claim a subtask for an agent (atomic; one winner)
    Assign {
        #[clap(long)]
        id: String,
        #[clap(long)]
        agent: String,
    },
    /// Begin or resume subtask execution
    Exec {
        #[clap(long)]
        id: String,
    },
    /// Critic verdict: subtask verified
    Verify {
        #[clap(long)]
        id: String,
    },
    /// Critic verdict: subtask rejected (bounded retries)
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "")]
        note: String,
    },
    /// Complete a task (all subtasks must be verified)
    Finish {
        #[clap(long)]
        id: String,
    },
    /// Derived progress for a task
    Progress {
        #[clap(long)]
        id: String,
    },
    /// Get a task with its subtasks
    Get {
        #[clap(long)]
        id: String,
    },
    /// List tasks
    List {
        #[clap(long)]
        project: Option<String>,
    },
    /// Save a resumable checkpoint for (task, agent)
    Checkpoint {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
        /// JSON state payload.
        #[clap(long)]
        state: String,
        #[clap(long, default_value = "")]
        summary: String,
    },
    /// Load the latest checkpoint for (task, agent)
    Resume {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
    },
    /// Show checkpoint history for (task, agent)
    History {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
    },
}

fn find_project_root(start_dir: &Path) -> Result<PathBuf, error::CephalonError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(".cephalon").exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(error::CephalonError::NotFound(
                "'.cephalon' directory not found in current or parent directories. Run `cephalon init` first.".to_string(),
            ));
        }
    }
}

fn project_name_for(path: &Path, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| {
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string())
    })
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}

pub fn run() -> Result<(), error::CephalonError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    if let Command::Init { dir } = &cli.command {
        let target_dir = dir.clone().unwrap_or_else(|| current_dir.clone());
        let target_dir = std::fs::canonicalize(&target_dir).map_err(error::CephalonError::IoError)?;
        let store_root = target_dir.join(".cephalon").join("data");
        std::fs::create_dir_all(&store_root).map_err(error::CephalonError::IoError)?;
        db::initialize_all(&store_root)?;
        println!(
            "{} Cephalon store initialized at {}",
            "●".bright_green(),
            store_root.display()
        );
        for bin in ["graph.db", "memory.db", "task.db"] {
            println!("    {} {}", "●".bright_green(), bin.bright_white());
        }
        return Ok(());
    }

    let project_root = find_project_root(&current_dir)?;
    let store_root = project_root.join(".cephalon").join("data");
    std::fs::create_dir_all(&store_root).map_err(error::CephalonError::IoError)?;
    let store = Store {
        kind: StoreKind::Repo,
        root: store_root,
    };
    let config = CephalonConfig::load(&project_root)?;
    let embedder = memory::HashEmbedder::default();

    match cli.command {
        Command::Init { .. } => unreachable!(),
        Command::Sync {
            project,
            path,
            full,
            format,
        } => {
            let project_path = path.unwrap_or_else(|| project_root.clone());
            let project = project_name_for(&project_path, project);
            let mode = if full {
                graph::SyncMode::Full
            } else {
                graph::SyncMode::Incremental
            };
            let result = graph::build_graph(&store, &project, &project_path, mode, &config)?;
            match format {
                OutputFormat::Json => print_json(&command_envelope(
                    "graph.sync",
                    "ok",
                    serde_json::to_value(&result).unwrap(),
                )),
                OutputFormat::Text => {
                    println!(
                        "{} synced '{}': {} processed, {} unchanged, {} entities, {} relations ({} ms)",
                        "●".bright_green(),
                        project,
                        result.files_processed,
                        result.files_skipped,
                        result.entities_added,
                        result.relations_added,
                        result.duration_ms
                    );
                    for err in &result.errors {
                        println!("    {} {}", "⚠".bright_yellow(), err);
                    }
                }
            }
        }
        Command::Status {
            project,
            path,
            format,
        } => {
            let project_path = path.unwrap_or_else(|| project_root.clone());
            let project = project_name_for(&project_path, project);
            let stats = graph::graph_stats(&store, &project)?;
            let skill_model = skills::load_skill_model(&project_path)?;
            let flow_count = skill_model.as_ref().map(|m| m.flows.len()).unwrap_or(0);
            match format {
                OutputFormat::Json => print_json(&command_envelope(
                    "status",
                    "ok",
                    serde_json::json!({
                        "graph": stats,
                        "skill": { "present": skill_model.is_some(), "flow_count": flow_count },
                    }),
                )),
                OutputFormat::Text => {
                    println!("Project: {}", stats.project);
                    println!("Code Graph:");
                    println!("  Entities:  {}", stats.entity_count);
                    println!("  Relations: {}", stats.relation_count);
                    println!("  Files:     {}", stats.file_count);
                    match stats.last_sync {
                        Some(ts) => println!("  Last sync: {}Z", ts),
                        None => println!("  Last sync: never (run `cephalon sync`)"),
                    }
                    println!("Skill doc: {}", if skill_model.is_some() { "present" } else { "absent" });
                    println!("  Flows:     {}", flow_count);
                }
            }
        }
        Command::Drift(drift_cli) => match drift_cli.command {
            DriftCommand::Check {
                project,
                path,
                flow,
                format,
            } => {
                let project_path = path.unwrap_or_else(|| project_root.clone());
                let project = project_name_for(&project_path, project);
                let report =
                    drift::check_drift(&store, &project, &project_path, flow.as_deref(), &config)?;
                match format {
                    OutputFormat::Json => print_json(&command_envelope(
                        "drift.check",
                        "ok",
                        serde_json::to_value(&report).unwrap(),
                    )),
                    OutputFormat::Text => println!("{}", drift::format_drift_report(&report)),
                }
            }
            DriftCommand::Latest { project, format } => {
                let project = project_name_for(&project_root, project);
                match drift::latest_report(&store, &project)? {
                    Some(report) => match format {
                        OutputFormat::Json => print_json(&command_envelope(
                            "drift.latest",
                            "ok",
                            serde_json::to_value(&report).unwrap(),
                        )),
                        OutputFormat::Text => println!("{}", drift::format_drift_report(&report)),
                    },
                    None => println!("No drift report recorded for '{}'.", project),
                }
            }
        },
        Command::Memory(memory_cli) => match memory_cli.command {
            MemoryCommand::Add {
                category,
                title,
                content,
                project,
                importance,
            } => {
                let project = project_name_for(&project_root, project);
                let id = memory::store_memory(
                    &store,
                    &embedder,
                    &category,
                    &title,
                    &content,
                    &project,
                    importance,
                    &config,
                )?;
                println!("Memory stored: {}", id);
            }
            MemoryCommand::Search {
                query,
                project,
                limit,
                rerank,
                format,
            } => {
                let project = project_name_for(&project_root, project);
                let reranker = memory::SimilarityReranker;
                let results = memory::search_memory_semantic(
                    &store,
                    &embedder,
                    &query,
                    Some(project.as_str()),
                    limit,
                    if rerank {
                        Some(&reranker as &dyn memory::Reranker)
                    } else {
                        None
                    },
                    &config,
                )?;
                match format {
                    OutputFormat::Json => print_json(&command_envelope(
                        "memory.search",
                        "ok",
                        serde_json::json!({ "results": results }),
                    )),
                    OutputFormat::Text => {
                        for m in &results {
                            println!("[{:.3}] {} — {}", m.score, m.title, m.id);
                        }
                        if results.is_empty() {
                            println!("No matches.");
                        }
                    }
                }
            }
            MemoryCommand::List { project, category } => {
                let results =
                    memory::list_memories(&store, project.as_deref(), category.as_deref())?;
                print_json(&serde_json::json!({ "memories": results }));
            }
        },
        Command::Task(task_cli) => run_task_cli(&store, &project_root, &config, task_cli)?,
        Command::Context {
            flow,
            project,
            path,
            format,
        } => {
            let project_path = path.unwrap_or_else(|| project_root.clone());
            let project = project_name_for(&project_path, project);
            let ctx = context::get_full_context(
                &store,
                &embedder,
                &flow,
                &project,
                &project_path,
                &config,
            )?;
            match format {
                OutputFormat::Json => print_json(&command_envelope(
                    "context",
                    "ok",
                    serde_json::to_value(&ctx).unwrap(),
                )),
                OutputFormat::Text => println!("{}", context::format_context_for_agent(&ctx)),
            }
        }
    }
    Ok(())
}

fn run_task_cli(
    store: &Store,
    project_root: &Path,
    config: &CephalonConfig,
    task_cli: TaskCli,
) -> Result<(), error::CephalonError> {
    match task_cli.command {
        TaskCommand::Add {
            description,
            project,
            priority,
        } => {
            let project = project_name_for(project_root, project);
            let task = tasks::create_task(store, &project, &description, priority)?;
            println!("Task created: {}", task.id);
        }
        TaskCommand::Subtask { task, description } => {
            let subtask = tasks::create_subtask(store, &task, &description)?;
            println!("Subtask created: {} (ord {})", subtask.id, subtask.ord);
        }
        TaskCommand::Plan { id } => {
            let task = tasks::plan_task(store, &id)?;
            println!("Task {}: {}", task.id, task.status);
        }
        TaskCommand::Start { id } => {
            let task = tasks::start_task(store, &id)?;
            println!("Task {}: {}", task.id, task.status);
        }
        TaskCommand::Assign { id, agent } => {
            let subtask = tasks::assign_subtask(store, &id, &agent)?;
            println!("Subtask {} assigned to {}", subtask.id, subtask.assigned_agent);
        }
        TaskCommand::Exec { id } => {
            let subtask = tasks::start_subtask(store, &id)?;
            println!("Subtask {}: {}", subtask.id, subtask.status);
        }
        TaskCommand::Verify { id } => {
            let subtask = tasks::verify_subtask(store, &id)?;
            println!("Subtask {}: {}", subtask.id, subtask.status);
        }
        TaskCommand::Reject { id, note } => {
            let subtask = tasks::reject_subtask(store, &id, &note, config.max_subtask_retries)?;
            println!(
                "Subtask {}: {} (retries: {})",
                subtask.id, subtask.status, subtask.retry_count
            );
        }
        TaskCommand::Finish { id } => {
            let task = tasks::finish_task(store, &id)?;
            println!("Task {}: {}", task.id, task.status);
        }
        TaskCommand::Progress { id } => {
            let progress = tasks::get_task_progress(store, &id)?;
            print_json(&serde_json::to_value(&progress).unwrap());
        }
        TaskCommand::Get { id } => {
            let task = tasks::get_task(store, &id)?;
            let subtasks = tasks::list_subtasks(store, &id)?;
            print_json(&serde_json::json!({ "task": task, "subtasks": subtasks }));
        }
        TaskCommand::List { project } => {
            let list = tasks::list_tasks(store, project.as_deref())?;
            print_json(&serde_json::json!({ "tasks": list }));
        }
        TaskCommand::Checkpoint {
            task,
            agent,
            state,
            summary,
        } => {
            let state: serde_json::Value = serde_json::from_str(&state).map_err(|e| {
                error::CephalonError::ValidationError(format!("invalid --state JSON: {}", e))
            })?;
            let cp = tasks::save_checkpoint(store, &task, &agent, &state, &summary)?;
            println!("Checkpoint saved: {} (seq {})", cp.id, cp.seq);
        }
        TaskCommand::Resume { task, agent } => match tasks::load_checkpoint(store, &task, &agent)? {
            Some(cp) => print_json(&serde_json::to_value(&cp).unwrap()),
            None => println!("No checkpoint for ({}, {}).", task, agent),
        },
        TaskCommand::History { task, agent } => {
            let history = tasks::list_checkpoints(store, &task, &agent)?;
            print_json(&serde_json::json!({ "checkpoints": history }));
        }
    }
    Ok(())
}
