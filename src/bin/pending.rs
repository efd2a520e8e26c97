//! pending CLI: operator interface to a pending-task store.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pending_tasks::TaskQueue;
use pending_tasks::config::Config;
use pending_tasks::engine::{ControlConfig, ControlPlane};
use pending_tasks::model::{NewTask, PendingTask, RunFilter, TaskId, TaskKind, TaskResult};
use pending_tasks::registry::{TaskRegistry, TaskRunner};
use pending_tasks::telemetry::{TelemetryConfig, init_telemetry};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pending", about = "Durable pending-task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new task
    Submit {
        /// Task kind tag; defaults to the demo `foo` marker
        tag: Option<String>,
        /// Data the task works on; equal pending tasks are coalesced
        #[arg(long)]
        data_id: Option<String>,
        /// Run in order with the other tasks of this group
        #[arg(long)]
        group_id: Option<String>,
        /// Only run through `run-task`
        #[arg(long)]
        manual: bool,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// List pending tasks
    List {
        /// Show dead tasks instead
        #[arg(long)]
        dead: bool,
    },
    /// Show a pending task
    Show {
        /// Task ID
        id: TaskId,
    },
    /// Run one pass over the pending tasks
    Run {
        /// Only run tasks of this group
        #[arg(long)]
        group: Option<String>,
    },
    /// Run a single task, manual ones included
    RunTask {
        /// Task ID
        id: TaskId,
    },
    /// List unresolved task errors
    Errors,
    /// Resolve the recorded errors of a task
    Resolve {
        /// Task ID
        id: TaskId,
    },
    /// Drop every task and error
    Clear,
    /// Run the control plane daemon
    Serve,
}

/// Demo marker kind. Carries no data and always succeeds.
#[derive(Serialize)]
struct FooTask;

impl TaskKind for FooTask {
    const TAG: &'static str = "foo";
}

struct FooRunner;

#[async_trait]
impl TaskRunner for FooRunner {
    fn tag(&self) -> &str {
        FooTask::TAG
    }

    async fn run(&self, task: &PendingTask) -> TaskResult {
        info!(id = %task.id, "foo task ran");
        TaskResult::Successful
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "pending".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let registry = TaskRegistry::empty().register(FooRunner);
    let queue = TaskQueue::open_sqlite(&config.db_path, config.queue_config()?, registry)?;

    match cli.command {
        Command::Submit {
            tag,
            data_id,
            group_id,
            manual,
            params,
        } => cmd_submit(&queue, tag, data_id, group_id, manual, params)?,
        Command::List { dead } => cmd_list(&queue, dead),
        Command::Show { id } => cmd_show(&queue, id)?,
        Command::Run { group } => {
            let filter = group.map(RunFilter::group).unwrap_or_default();
            let summary = queue.run_tasks(filter).await?;
            println!(
                "Ran {} task(s): {} succeeded, {} failed, {} skipped",
                summary.ran, summary.succeeded, summary.failed, summary.skipped
            );
        }
        Command::RunTask { id } => {
            let outcome = queue.run_task(id).await?;
            println!("{id}: {outcome:?}");
        }
        Command::Errors => cmd_errors(&queue),
        Command::Resolve { id } => {
            if queue.resolve_error(id)? {
                println!("Resolved errors of {id}");
            } else {
                println!("{id} has no recorded errors");
            }
        }
        Command::Clear => {
            queue.clear()?;
            println!("Cleared.");
        }
        Command::Serve => cmd_serve(&queue).await?,
    }

    queue.flush()?;
    Ok(())
}

async fn cmd_serve(queue: &TaskQueue) -> anyhow::Result<()> {
    let control = ControlPlane::new(
        queue.clone(),
        ControlConfig::from_queue_config(queue.config()),
    );

    info!(tags = ?queue.registry().tags(), pending = queue.len(), "serving");

    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(seq = event.seq, task = ?event.task_id(), kind = ?event.kind, "queue event")
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run().await?;
    Ok(())
}

fn cmd_submit(
    queue: &TaskQueue,
    tag: Option<String>,
    data_id: Option<String>,
    group_id: Option<String>,
    manual: bool,
    params: Option<String>,
) -> anyhow::Result<()> {
    let mut new = match tag {
        Some(tag) => NewTask::new(tag),
        None => NewTask::of(&FooTask),
    }
    .manually_run(manual);
    if let Some(json) = params {
        new = new.params(serde_json::from_str(&json)?);
    }
    if let Some(data_id) = data_id {
        new = new.data_id(data_id);
    }
    if let Some(group_id) = group_id {
        new = new.group(group_id);
    }

    let handle = queue.submit(new)?;
    println!("{:?}: {}", handle.acceptance, handle.id);
    Ok(())
}

fn cmd_list(queue: &TaskQueue, dead: bool) {
    let tasks = if dead { queue.dead() } else { queue.pending() };

    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<6}  {:<16}  {:<10}  {:<4}  {:<20}  {:<20}  CREATED",
        "ID", "TAG", "STATE", "TRY", "DATA_ID", "GROUP"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        println!(
            "{:<6}  {:<16}  {:<10}  {:<4}  {:<20}  {:<20}  {}",
            task.id,
            task.tag,
            task.state,
            task.attempts,
            task.data_id.as_deref().unwrap_or("-"),
            task.group_id.as_deref().unwrap_or("-"),
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
}

fn cmd_show(queue: &TaskQueue, id: TaskId) -> anyhow::Result<()> {
    let task = match queue.get(id) {
        Ok(task) => task,
        Err(e) => queue
            .dead()
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(e)?,
    };

    println!("ID:         {}", task.id);
    println!("Tag:        {}", task.tag);
    println!("State:      {}", task.state);
    println!("Data ID:    {}", task.data_id.as_deref().unwrap_or("-"));
    println!("Group:      {}", task.group_id.as_deref().unwrap_or("-"));
    println!("Manual:     {}", task.manually_run);
    println!("Params:     {}", serde_json::to_string_pretty(&task.params)?);
    println!("Attempts:   {}", task.attempts);
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);

    if let Ok(Some(error)) = queue.latest_error(id) {
        println!("---");
        println!("Error:      {}", error.message.as_deref().unwrap_or("-"));
        println!("Error ID:   {}", error.error_id.as_deref().unwrap_or("-"));
        println!("Recorded:   {}", error.created_at);
    }

    Ok(())
}

fn cmd_errors(queue: &TaskQueue) {
    let errors = queue.errors();
    if errors.is_empty() {
        println!("No unresolved errors.");
        return;
    }

    for error in &errors {
        println!(
            "{:<6}  task {:<6}  {:<20}  {}",
            error.id,
            error.task_id,
            error.error_id.as_deref().unwrap_or("-"),
            error.message.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} error(s)", errors.len());
}
