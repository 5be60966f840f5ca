//! ceq CLI: operator interface to a compute engine queue database.

use std::path::PathBuf;
use std::sync::Arc;

use ce_queue::config::Config;
use ce_queue::maintenance::WornOutSweeper;
use ce_queue::model::{ActivityRecord, ActivityStatus, QueueStatus, TaskError, TaskResult};
use ce_queue::queue::CeQueue;
use ce_queue::storage::Storage;
use ce_queue::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ceq", about = "Compute engine task queue")]
struct Cli {
    /// TOML config file. Environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new task
    Submit {
        /// Task type, e.g. REPORT
        task_type: String,
        /// Owning component uuid
        #[arg(long)]
        component: Option<String>,
        /// Login of the submitter
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Claim the next eligible task for a worker
    Peek {
        /// Worker identifier
        worker: String,
    },
    /// Archive a task as successful
    Complete {
        uuid: String,
        /// Analysis produced by the task
        #[arg(long)]
        analysis: Option<String>,
    },
    /// Archive a task as failed
    Fail {
        uuid: String,
        #[arg(long)]
        message: String,
        /// Full trace; defaults to the message
        #[arg(long)]
        stacktrace: Option<String>,
    },
    /// Cancel a pending task
    Cancel { uuid: String },
    /// Cancel every pending task
    CancelAll,
    /// Cancel pending tasks that used up their claim budget
    CancelWornOuts,
    /// List queued tasks
    List {
        /// Filter by status (PENDING | IN_PROGRESS)
        #[arg(long)]
        status: Option<String>,
    },
    /// List archived tasks, most recent first
    History {
        /// Filter by component uuid
        #[arg(long)]
        component: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a task, queued or archived
    Show { uuid: String },
    /// Show queue counters
    Status,
    /// Run the worn-out sweeper until Ctrl-C
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let queue = CeQueue::builder(Storage::open(&config.database_path)?)
        .settings(config.queue_settings())
        .build();

    match cli.command {
        Command::Submit {
            task_type,
            component,
            submitter,
        } => cmd_submit(&queue, task_type, component, submitter),
        Command::Peek { worker } => cmd_peek(&queue, &worker),
        Command::Complete { uuid, analysis } => {
            let result = analysis.map(TaskResult::with_analysis);
            cmd_remove(&queue, &uuid, ActivityStatus::Success, result, None)
        }
        Command::Fail {
            uuid,
            message,
            stacktrace,
        } => {
            let stacktrace = stacktrace.unwrap_or_else(|| message.clone());
            let error = TaskError::new(message, stacktrace);
            cmd_remove(&queue, &uuid, ActivityStatus::Failed, None, Some(error))
        }
        Command::Cancel { uuid } => {
            if queue.cancel(&uuid)? {
                println!("Canceled: {uuid}");
            } else {
                println!("No queued task {uuid}");
            }
            Ok(())
        }
        Command::CancelAll => {
            let count = queue.cancel_all()?;
            println!("Canceled {count} pending task(s)");
            Ok(())
        }
        Command::CancelWornOuts => {
            let count = queue.cancel_worn_outs()?;
            println!("Canceled {count} worn-out task(s)");
            Ok(())
        }
        Command::List { status } => cmd_list(&queue, status),
        Command::History { component, limit } => cmd_history(&queue, component, limit),
        Command::Show { uuid } => cmd_show(&queue, &uuid),
        Command::Status => {
            let status = queue.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Sweep => cmd_sweep(queue, &config).await,
    }
}

fn cmd_submit(
    queue: &CeQueue,
    task_type: String,
    component: Option<String>,
    submitter: Option<String>,
) -> anyhow::Result<()> {
    let mut builder = queue.prepare_submit().task_type(task_type);
    if let Some(component) = component {
        builder = builder.component_uuid(component);
    }
    if let Some(login) = submitter {
        builder = builder.submitter_login(login);
    }

    let handle = queue.submit(builder.build()?)?;
    println!("Submitted: {} (type: {})", handle.uuid, handle.task_type);
    Ok(())
}

fn cmd_peek(queue: &CeQueue, worker: &str) -> anyhow::Result<()> {
    match queue.peek(worker)? {
        Some(handle) => println!("{}", serde_json::to_string_pretty(&handle)?),
        None => println!("No eligible task."),
    }
    Ok(())
}

fn cmd_remove(
    queue: &CeQueue,
    uuid: &str,
    status: ActivityStatus,
    result: Option<TaskResult>,
    error: Option<TaskError>,
) -> anyhow::Result<()> {
    let handle = queue
        .handle(uuid)?
        .ok_or_else(|| anyhow::anyhow!("no queued task {uuid}"))?;
    queue.remove(&handle, status, result.as_ref(), error.as_ref())?;
    println!("Archived: {uuid} ({status})");
    Ok(())
}

fn cmd_list(queue: &CeQueue, status: Option<String>) -> anyhow::Result<()> {
    let status_filter: Option<QueueStatus> = match status {
        Some(s) => Some(
            s.to_uppercase()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let entries = queue.list_queue(status_filter)?;
    if entries.is_empty() {
        println!("No queued tasks.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<11}  {:<5}  {:<16}  CREATED",
        "UUID", "TYPE", "STATUS", "EXEC", "WORKER"
    );
    println!("{}", "-".repeat(110));
    for entry in &entries {
        println!(
            "{:<36}  {:<12}  {:<11}  {:<5}  {:<16}  {}",
            entry.uuid,
            entry.task_type,
            entry.status,
            entry.execution_count,
            entry.worker_uuid.as_deref().unwrap_or("-"),
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} task(s)", entries.len());
    Ok(())
}

fn cmd_history(queue: &CeQueue, component: Option<String>, limit: usize) -> anyhow::Result<()> {
    let records = queue.list_activity(component.as_deref(), limit)?;
    if records.is_empty() {
        println!("No archived tasks.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<8}  {:<4}  {:<5}  EXECUTED",
        "UUID", "TYPE", "STATUS", "LAST", "EXEC"
    );
    println!("{}", "-".repeat(100));
    for record in &records {
        println!(
            "{:<36}  {:<12}  {:<8}  {:<4}  {:<5}  {}",
            record.uuid,
            record.task_type,
            record.status,
            if record.is_last { "yes" } else { "" },
            record.execution_count,
            record.executed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

fn cmd_show(queue: &CeQueue, uuid: &str) -> anyhow::Result<()> {
    if let Some(entry) = queue.queue_entry(uuid)? {
        println!("UUID:       {}", entry.uuid);
        println!("Type:       {}", entry.task_type);
        println!("Status:     {}", entry.status);
        println!("Component:  {}", entry.component_uuid.as_deref().unwrap_or("-"));
        println!("Submitter:  {}", entry.submitter_login.as_deref().unwrap_or("-"));
        println!("Executions: {}", entry.execution_count);
        println!("Worker:     {}", entry.worker_uuid.as_deref().unwrap_or("-"));
        println!("Created:    {}", entry.created_at);
        println!("Updated:    {}", entry.updated_at);
        if let Some(started) = entry.started_at {
            println!("Started:    {started}");
        }
        return Ok(());
    }

    match queue.activity(uuid)? {
        Some(record) => print_activity(&record),
        None => anyhow::bail!("no task {uuid}"),
    }
    Ok(())
}

fn print_activity(record: &ActivityRecord) {
    println!("UUID:       {}", record.uuid);
    println!("Type:       {}", record.task_type);
    println!("Status:     {}", record.status);
    println!("Component:  {}", record.component_uuid.as_deref().unwrap_or("-"));
    println!("Submitter:  {}", record.submitter_login.as_deref().unwrap_or("-"));
    println!("Executions: {}", record.execution_count);
    println!("Worker:     {}", record.worker_uuid.as_deref().unwrap_or("-"));
    println!("Is Last:    {}", record.is_last);
    println!("Submitted:  {}", record.submitted_at);
    if let Some(started) = record.started_at {
        println!("Started:    {started}");
    }
    println!("Executed:   {}", record.executed_at);
    if let Some(ms) = record.execution_time_ms {
        println!("Duration:   {ms}ms");
    }
    if let Some(ref analysis) = record.analysis_uuid {
        println!("Analysis:   {analysis}");
    }
    if let Some(ref message) = record.error_message {
        println!("---");
        println!("Error:      {message}");
        if let Some(ref trace) = record.error_stacktrace {
            println!("{trace}");
        }
    }
}

async fn cmd_sweep(queue: CeQueue, config: &Config) -> anyhow::Result<()> {
    let sweeper = WornOutSweeper::new(Arc::new(queue), config.sweep_interval());

    let stopper = sweeper.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    sweeper.run().await?;
    Ok(())
}
