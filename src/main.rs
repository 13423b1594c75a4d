use anyhow::Result;
use clap::{Parser, Subcommand};
use nightshift::config::Config;
use nightshift::models::TaskStatus;
use nightshift::{logging, Nightshift, SubmitOptions};
use tokio::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "nightshift", about = "Staged-approval orchestration of headless AI agent runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new task (STAGED until approved)
    Submit {
        /// Natural-language request
        description: String,
        /// Per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Run the planner immediately after submission
        #[arg(long)]
        plan: bool,
    },
    /// Produce (or revise) the execution plan for a task
    Plan {
        task_id: String,
        /// Reviewer feedback; revises the existing plan
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Approve a staged task for execution
    Approve { task_id: String },
    /// Cancel a task that has not started
    Cancel { task_id: String },
    /// Pause a running task
    Pause { task_id: String },
    /// Resume a paused task
    Resume { task_id: String },
    /// Kill a running task
    Kill { task_id: String },
    /// List tasks, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one task with its logs and summary
    Get { task_id: String },
    /// Run the executor in the foreground until interrupted
    Run,
    /// Show executor status
    Status,
    /// Clear all tasks and logs
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    config.ensure_layout()?;
    let _log_guard = logging::init(&config.logs_dir())?;

    let nightshift = Nightshift::new(config.clone())?;

    match cli.command {
        Command::Submit {
            description,
            timeout,
            plan,
        } => {
            let task_id = nightshift.submit(
                &description,
                SubmitOptions {
                    timeout_seconds: timeout,
                },
            )?;
            println!("{task_id}");
            if plan {
                let plan = nightshift.plan_task(&task_id).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
        }
        Command::Plan { task_id, feedback } => {
            let plan = match feedback {
                Some(feedback) => nightshift.replan(&task_id, &feedback).await?,
                None => nightshift.plan_task(&task_id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Approve { task_id } => {
            nightshift.approve(&task_id)?;
            println!("{task_id} committed");
            let lock_path = config.executor_lock_path();
            if config.executor.auto_start
                && nightshift::executor::ExecutorLock::read(&lock_path).is_none()
            {
                eprintln!("no executor is running; start one with `nightshift run`");
            }
        }
        Command::Cancel { task_id } => {
            nightshift.cancel(&task_id)?;
            println!("{task_id} cancelled");
        }
        Command::Pause { task_id } => {
            nightshift.pause(&task_id)?;
            println!("pause signalled for {task_id}");
        }
        Command::Resume { task_id } => {
            nightshift.resume(&task_id)?;
            println!("resume signalled for {task_id}");
        }
        Command::Kill { task_id } => {
            nightshift.kill_task(&task_id)?;
            println!("kill signalled for {task_id}");
        }
        Command::List { status } => {
            let filter = status
                .map(|raw| raw.parse::<TaskStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            for task in nightshift.list(filter)? {
                println!(
                    "{}  {:9}  {}",
                    task.task_id,
                    task.status.as_str(),
                    task.description.lines().next().unwrap_or_default()
                );
            }
        }
        Command::Get { task_id } => {
            let details = nightshift.get(&task_id)?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Command::Run => {
            info!("starting executor");
            nightshift.executor_start().await?;
            println!("executor running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            println!("stopping...");
            nightshift.executor_stop(Duration::from_secs(30)).await?;
        }
        Command::Status => {
            let status = nightshift.executor_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Clear => {
            nightshift.clear_all()?;
            println!("store cleared");
        }
    }

    Ok(())
}
