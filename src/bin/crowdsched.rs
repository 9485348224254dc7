//! crowdsched CLI: operator and contributor interface to the task scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use crowdsched::bulk::Executor;
use crowdsched::config::Config;
use crowdsched::db::Db;
use crowdsched::lock::LockStore;
use crowdsched::model::{NewProject, NewTask, ProjectId, Requester, Selector, TaskFilter, TaskId};
use crowdsched::queue::WorkerQueue;
use crowdsched::repo::TaskRepository;
use crowdsched::router::RouteOutcome;
use crowdsched::sched::SchedulerPolicy;
use crowdsched::service::{Contribution, TaskService};
use crowdsched::telemetry::{TelemetryConfig, init_telemetry};
use crowdsched::tracker::RedundancyTracker;
use crowdsched::worker::{BulkWorker, LogNotifier};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "crowdsched", about = "Redundant task distribution for crowdsourcing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bulk worker daemon
    Serve,
    /// Project operations
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Contributor operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Bulk administrative mutations
    Bulk {
        #[command(subcommand)]
        action: BulkAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create {
        short_name: String,
        #[arg(long, default_value = "priority_first")]
        scheduler: SchedulerPolicy,
        /// Reservation TTL in seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// Change a project's scheduler or reservation TTL
    Configure {
        project: i64,
        #[arg(long)]
        scheduler: Option<SchedulerPolicy>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Set a requester's task list for the locked scheduler
    Assign {
        project: i64,
        /// `user:<id>` or `ip:<addr>`
        requester: Requester,
        #[arg(value_delimiter = ',')]
        tasks: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Reserve the next task for a requester
    Next {
        project: i64,
        requester: Requester,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Mark a task as shown to a requester
    Present {
        project: i64,
        task: i64,
        requester: Requester,
    },
    /// Submit an answer
    Answer {
        project: i64,
        task: i64,
        requester: Requester,
        /// JSON answer payload
        #[arg(long)]
        info: Option<String>,
    },
    /// Show redundancy, state and per-requester status
    Status { project: i64, task: i64 },
}

#[derive(Args)]
struct SelectorArgs {
    /// Comma-separated task ids
    #[arg(long, value_delimiter = ',', conflicts_with = "filter")]
    ids: Vec<i64>,
    /// Filter predicate, e.g. `state=ongoing&priority_from=0.5`
    #[arg(long)]
    filter: Option<String>,
}

impl SelectorArgs {
    fn selector(&self) -> anyhow::Result<Selector> {
        if !self.ids.is_empty() {
            return Ok(Selector::ids(self.ids.iter().copied()));
        }
        let filter = TaskFilter::parse(self.filter.as_deref().unwrap_or(""))?;
        Ok(Selector::Filter(filter))
    }
}

#[derive(Subcommand)]
enum BulkAction {
    /// Set priority on selected tasks
    Priority {
        project: i64,
        priority: f64,
        #[command(flatten)]
        select: SelectorArgs,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Set required answers on selected tasks
    Redundancy {
        project: i64,
        n_answers: u32,
        #[command(flatten)]
        select: SelectorArgs,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Delete selected tasks
    Delete {
        project: i64,
        #[command(flatten)]
        select: SelectorArgs,
        /// Also delete tasks that already have answers
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Mark selected completed tasks as exported
    Export {
        project: i64,
        #[command(flatten)]
        select: SelectorArgs,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Import tasks from a JSON array of `{info, priority, n_answers}`
    Import {
        project: i64,
        file: PathBuf,
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Project { action } => {
            let service = service(&config, &connect(&config).await?)?;
            cmd_project(&service, action).await
        }
        Command::Task { action } => {
            let service = service(&config, &connect(&config).await?)?;
            cmd_task(&service, action).await
        }
        Command::Bulk { action } => {
            let service = service(&config, &connect(&config).await?)?;
            cmd_bulk(&service, action).await
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Arc<Db>> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.ensure_queues().await?;
    Ok(Arc::new(db))
}

fn service(config: &Config, db: &Arc<Db>) -> anyhow::Result<TaskService> {
    let repo: Arc<dyn TaskRepository> = db.clone();
    let locks: Arc<dyn LockStore> = db.clone();
    let queue: Arc<dyn WorkerQueue> = db.clone();
    Ok(TaskService::new(repo, locks, queue, config.route_table()?)
        .require_reservation(config.require_reservation))
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;

    let db = connect(&config).await?;
    let repo: Arc<dyn TaskRepository> = db.clone();
    let executor = Executor::new(repo.clone(), RedundancyTracker::new(repo));

    let worker = BulkWorker::new(
        db.clone(),
        executor,
        Arc::new(LogNotifier),
        config.route_table()?,
        config.worker_config(),
    )
    .with_lock_sweep(db);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    guard.force_flush();
    Ok(())
}

async fn cmd_project(service: &TaskService, action: ProjectAction) -> anyhow::Result<()> {
    match action {
        ProjectAction::Create {
            short_name,
            scheduler,
            timeout_secs,
        } => {
            let project = service
                .create_project(
                    NewProject::new(short_name)
                        .scheduler(scheduler)
                        .task_timeout(Duration::from_secs(timeout_secs)),
                )
                .await?;
            println!("Created project {} ({})", project.id, project.short_name);
        }
        ProjectAction::Configure {
            project,
            scheduler,
            timeout_secs,
        } => {
            let project = service
                .configure_project(
                    ProjectId(project),
                    scheduler,
                    timeout_secs.map(Duration::from_secs),
                )
                .await?;
            println!(
                "Project {}: scheduler {}, task timeout {}s",
                project.id,
                project.scheduler,
                project.task_timeout.as_secs()
            );
        }
        ProjectAction::Assign {
            project,
            requester,
            tasks,
        } => {
            let tasks: Vec<TaskId> = tasks.into_iter().map(TaskId).collect();
            service.assign(ProjectId(project), &requester, &tasks).await?;
            println!("Assigned {} task(s) to {requester}", tasks.len());
        }
    }
    Ok(())
}

async fn cmd_task(service: &TaskService, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Next {
            project,
            requester,
            offset,
        } => match service.next_task(ProjectId(project), &requester, offset).await? {
            Some(task) => {
                println!(
                    "Task {} (priority {}, n_answers {})",
                    task.id, task.priority, task.n_answers
                );
                println!("{}", serde_json::to_string_pretty(&task.info)?);
            }
            None => println!("No task available."),
        },
        TaskAction::Present {
            project,
            task,
            requester,
        } => {
            let at = service
                .present_task(ProjectId(project), TaskId(task), &requester)
                .await?;
            println!("First presented at {at}");
        }
        TaskAction::Answer {
            project,
            task,
            requester,
            info,
        } => {
            let info: serde_json::Value = match info {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Value::Null,
            };
            let task = service
                .submit_answer(ProjectId(project), TaskId(task), &requester, info)
                .await?;
            println!("Recorded. Task {} is {}", task.id, task.state);
        }
        TaskAction::Status { project, task } => {
            let status = service.task_status(ProjectId(project), TaskId(task)).await?;
            println!("Task:       {}", status.task.id);
            println!("State:      {}", status.task.state);
            println!("Answers:    {}/{}", status.recorded, status.task.n_answers);
            println!("Exported:   {}", status.task.exported);
            println!("Priority:   {}", status.task.priority);
            for c in &status.contributors {
                match c.contribution {
                    Contribution::Completed => {
                        println!("  {:<24} completed", c.requester.to_string())
                    }
                    Contribution::Locked { remaining_secs } => {
                        println!(
                            "  {:<24} locked ({remaining_secs}s left)",
                            c.requester.to_string()
                        )
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_bulk(service: &TaskService, action: BulkAction) -> anyhow::Result<()> {
    let outcome = match action {
        BulkAction::Priority {
            project,
            priority,
            select,
            by,
        } => {
            service
                .set_priority(ProjectId(project), select.selector()?, priority, &by)
                .await?
        }
        BulkAction::Redundancy {
            project,
            n_answers,
            select,
            by,
        } => {
            service
                .set_redundancy(ProjectId(project), select.selector()?, n_answers, &by)
                .await?
        }
        BulkAction::Delete {
            project,
            select,
            force,
            by,
        } => {
            service
                .delete_tasks(ProjectId(project), select.selector()?, force, &by)
                .await?
        }
        BulkAction::Export { project, select, by } => {
            service
                .export_tasks(ProjectId(project), select.selector()?, &by)
                .await?
        }
        BulkAction::Import { project, file, by } => {
            let content = std::fs::read_to_string(&file)?;
            let tasks: Vec<NewTask> = serde_json::from_str(&content)?;
            service.import_tasks(ProjectId(project), tasks, &by).await?
        }
    };

    match outcome {
        RouteOutcome::Inline(report) => println!(
            "Done: {} {} of {} matched ({} skipped)",
            report.kind, report.applied, report.matched, report.skipped
        ),
        RouteOutcome::Enqueued { job_id, msg_id } => {
            println!(
                "Enqueued job {job_id} (message {msg_id}); the result will be reported when it \
                 finishes"
            )
        }
    }
    Ok(())
}
