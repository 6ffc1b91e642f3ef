use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use queuectl::config;
use queuectl::dashboard::{run_dashboard, DashboardState};
use queuectl::error::{QueueError, Result};
use queuectl::job::{Job, JobSpec, JobState};
use queuectl::manager::{self, WorkerManager};
use queuectl::store::Store;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Persistent background job queue with a worker pool and web dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the database schema
    #[command(name = "init-db")]
    InitDb,

    /// Enqueue a new job from a JSON spec or flags
    Enqueue {
        /// Job spec as JSON: {"id":..,"command":..,"max_retries":..,"priority":..,"run_at":..}
        json: Option<String>,
        /// Shell command to execute
        #[arg(long)]
        command: Option<String>,
        /// Job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Total attempts allowed before the job goes dead
        #[arg(long)]
        max_retries: Option<u32>,
        /// Higher runs first (default 0)
        #[arg(long)]
        priority: Option<i64>,
        /// Earliest run time, RFC 3339 UTC (default now)
        #[arg(long)]
        run_at: Option<String>,
    },

    /// Worker pool management
    #[command(subcommand)]
    Worker(WorkerCmd),

    /// Print job counts and manager status
    Status,

    /// List jobs, newest first
    List {
        /// Filter: pending, processing, completed, failed, dead
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show one job in full, including captured output
    Show { id: String },

    /// Dead-letter queue management
    #[command(subcommand)]
    Dlq(DlqCmd),

    /// Configuration keys (hyphen or underscore form accepted)
    #[command(subcommand)]
    Config(ConfigCmd),

    /// Web dashboard
    #[command(subcommand)]
    Dashboard(DashboardCmd),
}

#[derive(Subcommand, Debug)]
enum WorkerCmd {
    /// Start the worker manager in the background
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Stop the running worker manager
    Stop,
    /// Run the manager in the foreground (spawned by `worker start`)
    #[command(hide = true)]
    Run {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCmd {
    /// List dead jobs
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Move a dead job back to the pending queue
    Retry {
        id: String,
        /// New retry budget for the job
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Subcommand, Debug)]
enum DashboardCmd {
    /// Serve the read-only dashboard
    Start {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUEUECTL_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn db_path() -> PathBuf {
    PathBuf::from(config::DEFAULT_DB_PATH)
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Cmd::InitDb => {
            let store = Store::open(db_path())?;
            store.init()?;
            println!("database initialized at {}", store.path().display());
        }

        Cmd::Enqueue {
            json,
            command,
            id,
            max_retries,
            priority,
            run_at,
        } => {
            let spec = match json {
                Some(raw) => JobSpec::from_json(&raw)?,
                None => {
                    let Some(command) = command else {
                        return Err(QueueError::InvalidInput(
                            "provide a JSON spec or --command".into(),
                        ));
                    };
                    JobSpec {
                        id,
                        command,
                        max_retries,
                        priority,
                        run_at: run_at.as_deref().map(parse_run_at).transpose()?,
                    }
                }
            };
            let store = Store::open(db_path())?;
            let job = store.enqueue(&spec, Utc::now())?;
            println!("{}", job.id);
        }

        Cmd::Worker(WorkerCmd::Start { count }) => {
            if count < 1 {
                return Err(QueueError::InvalidInput("worker count must be at least 1".into()));
            }
            manager::start_detached(&db_path(), count)?;
            println!("worker manager started with {count} worker(s)");
        }
        Cmd::Worker(WorkerCmd::Stop) => {
            manager::stop(&manager::data_dir_of(&db_path()))?;
            println!("worker manager stopped");
        }
        Cmd::Worker(WorkerCmd::Run { count }) => {
            WorkerManager::new(db_path(), count).run().await?;
        }

        Cmd::Status => {
            let store = Store::open(db_path())?;
            let counts = store.counts_by_state()?;
            let status = manager::status(&manager::data_dir_of(&db_path()));
            println!("queue:");
            println!("  pending     {}", counts.pending);
            println!("  processing  {}", counts.processing);
            println!("  completed   {}", counts.completed);
            println!("  failed      {}", counts.failed);
            println!("  dead (dlq)  {}", counts.dead);
            println!("workers:");
            if status.running {
                println!("  manager     running");
                println!("  active      {}", status.active_workers);
            } else {
                println!("  manager     not running");
            }
        }

        Cmd::List { state, limit, offset } => {
            let filter = state
                .as_deref()
                .map(str::parse::<JobState>)
                .transpose()
                .map_err(|e| QueueError::InvalidInput(e.to_string()))?;
            let store = Store::open(db_path())?;
            let jobs = store.list(filter, limit, offset)?;
            if jobs.is_empty() {
                println!("no jobs found");
            } else {
                print_job_table(&jobs);
            }
        }

        Cmd::Show { id } => {
            let store = Store::open(db_path())?;
            let job = store
                .get(&id)?
                .ok_or_else(|| QueueError::NotFound(format!("job {id} not found")))?;
            print_job(&job);
        }

        Cmd::Dlq(DlqCmd::List { limit, offset }) => {
            let store = Store::open(db_path())?;
            let jobs = store.dlq_list(limit, offset)?;
            if jobs.is_empty() {
                println!("no jobs in the dead-letter queue");
            } else {
                print_job_table(&jobs);
            }
        }
        Cmd::Dlq(DlqCmd::Retry { id, max_retries }) => {
            let mut store = Store::open(db_path())?;
            store.dlq_retry(&id, max_retries, Utc::now())?;
            println!("job {id} moved back to the pending queue");
        }

        Cmd::Config(ConfigCmd::Set { key, value }) => {
            let store = Store::open(db_path())?;
            store.config_set(&key, &value)?;
            println!("{} = {value}", config::normalize_key(&key));
        }
        Cmd::Config(ConfigCmd::Get { key }) => {
            let store = Store::open(db_path())?;
            let normalized = config::normalize_key(&key);
            match store.config_get(&key)? {
                Some(value) => println!("{normalized} = {value}"),
                None => match config::default_for(&normalized) {
                    Some(default) => println!("{normalized} = {default} (default)"),
                    None => println!("{normalized} is not set"),
                },
            }
        }

        Cmd::Dashboard(DashboardCmd::Start { host, port }) => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|e| QueueError::InvalidInput(format!("invalid listen address: {e}")))?;
            let state = DashboardState::open(&db_path())?;
            println!("dashboard listening on http://{addr}");
            run_dashboard(addr, state).await;
        }
    }
    Ok(())
}

fn parse_run_at(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::InvalidInput(format!("invalid --run-at timestamp: {e}")))
}

fn print_job_table(jobs: &[Job]) {
    println!(
        "{:<38} {:<11} {:>8} {:>9} {:<26} command",
        "id", "state", "priority", "attempts", "created_at"
    );
    for job in jobs {
        println!(
            "{:<38} {:<11} {:>8} {:>6}/{:<2} {:<26} {}",
            clip(&job.id, 36),
            job.state,
            job.priority,
            job.attempts,
            job.max_retries,
            job.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
            clip(&job.command, 48),
        );
    }
}

fn print_job(job: &Job) {
    println!("id:          {}", job.id);
    println!("command:     {}", job.command);
    println!("state:       {}", job.state);
    println!("attempts:    {}/{}", job.attempts, job.max_retries);
    println!("priority:    {}", job.priority);
    println!("run_at:      {}", job.run_at.to_rfc3339());
    println!("next_run_at: {}", job.next_run_at.to_rfc3339());
    println!("created_at:  {}", job.created_at.to_rfc3339());
    println!("updated_at:  {}", job.updated_at.to_rfc3339());
    if let Some(code) = job.exit_code {
        println!("exit_code:   {code}");
    }
    if let Some(error) = &job.error {
        println!("error:       {error}");
    }
    if let Some(worker) = &job.claimed_by {
        println!("claimed_by:  {worker}");
    }
    if let Some(at) = job.claimed_at {
        println!("claimed_at:  {}", at.to_rfc3339());
    }
    if let Some(stdout) = &job.stdout {
        println!("--- stdout ---");
        println!("{stdout}");
    }
    if let Some(stderr) = &job.stderr {
        println!("--- stderr ---");
        println!("{stderr}");
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    } else {
        s.to_string()
    }
}
