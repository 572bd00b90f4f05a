use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use distcron::config::ClusterConfig;
use distcron::master::ApiResponse;
use distcron::node::Node;
use distcron::scheduler::{Job, JobLogEntry};
use distcron::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "distcron")]
#[command(version)]
#[command(about = "A distributed cron scheduler with fleet-wide mutual exclusion")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master and its workers in this process
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Worker commands
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// JSON config file (camelCase keys, missing fields take defaults)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address for the control API
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Number of workers to run in this process
    #[arg(long)]
    workers: Option<usize>,

    /// Worker id (defaults to the host's IPv4 address)
    #[arg(long)]
    worker_id: Option<String>,

    /// Append job logs to this JSON-lines file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Shell used to run job commands
    #[arg(long)]
    shell: Option<String>,

    /// Upper bound of the random delay before taking a job lock
    #[arg(long)]
    jitter_ms: Option<u64>,
}

impl ServerArgs {
    fn into_config(self) -> Result<ClusterConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::load(path)?,
            None => ClusterConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.master.api_addr = listen;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(id) = self.worker_id {
            config.worker.worker_id = Some(id);
        }
        if let Some(path) = self.log_file {
            config.log_file = Some(path);
        }
        if let Some(shell) = self.shell {
            config.worker.shell = shell;
        }
        if let Some(jitter) = self.jitter_ms {
            config.worker.jitter_max_ms = jitter;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Client Arguments (shared by job and worker commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Control API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8070")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job / Worker Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create or replace a job
    Save {
        name: String,
        /// Shell command to run (e.g., "echo hello")
        command: String,
        /// Cron expression (5, 6 or 7 fields, or a macro such as @hourly)
        cron: String,
    },
    /// Delete a job
    Delete { name: String },
    /// List all jobs
    List,
    /// Kill the running execution of a job on every worker
    Kill { name: String },
    /// Show execution logs of a job, newest first
    Log {
        name: String,

        #[arg(long, default_value = "0")]
        skip: usize,

        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// List live workers
    List,
}

// =============================================================================
// API Client
// =============================================================================

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            base: addr.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Box<dyn std::error::Error>> {
        let request = self.http.get(format!("{}{}", self.base, path)).query(query);
        Self::unwrap_envelope(request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let request = self.http.post(format!("{}{}", self.base, path)).json(body);
        Self::unwrap_envelope(request).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let envelope: ApiResponse = request.send().await?.json().await?;
        if envelope.errno != 0 {
            return Err(envelope.msg.into());
        }
        Ok(serde_json::from_value(envelope.data)?)
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config()?;

    tracing::info!(
        api_addr = %config.master.api_addr,
        workers = config.workers,
        worker_id = ?config.worker.worker_id,
        log_file = ?config.log_file,
        "Starting distcron"
    );

    let shutdown = install_shutdown_handler()?;
    Node::new(config).run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn handle_job_command(
    client: &ApiClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Save { name, command, cron } => {
            let job = Job::new(name, command, cron);
            let previous: Option<Job> = client.post("/job/save", &job).await?;
            match output_format {
                OutputFormat::Json => print_json(&json!({ "saved": job, "previous": previous }))?,
                OutputFormat::Table => {
                    println!("Job '{}' saved.", job.name);
                    if let Some(prev) = previous {
                        println!("Replaced: {} ({})", prev.command, prev.cron_expr);
                    }
                }
            }
        }
        JobCommands::Delete { name } => {
            let removed: Option<Job> = client.post("/job/delete", &json!({ "name": name })).await?;
            match output_format {
                OutputFormat::Json => print_json(&removed)?,
                OutputFormat::Table => match removed {
                    Some(job) => println!("Job '{}' deleted.", job.name),
                    None => println!("Job '{}' not found.", name),
                },
            }
        }
        JobCommands::List => {
            let jobs: Vec<Job> = client.get("/job/list", &[]).await?;
            match output_format {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<24} {:<24} COMMAND", "NAME", "SCHEDULE");
                        println!("{}", "-".repeat(78));
                        for job in &jobs {
                            println!(
                                "{:<24} {:<24} {}",
                                job.name,
                                job.cron_expr,
                                truncate(&job.command, 28)
                            );
                        }
                    }
                }
            }
        }
        JobCommands::Kill { name } => {
            let _: serde_json::Value = client.post("/job/kill", &json!({ "name": name })).await?;
            match output_format {
                OutputFormat::Json => print_json(&json!({ "killed": name }))?,
                OutputFormat::Table => println!("Kill requested for '{}'.", name),
            }
        }
        JobCommands::Log { name, skip, limit } => {
            let mut query = vec![("name", name), ("skip", skip.to_string())];
            if let Some(limit) = limit {
                query.push(("limit", limit.to_string()));
            }
            let entries: Vec<JobLogEntry> = client.get("/job/log", &query).await?;
            match output_format {
                OutputFormat::Json => print_json(&entries)?,
                OutputFormat::Table => {
                    if entries.is_empty() {
                        println!("No log entries found.");
                    }
                    for entry in &entries {
                        let status = if entry.err.is_empty() {
                            "ok".to_string()
                        } else {
                            entry.err.clone()
                        };
                        println!(
                            "{}  planned {}  {} ms  {}",
                            format_millis(entry.start_time),
                            format_millis(entry.plan_time),
                            entry.end_time - entry.start_time,
                            status
                        );
                        for line in entry.output.lines() {
                            println!("  {}", line);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_worker_command(
    client: &ApiClient,
    command: WorkerCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        WorkerCommands::List => {
            let workers: Vec<String> = client.get("/worker/list", &[]).await?;
            match output_format {
                OutputFormat::Json => print_json(&workers)?,
                OutputFormat::Table => {
                    if workers.is_empty() {
                        println!("No live workers.");
                    }
                    for worker in &workers {
                        println!("{}", worker);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            if let Err(e) = handle_job_command(&api, command, &client.output).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Worker { client, command } => {
            let api = ApiClient::new(&client.addr);
            if let Err(e) = handle_worker_command(&api, command, &client.output).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
