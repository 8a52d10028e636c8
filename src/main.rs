use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use gridbridge::config::{BatchConfig, LsfConfig};
use gridbridge::driver::{LsfDriver, SchedulerDriver};
use gridbridge::scheduler::{BatchSystem, JobId, JobRequest};
use gridbridge::shutdown::install_shutdown_handler;
use gridbridge::worker::{LocalJobRunner, LocalSupport, NoLocalJobs};

#[derive(Parser, Debug)]
#[command(name = "gridbridge")]
#[command(version)]
#[command(about = "Run commands as jobs on an LSF cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit commands and wait for all of them to finish
    Run(RunArgs),

    /// Print the bsub line a command would be submitted with
    Format(JobArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct JobArgs {
    /// Cores per job
    #[arg(long, default_value = "1")]
    cores: f64,

    /// Memory per job (e.g. "512M", "4G")
    #[arg(long, default_value = "1G", value_parser = parse_memory)]
    memory: u64,

    /// Disk per job (e.g. "10G")
    #[arg(long, default_value = "1G", value_parser = parse_memory)]
    disk: u64,

    /// Commands to run, one job each
    #[arg(required = true)]
    commands: Vec<String>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Run on this host instead of submitting to LSF
    #[arg(long)]
    local: bool,

    /// Maximum jobs submitted at once
    #[arg(long, default_value = "4")]
    max_jobs: usize,

    /// Seconds between scheduler status queries (defaults to the driver minimum)
    #[arg(long)]
    poll_wait: Option<u64>,

    /// Environment passed to every job, as NAME=VALUE (repeatable)
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

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
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobResultOutput {
    job_id: u64,
    command: String,
    status: &'static str,
    exit_code: Option<i32>,
    wall_time_secs: Option<f64>,
    submitted_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// "512M" -> 536870912. Plain numbers are bytes.
fn parse_memory(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        Some('T') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size {s:?}"))?;
    if value < 0.0 {
        return Err(format!("invalid memory size {s:?}"));
    }
    Ok((value * (1u64 << shift) as f64) as u64)
}

fn parse_env(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected NAME=VALUE, got {pair:?}"))
        })
        .collect()
}

fn print_results(results: &[JobResultOutput], output: &OutputFormat) -> serde_json::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(results)?),
        OutputFormat::Table => {
            println!(
                "{:<8} {:<10} {:<6} {:>10}  COMMAND",
                "JOB", "STATUS", "EXIT", "WALL(s)"
            );
            for r in results {
                println!(
                    "{:<8} {:<10} {:<6} {:>10}  {}",
                    r.job_id,
                    r.status,
                    r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                    r.wall_time_secs
                        .map(|w| format!("{w:.1}"))
                        .unwrap_or_else(|| "-".to_string()),
                    r.command
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

fn run_format(args: JobArgs) {
    let driver = LsfDriver::new(LsfConfig::from_env());
    for (i, command) in args.commands.iter().enumerate() {
        let line = driver.format_submission(args.cores, args.memory, JobId::from(i as u64), command);
        println!("{}", line.join(" "));
    }
}

async fn run_jobs(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = BatchConfig::new(args.max_jobs);
    if let Some(secs) = args.poll_wait {
        config = config.with_state_polling_wait(Duration::from_secs(secs));
    }

    let local: Arc<dyn LocalSupport> = if args.local {
        Arc::new(LocalJobRunner::new(args.max_jobs))
    } else {
        Arc::new(NoLocalJobs)
    };
    let driver = Arc::new(LsfDriver::new(LsfConfig::from_env()));
    let batch = BatchSystem::new(config, driver, local)?;

    for (name, value) in parse_env(&args.env)? {
        batch.set_env(&name, Some(&value)).await?;
    }

    let mut outstanding: HashMap<JobId, (String, DateTime<Utc>)> = HashMap::new();
    for command in &args.job.commands {
        let mut request = JobRequest::new(command.clone())
            .with_cores(args.job.cores)
            .with_memory(args.job.memory)
            .with_disk(args.job.disk);
        if args.local {
            request = request.locally();
        }
        let id = batch.issue_batch_job(request).await?;
        tracing::info!(job_id = %id, command, "Job issued");
        outstanding.insert(id, (command.clone(), Utc::now()));
    }

    let token = install_shutdown_handler()?;
    let mut results = Vec::new();

    while !outstanding.is_empty() {
        tokio::select! {
            _ = token.cancelled() => {
                let ids: Vec<JobId> = outstanding.keys().copied().collect();
                batch.kill_batch_jobs(&ids).await?;
                for (id, (command, submitted_at)) in outstanding.drain() {
                    results.push(JobResultOutput {
                        job_id: id.as_u64(),
                        command,
                        status: "killed",
                        exit_code: None,
                        wall_time_secs: None,
                        submitted_at,
                        finished_at: Utc::now(),
                    });
                }
            }
            update = batch.get_updated_batch_job(Duration::from_secs(1)) => {
                let Some(update) = update? else {
                    continue;
                };
                let Some((command, submitted_at)) = outstanding.remove(&update.job_id) else {
                    tracing::warn!(job_id = %update.job_id, "Update for unknown job");
                    continue;
                };
                tracing::info!(job_id = %update.job_id, exit_code = update.exit_code, "Job finished");
                results.push(JobResultOutput {
                    job_id: update.job_id.as_u64(),
                    command,
                    status: if update.exit_code == 0 { "completed" } else { "failed" },
                    exit_code: Some(update.exit_code),
                    wall_time_secs: update.wall_time.map(|w| w.as_secs_f64()),
                    submitted_at,
                    finished_at: Utc::now(),
                });
            }
        }
    }

    batch.shutdown().await?;

    results.sort_by_key(|r| r.job_id);
    print_results(&results, &args.output)?;
    Ok(results.iter().all(|r| r.exit_code == Some(0)))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let outcome = match args.command {
        Commands::Format(job) => {
            run_format(job);
            Ok(true)
        }
        Commands::Run(run) => run_jobs(run).await,
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}
