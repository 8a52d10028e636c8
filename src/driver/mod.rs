//! Contract between the batch system core and a concrete cluster scheduler.
//!
//! The core never talks to a scheduler directly. Everything it needs is one of
//! five operations on [`SchedulerDriver`]:
//!
//! - **format_submission**: build the command line that submits a job (pure)
//! - **submit**: run that line and return the scheduler's [`ExternalHandle`]
//! - **query_exit_code**: non-blocking poll, `None` while the job is unfinished
//! - **list_running_handles**: what the scheduler currently reports running
//! - **kill**: best-effort termination request
//!
//! Two optional hooks have defaults: [`SchedulerDriver::list_running_times`] adds
//! run times to the listing, and [`SchedulerDriver::system_limits`] reports the
//! largest machine so requests can be validated without configured limits.
//!
//! Every operation except formatting may fail with
//! [`BatchError::CommandFailed`](crate::error::BatchError::CommandFailed); the
//! core wraps each call in [`with_retries`](crate::retry::with_retries), so
//! drivers must not retry on their own.
//!
//! [`LsfDriver`] is the bundled implementation.

pub mod lsf;

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ResourceLimits;
use crate::error::{BatchError, Result};
use crate::scheduler::JobId;

pub use lsf::LsfDriver;

/// The scheduler's own identifier for a submitted job, with an optional array
/// task index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalHandle {
    pub job: String,
    pub task: Option<u32>,
}

impl ExternalHandle {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            task: None,
        }
    }

    pub fn with_task(job: impl Into<String>, task: u32) -> Self {
        Self {
            job: job.into(),
            task: Some(task),
        }
    }
}

impl std::fmt::Display for ExternalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.task {
            Some(task) => write!(f, "{}.{}", self.job, task),
            None => write!(f, "{}", self.job),
        }
    }
}

impl FromStr for ExternalHandle {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BatchError::Parse("empty batch job ID".to_string()));
        }
        match s.split_once('.') {
            Some((job, task)) => {
                let task = task
                    .parse()
                    .map_err(|_| BatchError::Parse(format!("invalid task index in {s:?}")))?;
                Ok(ExternalHandle::with_task(job, task))
            }
            None => Ok(ExternalHandle::new(s)),
        }
    }
}

#[async_trait]
pub trait SchedulerDriver: Send + Sync + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Command line that submits `command` as job `job_id`. Memory is in bytes.
    fn format_submission(&self, cores: f64, memory: u64, job_id: JobId, command: &str)
        -> Vec<String>;

    /// Submit a formatted line with `env` merged over the process environment.
    async fn submit(&self, line: &[String], env: &HashMap<String, String>)
        -> Result<ExternalHandle>;

    /// `Ok(None)` while the job has not finished.
    async fn query_exit_code(&self, handle: &ExternalHandle) -> Result<Option<i32>>;

    async fn list_running_handles(&self) -> Result<HashSet<ExternalHandle>>;

    /// Ask the scheduler to stop a job. A job that has already finished is not an
    /// error; its exit code is picked up by the next query.
    async fn kill(&self, job_id: JobId, handle: &ExternalHandle) -> Result<()>;

    /// How long each running job has been running. Drivers that cannot tell report
    /// zero.
    async fn list_running_times(&self) -> Result<HashMap<ExternalHandle, Duration>> {
        Ok(self
            .list_running_handles()
            .await?
            .into_iter()
            .map(|handle| (handle, Duration::ZERO))
            .collect())
    }

    /// Largest cores and memory any one machine offers, if the scheduler can say.
    async fn system_limits(&self) -> Result<Option<ResourceLimits>> {
        Ok(None)
    }

    /// Floor for the status polling interval when none is configured.
    fn min_poll_wait(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// Run a scheduler command to completion and return its stdout.
///
/// A non-zero exit becomes [`BatchError::CommandFailed`] carrying stderr (or stdout
/// when stderr is empty), which is what the retry wrapper keys on.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<String> {
    tracing::debug!(program, args = ?args, "Running scheduler command");

    let output = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Err(BatchError::CommandFailed {
        command: std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        code: output.status.code(),
        output: if stderr.trim().is_empty() { stdout } else { stderr },
    })
}
