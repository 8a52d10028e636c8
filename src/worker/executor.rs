use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::scheduler::{JobId, JobIdAllocator, JobRequest, UpdatedJob};

/// Jobs the batch system runs on this host instead of sending to the cluster.
///
/// Everything here is synchronous from the caller's point of view: no queues, no
/// retries.
#[async_trait]
pub trait LocalSupport: Send + Sync + 'static {
    /// Claim and start `request` if it should run locally.
    async fn issue_local(&self, request: &JobRequest, ids: &JobIdAllocator) -> Option<JobId>;

    /// Kill whichever of `ids` are local. Killed jobs produce no update.
    async fn kill_local(&self, ids: &[JobId]);

    /// Local jobs issued and not yet collected.
    async fn issued_local_ids(&self) -> HashSet<JobId>;

    async fn running_local_ids(&self) -> HashSet<JobId>;

    /// How long each running local job has been running.
    async fn running_local_times(&self) -> HashMap<JobId, Duration> {
        self.running_local_ids()
            .await
            .into_iter()
            .map(|id| (id, Duration::ZERO))
            .collect()
    }

    /// A finished local job, waiting at most `max_wait` for one.
    async fn get_updated_local_job(&self, max_wait: Duration) -> Option<UpdatedJob>;

    async fn shutdown_local(&self);
}

/// Sends every job to the cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalJobs;

#[async_trait]
impl LocalSupport for NoLocalJobs {
    async fn issue_local(&self, _request: &JobRequest, _ids: &JobIdAllocator) -> Option<JobId> {
        None
    }

    async fn kill_local(&self, _ids: &[JobId]) {}

    async fn issued_local_ids(&self) -> HashSet<JobId> {
        HashSet::new()
    }

    async fn running_local_ids(&self) -> HashSet<JobId> {
        HashSet::new()
    }

    async fn get_updated_local_job(&self, _max_wait: Duration) -> Option<UpdatedJob> {
        None
    }

    async fn shutdown_local(&self) {}
}

#[derive(Debug)]
struct LocalRun {
    abort: AbortHandle,
    started: Instant,
}

#[derive(Debug, Default)]
struct LocalState {
    issued: HashSet<JobId>,
    waiting: VecDeque<(JobId, String)>,
    running: HashMap<JobId, LocalRun>,
}

#[derive(Debug)]
struct Inner {
    max_jobs: usize,
    state: Mutex<LocalState>,
    updates_tx: UnboundedSender<UpdatedJob>,
}

/// Runs requests flagged `local` through `sh -c`, at most `max_jobs` at a time.
///
/// Children are killed when their task is aborted, which is how `kill_local` and
/// `shutdown_local` stop them.
#[derive(Debug)]
pub struct LocalJobRunner {
    inner: Arc<Inner>,
    updates_rx: Mutex<UnboundedReceiver<UpdatedJob>>,
}

impl LocalJobRunner {
    pub fn new(max_jobs: usize) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                max_jobs: max_jobs.max(1),
                state: Mutex::new(LocalState::default()),
                updates_tx,
            }),
            updates_rx: Mutex::new(updates_rx),
        }
    }
}

impl Inner {
    /// Start waiting jobs while there is room. Caller holds the state lock.
    fn launch_ready(self: &Arc<Self>, state: &mut LocalState) {
        while state.running.len() < self.max_jobs {
            let Some((id, command)) = state.waiting.pop_front() else {
                break;
            };
            let started = Instant::now();
            let task = tokio::spawn(run_local_job(self.clone(), id, command, started));
            state.running.insert(
                id,
                LocalRun {
                    abort: task.abort_handle(),
                    started,
                },
            );
        }
    }
}

async fn run_local_job(inner: Arc<Inner>, id: JobId, command: String, started: Instant) {
    tracing::info!(job_id = %id, command, "Executing local job");

    let result = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let exit_code = match result {
        Ok(output) => {
            let code = exit_code_of(&output.status);
            if code != 0 {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(job_id = %id, exit_code = code, stderr = %stderr.trim(), "Local job failed");
            }
            code
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Local job could not be started");
            127
        }
    };

    let mut state = inner.state.lock().await;
    if state.running.remove(&id).is_none() {
        // Killed while the lock was contended.
        return;
    }
    tracing::info!(job_id = %id, exit_code, "Local job completed");
    let _ = inner.updates_tx.send(UpdatedJob {
        job_id: id,
        exit_code,
        wall_time: Some(started.elapsed()),
    });
    inner.launch_ready(&mut state);
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[async_trait]
impl LocalSupport for LocalJobRunner {
    async fn issue_local(&self, request: &JobRequest, ids: &JobIdAllocator) -> Option<JobId> {
        if !request.local {
            return None;
        }
        let id = ids.next_id();
        let mut state = self.inner.state.lock().await;
        state.issued.insert(id);
        state.waiting.push_back((id, request.command.clone()));
        self.inner.launch_ready(&mut state);
        tracing::debug!(job_id = %id, "Issued local job");
        Some(id)
    }

    async fn kill_local(&self, ids: &[JobId]) {
        let mut state = self.inner.state.lock().await;
        for id in ids {
            if let Some(run) = state.running.remove(id) {
                run.abort.abort();
                tracing::debug!(job_id = %id, ran_for = ?run.started.elapsed(), "Killed local job");
            } else {
                state.waiting.retain(|(waiting_id, _)| waiting_id != id);
            }
            state.issued.remove(id);
        }
        self.inner.launch_ready(&mut state);
    }

    async fn issued_local_ids(&self) -> HashSet<JobId> {
        self.inner.state.lock().await.issued.clone()
    }

    async fn running_local_ids(&self) -> HashSet<JobId> {
        self.inner.state.lock().await.running.keys().copied().collect()
    }

    async fn running_local_times(&self) -> HashMap<JobId, Duration> {
        self.inner
            .state
            .lock()
            .await
            .running
            .iter()
            .map(|(id, run)| (*id, run.started.elapsed()))
            .collect()
    }

    async fn get_updated_local_job(&self, max_wait: Duration) -> Option<UpdatedJob> {
        let mut rx = self.updates_rx.lock().await;
        let update = if max_wait.is_zero() {
            rx.try_recv().ok()
        } else {
            tokio::time::timeout(max_wait, rx.recv()).await.ok().flatten()
        };
        if let Some(update) = &update {
            self.inner.state.lock().await.issued.remove(&update.job_id);
        }
        update
    }

    async fn shutdown_local(&self) {
        let mut state = self.inner.state.lock().await;
        for (id, run) in state.running.drain() {
            tracing::debug!(job_id = %id, "Stopping local job for shutdown");
            run.abort.abort();
        }
        state.waiting.clear();
    }
}
