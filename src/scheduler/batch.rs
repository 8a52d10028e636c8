use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::config::{BatchConfig, ResourceLimits};
use crate::driver::{ExternalHandle, SchedulerDriver};
use crate::error::{BatchError, Result};
use crate::retry::with_retries;
use crate::scheduler::cache::PollCache;
use crate::scheduler::queue::RunningJobs;
use crate::scheduler::resources::check_resource_request;
use crate::scheduler::{JobId, JobIdAllocator, JobRequest, UpdatedJob, WaitingJob};
use crate::worker::lifecycle::{NewJob, Worker, WorkerChannels, WorkerSettings};
use crate::worker::LocalSupport;

/// Caller-facing batch system for a grid-engine style cluster.
///
/// Cluster jobs are handed to a background [`Worker`] through queues and come back
/// through [`get_updated_batch_job`](Self::get_updated_batch_job); jobs the local
/// collaborator claims never touch the cluster. Every method takes `&self`, so one
/// instance can be shared behind an `Arc` by many tasks.
///
/// Must be created inside a tokio runtime.
pub struct BatchSystem {
    driver: Arc<dyn SchedulerDriver>,
    local: Arc<dyn LocalSupport>,
    config: BatchConfig,
    ids: JobIdAllocator,
    /// Configured limits, or the driver's answer on first use.
    limits: OnceCell<ResourceLimits>,
    /// Cluster jobs issued and not yet reported finished or killed.
    current_jobs: Mutex<HashSet<JobId>>,
    new_jobs: UnboundedSender<NewJob>,
    kills: UnboundedSender<JobId>,
    updated: Mutex<UnboundedReceiver<UpdatedJob>>,
    killed: Mutex<UnboundedReceiver<JobId>>,
    running: Arc<Mutex<RunningJobs>>,
    running_cache: Mutex<PollCache<HashMap<JobId, Duration>>>,
    environment: Arc<RwLock<HashMap<String, String>>>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl BatchSystem {
    /// Start the worker and return the batch system that feeds it.
    pub fn new(
        config: BatchConfig,
        driver: Arc<dyn SchedulerDriver>,
        local: Arc<dyn LocalSupport>,
    ) -> Result<Self> {
        if config.max_local_jobs == 0 {
            return Err(BatchError::InvalidRequest(
                "max_local_jobs must be at least 1".to_string(),
            ));
        }

        let state_polling_wait = config
            .state_polling_wait
            .unwrap_or_else(|| driver.min_poll_wait());

        let (new_jobs_tx, new_jobs_rx) = mpsc::unbounded_channel();
        let (updated_tx, updated_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (killed_tx, killed_rx) = mpsc::unbounded_channel();

        let running = Arc::new(Mutex::new(RunningJobs::new()));
        let environment = Arc::new(RwLock::new(HashMap::new()));

        let worker = Worker::new(
            driver.clone(),
            WorkerChannels {
                new_jobs: new_jobs_rx,
                updated: updated_tx,
                kills: kill_rx,
                killed: killed_tx,
            },
            running.clone(),
            environment.clone(),
            WorkerSettings {
                max_running: config.max_local_jobs,
                state_polling_wait,
                kill_poll_interval: config.kill_poll_interval,
                tick: config.worker_tick,
            },
        );
        let driver_name = driver.name().to_string();
        let handle = tokio::spawn(async move {
            let result = worker.run().await;
            match &result {
                Ok(()) => tracing::debug!(driver = %driver_name, "Batch system worker stopped"),
                Err(e) => {
                    tracing::error!(driver = %driver_name, error = %e, "Batch system worker failed")
                }
            }
            result
        });

        tracing::info!(
            driver = driver.name(),
            max_running = config.max_local_jobs,
            state_polling_wait = ?state_polling_wait,
            "Batch system started"
        );

        let limits = OnceCell::new_with(config.limits);
        Ok(Self {
            driver,
            local,
            config,
            ids: JobIdAllocator::new(),
            limits,
            current_jobs: Mutex::new(HashSet::new()),
            new_jobs: new_jobs_tx,
            kills: kill_tx,
            updated: Mutex::new(updated_rx),
            killed: Mutex::new(killed_rx),
            running,
            running_cache: Mutex::new(PollCache::new(state_polling_wait)),
            environment,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Validate and queue a job. Returns as soon as the job is queued; submission
    /// happens on the worker.
    pub async fn issue_batch_job(&self, request: JobRequest) -> Result<JobId> {
        check_resource_request(self.resource_limits().await, &request)?;

        if let Some(id) = self.local.issue_local(&request, &self.ids).await {
            return Ok(id);
        }

        let id = self.ids.next_id();
        self.current_jobs.lock().await.insert(id);
        if self
            .new_jobs
            .send(NewJob::Job(WaitingJob::new(id, &request)))
            .is_err()
        {
            self.current_jobs.lock().await.remove(&id);
            return Err(BatchError::WorkerStopped);
        }
        tracing::debug!(job_id = %id, command = %request.command, "Issued the job command");
        Ok(id)
    }

    /// Kill the given jobs and wait until every cluster kill is confirmed.
    ///
    /// Jobs still waiting are dropped without contacting the scheduler. Submitted
    /// jobs are confirmed only once the scheduler reports an exit code for them, and
    /// there is no timeout: a job the scheduler never reports on blocks this call
    /// (and the worker) indefinitely. Returns [`BatchError::WorkerStopped`] if the
    /// worker goes away before all confirmations arrive.
    pub async fn kill_batch_jobs(&self, ids: &[JobId]) -> Result<()> {
        let local_ids = self.local.issued_local_ids().await;
        self.local.kill_local(ids).await;

        let mut remaining: HashSet<JobId> = ids
            .iter()
            .copied()
            .filter(|id| !local_ids.contains(id))
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }
        tracing::debug!(jobs = ?remaining, "Jobs to be killed");

        // Held for the whole call so concurrent callers cannot take each other's
        // confirmations.
        let mut killed = self.killed.lock().await;
        for id in &remaining {
            self.kills
                .send(*id)
                .map_err(|_| BatchError::WorkerStopped)?;
        }

        while !remaining.is_empty() {
            match tokio::time::timeout(self.config.kill_poll_interval, killed.recv()).await {
                Ok(Some(id)) => {
                    remaining.remove(&id);
                    self.current_jobs.lock().await.remove(&id);
                }
                Ok(None) => {
                    tracing::warn!(pending = remaining.len(), "Worker stopped before confirming kills");
                    return Err(BatchError::WorkerStopped);
                }
                Err(_) => {
                    tracing::debug!(
                        pending = remaining.len(),
                        "Some kills still pending, waiting"
                    );
                }
            }
        }
        Ok(())
    }

    /// Every job issued and not yet collected, local or cluster. No remote calls.
    pub async fn issued_batch_job_ids(&self) -> HashSet<JobId> {
        let mut ids = self.local.issued_local_ids().await;
        ids.extend(self.current_jobs.lock().await.iter().copied());
        ids
    }

    /// Jobs the scheduler reports running, plus running local jobs.
    ///
    /// The scheduler is asked at most once per polling wait; in between the last
    /// listing is reused.
    pub async fn running_batch_job_ids(&self) -> Result<HashSet<JobId>> {
        Ok(self.running_batch_job_times().await?.into_keys().collect())
    }

    /// How long each running job has been running, by the same listing as
    /// [`running_batch_job_ids`](Self::running_batch_job_ids). Cluster run times
    /// are as of the last scheduler query.
    pub async fn running_batch_job_times(&self) -> Result<HashMap<JobId, Duration>> {
        let mut times = {
            let mut cache = self.running_cache.lock().await;
            match cache.fresh() {
                Some(times) => times.clone(),
                None => {
                    let driver = &self.driver;
                    let listing =
                        with_retries("list running jobs", move || driver.list_running_times())
                            .await?;
                    let running = self.running.lock().await;
                    let times: HashMap<JobId, Duration> = listing
                        .into_iter()
                        .filter_map(|(handle, ran_for)| {
                            running.job_for_handle(&handle).map(|id| (id, ran_for))
                        })
                        .collect();
                    cache.store(times.clone());
                    times
                }
            }
        };
        times.extend(self.local.running_local_times().await);
        Ok(times)
    }

    /// Limits requests are validated against. Without configured limits the driver
    /// is asked once; if it cannot say, nothing is rejected for size.
    pub async fn resource_limits(&self) -> &ResourceLimits {
        self.limits
            .get_or_init(|| async {
                let driver = &self.driver;
                match with_retries("system limits", move || driver.system_limits()).await {
                    Ok(Some(limits)) => {
                        tracing::info!(
                            max_cores = limits.max_cores,
                            max_memory = limits.max_memory,
                            "Using scheduler limits"
                        );
                        limits
                    }
                    Ok(None) => ResourceLimits::default(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not read scheduler limits, not enforcing any");
                        ResourceLimits::default()
                    }
                }
            })
            .await
    }

    /// Next finished job, local jobs first. Waits up to `max_wait` for a cluster job
    /// and returns `Ok(None)` on timeout.
    pub async fn get_updated_batch_job(&self, max_wait: Duration) -> Result<Option<UpdatedJob>> {
        if let Some(job) = self.local.get_updated_local_job(Duration::ZERO).await {
            return Ok(Some(job));
        }

        let mut updated = self.updated.lock().await;
        match tokio::time::timeout(max_wait, updated.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BatchError::WorkerStopped),
            Ok(Some(job)) => {
                tracing::debug!(job_id = %job.job_id, exit_code = job.exit_code, "Updated job");
                self.current_jobs.lock().await.remove(&job.job_id);
                Ok(Some(job))
            }
        }
    }

    /// Scheduler handles of the jobs currently submitted, for diagnostics.
    pub async fn batch_handles(&self) -> Vec<(JobId, ExternalHandle)> {
        self.running.lock().await.snapshot()
    }

    /// Set an environment variable for every job submitted from now on. With no
    /// value, the variable is copied from this process's environment.
    ///
    /// Values containing a comma are rejected: the scheduler's command line cannot
    /// carry them.
    pub async fn set_env(&self, name: &str, value: Option<&str>) -> Result<()> {
        let value = match value {
            Some(value) => value.to_string(),
            None => std::env::var(name).map_err(|_| {
                BatchError::InvalidRequest(format!("{name} is not set in the environment"))
            })?,
        };
        if value.contains(',') {
            return Err(BatchError::InvalidEnvValue {
                name: name.to_string(),
            });
        }
        self.environment
            .write()
            .await
            .insert(name.to_string(), value);
        Ok(())
    }

    pub async fn environment(&self) -> HashMap<String, String> {
        self.environment.read().await.clone()
    }

    /// Stop local jobs, send the worker its sentinel and wait for it to exit.
    ///
    /// The worker finishes the iteration it is in first, which includes any kill
    /// confirmation loop. Returns the worker's fatal error, if it had one. Calls
    /// made after this return [`BatchError::WorkerStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        self.local.shutdown_local().await;
        let _ = self.new_jobs.send(NewJob::Shutdown);

        let Some(handle) = self.worker.lock().await.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Batch system worker panicked");
                Err(BatchError::WorkerStopped)
            }
        }
    }
}
