use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;

use crate::driver::SchedulerDriver;
use crate::error::Result;
use crate::retry::with_retries;
use crate::scheduler::cache::PollCache;
use crate::scheduler::queue::{RunningJobs, WaitingQueue};
use crate::scheduler::{JobId, UpdatedJob, WaitingJob};

/// Message on the new-job queue.
#[derive(Debug, Clone, PartialEq)]
pub enum NewJob {
    Job(WaitingJob),
    /// The only thing that stops the worker.
    Shutdown,
}

/// Worker ends of the four queues shared with the batch system.
#[derive(Debug)]
pub struct WorkerChannels {
    pub new_jobs: UnboundedReceiver<NewJob>,
    pub updated: UnboundedSender<UpdatedJob>,
    pub kills: UnboundedReceiver<JobId>,
    pub killed: UnboundedSender<JobId>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Admission ceiling.
    pub max_running: usize,
    pub state_polling_wait: Duration,
    pub kill_poll_interval: Duration,
    pub tick: Duration,
}

/// Owns the waiting list and drives every cluster job from submission to a
/// reported outcome.
///
/// The running set is shared with the batch system so it can map scheduler
/// listings back to job IDs; only the worker mutates it.
pub struct Worker {
    driver: Arc<dyn SchedulerDriver>,
    channels: WorkerChannels,
    waiting: WaitingQueue,
    running: Arc<Mutex<RunningJobs>>,
    environment: Arc<RwLock<HashMap<String, String>>>,
    settings: WorkerSettings,
    check_cache: PollCache<bool>,
    shutdown_requested: bool,
}

impl Worker {
    pub fn new(
        driver: Arc<dyn SchedulerDriver>,
        channels: WorkerChannels,
        running: Arc<Mutex<RunningJobs>>,
        environment: Arc<RwLock<HashMap<String, String>>>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            driver,
            channels,
            waiting: WaitingQueue::new(),
            running,
            environment,
            check_cache: PollCache::new(settings.state_polling_wait),
            settings,
            shutdown_requested: false,
        }
    }

    /// Worker loop. Returns when the shutdown sentinel arrives or the batch system
    /// is dropped; any error returned here is fatal to the worker.
    ///
    /// Each iteration:
    /// 1. Takes at most one new job onto the waiting list
    /// 2. Processes kill requests, blocking until every kill is confirmed
    /// 3. Submits waiting jobs while below the admission ceiling
    /// 4. Polls running jobs for exit codes, at most once per polling wait
    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.shutdown_requested {
                tracing::debug!("Received queue sentinel");
                break;
            }

            let mut activity = false;
            match self.channels.new_jobs.try_recv() {
                Ok(NewJob::Job(job)) => {
                    activity = true;
                    self.waiting.push(job);
                }
                Ok(NewJob::Shutdown) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!("Received queue sentinel");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            activity |= self.kill_jobs().await?;
            activity |= self.create_jobs().await?;
            activity |= self.check_on_jobs().await?;
            tracing::trace!(activity, "Worker iteration");
        }

        Ok(())
    }

    /// Kill everything on the kill queue. Jobs never submitted are reported killed
    /// at once; submitted jobs are killed through the driver and reported only once
    /// the scheduler gives an exit code for them.
    async fn kill_jobs(&mut self) -> Result<bool> {
        let mut kill_list = Vec::new();
        let mut seen = HashSet::new();
        while let Ok(id) = self.channels.kills.try_recv() {
            if seen.insert(id) {
                kill_list.push(id);
            }
        }
        if kill_list.is_empty() {
            return Ok(false);
        }

        // A kill can overtake its own job on the new-job queue.
        self.absorb_new_jobs();

        let driver = &self.driver;
        let mut pending = Vec::new();
        for id in kill_list {
            let handle = self.running.lock().await.handle(id).ok().cloned();
            match handle {
                Some(handle) => {
                    tracing::debug!(job_id = %id, handle = %handle, "Killing job");
                    let handle = &handle;
                    with_retries("kill", move || driver.kill(id, handle)).await?;
                    pending.push(id);
                }
                None => {
                    if self.waiting.remove(id) {
                        tracing::debug!(job_id = %id, "Killed job before submission");
                    }
                    self.report_killed(id);
                }
            }
        }

        while !pending.is_empty() {
            let mut unconfirmed = Vec::new();
            for id in pending {
                let handle = self.running.lock().await.handle(id)?.clone();
                let handle = &handle;
                let status =
                    with_retries("query exit code", move || driver.query_exit_code(handle))
                        .await?;
                if status.is_some() {
                    tracing::debug!(job_id = %id, "Adding job to killed jobs queue");
                    self.running.lock().await.forget(id)?;
                    self.report_killed(id);
                } else {
                    unconfirmed.push(id);
                }
            }
            pending = unconfirmed;
            if !pending.is_empty() {
                tracing::warn!(
                    pending = pending.len(),
                    retry_in = ?self.settings.kill_poll_interval,
                    "Some jobs weren't killed, trying again"
                );
                tokio::time::sleep(self.settings.kill_poll_interval).await;
            }
        }

        Ok(true)
    }

    /// Submit waiting jobs, oldest first, until the ceiling is reached.
    async fn create_jobs(&mut self) -> Result<bool> {
        let mut activity = false;
        loop {
            let running = self.running.lock().await.len();
            if running >= self.settings.max_running {
                break;
            }
            let Some(job) = self.waiting.pop() else {
                break;
            };
            activity = true;

            let line = self
                .driver
                .format_submission(job.cores, job.memory, job.id, &job.command);
            tracing::debug!(job_id = %job.id, line = ?line, "Running");

            let env = self.environment.read().await.clone();
            let driver = &self.driver;
            let (line_ref, env_ref) = (&line, &env);
            let handle = with_retries("submit", move || driver.submit(line_ref, env_ref)).await?;
            tracing::debug!(job_id = %job.id, handle = %handle, "Submitted job");

            self.running.lock().await.insert(job.id, handle);
        }
        Ok(activity)
    }

    /// Report every running job the scheduler says has finished. Within the polling
    /// wait the previous result is returned without asking the scheduler.
    async fn check_on_jobs(&mut self) -> Result<bool> {
        if let Some(activity) = self.check_cache.fresh() {
            return Ok(*activity);
        }

        let mut activity = false;
        let snapshot = self.running.lock().await.snapshot();
        let driver = &self.driver;
        for (id, handle) in snapshot {
            let handle = &handle;
            let status =
                with_retries("query exit code", move || driver.query_exit_code(handle)).await?;
            if let Some(exit_code) = status {
                activity = true;
                self.running.lock().await.forget(id)?;
                tracing::debug!(job_id = %id, exit_code, "Job finished");
                if self
                    .channels
                    .updated
                    .send(UpdatedJob::new(id, exit_code))
                    .is_err()
                {
                    tracing::warn!(job_id = %id, "Updated jobs queue closed, dropping result");
                }
            }
        }

        self.check_cache.store(activity);
        Ok(activity)
    }

    /// Move every queued new job onto the waiting list, remembering a sentinel for
    /// the top of the next iteration.
    fn absorb_new_jobs(&mut self) {
        while let Ok(msg) = self.channels.new_jobs.try_recv() {
            match msg {
                NewJob::Job(job) => self.waiting.push(job),
                NewJob::Shutdown => {
                    self.shutdown_requested = true;
                    break;
                }
            }
        }
    }

    fn report_killed(&self, id: JobId) {
        if self.channels.killed.send(id).is_err() {
            tracing::warn!(job_id = %id, "Killed jobs queue closed, dropping confirmation");
        }
    }
}
