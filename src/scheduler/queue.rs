use std::collections::{HashMap, VecDeque};

use crate::driver::ExternalHandle;
use crate::error::{BatchError, Result};
use crate::scheduler::job::{JobId, WaitingJob};

/// Cluster jobs accepted by the worker but not yet submitted, oldest first.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    jobs: VecDeque<WaitingJob>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: WaitingJob) {
        self.jobs.push_back(job);
    }

    /// Take the oldest waiting job.
    pub fn pop(&mut self) -> Option<WaitingJob> {
        self.jobs.pop_front()
    }

    /// Remove a job that was killed before submission. Returns false if absent.
    pub fn remove(&mut self, id: JobId) -> bool {
        match self.jobs.iter().position(|j| j.id == id) {
            Some(pos) => {
                self.jobs.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.iter().any(|j| j.id == id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Jobs submitted to the scheduler, with their external handles.
///
/// A job is running exactly when it has a handle here, so the mapping is total
/// over the running set by construction.
#[derive(Debug, Default)]
pub struct RunningJobs {
    handles: HashMap<JobId, ExternalHandle>,
    by_handle: HashMap<ExternalHandle, JobId>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: JobId, handle: ExternalHandle) {
        if let Some(old) = self.handles.insert(id, handle.clone()) {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, id);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Handle of a running job. A job that is not running here is a bookkeeping bug.
    pub fn handle(&self, id: JobId) -> Result<&ExternalHandle> {
        self.handles.get(&id).ok_or(BatchError::UnknownJob(id))
    }

    pub fn job_for_handle(&self, handle: &ExternalHandle) -> Option<JobId> {
        self.by_handle.get(handle).copied()
    }

    /// Drop a finished or killed job.
    pub fn forget(&mut self, id: JobId) -> Result<ExternalHandle> {
        let handle = self.handles.remove(&id).ok_or(BatchError::UnknownJob(id))?;
        self.by_handle.remove(&handle);
        Ok(handle)
    }

    /// Snapshot of running jobs and their handles, sorted by job ID.
    pub fn snapshot(&self) -> Vec<(JobId, ExternalHandle)> {
        let mut jobs: Vec<_> = self
            .handles
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        jobs.sort_by_key(|(id, _)| *id);
        jobs
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
