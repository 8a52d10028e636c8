use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Internally assigned job identifier, distinct from the scheduler's own ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out job IDs. Clones share the same counter so the cluster path and the
/// local runner never collide.
#[derive(Debug, Clone, Default)]
pub struct JobIdAllocator {
    next: Arc<AtomicU64>,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the caller asks to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub command: String,
    pub cores: f64,
    /// Bytes
    pub memory: u64,
    /// Bytes
    pub disk: u64,
    /// Run on this host through the local collaborator instead of the cluster.
    pub local: bool,
}

impl JobRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cores: 1.0,
            memory: 1 << 30,
            disk: 1 << 30,
            local: false,
        }
    }

    pub fn with_cores(mut self, cores: f64) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_disk(mut self, disk: u64) -> Self {
        self.disk = disk;
        self
    }

    pub fn locally(mut self) -> Self {
        self.local = true;
        self
    }
}

/// A cluster job admitted to the facade but not yet submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingJob {
    pub id: JobId,
    pub cores: f64,
    pub memory: u64,
    pub command: String,
}

impl WaitingJob {
    pub fn new(id: JobId, request: &JobRequest) -> Self {
        Self {
            id,
            cores: request.cores,
            memory: request.memory,
            command: request.command.clone(),
        }
    }
}

/// A finished job as reported to the caller. Cluster jobs never carry a wall time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedJob {
    pub job_id: JobId,
    pub exit_code: i32,
    pub wall_time: Option<Duration>,
}

impl UpdatedJob {
    pub fn new(job_id: JobId, exit_code: i32) -> Self {
        Self {
            job_id,
            exit_code,
            wall_time: None,
        }
    }
}
