//! Execution side of the batch system.
//!
//! - **Lifecycle worker**: the background task that owns cluster job state
//! - **Local execution**: jobs run on this host instead of the cluster
//!
//! # Components
//!
//! - [`Worker`]: admits, submits, polls and kills cluster jobs
//! - [`LocalSupport`]: contract for local execution, with [`LocalJobRunner`] and
//!   [`NoLocalJobs`] as implementations
//!
//! # Worker Flow
//!
//! 1. [`BatchSystem`](crate::scheduler::BatchSystem) pushes jobs on the new-job queue
//! 2. The worker moves them to its waiting list and submits them in FIFO order
//!    while below the admission ceiling
//! 3. Running jobs are polled for exit codes and reported on the updated-job queue
//! 4. Kill requests are confirmed on the killed-job queue
//!
//! Kill confirmation blocks the worker until the scheduler reports every killed
//! job finished; admissions and polling pause meanwhile.

pub mod executor;
pub mod lifecycle;

pub use executor::{LocalJobRunner, LocalSupport, NoLocalJobs};
pub use lifecycle::{NewJob, Worker, WorkerChannels, WorkerSettings};
