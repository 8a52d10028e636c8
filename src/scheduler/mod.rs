pub mod batch;
pub mod cache;
pub mod job;
pub mod queue;
pub mod resources;

pub use batch::BatchSystem;
pub use job::{JobId, JobIdAllocator, JobRequest, UpdatedJob, WaitingJob};
pub use queue::{RunningJobs, WaitingQueue};
