use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum BatchError {
    /// An external scheduler command exited unsuccessfully. The only retryable error.
    #[error("Command `{command}` failed with code {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Unknown job ID {0}, could not be converted to a batch system ID")]
    UnknownJob(JobId),

    #[error("Environment variable {name} has a value containing a comma, which the batch system cannot pass through")]
    InvalidEnvValue { name: String },

    #[error("Requested {resource} of {requested} exceeds the maximum of {max}")]
    ResourceExceeded {
        resource: &'static str,
        requested: String,
        max: String,
    },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Batch system worker has stopped")]
    WorkerStopped,

    #[error("Failed to parse scheduler output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::CommandFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_command_failures_are_retryable() {
        let failed = BatchError::CommandFailed {
            command: "bsub".to_string(),
            code: Some(255),
            output: "LSF is down".to_string(),
        };
        assert!(failed.is_retryable());
        assert!(!BatchError::UnknownJob(JobId::from(3)).is_retryable());
        assert!(!BatchError::WorkerStopped.is_retryable());
        assert!(!BatchError::InvalidEnvValue {
            name: "FOO".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn command_failure_message_includes_output() {
        let failed = BatchError::CommandFailed {
            command: "bjobs -l 12".to_string(),
            code: Some(1),
            output: "Job <12> is not found".to_string(),
        };
        let msg = failed.to_string();
        assert!(msg.contains("bjobs -l 12"));
        assert!(msg.contains("Job <12> is not found"));
    }
}
