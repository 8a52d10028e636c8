use crate::config::ResourceLimits;
use crate::error::{BatchError, Result};
use crate::scheduler::job::JobRequest;

/// Reject a request the cluster could never satisfy, before it reaches any queue.
pub fn check_resource_request(limits: &ResourceLimits, request: &JobRequest) -> Result<()> {
    if !request.cores.is_finite() || request.cores <= 0.0 {
        return Err(BatchError::InvalidRequest(format!(
            "cores must be positive, got {}",
            request.cores
        )));
    }
    if request.memory == 0 {
        return Err(BatchError::InvalidRequest(
            "memory must be positive".to_string(),
        ));
    }
    if request.cores > limits.max_cores {
        return Err(BatchError::ResourceExceeded {
            resource: "cores",
            requested: request.cores.to_string(),
            max: limits.max_cores.to_string(),
        });
    }
    if request.memory > limits.max_memory {
        return Err(BatchError::ResourceExceeded {
            resource: "memory",
            requested: request.memory.to_string(),
            max: limits.max_memory.to_string(),
        });
    }
    if request.disk > limits.max_disk {
        return Err(BatchError::ResourceExceeded {
            resource: "disk",
            requested: request.disk.to_string(),
            max: limits.max_disk.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_cores: 4.0,
            max_memory: 8 << 30,
            max_disk: 100 << 30,
        }
    }

    #[test]
    fn accepts_request_within_limits() {
        let req = JobRequest::new("true").with_cores(4.0).with_memory(8 << 30);
        assert!(check_resource_request(&limits(), &req).is_ok());
    }

    #[test]
    fn rejects_each_exceeded_resource() {
        let cases = [
            (JobRequest::new("true").with_cores(4.5), "cores"),
            (JobRequest::new("true").with_memory((8 << 30) + 1), "memory"),
            (JobRequest::new("true").with_disk(101 << 30), "disk"),
        ];
        for (req, expected) in cases {
            match check_resource_request(&limits(), &req) {
                Err(BatchError::ResourceExceeded { resource, .. }) => {
                    assert_eq!(resource, expected)
                }
                other => panic!("expected {expected} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_non_positive_quantities() {
        for cores in [0.0, -1.0, f64::NAN] {
            let req = JobRequest::new("true").with_cores(cores);
            assert!(matches!(
                check_resource_request(&limits(), &req),
                Err(BatchError::InvalidRequest(_))
            ));
        }
        let req = JobRequest::new("true").with_memory(0);
        assert!(matches!(
            check_resource_request(&limits(), &req),
            Err(BatchError::InvalidRequest(_))
        ));
    }
}
