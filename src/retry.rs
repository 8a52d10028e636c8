use std::future::Future;

use crate::error::{BatchError, Result};

/// Total attempts, counting the first one.
pub const MAX_ATTEMPTS: usize = 3;

/// Run a scheduler operation, retrying immediately on [`BatchError::CommandFailed`].
///
/// After [`MAX_ATTEMPTS`] failures the last error is returned unchanged. Any other
/// error is returned on first occurrence. Side effects of a failed attempt are
/// not undone.
pub async fn with_retries<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                if let BatchError::CommandFailed { code, output, .. } = &err {
                    tracing::error!(
                        operation,
                        attempt,
                        code = ?code,
                        output = %output.trim(),
                        "Operation failed"
                    );
                }
                if attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
