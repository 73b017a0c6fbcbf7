//! Typed errors surfaced by the render pool.

use crate::classify::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`crate::pool::RenderPool::submit`].
///
/// Timeouts are surfaced immediately without retry; the caller decides
/// whether to resubmit.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue did not accept the job within the submission window.
    #[error("job {job_id} was not accepted within {waited:?}")]
    SubmissionTimeout { job_id: String, waited: Duration },

    /// No result arrived within the result window. The job may still finish
    /// in the background; its result will be counted but not delivered.
    #[error("no result for job {job_id} within {waited:?}")]
    ResultTimeout { job_id: String, waited: Duration },

    /// The pool has been stopped and accepts no further work.
    #[error("render pool is stopped")]
    PoolStopped,
}

/// A job that exhausted its attempts.
///
/// `attempts` is the number actually performed: `max_retries + 1` when the
/// full retry budget was spent, fewer when pool shutdown cut the loop short.
#[derive(Debug, Error)]
#[error("job {job_id} failed after {attempts} attempt(s) [{kind}]: {message}")]
pub struct ExecutionError {
    pub job_id: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_carries_context() {
        let err = ExecutionError {
            job_id: "job-1".into(),
            kind: ErrorKind::Network,
            attempts: 4,
            message: "connection refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("job-1"));
        assert!(text.contains("4 attempt(s)"));
        assert!(text.contains("network"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::SubmissionTimeout {
            job_id: "job-2".into(),
            waited: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("job-2"));
        assert!(matches!(PoolError::PoolStopped, PoolError::PoolStopped));
    }
}
