//! Thread-safe running counters over completed jobs.

use crate::job::JobResult;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct Counters {
    total_jobs: u64,
    successful_jobs: u64,
    failed_jobs: u64,
    total_retries: u64,
    total_duration: Duration,
}

/// Read-only copy of the pool counters.
///
/// `total_jobs == successful_jobs + failed_jobs` once all in-flight jobs have
/// drained.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub total_retries: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
}

/// Aggregator owned by the pool; the lock never leaves this module.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<Counters>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one completed job into the counters.
    pub fn record(&self, result: &JobResult) {
        let mut counters = self.inner.lock().expect("metrics lock poisoned");
        counters.total_jobs += 1;
        if result.is_success() {
            counters.successful_jobs += 1;
        } else {
            counters.failed_jobs += 1;
        }
        counters.total_retries += u64::from(result.retries);
        counters.total_duration += result.duration;
    }

    /// Copies the counters out; callers never observe the lock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.inner.lock().expect("metrics lock poisoned").clone();
        let average_duration = if counters.total_jobs > 0 {
            counters.total_duration / counters.total_jobs as u32
        } else {
            Duration::ZERO
        };
        MetricsSnapshot {
            total_jobs: counters.total_jobs,
            successful_jobs: counters.successful_jobs,
            failed_jobs: counters.failed_jobs,
            total_retries: counters.total_retries,
            total_duration: counters.total_duration,
            average_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use crate::error::ExecutionError;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn success(duration_ms: u64, retries: u32) -> JobResult {
        JobResult {
            job_id: "job-ok".into(),
            outcome: Ok(PathBuf::from("/tmp/out.png")),
            duration: Duration::from_millis(duration_ms),
            retries,
        }
    }

    fn failure(duration_ms: u64, retries: u32) -> JobResult {
        JobResult {
            job_id: "job-bad".into(),
            outcome: Err(ExecutionError {
                job_id: "job-bad".into(),
                kind: ErrorKind::Network,
                attempts: retries + 1,
                message: "connection refused".into(),
            }),
            duration: Duration::from_millis(duration_ms),
            retries,
        }
    }

    #[test]
    fn test_counts_and_average() {
        let metrics = MetricsAggregator::new();
        metrics.record(&success(100, 0));
        metrics.record(&success(300, 2));
        metrics.record(&failure(200, 3));

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                total_jobs: 3,
                successful_jobs: 2,
                failed_jobs: 1,
                total_retries: 5,
                total_duration: Duration::from_millis(600),
                average_duration: Duration::from_millis(200),
            }
        );
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsAggregator::new().snapshot();
        assert_eq!(snapshot.total_jobs, 0);
        assert_eq!(snapshot.average_duration, Duration::ZERO);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let metrics = MetricsAggregator::new();
        metrics.record(&success(10, 0));
        let before = metrics.snapshot();
        metrics.record(&success(10, 0));
        // The earlier snapshot is unaffected by later records.
        assert_eq!(before.total_jobs, 1);
        assert_eq!(metrics.snapshot().total_jobs, 2);
    }

    #[test]
    fn test_totals_balance_under_concurrency() {
        use std::sync::Arc;
        let metrics = Arc::new(MetricsAggregator::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    if (worker + i) % 2 == 0 {
                        metrics.record(&success(1, 0));
                    } else {
                        metrics.record(&failure(1, 1));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_jobs, 400);
        assert_eq!(
            snapshot.total_jobs,
            snapshot.successful_jobs + snapshot.failed_jobs
        );
    }
}
