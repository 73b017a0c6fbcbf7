//! Render pool: bounded dispatcher, worker tasks, and result correlation.
//!
//! ## Architecture
//!
//! - **Queue**: bounded `mpsc` channel (capacity 2x pool size) feeding a
//!   fixed set of worker tasks
//! - **Executor**: per-job retry loop with capped exponential backoff and a
//!   wall-clock execution budget
//! - **Correlation**: a pending-waiter map of `job_id` to a single-use
//!   completion channel, removed on delivery or timeout cleanup
//! - **Lifecycle**: one `CancellationToken` signals every worker; `stop()`
//!   waits for natural completion of in-flight attempts
//!
//! Attempt failures are classified and the verdict logged, but the base loop
//! always runs the full attempt budget; the upload orchestrator is the layer
//! that stops early on permanent errors.

use crate::classify;
use crate::error::{ExecutionError, PoolError};
use crate::job::{JobResult, RenderJob};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::render::Render;
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker count used when the configured pool size is zero.
const DEFAULT_POOL_SIZE: usize = 5;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks; zero selects the default of 5.
    pub pool_size: usize,
    pub retry_policy: RetryPolicy,
    /// Wall-clock budget for one job including its backoff sleeps.
    pub job_timeout: Duration,
    /// How long `submit` waits for queue space.
    pub submit_timeout: Duration,
    /// How long `submit` waits for the correlated result.
    pub result_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            retry_policy: RetryPolicy::default(),
            job_timeout: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(30),
            result_timeout: Duration::from_secs(120),
        }
    }
}

struct ExecCtx {
    config: PoolConfig,
    renderer: Arc<dyn Render>,
    retry_table: classify::RetryTable,
    shutdown: CancellationToken,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JobResult>>>>;

/// Fixed-size pool of render workers over one bounded job queue.
pub struct RenderPool {
    ctx: Arc<ExecCtx>,
    metrics: Arc<MetricsAggregator>,
    pending: PendingMap,
    job_tx: Mutex<Option<mpsc::Sender<RenderJob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn Render>, config: PoolConfig) -> Self {
        Self::with_retry_table(renderer, config, classify::RetryTable::default())
    }

    pub fn with_retry_table(
        renderer: Arc<dyn Render>,
        config: PoolConfig,
        retry_table: classify::RetryTable,
    ) -> Self {
        Self {
            ctx: Arc::new(ExecCtx {
                config,
                renderer,
                retry_table,
                shutdown: CancellationToken::new(),
            }),
            metrics: Arc::new(MetricsAggregator::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            job_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker tasks and the result router. Idempotent.
    pub fn start(&self) {
        let mut job_tx = self.job_tx.lock().unwrap();
        if job_tx.is_some() || self.ctx.shutdown.is_cancelled() {
            return;
        }

        let size = if self.ctx.config.pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.ctx.config.pool_size
        };
        let (tx, rx) = mpsc::channel::<RenderJob>(size * 2);
        let (result_tx, result_rx) = mpsc::channel::<JobResult>(size * 2);
        *job_tx = Some(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = self.tasks.lock().unwrap();
        for worker_id in 0..size {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                result_tx.clone(),
                self.ctx.clone(),
            )));
        }
        // The workers hold the only result senders; the router exits once the
        // last worker is gone and the channel has drained.
        drop(result_tx);
        tasks.push(tokio::spawn(route_results(
            result_rx,
            self.pending.clone(),
            self.metrics.clone(),
        )));

        info!("Render pool started: workers={}, queue_capacity={}", size, size * 2);
    }

    /// Enqueues a job and waits for its correlated result.
    ///
    /// Fails fast with [`PoolError::PoolStopped`] once the pool is stopped.
    /// The enqueue wait is bounded by `submit_timeout`, the result wait by
    /// `result_timeout`; a result-timeout does not cancel the job, it only
    /// gives up on delivery.
    pub async fn submit(&self, job: RenderJob) -> Result<JobResult, PoolError> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(PoolError::PoolStopped);
        }
        let job_tx = self
            .job_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(PoolError::PoolStopped)?;

        let job_id = job.job_id.clone();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(job_id.clone(), result_tx);

        match timeout(self.ctx.config.submit_timeout, job_tx.send(job)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.remove_pending(&job_id);
                return Err(PoolError::PoolStopped);
            }
            Err(_) => {
                self.remove_pending(&job_id);
                return Err(PoolError::SubmissionTimeout {
                    job_id,
                    waited: self.ctx.config.submit_timeout,
                });
            }
        }

        match timeout(self.ctx.config.result_timeout, result_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(PoolError::PoolStopped),
            Err(_) => {
                self.remove_pending(&job_id);
                Err(PoolError::ResultTimeout {
                    job_id,
                    waited: self.ctx.config.result_timeout,
                })
            }
        }
    }

    /// Signals cancellation, rejects new submissions, and waits for every
    /// worker to finish its current attempt and exit.
    pub async fn stop(&self) {
        info!("Stopping render pool");
        // Closing the queue lets idle workers see end-of-stream; cancellation
        // interrupts backoff sleeps and idle receives.
        self.job_tx.lock().unwrap().take();
        self.ctx.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Pool task terminated abnormally: {}", err);
            }
        }

        // Jobs still sitting in the closed queue never ran; dropping their
        // completion channels fails the waiters with PoolStopped.
        let stranded: Vec<String> = self.pending.lock().unwrap().drain().map(|(id, _)| id).collect();
        if !stranded.is_empty() {
            warn!(
                "Jobs stranded in queue at shutdown: count={}",
                stranded.len()
            );
        }
        info!("Render pool stopped");
    }

    /// Copy of the pool counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Jobs currently queued (not yet picked up by a worker).
    pub fn queue_depth(&self) -> usize {
        self.job_tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    fn remove_pending(&self, job_id: &str) {
        self.pending.lock().unwrap().remove(job_id);
    }
}

/// Pulls jobs off the shared queue until shutdown or queue close.
async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RenderJob>>>,
    result_tx: mpsc::Sender<JobResult>,
    ctx: Arc<ExecCtx>,
) {
    debug!("Worker {} started", worker_id);
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let result = execute_job(job, &ctx).await;
        if result_tx.send(result).await.is_err() {
            break;
        }
    }
    debug!("Worker {} exited", worker_id);
}

/// Runs one job to completion: attempt 0 immediately, attempts `1..=R` after
/// a backoff delay, all under the job's wall-clock budget.
async fn execute_job(mut job: RenderJob, ctx: &ExecCtx) -> JobResult {
    let started = Instant::now();
    let deadline = started + ctx.config.job_timeout;
    let job_id = job.job_id.clone();
    let mut last_error: Option<anyhow::Error> = None;
    let mut attempts = 0u32;

    for attempt in 0..=job.max_retries {
        if attempt > 0 {
            let delay = ctx.config.retry_policy.backoff(attempt);
            // The sleep observes pool shutdown and the job deadline; an
            // expired deadline falls through and fails the attempt instead.
            match timeout_at(deadline, async {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                }
            })
            .await
            {
                Ok(true) => {
                    let error = last_error.expect("shutdown before any attempt ran");
                    return aborted_result(&job_id, error, attempts, started);
                }
                Ok(false) | Err(_) => {}
            }
            job.retry_count = attempt;
        }
        attempts = attempt + 1;

        let error = match timeout_at(
            deadline,
            ctx.renderer.render(job.kind, &job.input, &job.output_name),
        )
        .await
        {
            Ok(Ok(path)) => {
                let duration = started.elapsed();
                info!(
                    job_id = %job_id,
                    attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                return JobResult {
                    job_id,
                    outcome: Ok(path),
                    duration,
                    retries: attempt,
                };
            }
            Ok(Err(err)) => err,
            Err(_) => anyhow::anyhow!(
                "render timeout: execution budget {:?} exceeded",
                ctx.config.job_timeout
            ),
        };

        let message = format!("{:#}", error);
        let kind = classify::classify(&message);
        warn!(
            job_id = %job_id,
            attempt,
            kind = %kind,
            retryable = ctx.retry_table.is_retryable(kind),
            error = %message,
            "Render attempt failed"
        );
        last_error = Some(error);
    }

    let error = last_error.expect("attempt loop ran at least once");
    let message = format!("{:#}", error);
    let kind = classify::classify(&message);
    JobResult {
        job_id: job_id.clone(),
        outcome: Err(ExecutionError {
            job_id,
            kind,
            attempts,
            message,
        }),
        duration: started.elapsed(),
        retries: attempts.saturating_sub(1),
    }
}

/// Failure result for a job whose retry loop was cut short by shutdown.
fn aborted_result(
    job_id: &str,
    error: anyhow::Error,
    attempts: u32,
    started: Instant,
) -> JobResult {
    let message = format!("{:#} (retries aborted by pool shutdown)", error);
    let kind = classify::classify(&message);
    JobResult {
        job_id: job_id.to_string(),
        outcome: Err(ExecutionError {
            job_id: job_id.to_string(),
            kind,
            attempts,
            message,
        }),
        duration: started.elapsed(),
        retries: attempts.saturating_sub(1),
    }
}

/// Single consumer of the result stream: records metrics for every
/// completion, then hands the result to the matching waiter if one is still
/// registered.
async fn route_results(
    mut result_rx: mpsc::Receiver<JobResult>,
    pending: PendingMap,
    metrics: Arc<MetricsAggregator>,
) {
    while let Some(result) = result_rx.recv().await {
        metrics.record(&result);
        let job_id = result.job_id.clone();
        let waiter = pending.lock().unwrap().remove(&job_id);
        match waiter {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!(job_id = %job_id, "Waiter gone before result delivery");
                }
            }
            None => {
                debug!(job_id = %job_id, "Result arrived after its waiter gave up");
            }
        }
    }
    debug!("Result router exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Renderer that fails a fixed number of leading calls, with an optional
    /// per-call delay.
    struct ScriptedRenderer {
        calls: AtomicU32,
        fail_first: u32,
        delay: Duration,
        error_text: &'static str,
    }

    impl ScriptedRenderer {
        fn ok() -> Self {
            Self::failing(0, "unused")
        }

        fn failing(fail_first: u32, error_text: &'static str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                delay: Duration::ZERO,
                error_text,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                delay,
                error_text: "unused",
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Render for ScriptedRenderer {
        async fn render(&self, _: JobKind, _: &str, output_name: &str) -> Result<PathBuf> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call < self.fail_first {
                anyhow::bail!("{}", self.error_text);
            }
            Ok(PathBuf::from("/tmp/artifacts").join(output_name))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    fn config(pool_size: usize, max_retries: u32) -> PoolConfig {
        PoolConfig {
            pool_size,
            retry_policy: fast_policy(max_retries),
            ..PoolConfig::default()
        }
    }

    fn job(policy: &RetryPolicy, output_name: &str) -> RenderJob {
        RenderJob::new(
            JobKind::Markup,
            "<svg/>".into(),
            output_name.into(),
            policy.max_retries,
        )
    }

    #[tokio::test]
    async fn test_submit_success() {
        let renderer = Arc::new(ScriptedRenderer::ok());
        let pool = RenderPool::new(renderer.clone(), config(2, 3));
        pool.start();

        let submitted = job(&fast_policy(3), "out.png");
        let job_id = submitted.job_id.clone();
        let result = pool.submit(submitted).await.unwrap();

        assert_eq!(result.job_id, job_id);
        assert!(result.is_success());
        assert_eq!(result.retries, 0);
        assert_eq!(renderer.calls(), 1);

        pool.stop().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.total_jobs, 1);
        assert_eq!(metrics.successful_jobs, 1);
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let renderer = Arc::new(ScriptedRenderer::failing(2, "network unreachable"));
        let pool = RenderPool::new(renderer.clone(), config(2, 3));
        pool.start();

        let result = pool.submit(job(&fast_policy(3), "out.png")).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.retries, 2);
        assert_eq!(renderer.calls(), 3);
        // Two backoff sleeps: 10ms + 20ms.
        assert!(result.duration >= Duration::from_millis(30));

        pool.stop().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.successful_jobs, 1);
        assert_eq!(metrics.total_retries, 2);
    }

    #[tokio::test]
    async fn test_exhausts_all_attempts() {
        let renderer = Arc::new(ScriptedRenderer::failing(u32::MAX, "invalid input payload"));
        let pool = RenderPool::new(renderer.clone(), config(2, 3));
        pool.start();

        let policy = fast_policy(3);
        let result = pool.submit(job(&policy, "out.png")).await.unwrap();

        let error = result.error().expect("job must fail");
        assert_eq!(error.attempts, 4);
        assert_eq!(error.kind, crate::classify::ErrorKind::Validation);
        assert!(error.message.contains("invalid input payload"));
        // Every attempt ran even though the failure is non-retryable.
        assert_eq!(renderer.calls(), 4);
        assert!(result.duration >= policy.total_backoff());

        pool.stop().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.failed_jobs, 1);
        assert_eq!(metrics.total_retries, 3);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails_fast() {
        let pool = RenderPool::new(Arc::new(ScriptedRenderer::ok()), config(2, 0));
        pool.start();
        pool.stop().await;

        let result = pool.submit(job(&fast_policy(0), "out.png")).await;
        assert!(matches!(result, Err(PoolError::PoolStopped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_jobs_correlate() {
        let renderer = Arc::new(ScriptedRenderer::ok());
        let pool = Arc::new(RenderPool::new(renderer, config(3, 0)));
        pool.start();

        let mut handles = Vec::new();
        for i in 0..20 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let submitted = job(&fast_policy(0), &format!("out-{i}.png"));
                let job_id = submitted.job_id.clone();
                let result = pool.submit(submitted).await.unwrap();
                (job_id, i, result)
            }));
        }

        for handle in handles {
            let (job_id, i, result) = handle.await.unwrap();
            assert_eq!(result.job_id, job_id);
            let path = result.path().unwrap().to_string_lossy().into_owned();
            assert!(path.ends_with(&format!("out-{i}.png")));
        }

        pool.stop().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.total_jobs, 20);
        assert_eq!(
            metrics.total_jobs,
            metrics.successful_jobs + metrics.failed_jobs
        );
    }

    #[tokio::test]
    async fn test_result_timeout_counts_orphaned_result() {
        let mut cfg = config(1, 0);
        cfg.result_timeout = Duration::from_millis(20);
        let pool = RenderPool::new(
            Arc::new(ScriptedRenderer::slow(Duration::from_millis(150))),
            cfg,
        );
        pool.start();

        let result = pool.submit(job(&fast_policy(0), "slow.png")).await;
        assert!(matches!(result, Err(PoolError::ResultTimeout { .. })));

        // The job still completes in the background and reaches the metrics.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.metrics().total_jobs, 1);
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submission_timeout_when_queue_full() {
        let mut cfg = config(1, 0);
        cfg.submit_timeout = Duration::from_millis(30);
        let pool = Arc::new(RenderPool::new(
            Arc::new(ScriptedRenderer::slow(Duration::from_millis(500))),
            cfg,
        ));
        pool.start();

        // One job in flight plus two filling the capacity-2 queue.
        let mut fillers = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            fillers.push(tokio::spawn(async move {
                let _ = pool.submit(job(&fast_policy(0), &format!("fill-{i}.png"))).await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = pool.submit(job(&fast_policy(0), "late.png")).await;
        assert!(matches!(result, Err(PoolError::SubmissionTimeout { .. })));

        pool.stop().await;
        for filler in fillers {
            let _ = filler.await;
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_job() {
        let pool = Arc::new(RenderPool::new(
            Arc::new(ScriptedRenderer::slow(Duration::from_millis(100))),
            config(1, 0),
        ));
        pool.start();

        let submit = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(job(&fast_policy(0), "inflight.png")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop().await;

        // The in-flight job ran to natural completion and was delivered.
        let result = submit.await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(pool.metrics().successful_jobs, 1);
    }

    #[tokio::test]
    async fn test_zero_pool_size_uses_default() {
        let pool = RenderPool::new(Arc::new(ScriptedRenderer::ok()), config(0, 0));
        pool.start();

        let result = pool.submit(job(&fast_policy(0), "out.png")).await.unwrap();
        assert!(result.is_success());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_job_timeout_counts_as_failed_attempts() {
        let mut cfg = config(1, 2);
        cfg.job_timeout = Duration::from_millis(50);
        let renderer = Arc::new(ScriptedRenderer::slow(Duration::from_millis(200)));
        let pool = RenderPool::new(renderer, cfg);
        pool.start();

        let result = pool.submit(job(&fast_policy(2), "stuck.png")).await.unwrap();
        let error = result.error().expect("budget exhaustion must fail the job");
        assert_eq!(error.kind, crate::classify::ErrorKind::Timeout);
        // The loop still ran its full attempt budget, failing fast once the
        // deadline had passed.
        assert_eq!(error.attempts, 3);

        pool.stop().await;
    }
}
