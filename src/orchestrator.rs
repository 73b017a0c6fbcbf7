//! Upload orchestration: the persistence-aware envelope around render and
//! upload.
//!
//! The pool's executor retries blindly; this layer is the policy-aware one.
//! It records every run, consults the retry table before spending upload
//! attempts, and enforces the persisted attempt ceiling for batch retries.

use crate::classify::{self, RetryTable};
use crate::job::{JobKind, RenderJob};
use crate::pool::RenderPool;
use crate::retry::RetryPolicy;
use crate::store::{ErrorRecord, HistoryEntry, RecordStatus, RecordStore, UploadRecord};
use crate::upload::{RemoteLocators, Upload};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Remove the local artifact once its upload is confirmed.
    pub delete_local_after_upload: bool,
    /// Artifacts older than this are removed by [`UploadOrchestrator::sweep_cache`].
    pub cache_max_age: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            delete_local_after_upload: false,
            cache_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Structured result of one orchestrated run; this layer never propagates an
/// error to its caller.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record_id: String,
    pub status: RecordStatus,
    pub remote: Option<RemoteLocators>,
    pub error: Option<String>,
    /// Whether a later batch retry may pick this record up again.
    pub can_retry: bool,
}

/// Counts reported by [`UploadOrchestrator::retry_failed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records that hit the retry ceiling and were marked permanent.
    pub skipped: usize,
}

pub struct UploadOrchestrator {
    pool: Arc<RenderPool>,
    uploader: Arc<dyn Upload>,
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    retry_table: RetryTable,
    config: OrchestratorConfig,
}

impl UploadOrchestrator {
    pub fn new(
        pool: Arc<RenderPool>,
        uploader: Arc<dyn Upload>,
        store: Arc<dyn RecordStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            uploader,
            store,
            policy,
            retry_table: RetryTable::default(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_table(mut self, retry_table: RetryTable) -> Self {
        self.retry_table = retry_table;
        self
    }

    /// Runs one input end-to-end: persist a `Pending` record, render through
    /// the pool, upload with a classification-aware retry loop, persist the
    /// outcome.
    pub async fn process(&self, kind: JobKind, input: String, output_name: String) -> UploadOutcome {
        let record = UploadRecord::new(kind, input, output_name);
        if let Err(err) = self.store.create(&record).await {
            warn!(
                record_id = %record.record_id,
                "Failed to persist upload record: {:#}", err
            );
        }
        self.run(record, 1).await
    }

    /// Re-runs up to `limit` retry-eligible failures. Records whose persisted
    /// attempt count has reached the ceiling are marked permanently
    /// non-retryable without touching render or upload.
    pub async fn retry_failed(&self, limit: usize) -> RetryReport {
        let errors = match self.store.get_retryable(limit).await {
            Ok(errors) => errors,
            Err(err) => {
                warn!("Failed to load retryable errors: {:#}", err);
                return RetryReport::default();
            }
        };

        let mut report = RetryReport::default();
        for error in errors {
            report.attempted += 1;

            if error.attempt_count >= self.policy.max_retries {
                if let Err(err) = self.store.mark_non_retryable(&error.record_id).await {
                    warn!(
                        record_id = %error.record_id,
                        "Failed to mark record non-retryable: {:#}", err
                    );
                }
                info!(
                    record_id = %error.record_id,
                    attempts = error.attempt_count,
                    "Retry ceiling reached; marked permanently non-retryable"
                );
                report.skipped += 1;
                continue;
            }

            let record = match self.store.get_by_id(&error.record_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(record_id = %error.record_id, "Error record has no upload record");
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(record_id = %error.record_id, "Failed to load record: {:#}", err);
                    report.failed += 1;
                    continue;
                }
            };

            let outcome = self.run(record, error.attempt_count + 1).await;
            if outcome.status == RecordStatus::Uploaded {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Batch retry finished"
        );
        report
    }

    /// Removes the remote artifact for an uploaded record and clears its
    /// locators.
    pub async fn delete_remote(&self, record_id: &str) -> Result<()> {
        let mut record = self
            .store
            .get_by_id(record_id)
            .await?
            .with_context(|| format!("no upload record {record_id}"))?;
        let remote = record
            .remote
            .take()
            .with_context(|| format!("record {record_id} has no remote artifact"))?;

        self.uploader.delete(&remote.remote_id).await?;
        record.status = RecordStatus::Pending;
        record.updated_at = Utc::now();
        if let Err(err) = self.store.update(&record).await {
            warn!(record_id = %record_id, "Failed to persist record after delete: {:#}", err);
        }
        info!(record_id = %record_id, remote_id = %remote.remote_id, "Remote artifact deleted");
        Ok(())
    }

    /// Deletes cached artifacts older than the configured max age; returns
    /// how many were removed.
    pub async fn sweep_cache(&self, dir: &Path) -> Result<usize> {
        let Some(cutoff) = SystemTime::now().checked_sub(self.config.cache_max_age) else {
            return Ok(0);
        };

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read cache directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            if modified < cutoff {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cache sweep removed {} artifact(s) from {}", removed, dir.display());
        }
        Ok(removed)
    }

    async fn run(&self, mut record: UploadRecord, attempt_count: u32) -> UploadOutcome {
        let job = RenderJob::new(
            record.kind,
            record.input.clone(),
            record.output_name.clone(),
            self.policy.max_retries,
        );

        let rendered = match self.pool.submit(job).await {
            Ok(result) => result.outcome.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let local_path = match rendered {
            Ok(path) => path,
            Err(message) => return self.fail(record, attempt_count, &message).await,
        };
        record.local_path = Some(local_path.display().to_string());

        match self.upload_with_retry(&record, &local_path).await {
            Ok(locators) => {
                record.mark_uploaded(locators.clone());
                if let Err(err) = self.store.update(&record).await {
                    warn!(
                        record_id = %record.record_id,
                        "Failed to persist uploaded record: {:#}", err
                    );
                }
                if let Err(err) = self.store.clear_errors(&record.record_id).await {
                    warn!(
                        record_id = %record.record_id,
                        "Failed to clear error records: {:#}", err
                    );
                }
                self.push_history(&record, attempt_count, RecordStatus::Uploaded, &locators.url)
                    .await;

                if self.config.delete_local_after_upload {
                    if let Err(err) = tokio::fs::remove_file(&local_path).await {
                        warn!(
                            record_id = %record.record_id,
                            "Failed to delete local artifact: {:#}", err
                        );
                    }
                }

                UploadOutcome {
                    record_id: record.record_id,
                    status: RecordStatus::Uploaded,
                    remote: Some(locators),
                    error: None,
                    can_retry: false,
                }
            }
            Err(message) => self.fail(record, attempt_count, &message).await,
        }
    }

    /// Bounded upload loop: `max_retries` attempts, policy backoff between
    /// them, early stop on a non-retryable classification.
    async fn upload_with_retry(
        &self,
        record: &UploadRecord,
        local_path: &Path,
    ) -> Result<RemoteLocators, String> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_message = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }
            match self
                .uploader
                .upload(local_path, &record.record_id, record.kind)
                .await
            {
                Ok(locators) => return Ok(locators),
                Err(err) => {
                    let message = format!("{:#}", err);
                    let kind = classify::classify(&message);
                    let retryable = self.retry_table.is_retryable(kind);
                    warn!(
                        record_id = %record.record_id,
                        attempt,
                        kind = %kind,
                        retryable,
                        error = %message,
                        "Upload attempt failed"
                    );
                    last_message = message;
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_message)
    }

    async fn fail(
        &self,
        mut record: UploadRecord,
        attempt_count: u32,
        message: &str,
    ) -> UploadOutcome {
        let kind = classify::classify(message);
        let retryable = self.retry_table.is_retryable(kind);
        let can_retry = retryable && attempt_count < self.policy.max_retries;

        record.mark_failed();
        if let Err(err) = self.store.update(&record).await {
            warn!(
                record_id = %record.record_id,
                "Failed to persist failed record: {:#}", err
            );
        }

        let next_retry_at = retryable.then(|| {
            let delay = chrono::Duration::from_std(self.policy.backoff(attempt_count.max(1)))
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            Utc::now() + delay
        });
        let error = ErrorRecord {
            record_id: record.record_id.clone(),
            kind,
            message: message.to_string(),
            remediation: classify::remediation(kind).to_string(),
            attempt_count,
            retryable,
            next_retry_at,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.save_error(&error).await {
            warn!(
                record_id = %record.record_id,
                "Failed to persist error record: {:#}", err
            );
        }
        self.push_history(&record, attempt_count, RecordStatus::Failed, message)
            .await;

        UploadOutcome {
            record_id: record.record_id,
            status: RecordStatus::Failed,
            remote: None,
            error: Some(message.to_string()),
            can_retry,
        }
    }

    async fn push_history(
        &self,
        record: &UploadRecord,
        attempt: u32,
        status: RecordStatus,
        detail: &str,
    ) {
        let entry = HistoryEntry {
            record_id: record.record_id.clone(),
            attempt,
            status,
            detail: detail.to_string(),
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.save_history(&entry).await {
            warn!(
                record_id = %record.record_id,
                "Failed to append attempt history: {:#}", err
            );
        }
    }
}
