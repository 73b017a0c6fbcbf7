//! Upload-record persistence: trait seam, Redis implementation, in-memory
//! implementation.

use crate::classify::ErrorKind;
use crate::job::JobKind;
use crate::upload::RemoteLocators;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Key prefix for upload records.
const RECORD_KEY_PREFIX: &str = "wiretuner:render:record";

/// Key prefix for error records.
const ERROR_KEY_PREFIX: &str = "wiretuner:render:error";

/// Set of record IDs that currently have an error record.
const ERROR_INDEX_KEY: &str = "wiretuner:render:error:index";

/// Key prefix for attempt history lists.
const HISTORY_KEY_PREFIX: &str = "wiretuner:render:history";

/// Record TTL in seconds (24 hours).
const RECORD_TTL_SECONDS: u64 = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Uploaded,
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Uploaded => write!(f, "uploaded"),
            RecordStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one upload pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub record_id: String,
    pub kind: JobKind,
    pub input: String,
    pub output_name: String,
    pub status: RecordStatus,
    pub local_path: Option<String>,
    pub remote: Option<RemoteLocators>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(kind: JobKind, input: String, output_name: String) -> Self {
        let now = Utc::now();
        Self {
            record_id: Uuid::new_v4().to_string(),
            kind,
            input,
            output_name,
            status: RecordStatus::Pending,
            local_path: None,
            remote: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_uploaded(&mut self, remote: RemoteLocators) {
        self.status = RecordStatus::Uploaded;
        self.remote = Some(remote);
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self) {
        self.status = RecordStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Persisted failure details for a record, including the batch-retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub record_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: String,
    /// Orchestrator-level attempts so far; the persisted counter the retry
    /// ceiling is checked against.
    pub attempt_count: u32,
    pub retryable: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Eligible for a batch retry right now.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.retryable && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// One line of attempt history for a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record_id: String,
    pub attempt: u32,
    pub status: RecordStatus,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence collaborator for upload records, error records, and attempt
/// history.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, record: &UploadRecord) -> Result<()>;
    async fn update(&self, record: &UploadRecord) -> Result<()>;
    async fn get_by_id(&self, record_id: &str) -> Result<Option<UploadRecord>>;

    async fn save_error(&self, error: &ErrorRecord) -> Result<()>;
    /// Returns up to `limit` error records that are retryable and due.
    async fn get_retryable(&self, limit: usize) -> Result<Vec<ErrorRecord>>;
    async fn clear_errors(&self, record_id: &str) -> Result<()>;
    async fn mark_non_retryable(&self, record_id: &str) -> Result<()>;

    async fn save_history(&self, entry: &HistoryEntry) -> Result<()>;
    async fn get_history(&self, record_id: &str) -> Result<Vec<HistoryEntry>>;
}

/// Redis-backed record store.
///
/// Records are stored as JSON under prefixed keys with a 24-hour TTL; record
/// IDs with an outstanding error are tracked in a set so batch retry can scan
/// them without key globbing.
pub struct RedisRecordStore {
    conn: ConnectionManager,
}

impl RedisRecordStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn record_key(record_id: &str) -> String {
        format!("{}:{}", RECORD_KEY_PREFIX, record_id)
    }

    fn error_key(record_id: &str) -> String {
        format!("{}:{}", ERROR_KEY_PREFIX, record_id)
    }

    fn history_key(record_id: &str) -> String {
        format!("{}:{}", HISTORY_KEY_PREFIX, record_id)
    }

    async fn put_record(&self, record: &UploadRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize upload record")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::record_key(&record.record_id), json, RECORD_TTL_SECONDS)
            .await
            .context("Failed to write upload record")?;
        debug!(
            "Stored record: record_id={}, status={}",
            record.record_id, record.status
        );
        Ok(())
    }

    async fn get_error(&self, record_id: &str) -> Result<Option<ErrorRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(Self::error_key(record_id))
            .await
            .context("Failed to read error record")?;
        json.map(|json| {
            serde_json::from_str(&json).context("Failed to deserialize error record")
        })
        .transpose()
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn create(&self, record: &UploadRecord) -> Result<()> {
        self.put_record(record).await
    }

    async fn update(&self, record: &UploadRecord) -> Result<()> {
        self.put_record(record).await
    }

    async fn get_by_id(&self, record_id: &str) -> Result<Option<UploadRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(Self::record_key(record_id))
            .await
            .context("Failed to read upload record")?;
        json.map(|json| {
            serde_json::from_str(&json).context("Failed to deserialize upload record")
        })
        .transpose()
    }

    async fn save_error(&self, error: &ErrorRecord) -> Result<()> {
        let json = serde_json::to_string(error).context("Failed to serialize error record")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::error_key(&error.record_id), json, RECORD_TTL_SECONDS)
            .await
            .context("Failed to write error record")?;
        conn.sadd::<_, _, ()>(ERROR_INDEX_KEY, &error.record_id)
            .await
            .context("Failed to index error record")?;
        Ok(())
    }

    async fn get_retryable(&self, limit: usize) -> Result<Vec<ErrorRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(ERROR_INDEX_KEY)
            .await
            .context("Failed to read error index")?;

        let now = Utc::now();
        let mut due = Vec::new();
        for record_id in ids {
            match self.get_error(&record_id).await? {
                Some(error) if error.due(now) => due.push(error),
                Some(_) => {}
                None => {
                    // Error key expired; drop the stale index entry.
                    conn.srem::<_, _, ()>(ERROR_INDEX_KEY, &record_id)
                        .await
                        .context("Failed to prune error index")?;
                }
            }
        }
        due.sort_by_key(|error| error.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn clear_errors(&self, record_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::error_key(record_id))
            .await
            .context("Failed to delete error record")?;
        conn.srem::<_, _, ()>(ERROR_INDEX_KEY, record_id)
            .await
            .context("Failed to deindex error record")?;
        Ok(())
    }

    async fn mark_non_retryable(&self, record_id: &str) -> Result<()> {
        if let Some(mut error) = self.get_error(record_id).await? {
            error.retryable = false;
            error.next_retry_at = None;
            let json =
                serde_json::to_string(&error).context("Failed to serialize error record")?;
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(Self::error_key(record_id), json, RECORD_TTL_SECONDS)
                .await
                .context("Failed to write error record")?;
            conn.srem::<_, _, ()>(ERROR_INDEX_KEY, record_id)
                .await
                .context("Failed to deindex error record")?;
        }
        Ok(())
    }

    async fn save_history(&self, entry: &HistoryEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("Failed to serialize history entry")?;
        let key = Self::history_key(&entry.record_id);
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&key, json)
            .await
            .context("Failed to append history entry")?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(RECORD_TTL_SECONDS)
            .query_async::<_, ()>(&mut conn)
            .await
            .context("Failed to set history TTL")?;
        Ok(())
    }

    async fn get_history(&self, record_id: &str) -> Result<Vec<HistoryEntry>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(Self::history_key(record_id), 0, -1)
            .await
            .context("Failed to read history")?;
        entries
            .iter()
            .map(|json| {
                serde_json::from_str(json).context("Failed to deserialize history entry")
            })
            .collect()
    }
}

/// In-memory record store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, UploadRecord>>,
    errors: Mutex<HashMap<String, ErrorRecord>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &UploadRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.record_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &UploadRecord) -> Result<()> {
        self.create(record).await
    }

    async fn get_by_id(&self, record_id: &str) -> Result<Option<UploadRecord>> {
        Ok(self.records.lock().unwrap().get(record_id).cloned())
    }

    async fn save_error(&self, error: &ErrorRecord) -> Result<()> {
        self.errors
            .lock()
            .unwrap()
            .insert(error.record_id.clone(), error.clone());
        Ok(())
    }

    async fn get_retryable(&self, limit: usize) -> Result<Vec<ErrorRecord>> {
        let now = Utc::now();
        let mut due: Vec<ErrorRecord> = self
            .errors
            .lock()
            .unwrap()
            .values()
            .filter(|error| error.due(now))
            .cloned()
            .collect();
        due.sort_by_key(|error| error.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn clear_errors(&self, record_id: &str) -> Result<()> {
        self.errors.lock().unwrap().remove(record_id);
        Ok(())
    }

    async fn mark_non_retryable(&self, record_id: &str) -> Result<()> {
        if let Some(error) = self.errors.lock().unwrap().get_mut(record_id) {
            error.retryable = false;
            error.next_retry_at = None;
        }
        Ok(())
    }

    async fn save_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.history
            .lock()
            .unwrap()
            .entry(entry.record_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_history(&self, record_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(record_id)
            .cloned()
            .unwrap_or_default())
    }
}
