//! Job models for the render pool.

use crate::error::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// How the input payload of a job is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Input is diagram markup (SVG source) to be rendered into an artifact.
    Markup,
    /// Input is a reference to an existing local image file.
    Reference,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Markup => write!(f, "markup"),
            JobKind::Reference => write!(f, "reference"),
        }
    }
}

/// A render request submitted to the pool.
///
/// Immutable once created except for `retry_count`, which only the executor
/// touches while running its attempt loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub job_id: String,
    pub kind: JobKind,
    pub input: String,
    pub output_name: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl RenderJob {
    pub fn new(kind: JobKind, input: String, output_name: String, max_retries: u32) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            kind,
            input,
            output_name,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a single job, produced exactly once by the executor.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: String,
    pub outcome: Result<PathBuf, ExecutionError>,
    /// Wall-clock time from the first attempt to the final one, backoff
    /// sleeps included.
    pub duration: Duration,
    /// Retries actually performed (attempts minus one).
    pub retries: u32,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.outcome.as_ref().err()
    }
}
