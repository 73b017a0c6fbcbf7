//! Remote upload collaborator seam.

use crate::job::JobKind;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Locators returned by the remote store for an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocators {
    pub remote_id: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

/// Upload client injected into the orchestrator.
///
/// Error text should name the underlying cause; the orchestrator classifies
/// failures from it to decide whether another attempt is worthwhile.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upload: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        identifier: &str,
        kind: JobKind,
    ) -> Result<RemoteLocators>;

    async fn delete(&self, remote_id: &str) -> Result<()>;
}
