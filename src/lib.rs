//! Render Worker Library
//!
//! This library provides a bounded worker pool that renders diagram sources
//! into image artifacts, plus the orchestration layer that uploads them to a
//! remote store with persisted retry state.
//!
//! ## Module Overview
//!
//! - `pool`: bounded worker pool, retry executor, result correlation
//! - `job`: job models and results
//! - `retry`: retry policy and backoff computation
//! - `classify`: failure taxonomy and retryability verdicts
//! - `render`: rendering seam and the resvg/svg2pdf implementation
//! - `upload`: remote upload seam
//! - `store`: upload-record persistence (Redis and in-memory)
//! - `orchestrator`: persistence-aware upload envelope and batch retry
//! - `metrics`: pool counters with copy-out snapshots
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worker_render::{
//!     job::{JobKind, RenderJob},
//!     pool::{PoolConfig, RenderPool},
//!     render::SvgRenderer,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let renderer = Arc::new(SvgRenderer::new("./artifacts"));
//!     let pool = RenderPool::new(renderer, PoolConfig::default());
//!     pool.start();
//!
//!     let job = RenderJob::new(
//!         JobKind::Markup,
//!         r#"<svg xmlns="http://www.w3.org/2000/svg" width="100" height="100"/>"#.to_string(),
//!         "diagram.png".to_string(),
//!         3,
//!     );
//!     let result = pool.submit(job).await.expect("pool is running");
//!     println!("rendered to {:?}", result.path());
//!
//!     pool.stop().await;
//! }
//! ```

pub mod classify;
pub mod error;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod render;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod upload;
