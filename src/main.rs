//! Render Worker Service
//!
//! This worker renders diagram sources into image artifacts using a bounded
//! pool of render tasks with automatic retry on transient failure.
//!
//! ## Architecture
//!
//! - **Queue**: bounded in-memory channel feeding the worker pool
//! - **Renderer**: resvg/svg2pdf pipeline (`SvgRenderer`)
//! - **Results**: correlated back to each submission by job ID
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables:
//! - `RENDER_INPUT_DIR`: Directory scanned for `.svg` sources (default: input)
//! - `RENDER_OUTPUT_DIR`: Artifact directory (default: artifacts)
//! - `WORKER_CONCURRENCY`: Number of concurrent workers (default: 5)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use worker_render::job::{JobKind, RenderJob};
use worker_render::pool::{PoolConfig, RenderPool};
use worker_render::render::SvgRenderer;
use worker_render::retry::RetryPolicy;
use worker_render::telemetry;
use std::fs;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting render worker service");

    // Load configuration
    let input_dir = std::env::var("RENDER_INPUT_DIR").unwrap_or_else(|_| "input".to_string());
    let output_dir =
        std::env::var("RENDER_OUTPUT_DIR").unwrap_or_else(|_| "artifacts".to_string());
    let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    info!(
        "Configuration: input_dir={}, output_dir={}, concurrency={}",
        input_dir, output_dir, concurrency
    );

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {output_dir}"))?;

    // Create the pool
    let policy = RetryPolicy::default();
    let renderer = Arc::new(SvgRenderer::new(&*output_dir));
    let pool = Arc::new(RenderPool::new(
        renderer,
        PoolConfig {
            pool_size: concurrency,
            retry_policy: policy,
            ..PoolConfig::default()
        },
    ));
    pool.start();

    // Submit one job per diagram source
    let mut handles = Vec::new();
    for entry in fs::read_dir(&input_dir)
        .with_context(|| format!("Failed to read input directory {input_dir}"))?
    {
        let path = entry?.path();
        let is_svg = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("svg"))
            .unwrap_or(false);
        if !is_svg {
            continue;
        }

        let markup = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "diagram".to_string());
        let job = RenderJob::new(
            JobKind::Markup,
            markup,
            format!("{stem}.png"),
            policy.max_retries,
        );

        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            match pool.submit(job).await {
                Ok(result) => telemetry::record_job_telemetry(&result),
                Err(e) => error!("Job was not processed: {}", e),
            }
        }));
    }

    info!("Submitted {} render job(s)", handles.len());

    // Drain, or shut down early on Ctrl+C
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    tokio::select! {
        _ = drain => info!("All jobs drained"),
        _ = signal::ctrl_c() => info!("Received shutdown signal, waiting for workers to finish..."),
    }

    pool.stop().await;

    let snapshot = pool.metrics();
    telemetry::record_pool_heartbeat(pool.queue_depth(), &snapshot);
    info!(
        "Render worker shutdown complete: total={}, succeeded={}, failed={}, retries={}",
        snapshot.total_jobs, snapshot.successful_jobs, snapshot.failed_jobs, snapshot.total_retries
    );
    Ok(())
}
