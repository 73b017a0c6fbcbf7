//! Telemetry and structured logging for the render worker.

use crate::job::JobResult;
use crate::metrics::MetricsSnapshot;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

/// Duration above which a single job is flagged as slow (ms).
const SLOW_JOB_THRESHOLD_MS: u64 = 5000;

/// Records telemetry for one completed or failed job.
///
/// Emits a structured log line and an OpenTelemetry span with duration,
/// retry count, and error details for monitoring render pipeline health.
pub fn record_job_telemetry(result: &JobResult) {
    let tracer = global::tracer("render-worker");
    let mut span = tracer.start("render_job");

    let duration_ms = result.duration.as_millis() as u64;
    let status = if result.is_success() { "success" } else { "failed" };

    span.set_attribute(KeyValue::new("job_id", result.job_id.clone()));
    span.set_attribute(KeyValue::new("status", status));
    span.set_attribute(KeyValue::new("retries", i64::from(result.retries)));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms as i64));

    info!(
        job_id = %result.job_id,
        status,
        retries = result.retries,
        duration_ms,
        "Render job finished"
    );

    if duration_ms > SLOW_JOB_THRESHOLD_MS {
        warn!(
            job_id = %result.job_id,
            duration_ms,
            "Render job exceeded performance threshold ({}ms)",
            SLOW_JOB_THRESHOLD_MS
        );
    }

    if let Some(error) = result.error() {
        span.set_attribute(KeyValue::new("error", error.to_string()));
        span.set_attribute(KeyValue::new("error_kind", error.kind.to_string()));
        span.set_attribute(KeyValue::new("attempts", i64::from(error.attempts)));
        warn!(
            job_id = %result.job_id,
            kind = %error.kind,
            attempts = error.attempts,
            error = %error.message,
            "Render job failed"
        );
    }

    span.end();
}

/// Records a pool heartbeat with queue depth and running counters.
///
/// Call periodically while the pool is serving jobs.
pub fn record_pool_heartbeat(queue_depth: usize, metrics: &MetricsSnapshot) {
    let tracer = global::tracer("render-worker");
    let mut span = tracer.start("pool_heartbeat");

    span.set_attribute(KeyValue::new("queue_depth", queue_depth as i64));
    span.set_attribute(KeyValue::new("total_jobs", metrics.total_jobs as i64));
    span.set_attribute(KeyValue::new("failed_jobs", metrics.failed_jobs as i64));
    span.set_attribute(KeyValue::new(
        "total_retries",
        metrics.total_retries as i64,
    ));
    span.end();

    info!(
        queue_depth,
        total_jobs = metrics.total_jobs,
        successful_jobs = metrics.successful_jobs,
        failed_jobs = metrics.failed_jobs,
        "Pool heartbeat"
    );
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Call once at worker startup. Reads configuration from environment
/// variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: render-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "render-worker".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    global::set_tracer_provider(tracer.provider().unwrap());

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}
