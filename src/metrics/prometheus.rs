//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "workload_backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["queue"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "workload_backup_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["queue"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "workload_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["queue"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys waiting in each work queue
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "workload_backup_operator_queue_depth",
        "Keys waiting to be reconciled",
        &["queue"]
    ).unwrap();

    /// Retries scheduled with backoff
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "workload_backup_operator_retries_total",
        "Total number of retries scheduled after failed reconciliations",
        &["queue"]
    ).unwrap();

    /// Backup components injected into workloads
    pub static ref INJECTIONS: CounterVec = register_counter_vec!(
        "workload_backup_operator_injections_total",
        "Total number of backup component injections",
        &["kind"]
    ).unwrap();

    /// Backup components removed from workloads
    pub static ref REMOVALS: CounterVec = register_counter_vec!(
        "workload_backup_operator_removals_total",
        "Total number of backup component removals",
        &["kind"]
    ).unwrap();

    /// Scale runs by outcome
    pub static ref SCALE_RUNS: CounterVec = register_counter_vec!(
        "workload_backup_operator_scale_runs_total",
        "Total number of scale-down/scale-up runs by outcome",
        &["outcome"]
    ).unwrap();

    /// Drains that timed out before all scalable pods terminated
    pub static ref DRAIN_TIMEOUTS: prometheus::Counter = prometheus::register_counter!(
        "workload_backup_operator_drain_timeouts_total",
        "Total number of drain waits that timed out"
    ).unwrap();

    /// Replica counts restored from saved state
    pub static ref RESTORES: CounterVec = register_counter_vec!(
        "workload_backup_operator_restores_total",
        "Total number of replica restores",
        &["kind"]
    ).unwrap();

    /// Events recorded against objects
    pub static ref EVENTS: CounterVec = register_counter_vec!(
        "workload_backup_operator_events_total",
        "Total number of events by type and reason",
        &["type", "reason"]
    ).unwrap();

    /// Currently managed resources
    pub static ref MANAGED_RESOURCES: GaugeVec = register_gauge_vec!(
        "workload_backup_operator_managed_resources",
        "Number of cached resources by kind",
        &["kind"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "workload_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();

    /// Operator readiness (1 once every watch cache has synced)
    pub static ref OPERATOR_READY: prometheus::Gauge = prometheus::register_gauge!(
        "workload_backup_operator_ready",
        "Operator readiness (1 = caches synced, 0 = starting)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => health_response(),
        "/readyz" | "/ready" => ready_response(),
        _ => not_found_response(),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from("Failed to encode metrics")))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap()
}

/// Health check response
fn health_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from("ok")))
        .unwrap()
}

/// Readiness check response; not ready until the watch caches have synced
fn ready_response() -> Response<Full<Bytes>> {
    let (status, body) = if OPERATOR_READY.get() >= 1.0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    };
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Not found response
fn not_found_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("Not Found")))
        .unwrap()
}
