//! Operator HTTP endpoint
//!
//! - `GET /metrics` relay metrics in Prometheus text format
//! - `GET /health` liveness
//! - `GET /connections` hosts with an active device session, one per line
//! - `POST /send/{host}` push the request body to a device (fire-and-forget)

use crate::infra::metrics::{Metrics, MetricsTotals, BACKEND_LATENCY_BOUNDS_MS, NUM_BUCKETS};
use crate::io::registry::ConnectionRegistry;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let totals = metrics.totals();
    let mut output = String::with_capacity(4096);

    write_connection_metrics(&mut output, site_id, &totals);
    write_frame_metrics(&mut output, site_id, &totals);
    write_backend_metrics(&mut output, site_id, &totals);

    output
}

fn write_connection_metrics(output: &mut String, site: &str, totals: &MetricsTotals) {
    write_metric(
        output,
        "relay_device_connections_active",
        "Device sessions currently open",
        MetricType::Gauge,
        site,
        totals.connections_active,
    );
    write_metric(
        output,
        "relay_device_connects_total",
        "Device sessions established",
        MetricType::Counter,
        site,
        totals.connects,
    );
    write_metric(
        output,
        "relay_device_disconnects_total",
        "Device sessions closed",
        MetricType::Counter,
        site,
        totals.disconnects,
    );
    write_metric(
        output,
        "relay_device_connect_failures_total",
        "Failed device dials",
        MetricType::Counter,
        site,
        totals.connect_failures,
    );
    write_metric(
        output,
        "relay_device_reconnect_attempts_total",
        "Reconnect attempts after a session was lost or a dial failed",
        MetricType::Counter,
        site,
        totals.reconnect_attempts,
    );
    write_metric(
        output,
        "relay_device_sends_total",
        "Messages queued for devices",
        MetricType::Counter,
        site,
        totals.sends,
    );
    write_metric(
        output,
        "relay_device_sends_dropped_total",
        "Messages dropped (no session or queue full)",
        MetricType::Counter,
        site,
        totals.sends_dropped,
    );
}

fn write_frame_metrics(output: &mut String, site: &str, totals: &MetricsTotals) {
    write_metric(
        output,
        "relay_frames_total",
        "Inbound device frames",
        MetricType::Counter,
        site,
        totals.frames,
    );
    write_metric(
        output,
        "relay_breaker_frames_total",
        "Breaker signal frames",
        MetricType::Counter,
        site,
        totals.breaker_frames,
    );
    write_metric(
        output,
        "relay_paystation_frames_total",
        "Pay-station frames",
        MetricType::Counter,
        site,
        totals.paystation_frames,
    );
    write_metric(
        output,
        "relay_decode_failures_total",
        "Frames dropped as undecodable",
        MetricType::Counter,
        site,
        totals.decode_failures,
    );
    write_metric(
        output,
        "relay_oversize_frames_total",
        "Frames discarded for exceeding the size limit",
        MetricType::Counter,
        site,
        totals.oversize_frames,
    );
    write_metric(
        output,
        "relay_facility_lookups_total",
        "Facility lookups by remote address",
        MetricType::Counter,
        site,
        totals.facility_lookups,
    );
    write_metric(
        output,
        "relay_facility_misses_total",
        "Facility lookups with no configured facility",
        MetricType::Counter,
        site,
        totals.facility_misses,
    );
}

fn write_backend_metrics(output: &mut String, site: &str, totals: &MetricsTotals) {
    write_histogram(
        output,
        "relay_backend_latency_ms",
        "Backend round-trip latency in milliseconds",
        site,
        &totals.backend_latency_buckets,
        &BACKEND_LATENCY_BOUNDS_MS,
        totals.backend_latency_total_ms,
    );
    write_metric(
        output,
        "relay_backend_failures_total",
        "Backend calls that failed after retries",
        MetricType::Counter,
        site,
        totals.backend_failures,
    );
    write_metric(
        output,
        "relay_backend_retries_total",
        "Immediate backend retries",
        MetricType::Counter,
        site,
        totals.backend_retries,
    );
    write_metric(
        output,
        "relay_images_deleted_total",
        "Staged vehicle images deleted",
        MetricType::Counter,
        site,
        totals.images_deleted,
    );
    write_metric(
        output,
        "relay_images_retained_total",
        "Staged vehicle images kept after a rejected exit report",
        MetricType::Counter,
        site,
        totals.images_retained,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    registry: Arc<ConnectionRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/connections") => {
            let mut body = registry.connected_hosts().join("\n");
            body.push('\n');
            respond(StatusCode::OK, "text/plain", body)
        }
        (&Method::POST, p) if p.starts_with("/send/") => {
            let host = p.trim_start_matches("/send/").to_string();
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "control_body_read_failed");
                    return Ok(respond(StatusCode::BAD_REQUEST, "application/json", r#"{"ok":false}"#));
                }
            };
            let Ok(message) = std::str::from_utf8(&body) else {
                return Ok(respond(
                    StatusCode::BAD_REQUEST,
                    "application/json",
                    r#"{"ok":false,"error":"invalid_utf8"}"#,
                ));
            };
            let queued = registry.send(&host, message);
            info!(host = %host, queued = queued, "manual_device_send");
            respond(StatusCode::OK, "application/json", format!(r#"{{"ok":true,"queued":{queued}}}"#))
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the operator HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();
                        let registry = registry.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                let registry = registry.clone();
                                async move { handle_request(req, metrics, site_id, registry).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "metrics_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "metrics_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
