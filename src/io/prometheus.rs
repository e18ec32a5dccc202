//! Prometheus metrics HTTP endpoint
//!
//! Exposes detector metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
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
use tracing::{error, info};

/// Prometheus metric type
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

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
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
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads only monotonic counters and gauges, so scraping does not reset the
/// periodic counters behind the log reporter.
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_cycle_metrics(&mut output, site_id, metrics);
    write_failure_metrics(&mut output, site_id, metrics);
    write_session_metrics(&mut output, site_id, metrics);
    write_floor_metrics(&mut output, site_id, metrics);

    output
}

fn write_cycle_metrics(output: &mut String, site: &str, metrics: &Metrics) {
    write_metric(
        output,
        "freespot_cycles_total",
        "Detection cycles that published a result",
        MetricType::Counter,
        site,
        metrics.cycles_total(),
    );
    write_metric(
        output,
        "freespot_persons_detected_total",
        "Person observations across all cycles",
        MetricType::Counter,
        site,
        metrics.persons_detected_total(),
    );
    write_histogram(
        output,
        "freespot_cycle_duration_ms",
        "End-to-end detection cycle time in milliseconds",
        site,
        &metrics.cycle_buckets_total(),
        &METRICS_BUCKET_BOUNDS,
        metrics.cycle_ms_total(),
    );
}

fn write_failure_metrics(output: &mut String, site: &str, metrics: &Metrics) {
    let counters = [
        ("freespot_connect_failures_total", "Camera connect failures", metrics.connect_failures_total()),
        ("freespot_no_frame_total", "Opened streams that yielded no frame", metrics.read_failures_total()),
        ("freespot_streams_unavailable_total", "Sessions ended by a lost camera", metrics.streams_unavailable_total()),
        ("freespot_detector_failures_total", "Person detector failures", metrics.detector_failures_total()),
        ("freespot_resolver_failures_total", "Occupancy resolver failures", metrics.resolver_failures_total()),
        ("freespot_cycle_errors_total", "Other absorbed cycle errors", metrics.cycle_errors_total()),
        ("freespot_subscriber_failures_total", "Result subscriber failures", metrics.subscriber_failures_total()),
        ("freespot_egress_dropped_total", "Egress messages dropped due to channel full", metrics.egress_dropped_total()),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
}

fn write_session_metrics(output: &mut String, site: &str, metrics: &Metrics) {
    write_metric(
        output,
        "freespot_active_sessions",
        "Sessions currently starting or running",
        MetricType::Gauge,
        site,
        metrics.active_sessions(),
    );
    write_metric(
        output,
        "freespot_sessions_started_total",
        "Sessions started",
        MetricType::Counter,
        site,
        metrics.sessions_started_total(),
    );
    write_metric(
        output,
        "freespot_sessions_failed_total",
        "Sessions terminated by a fatal error",
        MetricType::Counter,
        site,
        metrics.sessions_failed_total(),
    );
}

fn write_floor_metrics(output: &mut String, site: &str, metrics: &Metrics) {
    let gauges = metrics.floor_gauges();

    let _ = writeln!(output, "# HELP freespot_floor_persons Persons in the latest frame per floor");
    let _ = writeln!(output, "# TYPE freespot_floor_persons gauge");
    for (floor_id, gauge) in &gauges {
        let _ = writeln!(
            output,
            "freespot_floor_persons{{site=\"{site}\",floor_id=\"{floor_id}\"}} {}",
            gauge.persons
        );
    }

    let _ = writeln!(output, "# HELP freespot_floor_tables_occupied Occupied tables per floor");
    let _ = writeln!(output, "# TYPE freespot_floor_tables_occupied gauge");
    for (floor_id, gauge) in &gauges {
        let _ = writeln!(
            output,
            "freespot_floor_tables_occupied{{site=\"{site}\",floor_id=\"{floor_id}\"}} {}",
            gauge.occupied_tables
        );
    }

    let _ = writeln!(output, "# HELP freespot_floor_tables Tables resolved per floor");
    let _ = writeln!(output, "# TYPE freespot_floor_tables gauge");
    for (floor_id, gauge) in &gauges {
        let _ = writeln!(
            output,
            "freespot_floor_tables{{site=\"{site}\",floor_id=\"{floor_id}\"}} {}",
            gauge.total_tables
        );
    }
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DetectionResult, FloorId, OccupancyMethod, TableId, TableOccupancy};
    use chrono::Utc;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_session_started();
        metrics.record_connect_failure();
        metrics.record_cycle(&DetectionResult {
            floor_id: FloorId(3),
            timestamp: Utc::now(),
            person_count: 2,
            table_occupancies: vec![TableOccupancy {
                table_id: TableId(1),
                name: "Window".to_string(),
                occupied: true,
                method: OccupancyMethod::CenterPoint,
                min_distance: Some(4.0),
                person_count: 2,
            }],
            frame_width: 1280,
            frame_height: 720,
            processing_time_ms: 80.0,
        });

        let output = format_prometheus_metrics(&metrics, "library");

        assert!(output.contains("freespot_cycles_total{site=\"library\"} 1"));
        assert!(output.contains("freespot_cycle_duration_ms_bucket{site=\"library\",le=\"100\"} 1"));
        assert!(output.contains("freespot_cycle_duration_ms_sum{site=\"library\"} 80"));
        assert!(output.contains("freespot_connect_failures_total{site=\"library\"} 1"));
        assert!(output.contains("freespot_active_sessions{site=\"library\"} 1"));
        assert!(output.contains("freespot_floor_tables_occupied{site=\"library\",floor_id=\"3\"} 1"));
        assert!(output.contains("freespot_floor_persons{site=\"library\",floor_id=\"3\"} 2"));
    }

    #[test]
    fn test_scrape_does_not_reset_report_counters() {
        let metrics = Metrics::new();
        metrics.record_detector_failure();
        let _ = format_prometheus_metrics(&metrics, "s");
        let _ = format_prometheus_metrics(&metrics, "s");
        assert_eq!(metrics.report().detector_failures_total, 1);
    }
}
