//! FreeSpot detector - per-floor table occupancy daemon
//!
//! Runs one detection session per configured floor, publishes results over
//! MQTT and records table status changes to a JSONL ledger.
//!
//! Module structure:
//! - `domain/` - Core types (zones, results, errors)
//! - `io/` - External interfaces (camera, detector, MQTT, ledger, Prometheus)
//! - `services/` - Occupancy resolution, sessions, registry, result hub
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use freespot_detector::infra::{Config, Metrics};
use freespot_detector::io::{
    create_egress_channel, EndpointFrameSource, HttpPersonDetector, InMemoryGeometryStore, MqttPublisher,
    OccupancyLedger,
};
use freespot_detector::services::session::{SessionDeps, SessionSettings};
use freespot_detector::services::{
    BroadcastSubscriber, PersistenceSubscriber, ResultHub, SessionRegistry, StartOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// FreeSpot detector - table occupancy detection per floor
#[derive(Parser, Debug)]
#[command(name = "freespot-detector", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-cycle logs
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "freespot-detector starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        floors = config.floors().len(),
        interval_ms = config.detection_interval().as_millis() as u64,
        confidence = config.confidence(),
        canvas = %config.canvas(),
        detector_url = %config.detector_url(),
        mqtt_enabled = config.mqtt_enabled(),
        persistence_file = %config.persistence_file(),
        prometheus_port = config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(ResultHub::new(metrics.clone()));

    let ledger = Arc::new(
        OccupancyLedger::open(config.persistence_file())
            .with_context(|| format!("Failed to open occupancy ledger {}", config.persistence_file()))?,
    );
    hub.subscribe(Arc::new(PersistenceSubscriber::new(ledger)));

    // MQTT egress channel and publisher (if enabled)
    let (egress, publisher_task) = if config.mqtt_enabled() {
        let (egress, egress_rx) = create_egress_channel(1000, config.site_id().to_string(), metrics.clone());
        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        let task = tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        hub.subscribe(Arc::new(BroadcastSubscriber::new(Arc::new(egress.clone()))));
        (Some(egress), Some(task))
    } else {
        (None, None)
    };

    let deps = SessionDeps {
        frame_source: Arc::new(EndpointFrameSource::from_config(&config)?),
        detector: Arc::new(HttpPersonDetector::new(config.detector_url(), config.detector_timeout())?),
        geometry: Arc::new(InMemoryGeometryStore::from_config(&config)),
        hub: hub.clone(),
        metrics: metrics.clone(),
    };
    let registry =
        SessionRegistry::new(deps, SessionSettings::from_config(&config), config.stop_timeout(), egress);

    for floor in config.floors().iter().filter(|f| f.autostart) {
        match registry.start_session(floor.floor_id(), &floor.stream_url, config.canvas()) {
            Ok(StartOutcome::Started) => {
                info!(floor_id = %floor.id, name = %floor.display_name(), "floor_autostarted")
            }
            Ok(StartOutcome::AlreadyActive) => {}
            Err(e) => error!(floor_id = %floor.id, error = %e, "floor_autostart_failed"),
        }
    }

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = freespot_detector::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary
    let report_metrics = metrics.clone();
    let report_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(report_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            report_metrics.report().log();
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("shutdown_signal_received");

    for (floor_id, outcome) in registry.stop_all().await {
        info!(floor_id = %floor_id, outcome = ?outcome, "floor_stopped");
    }
    let _ = shutdown_tx.send(true);

    if let Some(task) = publisher_task {
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            warn!("mqtt_egress_drain_timed_out");
        }
    }

    info!("freespot-detector shutdown complete");
    Ok(())
}
