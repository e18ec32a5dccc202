//! One-shot detection probe
//!
//! Runs a single acquire -> detect -> resolve pass for one configured floor
//! and prints the result in wire format. Useful for checking a camera,
//! the detector and the table geometry before enabling a floor.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use freespot_detector::domain::types::{round2, DetectionResult, FloorId};
use freespot_detector::infra::Config;
use freespot_detector::io::{
    EndpointFrameSource, FrameSource, GeometryStore, HttpPersonDetector, InMemoryGeometryStore, PersonDetector,
};
use freespot_detector::services::occupancy;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "freespot-probe", about = "Run one detection pass for a floor")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Floor id from the config
    #[arg(short, long)]
    floor: i64,

    /// Override the floor's stream URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the confidence threshold
    #[arg(long)]
    confidence: Option<f32>,

    /// Pretty-print the result
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let floor_id = FloorId(args.floor);

    let endpoint = match (&args.endpoint, config.floor(floor_id)) {
        (Some(endpoint), _) => endpoint.clone(),
        (None, Some(floor)) => floor.stream_url.clone(),
        (None, None) => bail!("floor {} is not configured in {}", floor_id, args.config),
    };
    let confidence = args.confidence.unwrap_or_else(|| config.confidence());

    let started = Instant::now();
    let geometry = InMemoryGeometryStore::from_config(&config);
    let zones = geometry.get_zones(floor_id).await?;
    if zones.is_empty() {
        eprintln!("warning: floor {floor_id} has no tables, every result will be empty");
    }

    let source = EndpointFrameSource::from_config(&config)?;
    let frame = source
        .read_frame(&endpoint)
        .await
        .with_context(|| format!("Failed to read a frame from {endpoint}"))?;
    eprintln!("frame: {}x{} ({} bytes)", frame.width(), frame.height(), frame.data().len());

    let detector = HttpPersonDetector::new(config.detector_url(), config.detector_timeout())?;
    let persons = detector.detect(&frame, confidence).await?;

    let table_occupancies = occupancy::resolve(frame.size(), &zones, &persons, config.canvas())?;

    let result = DetectionResult {
        floor_id,
        timestamp: Utc::now(),
        person_count: persons.len() as u32,
        table_occupancies,
        frame_width: frame.width(),
        frame_height: frame.height(),
        processing_time_ms: round2(started.elapsed().as_secs_f64() * 1000.0),
    };

    let json = if args.pretty { serde_json::to_string_pretty(&result)? } else { serde_json::to_string(&result)? };
    println!("{json}");
    Ok(())
}
