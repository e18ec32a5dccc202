//! Integration tests for configuration loading

use freespot_detector::domain::types::{CanvasSize, FloorId};
use freespot_detector::infra::Config;
use freespot_detector::io::{GeometryStore, InMemoryGeometryStore};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[site]
id = "test-site"

[detection]
interval_ms = 500
confidence = 0.6
canvas_width = 1920
canvas_height = 1080
max_connect_failures = 3
stop_timeout_ms = 2500

[detector]
url = "http://detector:9000"

[mqtt]
host = "test-host"
port = 1884
topic_prefix = "test/floors"

[persistence]
file = "/tmp/ledger.jsonl"

[metrics]
interval_secs = 15
prometheus_port = 9091

[[floors]]
id = 3
name = "Terrace"
stream_url = "rtsp://cam-3/stream"
autostart = false

[[floors.tables]]
id = 31
name = "Corner"
coords = [10, 20, 110, 70]

[[floors.tables]]
id = 32
coords = { x = 200, y = 200, width = 40, height = 40 }
rotation = 0.5

[[floors.tables]]
id = 33
coords = [5, 5, 5]
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(CONFIG);
    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.detection_interval(), Duration::from_millis(500));
    assert_eq!(config.confidence(), 0.6);
    assert_eq!(config.canvas(), CanvasSize::new(1920, 1080));
    assert_eq!(config.max_connect_failures(), 3);
    assert_eq!(config.stop_timeout(), Duration::from_millis(2500));
    assert_eq!(config.detector_url(), "http://detector:9000");
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_topic_prefix(), "test/floors");
    assert_eq!(config.persistence_file(), "/tmp/ledger.jsonl");
    assert_eq!(config.prometheus_port(), 9091);

    // Unset values keep their defaults
    assert_eq!(config.connect_backoff(), Duration::from_millis(2000));
    assert_eq!(config.ffmpeg_path(), "ffmpeg");
}

#[test]
fn test_floors_and_tables() {
    let temp_file = write_config(CONFIG);
    let config = Config::from_file(temp_file.path()).unwrap();

    let floor = config.floor(FloorId(3)).unwrap();
    assert_eq!(floor.display_name(), "Terrace");
    assert_eq!(floor.stream_url, "rtsp://cam-3/stream");
    assert!(!floor.autostart);
    assert_eq!(floor.tables.len(), 3);
}

#[tokio::test]
async fn test_geometry_seeded_from_config_skips_malformed_tables() {
    let temp_file = write_config(CONFIG);
    let config = Config::from_file(temp_file.path()).unwrap();
    let store = InMemoryGeometryStore::from_config(&config);

    let zones = store.get_zones(FloorId(3)).await.unwrap();
    assert_eq!(zones.len(), 2);

    assert_eq!(zones[0].name(), "Corner");
    assert_eq!(zones[0].position(), (10.0, 20.0));
    assert_eq!((zones[0].width(), zones[0].height()), (100.0, 50.0));

    assert_eq!(zones[1].position(), (200.0, 200.0));
    assert_eq!(zones[1].rotation(), 0.5);
}

#[test]
fn test_invalid_toml_is_an_error() {
    let temp_file = write_config("[detection\ninterval_ms = ");
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.canvas(), CanvasSize::new(1280, 720));
    assert_eq!(config.max_connect_failures(), 5);
    assert!(config.floors().is_empty());
}
