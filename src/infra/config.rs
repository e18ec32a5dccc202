//! Configuration loading from TOML files
//!
//! The binaries pick the file with `--config <path>` or the `CONFIG_FILE`
//! environment variable, defaulting to config/dev.toml.

use crate::domain::types::{CanvasSize, FloorId};
use crate::domain::zone::RawTableRecord;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier, used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "freespot".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Sleep between detection cycles
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Minimum person confidence passed to the detector
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_canvas_width")]
    pub canvas_width: u32,
    #[serde(default = "default_canvas_height")]
    pub canvas_height: u32,
    /// Consecutive connect failures before the session gives up
    #[serde(default = "default_max_connect_failures")]
    pub max_connect_failures: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Grace period for a session to exit after stop()
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_confidence() -> f32 {
    0.5
}

fn default_canvas_width() -> u32 {
    1280
}

fn default_canvas_height() -> u32 {
    720
}

fn default_max_connect_failures() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    2000
}

fn default_read_backoff_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    2000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            confidence: default_confidence(),
            canvas_width: default_canvas_width(),
            canvas_height: default_canvas_height(),
            max_connect_failures: default_max_connect_failures(),
            connect_backoff_ms: default_connect_backoff_ms(),
            read_backoff_ms: default_read_backoff_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameSourceConfig {
    /// Upper bound for one open+read of a camera endpoint
    #[serde(default = "default_frame_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
}

fn default_frame_timeout_ms() -> u64 {
    10_000
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_rtsp_transport() -> String {
    "tcp".to_string()
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_frame_timeout_ms(),
            ffmpeg_path: default_ffmpeg_path(),
            rtsp_transport: default_rtsp_transport(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Base URL of the person-detection service
    #[serde(default = "default_detector_url")]
    pub url: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_detector_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_detector_timeout_ms() -> u64 {
    5000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { url: default_detector_url(), timeout_ms: default_detector_timeout_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Enable MQTT broadcasting of detection results
    #[serde(default = "default_mqtt_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Results go to `{topic_prefix}/{floor_id}/detection`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_enabled() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "freespot/floors".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_enabled(),
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// File path for table status changes (JSONL format)
    #[serde(default = "default_persistence_file")]
    pub file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { file: default_persistence_file() }
    }
}

fn default_persistence_file() -> String {
    "occupancy.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

/// One monitored floor with its camera and table geometry
#[derive(Debug, Clone, Deserialize)]
pub struct FloorConfig {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// RTSP or HTTP snapshot URL of the floor camera
    pub stream_url: String,
    /// Start a detection session when the daemon boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,
    #[serde(default)]
    pub tables: Vec<RawTableRecord>,
}

fn default_autostart() -> bool {
    true
}

impl FloorConfig {
    pub fn floor_id(&self) -> FloorId {
        FloorId(self.id)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("Floor {}", self.id))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub frame_source: FrameSourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub floors: Vec<FloorConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    detection: DetectionConfig,
    frame_timeout_ms: u64,
    ffmpeg_path: String,
    rtsp_transport: String,
    detector_url: String,
    detector_timeout_ms: u64,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic_prefix: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    persistence_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    floors: Vec<FloorConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            detection: toml_config.detection,
            frame_timeout_ms: toml_config.frame_source.timeout_ms,
            ffmpeg_path: toml_config.frame_source.ffmpeg_path,
            rtsp_transport: toml_config.frame_source.rtsp_transport,
            detector_url: toml_config.detector.url,
            detector_timeout_ms: toml_config.detector.timeout_ms,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic_prefix: toml_config.mqtt.topic_prefix,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            persistence_file: toml_config.persistence.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            floors: toml_config.floors,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Find a configured floor by id
    pub fn floor(&self, floor_id: FloorId) -> Option<&FloorConfig> {
        self.floors.iter().find(|f| f.floor_id() == floor_id)
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection.interval_ms)
    }

    pub fn confidence(&self) -> f32 {
        self.detection.confidence
    }

    pub fn canvas(&self) -> CanvasSize {
        CanvasSize::new(self.detection.canvas_width, self.detection.canvas_height)
    }

    pub fn max_connect_failures(&self) -> u32 {
        self.detection.max_connect_failures
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.detection.connect_backoff_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.detection.read_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.detection.error_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.detection.stop_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    pub fn rtsp_transport(&self) -> &str {
        &self.rtsp_transport
    }

    pub fn detector_url(&self) -> &str {
        &self.detector_url
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt_topic_prefix
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn persistence_file(&self) -> &str {
        &self.persistence_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn floors(&self) -> &[FloorConfig] {
        &self.floors
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
