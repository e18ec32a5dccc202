//! Per-floor detection session
//!
//! One session owns one floor's loop:
//!
//! ```text
//! zones -> frame -> persons -> occupancy -> publish -> sleep
//! ```
//!
//! Cancellation is a `watch` flag. It is checked at the top of every
//! iteration and raced against the cycle and every sleep, so a stop takes
//! effect at the next await point. Dropping the in-flight cycle drops any
//! ffmpeg child and HTTP request with it.
//!
//! Only `StreamUnavailable` ends the loop. Every other error is logged,
//! counted, reported to the observer and followed by a backoff.

use crate::domain::error::DetectionError;
use crate::domain::types::{round2, CanvasSize, DetectionResult, FloorId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::detector::PersonDetector;
use crate::io::frame_source::{FrameAcquirer, FrameSource};
use crate::io::geometry_store::GeometryStore;
use crate::services::occupancy;
use crate::services::result_hub::ResultHub;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// Starting or Running
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Registry-owned record of one session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Uuid,
    pub status: SessionStatus,
    /// Consecutive connect failures at the last absorbed error
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<DetectionError>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn starting(session_id: Uuid) -> Self {
        Self {
            session_id,
            status: SessionStatus::Starting,
            retry_count: 0,
            started_at: Utc::now(),
            last_error: None,
            ended_at: None,
        }
    }
}

/// Loop timing and detection parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interval: Duration,
    pub confidence: f32,
    pub canvas: CanvasSize,
    pub max_connect_failures: u32,
    pub connect_backoff: Duration,
    pub read_backoff: Duration,
    pub error_backoff: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.detection_interval(),
            confidence: config.confidence(),
            canvas: config.canvas(),
            max_connect_failures: config.max_connect_failures(),
            connect_backoff: config.connect_backoff(),
            read_backoff: config.read_backoff(),
            error_backoff: config.error_backoff(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionDeps {
    pub frame_source: Arc<dyn FrameSource>,
    pub detector: Arc<dyn PersonDetector>,
    pub geometry: Arc<dyn GeometryStore>,
    pub hub: Arc<ResultHub>,
    pub metrics: Arc<Metrics>,
}

/// Receives state changes from a running session
pub trait SessionObserver: Send + Sync {
    /// A result was published
    fn on_published(&self, _timestamp: DateTime<Utc>) {}
    /// A transient error was absorbed
    fn on_transient_error(&self, _error: &DetectionError, _retry_count: u32) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionExit {
    /// Cancelled through the stop signal
    Stopped,
    /// Ended by a fatal error
    Failed(DetectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Published,
    NoZones,
}

/// Resolves once cancellation is requested or the sender is gone
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep unless cancelled first. Returns true when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancelled(cancel) => true,
    }
}

pub struct DetectionSession {
    floor_id: FloorId,
    session_id: Uuid,
    endpoint: String,
    settings: SessionSettings,
    acquirer: FrameAcquirer,
    detector: Arc<dyn PersonDetector>,
    geometry: Arc<dyn GeometryStore>,
    hub: Arc<ResultHub>,
    metrics: Arc<Metrics>,
    observer: Arc<dyn SessionObserver>,
}

impl DetectionSession {
    pub fn new(
        floor_id: FloorId,
        session_id: Uuid,
        endpoint: impl Into<String>,
        settings: SessionSettings,
        deps: &SessionDeps,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            floor_id,
            session_id,
            endpoint: endpoint.into(),
            acquirer: FrameAcquirer::new(deps.frame_source.clone(), settings.max_connect_failures),
            settings,
            detector: deps.detector.clone(),
            geometry: deps.geometry.clone(),
            hub: deps.hub.clone(),
            metrics: deps.metrics.clone(),
            observer,
        }
    }

    /// Run until cancelled or the stream is lost
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> SessionExit {
        info!(
            floor_id = %self.floor_id,
            session_id = %self.session_id,
            endpoint = %self.endpoint,
            canvas = %self.settings.canvas,
            "detection_session_started"
        );

        // Checked again right before a result is published
        let stop_flag = cancel.clone();

        loop {
            if *cancel.borrow() {
                break;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancelled(&mut cancel) => Err(DetectionError::Cancelled),
                outcome = self.run_cycle(started, &stop_flag) => outcome,
            };

            let pause = match outcome {
                Ok(CycleOutcome::Published) | Ok(CycleOutcome::NoZones) => self.settings.interval,
                Err(DetectionError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    self.metrics.record_connect_failure();
                    self.metrics.record_stream_unavailable();
                    error!(
                        floor_id = %self.floor_id,
                        session_id = %self.session_id,
                        error = %e,
                        "detection_session_failed"
                    );
                    return SessionExit::Failed(e);
                }
                Err(e) => self.absorb(e),
            };

            if sleep_or_cancel(pause, &mut cancel).await {
                break;
            }
        }

        info!(floor_id = %self.floor_id, session_id = %self.session_id, "detection_session_stopped");
        SessionExit::Stopped
    }

    async fn run_cycle(
        &mut self,
        started: Instant,
        stop_flag: &watch::Receiver<bool>,
    ) -> Result<CycleOutcome, DetectionError> {
        let zones = self
            .geometry
            .get_zones(self.floor_id)
            .await
            .map_err(|e| DetectionError::GeometryUnavailable(format!("{e:#}")))?;
        if zones.is_empty() {
            debug!(floor_id = %self.floor_id, "no_tables_configured");
            return Ok(CycleOutcome::NoZones);
        }

        let frame = self.acquirer.acquire(&self.endpoint).await?;

        let persons = self
            .detector
            .detect(&frame, self.settings.confidence)
            .await
            .map_err(|e| DetectionError::DetectorFailure(format!("{e:#}")))?;

        let frame_size = frame.size();
        drop(frame);

        let table_occupancies =
            occupancy::resolve(frame_size, &zones, &persons, self.settings.canvas)?;

        let result = DetectionResult {
            floor_id: self.floor_id,
            timestamp: Utc::now(),
            person_count: persons.len() as u32,
            table_occupancies,
            frame_width: frame_size.width,
            frame_height: frame_size.height,
            processing_time_ms: round2(started.elapsed().as_secs_f64() * 1000.0),
        };

        debug!(
            floor_id = %self.floor_id,
            persons = result.person_count,
            occupied = result.occupied_count(),
            tables = result.table_occupancies.len(),
            processing_ms = result.processing_time_ms,
            "detection_cycle"
        );

        // A detector that never yields can outlive a timed-out stop; its
        // result must not reach a floor that was already cleared
        if *stop_flag.borrow() {
            debug!(floor_id = %self.floor_id, "detection_cycle_discarded");
            return Err(DetectionError::Cancelled);
        }

        let timestamp = result.timestamp;
        self.metrics.record_cycle(&result);
        self.hub.publish(self.floor_id, result);
        self.observer.on_published(timestamp);
        Ok(CycleOutcome::Published)
    }

    /// Log and count a transient error, returning the backoff before the
    /// next attempt
    fn absorb(&self, error: DetectionError) -> Duration {
        let backoff = match &error {
            DetectionError::ConnectFailed { .. } => {
                self.metrics.record_connect_failure();
                self.settings.connect_backoff
            }
            DetectionError::NoFrame(_) => {
                self.metrics.record_read_failure();
                self.settings.read_backoff
            }
            DetectionError::DetectorFailure(_) => {
                self.metrics.record_detector_failure();
                self.settings.error_backoff
            }
            DetectionError::ResolverFailure(_) => {
                self.metrics.record_resolver_failure();
                self.settings.error_backoff
            }
            _ => {
                self.metrics.record_cycle_error();
                self.settings.error_backoff
            }
        };

        let retry_count = self.acquirer.consecutive_failures();
        warn!(
            floor_id = %self.floor_id,
            kind = error.kind(),
            error = %error,
            retry_count = retry_count,
            backoff_ms = backoff.as_millis() as u64,
            "detection_cycle_failed"
        );
        self.observer.on_transient_error(&error, retry_count);
        backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PersonObservation, TableId, TableZone};
    use crate::io::frame_source::{Frame, FrameReadError};
    use crate::io::geometry_store::InMemoryGeometryStore;
    use anyhow::bail;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back a script, then repeats the fallback forever
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Frame, FrameReadError>>>,
        fallback: Result<Frame, FrameReadError>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Frame, FrameReadError>>, fallback: Result<Frame, FrameReadError>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), fallback, calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn read_frame(&self, _endpoint: &str) -> Result<Frame, FrameReadError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct FixedDetector {
        persons: Vec<PersonObservation>,
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl PersonDetector for FixedDetector {
        async fn detect(&self, _frame: &Frame, _confidence: f32) -> anyhow::Result<Vec<PersonObservation>> {
            if self.fail_first.load(Ordering::Relaxed) > 0 {
                self.fail_first.fetch_sub(1, Ordering::Relaxed);
                bail!("model busy");
            }
            Ok(self.persons.clone())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        published: AtomicU32,
        errors: Mutex<Vec<String>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_published(&self, _timestamp: DateTime<Utc>) {
            self.published.fetch_add(1, Ordering::Relaxed);
        }

        fn on_transient_error(&self, error: &DetectionError, _retry_count: u32) {
            self.errors.lock().push(error.kind().to_string());
        }
    }

    fn frame() -> Frame {
        Frame::new(Bytes::from_static(b"frame"), 1280, 720)
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            interval: Duration::from_millis(5),
            confidence: 0.5,
            canvas: CanvasSize::new(1280, 720),
            max_connect_failures: 5,
            connect_backoff: Duration::from_millis(1),
            read_backoff: Duration::from_millis(1),
            error_backoff: Duration::from_millis(1),
        }
    }

    fn deps(
        source: Arc<dyn FrameSource>,
        detector: FixedDetector,
        with_zone: bool,
    ) -> (SessionDeps, Arc<InMemoryGeometryStore>) {
        let metrics = Arc::new(Metrics::new());
        let geometry = Arc::new(InMemoryGeometryStore::new());
        if with_zone {
            geometry.upsert_zone(
                FloorId(1),
                TableZone::new(TableId(1), "Window", (100.0, 100.0), (50.0, 50.0), 0.0, 2).unwrap(),
            );
        }
        let deps = SessionDeps {
            frame_source: source,
            detector: Arc::new(detector),
            geometry: geometry.clone(),
            hub: Arc::new(ResultHub::new(metrics.clone())),
            metrics,
        };
        (deps, geometry)
    }

    fn detector(persons: Vec<PersonObservation>) -> FixedDetector {
        FixedDetector { persons, fail_first: AtomicU32::new(0) }
    }

    #[tokio::test]
    async fn test_five_connect_failures_end_the_session() {
        let source = ScriptedSource::new(vec![], Err(FrameReadError::Connect("refused".into())));
        let (deps, _) = deps(source.clone(), detector(vec![]), true);
        let observer = Arc::new(RecordingObserver::default());
        let session =
            DetectionSession::new(FloorId(1), Uuid::now_v7(), "rtsp://cam", settings(), &deps, observer.clone());

        let (_tx, rx) = watch::channel(false);
        let exit = session.run(rx).await;

        assert_eq!(
            exit,
            SessionExit::Failed(DetectionError::StreamUnavailable {
                endpoint: "rtsp://cam".into(),
                attempts: 5
            })
        );
        assert_eq!(source.calls.load(Ordering::Relaxed), 5);
        assert_eq!(observer.errors.lock().len(), 4);
        assert_eq!(deps.metrics.streams_unavailable_total(), 1);
        assert_eq!(deps.metrics.connect_failures_total(), 5);
    }

    #[tokio::test]
    async fn test_publishes_results_until_cancelled() {
        let source = ScriptedSource::new(vec![], Ok(frame()));
        let (deps, _) = deps(source, detector(vec![PersonObservation::new(120.0, 120.0, 0.9)]), true);
        let observer = Arc::new(RecordingObserver::default());
        let session =
            DetectionSession::new(FloorId(1), Uuid::now_v7(), "rtsp://cam", settings(), &deps, observer.clone());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let exit = handle.await.unwrap();

        assert_eq!(exit, SessionExit::Stopped);
        assert!(observer.published.load(Ordering::Relaxed) >= 1);
        let latest = deps.hub.get_latest(FloorId(1)).unwrap();
        assert_eq!(latest.person_count, 1);
        assert!(latest.table_occupancies[0].occupied);
        assert_eq!(latest.table_occupancies[0].min_distance, Some(7.07));
        assert_eq!(latest.frame_width, 1280);
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_end_the_session() {
        let source = ScriptedSource::new(
            vec![
                Err(FrameReadError::Read("corrupt".into())),
                Err(FrameReadError::Connect("refused".into())),
            ],
            Ok(frame()),
        );
        let detector = FixedDetector { persons: vec![], fail_first: AtomicU32::new(1) };
        let (deps, _) = deps(source, detector, true);
        let observer = Arc::new(RecordingObserver::default());
        let session =
            DetectionSession::new(FloorId(1), Uuid::now_v7(), "rtsp://cam", settings(), &deps, observer.clone());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SessionExit::Stopped);

        let errors = observer.errors.lock().clone();
        assert_eq!(errors, vec!["no_frame", "connect_failed", "detector_failure"]);
        assert!(deps.hub.get_latest(FloorId(1)).is_some());
        assert_eq!(deps.metrics.read_failures_total(), 1);
        assert_eq!(deps.metrics.detector_failures_total(), 1);
    }

    #[tokio::test]
    async fn test_floor_without_tables_skips_cycles() {
        let source = ScriptedSource::new(vec![], Ok(frame()));
        let (deps, _) = deps(source.clone(), detector(vec![]), false);
        let session = DetectionSession::new(
            FloorId(1),
            Uuid::now_v7(),
            "rtsp://cam",
            settings(),
            &deps,
            Arc::new(NoopObserver),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(source.calls.load(Ordering::Relaxed), 0);
        assert!(deps.hub.get_latest(FloorId(1)).is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_sleep() {
        let source = ScriptedSource::new(vec![], Ok(frame()));
        let (deps, _) = deps(source, detector(vec![]), true);
        let mut slow = settings();
        slow.interval = Duration::from_secs(3600);
        let session =
            DetectionSession::new(FloorId(1), Uuid::now_v7(), "e", slow, &deps, Arc::new(NoopObserver));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(exit, SessionExit::Stopped);
    }

    /// Blocks the worker thread, so cancellation can only be seen afterwards
    struct BlockingDetector;

    #[async_trait]
    impl PersonDetector for BlockingDetector {
        async fn detect(&self, _frame: &Frame, _confidence: f32) -> anyhow::Result<Vec<PersonObservation>> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(vec![PersonObservation::new(120.0, 120.0, 0.9)])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cycle_finishing_after_cancel_is_not_published() {
        let source = ScriptedSource::new(vec![], Ok(frame()));
        let (mut session_deps, _) = deps(source, detector(vec![]), true);
        session_deps.detector = Arc::new(BlockingDetector);
        let observer = Arc::new(RecordingObserver::default());
        let session = DetectionSession::new(
            FloorId(1),
            Uuid::now_v7(),
            "rtsp://cam",
            settings(),
            &session_deps,
            observer.clone(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), SessionExit::Stopped);
        assert!(session_deps.hub.get_latest(FloorId(1)).is_none());
        assert_eq!(session_deps.metrics.cycles_total(), 0);
        assert_eq!(observer.published.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_cancels() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_millis(100), cancelled(&mut rx)).await.unwrap();
    }

    #[test]
    fn test_status_helpers() {
        assert!(SessionStatus::Starting.is_active());
        assert!(SessionStatus::Running.is_active());
        assert!(!SessionStatus::Stopping.is_active());
        assert!(!SessionStatus::Failed.is_active());
        assert_eq!(SessionStatus::Failed.as_str(), "failed");
    }
}
