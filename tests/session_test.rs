//! Integration tests for session lifecycle through the registry

use async_trait::async_trait;
use bytes::Bytes;
use freespot_detector::domain::types::{CanvasSize, FloorId, PersonObservation, TableId, TableZone};
use freespot_detector::domain::DetectionError;
use freespot_detector::infra::Metrics;
use freespot_detector::io::{Frame, FrameReadError, FrameSource, InMemoryGeometryStore, OccupancyLedger, PersonDetector};
use freespot_detector::services::session::{SessionDeps, SessionSettings, SessionStatus};
use freespot_detector::services::{
    PersistenceSubscriber, ResultHub, SessionRegistry, StartOutcome, StopOutcome,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CameraStub {
    refuse: bool,
    opens: AtomicU32,
}

#[async_trait]
impl FrameSource for CameraStub {
    async fn read_frame(&self, _endpoint: &str) -> Result<Frame, FrameReadError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        if self.refuse {
            Err(FrameReadError::Connect("connection refused".to_string()))
        } else {
            Ok(Frame::new(Bytes::from_static(b"jpeg"), 1280, 720))
        }
    }
}

/// Returns whatever persons the test sets
#[derive(Default)]
struct DetectorStub {
    persons: Mutex<Vec<PersonObservation>>,
}

#[async_trait]
impl PersonDetector for DetectorStub {
    async fn detect(&self, _frame: &Frame, _confidence: f32) -> anyhow::Result<Vec<PersonObservation>> {
        Ok(self.persons.lock().clone())
    }
}

struct Harness {
    registry: SessionRegistry,
    hub: Arc<ResultHub>,
    geometry: Arc<InMemoryGeometryStore>,
    detector: Arc<DetectorStub>,
    camera: Arc<CameraStub>,
    metrics: Arc<Metrics>,
}

fn harness(refuse: bool) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(ResultHub::new(metrics.clone()));
    let geometry = Arc::new(InMemoryGeometryStore::new());
    geometry.upsert_zone(
        FloorId(1),
        TableZone::new(TableId(1), "Window", (100.0, 100.0), (50.0, 50.0), 0.0, 2).unwrap(),
    );
    let detector = Arc::new(DetectorStub::default());
    let camera = Arc::new(CameraStub { refuse, opens: AtomicU32::new(0) });

    let deps = SessionDeps {
        frame_source: camera.clone(),
        detector: detector.clone(),
        geometry: geometry.clone(),
        hub: hub.clone(),
        metrics: metrics.clone(),
    };
    let settings = SessionSettings {
        interval: Duration::from_millis(10),
        confidence: 0.5,
        canvas: CanvasSize::default(),
        max_connect_failures: 5,
        connect_backoff: Duration::from_millis(2),
        read_backoff: Duration::from_millis(2),
        error_backoff: Duration::from_millis(2),
    };
    let registry = SessionRegistry::new(deps, settings, Duration::from_secs(1), None);
    Harness { registry, hub, geometry, detector, camera, metrics }
}

/// Poll until `check` holds or a second has passed
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_repeated_start_creates_one_session() {
    let h = harness(false);

    let first = h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();
    let second = h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();

    assert_eq!(first, StartOutcome::Started);
    assert_eq!(second, StartOutcome::AlreadyActive);
    assert_eq!(h.registry.list_active(), vec![FloorId(1)]);
    assert_eq!(h.metrics.sessions_started_total(), 1);

    h.registry.stop_all().await;
}

#[tokio::test]
async fn test_concurrent_starts_create_one_session() {
    let h = harness(false);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = h.registry.clone();
        handles.push(tokio::spawn(async move {
            registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap()
        }));
    }
    let mut started = 0;
    for handle in handles {
        if handle.await.unwrap() == StartOutcome::Started {
            started += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(h.registry.list_active().len(), 1);
    h.registry.stop_all().await;
}

#[tokio::test]
async fn test_session_runs_and_publishes() {
    let h = harness(false);
    h.detector.persons.lock().push(PersonObservation::new(120.0, 120.0, 0.9));

    h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();
    assert!(eventually(|| h.registry.status(FloorId(1)).status == SessionStatus::Running).await);

    let latest = h.hub.get_latest(FloorId(1)).unwrap();
    assert_eq!(latest.floor_id, FloorId(1));
    assert_eq!(latest.person_count, 1);
    assert!(latest.table_occupancies[0].occupied);
    assert_eq!(latest.table_occupancies[0].min_distance, Some(7.07));

    let status = h.registry.status(FloorId(1));
    assert!(status.running);
    assert!(status.last_result_timestamp.is_some());
    assert_eq!(status.retry_count, 0);

    h.registry.stop_all().await;
}

#[tokio::test]
async fn test_unreachable_stream_fails_after_five_attempts() {
    let h = harness(true);

    h.registry.start_session(FloorId(1), "rtsp://dead-cam", CanvasSize::default()).unwrap();
    assert!(eventually(|| h.registry.status(FloorId(1)).status == SessionStatus::Failed).await);

    let status = h.registry.status(FloorId(1));
    assert!(!status.running);
    assert_eq!(status.last_error_kind, Some("stream_unavailable"));
    assert!(status.ended_at.is_some());
    assert!(status.last_error.unwrap().contains("stream unavailable"));
    assert!(matches!(
        h.registry.last_error(FloorId(1)),
        Some(DetectionError::StreamUnavailable { attempts: 5, .. })
    ));
    assert_eq!(h.camera.opens.load(Ordering::Relaxed), 5);
    assert!(!h.registry.is_running(FloorId(1)));
    assert!(h.registry.list_active().is_empty());
    assert_eq!(h.metrics.sessions_failed_total(), 1);
    assert_eq!(h.metrics.active_sessions(), 0);
}

#[tokio::test]
async fn test_stop_without_session_is_not_running() {
    let h = harness(false);
    assert_eq!(h.registry.stop_session(FloorId(42)).await, StopOutcome::NotRunning);
    assert_eq!(h.registry.status(FloorId(42)).status, SessionStatus::Idle);
}

#[tokio::test]
async fn test_stop_releases_session_and_clears_result() {
    let h = harness(false);

    h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();
    assert!(eventually(|| h.hub.get_latest(FloorId(1)).is_some()).await);

    assert_eq!(h.registry.stop_session(FloorId(1)).await, StopOutcome::Stopped);
    assert!(h.hub.get_latest(FloorId(1)).is_none());
    assert!(!h.registry.is_running(FloorId(1)));
    assert_eq!(h.registry.stop_session(FloorId(1)).await, StopOutcome::NotRunning);

    // No further frames are read once stopped
    let opens = h.camera.opens.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.camera.opens.load(Ordering::Relaxed), opens);
    assert_eq!(h.metrics.active_sessions(), 0);
}

#[tokio::test]
async fn test_zone_edits_apply_on_next_iteration() {
    let h = harness(false);
    h.detector.persons.lock().push(PersonObservation::new(520.0, 320.0, 0.9));

    h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();
    assert!(eventually(|| h.hub.get_latest(FloorId(1)).is_some()).await);
    assert!(!h.hub.get_latest(FloorId(1)).unwrap().table_occupancies[0].occupied);

    h.geometry.upsert_zone(
        FloorId(1),
        TableZone::new(TableId(1), "Window", (500.0, 300.0), (50.0, 50.0), 0.0, 2).unwrap(),
    );
    assert!(
        eventually(|| h
            .hub
            .get_latest(FloorId(1))
            .is_some_and(|r| r.table_occupancies[0].occupied))
        .await
    );

    h.registry.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_stops_every_floor() {
    let h = harness(false);
    for floor in [3, 1, 2] {
        h.registry.start_session(FloorId(floor), "rtsp://cam", CanvasSize::default()).unwrap();
    }

    let outcomes = h.registry.stop_all().await;

    assert_eq!(
        outcomes,
        vec![
            (FloorId(1), StopOutcome::Stopped),
            (FloorId(2), StopOutcome::Stopped),
            (FloorId(3), StopOutcome::Stopped),
        ]
    );
    assert!(h.registry.list_active().is_empty());
}

#[tokio::test]
async fn test_ledger_records_status_changes_once() {
    let h = harness(false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("occupancy.jsonl");
    let ledger = Arc::new(OccupancyLedger::open(&path).unwrap());
    h.hub.subscribe(Arc::new(PersistenceSubscriber::new(ledger)));
    h.detector.persons.lock().push(PersonObservation::new(120.0, 120.0, 0.9));

    h.registry.start_session(FloorId(1), "rtsp://cam", CanvasSize::default()).unwrap();
    assert!(eventually(|| h.metrics.cycles_total() >= 3).await);
    h.registry.stop_all().await;

    // Many identical cycles, one status line
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("\"occupied\""));
}
