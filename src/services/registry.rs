//! Session registry
//!
//! Owns every detection session, at most one per floor. Start is a
//! check-and-insert under the sessions lock, so concurrent starts for the
//! same floor cannot both spawn a task.
//!
//! Each session runs as two tasks: the loop itself and a supervisor that
//! awaits it and reports the exit back. The supervisor holds only a weak
//! reference to the registry.

use crate::domain::error::DetectionError;
use crate::domain::types::{CanvasSize, FloorId};
use crate::io::egress_channel::{EgressSender, SessionEventKind};
use crate::services::session::{
    DetectionSession, SessionDeps, SessionExit, SessionObserver, SessionSettings, SessionState,
    SessionStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A session already exists for the floor; nothing was changed
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Was running and released its resources
    Stopped,
    /// Was running but did not exit in time and was aborted
    TimedOut,
    NotRunning,
}

/// Status payload for one floor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub floor_id: FloorId,
    pub running: bool,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_result_timestamp: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Machine-readable kind of `last_error`, e.g. `stream_unavailable`
    pub last_error_kind: Option<&'static str>,
    /// When a failed session ended
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub session_id: Option<Uuid>,
}

struct SessionControl {
    cancel: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    session_abort: AbortHandle,
}

struct SessionEntry {
    state: SessionState,
    /// None once the session has stopped or failed
    control: Option<SessionControl>,
}

struct RegistryInner {
    sessions: Mutex<FxHashMap<FloorId, SessionEntry>>,
    deps: SessionDeps,
    settings: SessionSettings,
    stop_timeout: Duration,
    egress: Option<EgressSender>,
}

impl RegistryInner {
    fn emit(&self, floor_id: FloorId, session_id: Uuid, kind: SessionEventKind, error: Option<&DetectionError>) {
        if let Some(egress) = &self.egress {
            egress.send_session_event(floor_id, session_id, kind, error.map(|e| e.to_string()));
        }
    }

    /// Called by the supervisor when a session task ends on its own
    fn session_finished(&self, floor_id: FloorId, session_id: Uuid, exit: SessionExit) {
        let SessionExit::Failed(err) = exit else {
            // Clean exits only follow a stop, which does its own cleanup
            return;
        };

        {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(&floor_id) else {
                return;
            };
            if entry.state.session_id != session_id || entry.state.status == SessionStatus::Stopping {
                return;
            }
            entry.state.status = SessionStatus::Failed;
            entry.state.last_error = Some(err.clone());
            entry.state.ended_at = Some(Utc::now());
            entry.control = None;
        }

        self.deps.metrics.record_session_ended(floor_id, true);
        error!(
            floor_id = %floor_id,
            session_id = %session_id,
            kind = err.kind(),
            error = %err,
            "session_failed"
        );
        self.emit(floor_id, session_id, SessionEventKind::Failed, Some(&err));
    }
}

/// Feeds session progress back into the registry entry
struct RegistryObserver {
    inner: Weak<RegistryInner>,
    floor_id: FloorId,
    session_id: Uuid,
}

impl RegistryObserver {
    fn with_state(&self, f: impl FnOnce(&mut SessionState)) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut sessions = inner.sessions.lock();
        if let Some(entry) = sessions.get_mut(&self.floor_id) {
            if entry.state.session_id == self.session_id {
                f(&mut entry.state);
            }
        }
    }
}

impl SessionObserver for RegistryObserver {
    fn on_published(&self, _timestamp: DateTime<Utc>) {
        let floor_id = self.floor_id;
        self.with_state(|state| {
            state.retry_count = 0;
            if state.status == SessionStatus::Starting {
                state.status = SessionStatus::Running;
                info!(floor_id = %floor_id, "session_running");
            }
        });
    }

    fn on_transient_error(&self, error: &DetectionError, retry_count: u32) {
        self.with_state(|state| {
            state.retry_count = retry_count;
            state.last_error = Some(error.clone());
        });
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "session task panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        deps: SessionDeps,
        settings: SessionSettings,
        stop_timeout: Duration,
        egress: Option<EgressSender>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(FxHashMap::default()),
                deps,
                settings,
                stop_timeout,
                egress,
            }),
        }
    }

    /// Start detection for a floor. Must be called inside a tokio runtime.
    ///
    /// A floor with a starting, running or stopping session is left alone
    /// and reported as `AlreadyActive`. A failed record is replaced.
    pub fn start_session(
        &self,
        floor_id: FloorId,
        endpoint: &str,
        canvas: CanvasSize,
    ) -> Result<StartOutcome, DetectionError> {
        if !canvas.is_valid() {
            return Err(DetectionError::InvalidCanvas { width: canvas.width, height: canvas.height });
        }

        let session_id = Uuid::now_v7();
        {
            let mut sessions = self.inner.sessions.lock();
            if let Some(entry) = sessions.get(&floor_id) {
                if entry.control.is_some() || entry.state.status == SessionStatus::Stopping {
                    info!(floor_id = %floor_id, status = entry.state.status.as_str(), "session_already_active");
                    return Ok(StartOutcome::AlreadyActive);
                }
            }

            let mut settings = self.inner.settings.clone();
            settings.canvas = canvas;
            let observer = Arc::new(RegistryObserver {
                inner: Arc::downgrade(&self.inner),
                floor_id,
                session_id,
            });
            let session = DetectionSession::new(floor_id, session_id, endpoint, settings, &self.inner.deps, observer);

            let (cancel, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(session.run(cancel_rx));
            let session_abort = task.abort_handle();

            let weak = Arc::downgrade(&self.inner);
            let supervisor = tokio::spawn(async move {
                let exit = match task.await {
                    Ok(exit) => exit,
                    Err(e) if e.is_cancelled() => SessionExit::Stopped,
                    Err(e) => SessionExit::Failed(DetectionError::Internal(join_error_message(e))),
                };
                if let Some(inner) = weak.upgrade() {
                    inner.session_finished(floor_id, session_id, exit);
                }
            });

            sessions.insert(
                floor_id,
                SessionEntry {
                    state: SessionState::starting(session_id),
                    control: Some(SessionControl { cancel, supervisor, session_abort }),
                },
            );
        }

        self.inner.deps.metrics.record_session_started();
        info!(
            floor_id = %floor_id,
            session_id = %session_id,
            endpoint = %endpoint,
            canvas = %canvas,
            "session_started"
        );
        self.inner.emit(floor_id, session_id, SessionEventKind::Started, None);
        Ok(StartOutcome::Started)
    }

    /// Signal the floor's session to stop and wait for it, up to the stop
    /// timeout. A session that overruns is aborted.
    pub async fn stop_session(&self, floor_id: FloorId) -> StopOutcome {
        let (control, session_id) = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(&floor_id) else {
                return StopOutcome::NotRunning;
            };
            if !entry.state.status.is_active() {
                return StopOutcome::NotRunning;
            }
            let Some(control) = entry.control.take() else {
                return StopOutcome::NotRunning;
            };
            entry.state.status = SessionStatus::Stopping;
            (control, entry.state.session_id)
        };

        info!(floor_id = %floor_id, session_id = %session_id, "session_stopping");
        let SessionControl { cancel, supervisor, session_abort } = control;
        // A send error means the loop is already gone
        let _ = cancel.send(true);

        let outcome = match tokio::time::timeout(self.inner.stop_timeout, supervisor).await {
            Ok(_) => StopOutcome::Stopped,
            Err(_) => {
                session_abort.abort();
                warn!(
                    floor_id = %floor_id,
                    session_id = %session_id,
                    timeout_ms = self.inner.stop_timeout.as_millis() as u64,
                    "session_stop_timed_out"
                );
                StopOutcome::TimedOut
            }
        };

        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.get(&floor_id).is_some_and(|e| e.state.session_id == session_id) {
                sessions.remove(&floor_id);
            }
        }
        self.inner.deps.hub.clear(floor_id);
        self.inner.deps.metrics.record_session_ended(floor_id, false);

        let kind = match outcome {
            StopOutcome::TimedOut => SessionEventKind::StopTimedOut,
            _ => SessionEventKind::Stopped,
        };
        info!(floor_id = %floor_id, session_id = %session_id, outcome = ?outcome, "session_stopped");
        self.inner.emit(floor_id, session_id, kind, None);
        outcome
    }

    /// True while the floor's session is starting or running
    pub fn is_running(&self, floor_id: FloorId) -> bool {
        self.inner
            .sessions
            .lock()
            .get(&floor_id)
            .is_some_and(|e| e.state.status.is_active())
    }

    /// Floors with a starting or running session, ascending
    pub fn list_active(&self) -> Vec<FloorId> {
        let mut floors: Vec<FloorId> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, e)| e.state.status.is_active())
            .map(|(floor_id, _)| *floor_id)
            .collect();
        floors.sort();
        floors
    }

    pub fn status(&self, floor_id: FloorId) -> SessionStatusReport {
        let last_result_timestamp = self.inner.deps.hub.get_latest(floor_id).map(|r| r.timestamp);
        let sessions = self.inner.sessions.lock();
        match sessions.get(&floor_id) {
            Some(entry) => SessionStatusReport {
                floor_id,
                running: entry.state.status.is_active(),
                status: entry.state.status,
                started_at: Some(entry.state.started_at),
                last_result_timestamp,
                last_error: entry.state.last_error.as_ref().map(|e| e.to_string()),
                last_error_kind: entry.state.last_error.as_ref().map(|e| e.kind()),
                ended_at: entry.state.ended_at,
                retry_count: entry.state.retry_count,
                session_id: Some(entry.state.session_id),
            },
            None => SessionStatusReport {
                floor_id,
                running: false,
                status: SessionStatus::Idle,
                started_at: None,
                last_result_timestamp,
                last_error: None,
                last_error_kind: None,
                ended_at: None,
                retry_count: 0,
                session_id: None,
            },
        }
    }

    /// Kind of the last error recorded for a floor
    pub fn last_error(&self, floor_id: FloorId) -> Option<DetectionError> {
        self.inner.sessions.lock().get(&floor_id).and_then(|e| e.state.last_error.clone())
    }

    /// Stop every session concurrently. Returns the floors stopped with
    /// their outcome, ascending.
    pub async fn stop_all(&self) -> Vec<(FloorId, StopOutcome)> {
        let floors = self.list_active();
        let mut set = JoinSet::new();
        for floor_id in floors {
            let registry = self.clone();
            set.spawn(async move { (floor_id, registry.stop_session(floor_id).await) });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "stop_task_failed"),
            }
        }
        outcomes.sort_by_key(|(floor_id, _)| *floor_id);
        info!(stopped = outcomes.len(), "all_sessions_stopped");
        outcomes
    }
}
