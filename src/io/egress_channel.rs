//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way for session tasks to hand results to the MQTT
//! publisher. Uses a bounded mpsc channel to prevent unbounded memory growth;
//! when the channel is full the message is dropped and counted.

use crate::domain::types::{DetectionResult, FloorId};
use crate::infra::metrics::Metrics;
use crate::services::result_hub::Broadcaster;
use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Detection result in wire format
    Detection(DetectionPayload),
    /// Session lifecycle change
    SessionEvent(SessionEventPayload),
}

/// Pre-serialized detection result for one floor
#[derive(Debug)]
pub struct DetectionPayload {
    pub floor_id: FloorId,
    pub json: String,
}

/// Session lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Started,
    Stopped,
    Failed,
    StopTimedOut,
}

/// Payload for session lifecycle events
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventPayload {
    pub site: String,
    pub floor_id: FloorId,
    pub ts: DateTime<Utc>,
    pub event: SessionEventKind,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sender handle for egress messages
///
/// Clone this to share across session tasks.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    /// Non-blocking send. A full channel drops the message and counts it;
    /// a closed channel is reported to the caller.
    fn try_send(&self, msg: EgressMessage) -> anyhow::Result<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.record_egress_dropped();
                debug!("egress_channel_full");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => bail!("egress channel closed"),
        }
    }

    /// Send a session lifecycle event
    pub fn send_session_event(
        &self,
        floor_id: FloorId,
        session_id: Uuid,
        event: SessionEventKind,
        error: Option<String>,
    ) {
        let payload = SessionEventPayload {
            site: self.site_id.clone(),
            floor_id,
            ts: Utc::now(),
            event,
            session_id,
            error,
        };
        let _ = self.try_send(EgressMessage::SessionEvent(payload));
    }
}

impl Broadcaster for EgressSender {
    fn notify(&self, floor_id: FloorId, result: &DetectionResult) -> anyhow::Result<()> {
        self.try_send(EgressMessage::Detection(DetectionPayload { floor_id, json: result.to_json() }))
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, metrics), rx)
}
