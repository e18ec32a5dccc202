//! Result cache and notifier
//!
//! Holds the latest `DetectionResult` per floor and fans every publish out
//! to subscribers. Readers take the read lock for a map lookup only, so a
//! slow subscriber never blocks `get_latest`.
//!
//! Subscriber failures (errors or panics) are logged and counted. They
//! never reach the publishing session or the other subscribers.

use crate::domain::error::DetectionError;
use crate::domain::types::{DetectionResult, FloorId, TableOccupancy};
use crate::infra::metrics::Metrics;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Receives every result published for the floors it subscribed to
pub trait ResultSubscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_result(&self, result: &DetectionResult) -> anyhow::Result<()>;
}

/// Pushes results to live consumers
pub trait Broadcaster: Send + Sync {
    fn notify(&self, floor_id: FloorId, result: &DetectionResult) -> anyhow::Result<()>;
}

/// Stores table status. Must tolerate repeated identical input.
pub trait OccupancySink: Send + Sync {
    fn apply_occupancy(&self, floor_id: FloorId, occupancies: &[TableOccupancy]) -> anyhow::Result<()>;
}

/// Adapts a [`Broadcaster`] to the hub
pub struct BroadcastSubscriber {
    broadcaster: Arc<dyn Broadcaster>,
}

impl BroadcastSubscriber {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl ResultSubscriber for BroadcastSubscriber {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn on_result(&self, result: &DetectionResult) -> anyhow::Result<()> {
        self.broadcaster.notify(result.floor_id, result)
    }
}

/// Adapts an [`OccupancySink`] to the hub
pub struct PersistenceSubscriber {
    sink: Arc<dyn OccupancySink>,
}

impl PersistenceSubscriber {
    pub fn new(sink: Arc<dyn OccupancySink>) -> Self {
        Self { sink }
    }
}

impl ResultSubscriber for PersistenceSubscriber {
    fn name(&self) -> &str {
        "persistence"
    }

    fn on_result(&self, result: &DetectionResult) -> anyhow::Result<()> {
        self.sink.apply_occupancy(result.floor_id, &result.table_occupancies)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// None receives every floor
    floor_id: Option<FloorId>,
    subscriber: Arc<dyn ResultSubscriber>,
}

pub struct ResultHub {
    latest: RwLock<FxHashMap<FloorId, Arc<DetectionResult>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ResultHub {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            latest: RwLock::new(FxHashMap::default()),
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Subscribe to results of every floor
    pub fn subscribe(&self, subscriber: Arc<dyn ResultSubscriber>) -> SubscriptionId {
        self.add_subscription(None, subscriber)
    }

    /// Subscribe to results of one floor
    pub fn subscribe_floor(&self, floor_id: FloorId, subscriber: Arc<dyn ResultSubscriber>) -> SubscriptionId {
        self.add_subscription(Some(floor_id), subscriber)
    }

    fn add_subscription(
        &self,
        floor_id: Option<FloorId>,
        subscriber: Arc<dyn ResultSubscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(subscriber = subscriber.name(), id = id.0, "subscriber_added");
        self.subscriptions.write().push(Subscription { id, floor_id, subscriber });
        id
    }

    /// Returns true if the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Replace the floor's latest result and notify subscribers.
    ///
    /// Returns the failures of individual subscribers for inspection; they
    /// are already logged and counted.
    pub fn publish(&self, floor_id: FloorId, result: DetectionResult) -> Vec<DetectionError> {
        let result = Arc::new(result);
        self.latest.write().insert(floor_id, result.clone());

        // Copy out of the lock so delivery never holds it
        let targets: Vec<Arc<dyn ResultSubscriber>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.floor_id.map_or(true, |f| f == floor_id))
            .map(|s| s.subscriber.clone())
            .collect();

        let mut failures = Vec::new();
        for subscriber in targets {
            let reason = match catch_unwind(AssertUnwindSafe(|| subscriber.on_result(&result))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(floor_id = %floor_id, subscriber = subscriber.name(), error = %format!("{e:#}"), "subscriber_failed");
                    format!("{e:#}")
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(floor_id = %floor_id, subscriber = subscriber.name(), panic = %reason, "subscriber_panicked");
                    reason
                }
            };
            self.metrics.record_subscriber_failure();
            failures.push(DetectionError::SubscriberFailure {
                subscriber: subscriber.name().to_string(),
                reason,
            });
        }
        failures
    }

    pub fn get_latest(&self, floor_id: FloorId) -> Option<Arc<DetectionResult>> {
        self.latest.read().get(&floor_id).cloned()
    }

    /// Drop the floor's cached result
    pub fn clear(&self, floor_id: FloorId) -> bool {
        self.latest.write().remove(&floor_id).is_some()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
