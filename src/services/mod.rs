//! Services - detection logic and session lifecycle
//!
//! - `occupancy` - Person-to-table resolution
//! - `session` - Per-floor detection loop
//! - `registry` - Session ownership, start/stop/status
//! - `result_hub` - Latest result per floor and subscriber fan-out

pub mod occupancy;
pub mod registry;
pub mod result_hub;
pub mod session;

pub use registry::{SessionRegistry, SessionStatusReport, StartOutcome, StopOutcome};
pub use result_hub::{
    BroadcastSubscriber, Broadcaster, OccupancySink, PersistenceSubscriber, ResultHub, ResultSubscriber,
};
pub use session::{DetectionSession, SessionDeps, SessionSettings, SessionStatus};
