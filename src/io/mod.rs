//! IO modules - external system interfaces
//!
//! - `frame_source` - Camera frame acquisition (ffmpeg, HTTP snapshots)
//! - `detector` - Person detection service client
//! - `geometry_store` - Table zones per floor
//! - `egress` - Table status ledger (JSONL)
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for results and session events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod detector;
pub mod egress;
pub mod egress_channel;
pub mod frame_source;
pub mod geometry_store;
pub mod mqtt_egress;
pub mod prometheus;

pub use detector::{HttpPersonDetector, PersonDetector};
pub use egress::OccupancyLedger;
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender, SessionEventKind};
pub use frame_source::{EndpointFrameSource, Frame, FrameAcquirer, FrameReadError, FrameSource};
pub use geometry_store::{GeometryStore, InMemoryGeometryStore};
pub use mqtt_egress::MqttPublisher;
