//! Domain models - core occupancy types
//!
//! This module contains the canonical data types used throughout the system:
//! - `TableZone` - a table's detection rectangle in canvas space
//! - `DetectionResult` - one floor's occupancy snapshot (wire format)
//! - `RawTableRecord` - un-normalized table geometry from stores/config
//! - `DetectionError` - session error taxonomy

pub mod error;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use error::DetectionError;
pub use types::{
    CanvasSize, DetectionResult, FloorId, FrameSize, OccupancyMethod, PersonObservation, TableId,
    TableOccupancy, TableZone,
};
pub use zone::{RawTableRecord, ZoneError};
