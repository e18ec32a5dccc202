//! Shared types for the occupancy detector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for floor IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct FloorId(pub i64);

impl std::fmt::Display for FloorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for table IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TableId(pub i64);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-resolution coordinate system zones are authored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl std::fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel dimensions of a decoded camera frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Canonical table geometry in canvas space.
///
/// Only constructed through [`TableZone::new`], which enforces positive
/// width and height. Raw records from config or external stores go through
/// [`crate::domain::zone::RawTableRecord::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableZone {
    id: TableId,
    name: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    /// Radians, clockwise in image coordinates
    rotation: f64,
    capacity: u32,
}

impl TableZone {
    /// Returns None if the geometry is degenerate or non-finite
    pub fn new(
        id: TableId,
        name: impl Into<String>,
        position: (f64, f64),
        size: (f64, f64),
        rotation: f64,
        capacity: u32,
    ) -> Option<Self> {
        let (x, y) = position;
        let (width, height) = size;
        let finite = [x, y, width, height, rotation].iter().all(|v| v.is_finite());
        if !finite || width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self { id, name: name.into(), x, y, width, height, rotation, capacity })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A detected person, reduced to its bounding-box center in frame pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonObservation {
    pub center_x: f64,
    pub center_y: f64,
    pub confidence: f32,
}

impl PersonObservation {
    pub fn new(center_x: f64, center_y: f64, confidence: f32) -> Self {
        Self { center_x, center_y, confidence }
    }

    /// Build from an `[x1, y1, x2, y2]` bounding box
    pub fn from_bbox(bbox: [f64; 4], confidence: f32) -> Self {
        let [x1, y1, x2, y2] = bbox;
        Self::new((x1 + x2) / 2.0, (y1 + y2) / 2.0, confidence)
    }
}

/// How occupancy was decided for a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyMethod {
    /// Person bounding-box center falls inside the zone
    CenterPoint,
}


/// Per-table occupancy for one detection cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableOccupancy {
    #[serde(rename = "id")]
    pub table_id: TableId,
    pub name: String,
    pub occupied: bool,
    pub method: OccupancyMethod,
    /// Distance from the closest contained person to the zone center
    #[serde(rename = "distance")]
    pub min_distance: Option<f64>,
    pub person_count: u32,
}

/// Immutable snapshot of one detection cycle for a floor.
///
/// Serializes to the wire format consumed by broadcasters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub floor_id: FloorId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "persons_detected")]
    pub person_count: u32,
    #[serde(rename = "table_status")]
    pub table_occupancies: Vec<TableOccupancy>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub processing_time_ms: f64,
}

impl DetectionResult {
    pub fn occupied_count(&self) -> usize {
        self.table_occupancies.iter().filter(|t| t.occupied).count()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Round to two decimals, the precision used on the wire
#[inline]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> DetectionResult {
        DetectionResult {
            floor_id: FloorId(3),
            timestamp: Utc::now(),
            person_count: 2,
            table_occupancies: vec![
                TableOccupancy {
                    table_id: TableId(10),
                    name: "Window".to_string(),
                    occupied: true,
                    method: OccupancyMethod::CenterPoint,
                    min_distance: Some(7.07),
                    person_count: 1,
                },
                TableOccupancy {
                    table_id: TableId(11),
                    name: "Corner".to_string(),
                    occupied: false,
                    method: OccupancyMethod::CenterPoint,
                    min_distance: None,
                    person_count: 0,
                },
            ],
            frame_width: 1920,
            frame_height: 1080,
            processing_time_ms: 41.5,
        }
    }

    #[test]
    fn test_table_zone_rejects_degenerate_geometry() {
        assert!(TableZone::new(TableId(1), "t", (0.0, 0.0), (0.0, 10.0), 0.0, 2).is_none());
        assert!(TableZone::new(TableId(1), "t", (0.0, 0.0), (10.0, -1.0), 0.0, 2).is_none());
        assert!(TableZone::new(TableId(1), "t", (f64::NAN, 0.0), (10.0, 10.0), 0.0, 2).is_none());
        assert!(TableZone::new(TableId(1), "t", (0.0, 0.0), (10.0, 10.0), 0.3, 2).is_some());
    }

    #[test]
    fn test_person_from_bbox_uses_center() {
        let person = PersonObservation::from_bbox([100.0, 200.0, 140.0, 300.0], 0.9);
        assert_eq!(person.center_x, 120.0);
        assert_eq!(person.center_y, 250.0);
    }

    #[test]
    fn test_wire_format_field_names() {
        let json: serde_json::Value = serde_json::from_str(&sample_result().to_json()).unwrap();

        assert_eq!(json["floor_id"], 3);
        assert_eq!(json["persons_detected"], 2);
        assert_eq!(json["frame_width"], 1920);
        assert_eq!(json["frame_height"], 1080);
        assert_eq!(json["processing_time_ms"], 41.5);
        assert!(json["timestamp"].as_str().unwrap().contains('T'));

        let first = &json["table_status"][0];
        assert_eq!(first["id"], 10);
        assert_eq!(first["name"], "Window");
        assert_eq!(first["occupied"], true);
        assert_eq!(first["method"], "center_point");
        assert_eq!(first["distance"], 7.07);
        assert_eq!(first["person_count"], 1);
        assert!(json["table_status"][1]["distance"].is_null());
    }

    #[test]
    fn test_occupied_count() {
        assert_eq!(sample_result().occupied_count(), 1);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(7.0710678), 7.07);
        assert_eq!(round2(0.005), 0.01);
    }
}
