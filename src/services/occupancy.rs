//! Occupancy resolution
//!
//! Zones are authored on a fixed canvas; detections come in frame pixels.
//! Each zone rectangle is scaled into frame space per axis, then every
//! person center is tested against it:
//!
//! - rotation == 0: plain bounds test, edges inclusive
//! - rotation != 0: the point is moved into the rectangle's own unrotated
//!   frame (translate to the rectangle center, rotate by -rotation) and
//!   tested against the half extents
//!
//! A zone is occupied when at least one center lands inside it. For
//! occupied zones the distance from the closest center to the rectangle
//! center is reported, rounded to two decimals.

use crate::domain::error::DetectionError;
use crate::domain::types::{
    round2, CanvasSize, FrameSize, OccupancyMethod, PersonObservation, TableOccupancy, TableZone,
};

/// Absorbs trigonometric rounding on rotated edges
const ROTATION_EPSILON: f64 = 1e-9;

/// A zone rectangle in frame pixels
#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameRect {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    rotation: f64,
}

impl FrameRect {
    fn from_zone(zone: &TableZone, scale_x: f64, scale_y: f64) -> Self {
        let (x, y) = zone.position();
        Self {
            x1: x * scale_x,
            y1: y * scale_y,
            x2: (x + zone.width()) * scale_x,
            y2: (y + zone.height()) * scale_y,
            rotation: zone.rotation(),
        }
    }

    fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    fn contains(&self, px: f64, py: f64) -> bool {
        if self.rotation == 0.0 {
            return px >= self.x1 && px <= self.x2 && py >= self.y1 && py <= self.y2;
        }

        let (cx, cy) = self.center();
        let half_w = (self.x2 - self.x1) / 2.0;
        let half_h = (self.y2 - self.y1) / 2.0;

        let (tx, ty) = (px - cx, py - cy);
        let (sin, cos) = (-self.rotation).sin_cos();
        let local_x = tx * cos - ty * sin;
        let local_y = tx * sin + ty * cos;

        local_x.abs() <= half_w + ROTATION_EPSILON && local_y.abs() <= half_h + ROTATION_EPSILON
    }
}

fn scale_factors(frame: FrameSize, canvas: CanvasSize) -> Result<(f64, f64), DetectionError> {
    if !canvas.is_valid() {
        return Err(DetectionError::ResolverFailure(format!("invalid canvas {canvas}")));
    }
    let scale_x = frame.width as f64 / canvas.width as f64;
    let scale_y = frame.height as f64 / canvas.height as f64;
    if !scale_x.is_finite() || !scale_y.is_finite() || scale_x <= 0.0 || scale_y <= 0.0 {
        return Err(DetectionError::ResolverFailure(format!(
            "unusable frame size {}x{}",
            frame.width, frame.height
        )));
    }
    Ok((scale_x, scale_y))
}

fn unoccupied(zone: &TableZone) -> TableOccupancy {
    TableOccupancy {
        table_id: zone.id(),
        name: zone.name().to_string(),
        occupied: false,
        method: OccupancyMethod::CenterPoint,
        min_distance: None,
        person_count: 0,
    }
}

/// Resolve per-table occupancy for one frame.
///
/// Output order follows `zones`.
pub fn resolve(
    frame: FrameSize,
    zones: &[TableZone],
    persons: &[PersonObservation],
    canvas: CanvasSize,
) -> Result<Vec<TableOccupancy>, DetectionError> {
    if zones.is_empty() {
        return Ok(Vec::new());
    }
    if persons.is_empty() {
        return Ok(zones.iter().map(unoccupied).collect());
    }

    if let Some(bad) = persons.iter().find(|p| !p.center_x.is_finite() || !p.center_y.is_finite()) {
        return Err(DetectionError::ResolverFailure(format!(
            "non-finite person center ({}, {})",
            bad.center_x, bad.center_y
        )));
    }
    let (scale_x, scale_y) = scale_factors(frame, canvas)?;

    let occupancies = zones
        .iter()
        .map(|zone| {
            let rect = FrameRect::from_zone(zone, scale_x, scale_y);
            let (cx, cy) = rect.center();

            let mut count = 0u32;
            let mut min_distance: Option<f64> = None;
            for person in persons {
                if !rect.contains(person.center_x, person.center_y) {
                    continue;
                }
                count += 1;
                let distance = (person.center_x - cx).hypot(person.center_y - cy);
                min_distance = Some(min_distance.map_or(distance, |d| d.min(distance)));
            }

            TableOccupancy {
                table_id: zone.id(),
                name: zone.name().to_string(),
                occupied: count > 0,
                method: OccupancyMethod::CenterPoint,
                min_distance: min_distance.map(round2),
                person_count: count,
            }
        })
        .collect();

    Ok(occupancies)
}
