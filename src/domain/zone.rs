//! Table geometry normalization
//!
//! Stored table records come in three shapes:
//! - `coords = [x, y]` with separate `width`/`height`
//! - `coords = [x_min, y_min, x_max, y_max]`
//! - `coords = { x, y, width, height }`
//!
//! All of them are normalized here into a `TableZone` (position + size +
//! rotation). Anything else is rejected with a `ZoneError`.

use crate::domain::types::{TableId, TableZone};
use serde::Deserialize;
use thiserror::Error;

/// Default capacity when a record omits it
const DEFAULT_CAPACITY: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCoords {
    Points(Vec<f64>),
    Rect {
        x: f64,
        y: f64,
        #[serde(default)]
        width: Option<f64>,
        #[serde(default)]
        height: Option<f64>,
    },
}

/// Table record as stored by the CRUD side, before normalization
#[derive(Debug, Clone, Deserialize)]
pub struct RawTableRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub coords: Option<RawCoords>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub rotation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZoneError {
    #[error("table {0}: missing coords")]
    MissingCoords(i64),
    #[error("table {id}: unsupported coords with {len} values")]
    UnsupportedShape { id: i64, len: usize },
    #[error("table {0}: missing width or height")]
    MissingSize(i64),
    #[error("table {id}: degenerate geometry (width={width}, height={height})")]
    Degenerate { id: i64, width: f64, height: f64 },
}

impl RawTableRecord {
    /// Normalize into the canonical zone representation
    pub fn normalize(&self) -> Result<TableZone, ZoneError> {
        let coords = self.coords.as_ref().ok_or(ZoneError::MissingCoords(self.id))?;

        let (x, y, width, height) = match coords {
            RawCoords::Points(points) if points.len() >= 4 => {
                (points[0], points[1], points[2] - points[0], points[3] - points[1])
            }
            RawCoords::Points(points) if points.len() == 2 => {
                let (Some(w), Some(h)) = (self.width, self.height) else {
                    return Err(ZoneError::MissingSize(self.id));
                };
                (points[0], points[1], w, h)
            }
            RawCoords::Points(points) => {
                return Err(ZoneError::UnsupportedShape { id: self.id, len: points.len() });
            }
            RawCoords::Rect { x, y, width, height } => {
                // Inline size wins over the separate columns
                let (Some(w), Some(h)) = (width.or(self.width), height.or(self.height)) else {
                    return Err(ZoneError::MissingSize(self.id));
                };
                (*x, *y, w, h)
            }
        };

        let name = self.name.clone().unwrap_or_else(|| format!("Table {}", self.id));
        TableZone::new(
            TableId(self.id),
            name,
            (x, y),
            (width, height),
            self.rotation.unwrap_or(0.0),
            self.capacity.unwrap_or(DEFAULT_CAPACITY),
        )
        .ok_or(ZoneError::Degenerate { id: self.id, width, height })
    }
}

/// Normalize a batch of records, keeping the valid ones
///
/// Returns the zones plus the errors for rejected records so the caller can
/// log them.
pub fn normalize_all(records: &[RawTableRecord]) -> (Vec<TableZone>, Vec<ZoneError>) {
    let mut zones = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    for record in records {
        match record.normalize() {
            Ok(zone) => zones.push(zone),
            Err(e) => errors.push(e),
        }
    }
    (zones, errors)
}
