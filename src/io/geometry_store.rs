//! Table geometry lookup
//!
//! Sessions read a fresh zone snapshot from the store on every iteration,
//! so edits made here show up within one detection interval.

use crate::domain::types::{FloorId, TableId, TableZone};
use crate::domain::zone::{normalize_all, RawTableRecord, ZoneError};
use crate::infra::config::Config;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

/// Read-only view of table zones per floor
#[async_trait]
pub trait GeometryStore: Send + Sync {
    /// Current zones for a floor. An unknown floor has no zones.
    async fn get_zones(&self, floor_id: FloorId) -> anyhow::Result<Vec<TableZone>>;
}

/// Geometry store held in memory, seeded from config
#[derive(Default)]
pub struct InMemoryGeometryStore {
    floors: RwLock<FxHashMap<FloorId, Vec<TableZone>>>,
}

impl InMemoryGeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        for floor in config.floors() {
            let errors = store.replace_floor(floor.floor_id(), &floor.tables);
            info!(
                floor_id = %floor.id,
                tables = floor.tables.len() - errors.len(),
                rejected = errors.len(),
                "floor_geometry_loaded"
            );
        }
        store
    }

    /// Replace every zone of a floor. Malformed records are skipped and
    /// returned.
    pub fn replace_floor(&self, floor_id: FloorId, records: &[RawTableRecord]) -> Vec<ZoneError> {
        let (zones, errors) = normalize_all(records);
        for error in &errors {
            warn!(floor_id = %floor_id, error = %error, "table_record_rejected");
        }
        self.floors.write().insert(floor_id, zones);
        errors
    }

    /// Insert a zone or replace the one with the same table id
    pub fn upsert_zone(&self, floor_id: FloorId, zone: TableZone) {
        let mut floors = self.floors.write();
        let zones = floors.entry(floor_id).or_default();
        match zones.iter_mut().find(|z| z.id() == zone.id()) {
            Some(existing) => *existing = zone,
            None => zones.push(zone),
        }
    }

    /// Returns true if the zone existed
    pub fn remove_zone(&self, floor_id: FloorId, table_id: TableId) -> bool {
        let mut floors = self.floors.write();
        let Some(zones) = floors.get_mut(&floor_id) else {
            return false;
        };
        let before = zones.len();
        zones.retain(|z| z.id() != table_id);
        zones.len() != before
    }

    pub fn zones(&self, floor_id: FloorId) -> Vec<TableZone> {
        self.floors.read().get(&floor_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GeometryStore for InMemoryGeometryStore {
    async fn get_zones(&self, floor_id: FloorId) -> anyhow::Result<Vec<TableZone>> {
        Ok(self.zones(floor_id))
    }
}
