//! Occupancy ledger - writes table status changes to file
//!
//! Changes are written in JSONL format (one JSON object per line). The
//! ledger remembers the last status written for every table, so applying
//! the same occupancy twice writes nothing. On open, an existing file is
//! replayed to restore that memory across restarts.

use crate::domain::types::{FloorId, TableId, TableOccupancy};
use crate::services::result_hub::OccupancySink;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persisted table status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Available,
    Occupied,
}

impl TableStatus {
    pub fn from_occupied(occupied: bool) -> Self {
        if occupied {
            TableStatus::Occupied
        } else {
            TableStatus::Available
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Available => "available",
            TableStatus::Occupied => "occupied",
        }
    }
}

/// One line of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub ts: DateTime<Utc>,
    pub floor_id: FloorId,
    pub table_id: TableId,
    pub name: String,
    pub status: TableStatus,
}

/// JSONL ledger of table status changes
pub struct OccupancyLedger {
    file_path: PathBuf,
    last_status: Mutex<FxHashMap<(FloorId, TableId), TableStatus>>,
}

impl OccupancyLedger {
    /// Open a ledger, replaying any existing file
    pub fn open<P: AsRef<Path>>(file_path: P) -> anyhow::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let mut last_status = FxHashMap::default();

        if file_path.exists() {
            let file = std::fs::File::open(&file_path)
                .with_context(|| format!("Failed to open ledger {}", file_path.display()))?;
            let mut skipped = 0usize;
            for line in BufReader::new(file).lines() {
                let line = line.with_context(|| format!("Failed to read ledger {}", file_path.display()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StatusChange>(&line) {
                    Ok(change) => {
                        last_status.insert((change.floor_id, change.table_id), change.status);
                    }
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(file = %file_path.display(), skipped = skipped, "ledger_lines_skipped");
            }
        }

        info!(file_path = %file_path.display(), tables = last_status.len(), "ledger_initialized");
        Ok(Self { file_path, last_status: Mutex::new(last_status) })
    }

    /// Last status written for a table
    pub fn status(&self, floor_id: FloorId, table_id: TableId) -> Option<TableStatus> {
        self.last_status.lock().get(&(floor_id, table_id)).copied()
    }

    /// Record occupancy, appending a line for every table whose status changed.
    /// Returns the number of lines written.
    pub fn record(&self, floor_id: FloorId, occupancies: &[TableOccupancy]) -> anyhow::Result<usize> {
        // Lock spans the append: compare, write and update are one step
        let mut last_status = self.last_status.lock();

        let ts = Utc::now();
        let changes: Vec<StatusChange> = occupancies
            .iter()
            .filter_map(|occ| {
                let status = TableStatus::from_occupied(occ.occupied);
                match last_status.get(&(floor_id, occ.table_id)) {
                    Some(previous) if *previous == status => None,
                    _ => Some(StatusChange {
                        ts,
                        floor_id,
                        table_id: occ.table_id,
                        name: occ.name.clone(),
                        status,
                    }),
                }
            })
            .collect();

        if changes.is_empty() {
            return Ok(0);
        }

        let mut lines = String::new();
        for change in &changes {
            lines.push_str(&serde_json::to_string(change)?);
            lines.push('\n');
        }
        self.append(&lines)
            .with_context(|| format!("Failed to append to ledger {}", self.file_path.display()))?;

        for change in &changes {
            info!(
                floor_id = %change.floor_id,
                table_id = %change.table_id,
                status = change.status.as_str(),
                "table_status_changed"
            );
            last_status.insert((change.floor_id, change.table_id), change.status);
        }
        Ok(changes.len())
    }

    fn append(&self, lines: &str) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        file.write_all(lines.as_bytes())?;
        debug!(file = %self.file_path.display(), bytes = lines.len(), "ledger_written");
        Ok(())
    }
}

impl OccupancySink for OccupancyLedger {
    fn apply_occupancy(&self, floor_id: FloorId, occupancies: &[TableOccupancy]) -> anyhow::Result<()> {
        self.record(floor_id, occupancies).map(|_| ())
    }
}
