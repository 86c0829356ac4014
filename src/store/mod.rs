//! Crash-safe persistence: an append-only event log plus a
//! latest-snapshot record, behind one trait with memory, file and sqlite
//! backends.

pub mod file;
pub mod memory;
pub mod sqlite;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::incident::SingleLegIncident;
use crate::model::plan::ExecutionPlan;
use crate::model::position::Position;
use crate::venues::FundingPayment;

/// Bump when the persisted shape changes; loaders reject newer versions.
pub const SCHEMA_VERSION: u32 = 1;

/// One entry in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredEvent {
    PlanSubmitted { plan: Box<ExecutionPlan> },
    PairOpened { pair_id: Uuid, positions: Vec<Position> },
    PairClosing { pair_id: Uuid, reason: String },
    PairClosed { pair_id: Uuid, realized_pnl: f64 },
    PairFailed { pair_id: Uuid, reason: String },
    IncidentRaised { incident: SingleLegIncident },
    IncidentResolved { incident_id: Uuid },
    FundingCollected { venue: String, payment: FundingPayment },
    MetricsReset { timestamp: i64 },
    Reconciled { ghosts_dropped: u32, strays_seen: u32, timestamp: i64 },
}

/// Latest state snapshot, written on shutdown and after notable
/// transitions. Restart loads this, then reconciles against venues before
/// submitting anything new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeeperSnapshot {
    pub schema_version: u32,
    pub positions: Vec<Position>,
    pub incidents: Vec<SingleLegIncident>,
    /// Realized funding income accumulated since the last metrics reset.
    pub realized_funding: f64,
    /// Realized close PnL accumulated since the last metrics reset.
    pub realized_pnl: f64,
    /// Unix seconds of the snapshot.
    pub saved_at: i64,
}

pub trait Store: Send + Sync {
    fn append(&self, event: &StoredEvent) -> Result<()>;

    fn save_snapshot(&self, snapshot: &KeeperSnapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<KeeperSnapshot>>;

    /// Full event log, oldest first. Memory and file backends replay from
    /// their buffers; sqlite reads the events table.
    fn load_events(&self) -> Result<Vec<StoredEvent>>;
}
