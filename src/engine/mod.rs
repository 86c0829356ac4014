//! Two-legged execution state machine.
//!
//! The engine task is the single writer to the pair/position set. Keeper
//! loops talk to it through a command channel; venue I/O runs in spawned
//! per-pair tasks that report back as internal commands, so transitions for
//! one pair are serialized while different pairs proceed in parallel.
//! Readers get lock-free snapshots off a watch channel.

pub mod incident;
pub mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::keeper::metrics::SharedMetrics;
use crate::model::plan::{ExecutionPlan, OrderSpec, OrderType, Tif};
use crate::model::position::{Position, PositionSide, PositionStatus};
use crate::model::units::{BaseQty, Price, Usd};
use crate::model::{Side, VenueId};
use crate::store::{Store, StoredEvent};
use crate::venues::{OrderAck, OrderRequest, OrderStatus, PerpVenue, VenuePosition, VenueError};

use incident::SingleLegIncident;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max |long − short| / avg before a rebalance is forced.
    pub drift_limit: f64,
    /// How long a lagging leg may hang before the filled side is flattened.
    pub partial_timeout: Duration,
    /// Auto-close venue positions we do not recognize. Risky for positions
    /// opened out-of-band, so it defaults off.
    pub close_strays: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            drift_limit: 0.02,
            partial_timeout: Duration::from_secs(60),
            close_strays: false,
        }
    }
}

// ── Pair state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Submitting,
    Partial,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Tracked order state for one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegStatus {
    pub venue: VenueId,
    pub side: Side,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub error: Option<String>,
}

impl LegStatus {
    fn from_spec(spec: &OrderSpec) -> Self {
        LegStatus {
            venue: spec.venue.clone(),
            side: spec.side,
            client_order_id: spec.client_order_id.clone(),
            order_id: None,
            status: None,
            error: None,
        }
    }

    pub fn filled_qty(&self) -> BaseQty {
        self.status
            .as_ref()
            .map(|s| s.filled_qty())
            .unwrap_or(BaseQty(0.0))
    }

    pub fn is_fully_filled(&self) -> bool {
        matches!(self.status, Some(OrderStatus::Filled { .. }))
    }

    pub fn has_exposure(&self) -> bool {
        self.filled_qty().0 > 0.0
    }

    /// The leg can no longer fill: placement failed or the order reached a
    /// terminal non-filled status.
    pub fn is_dead(&self) -> bool {
        self.error.is_some()
            || matches!(
                self.status,
                Some(OrderStatus::Cancelled)
                    | Some(OrderStatus::Rejected)
                    | Some(OrderStatus::Expired)
            )
    }

    fn avg_fill_price(&self, fallback: Price) -> Price {
        match &self.status {
            Some(OrderStatus::Filled { avg_price, .. })
            | Some(OrderStatus::PartiallyFilled { avg_price, .. }) => *avg_price,
            _ => fallback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub id: Uuid,
    pub plan: ExecutionPlan,
    pub state: PairState,
    pub long_leg: LegStatus,
    pub short_leg: LegStatus,
    /// Reducing legs while closing.
    pub close_long: Option<LegStatus>,
    pub close_short: Option<LegStatus>,
    /// The two Position records once the pair is open.
    pub positions: Vec<Position>,
    pub close_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Published view of the engine state. Cheap to clone, safe to hold.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub pairs: Vec<PairRecord>,
    /// Positions restored from persistence that no live pair claims yet.
    pub orphans: Vec<Position>,
    pub incidents: Vec<SingleLegIncident>,
    pub latest_scan_id: u64,
}

impl EngineSnapshot {
    /// Positions of open or closing pairs, plus orphans. In-flight
    /// submissions are not positions yet.
    pub fn live_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .pairs
            .iter()
            .filter(|p| matches!(p.state, PairState::Open | PairState::Closing))
            .flat_map(|p| p.positions.iter().cloned())
            .collect();
        out.extend(self.orphans.iter().cloned());
        out
    }

    pub fn open_pairs(&self) -> impl Iterator<Item = &PairRecord> {
        self.pairs.iter().filter(|p| p.state == PairState::Open)
    }

    pub fn has_live_work(&self) -> bool {
        self.pairs.iter().any(|p| {
            matches!(
                p.state,
                PairState::Submitting | PairState::Partial | PairState::Open | PairState::Closing
            )
        }) || !self.orphans.is_empty()
    }
}

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum EngineCommand {
    Submit(Box<ExecutionPlan>),
    /// Newest completed scan; plans from older scans are rejected.
    NoteScan { scan_id: u64 },
    /// Re-poll fills for every in-flight leg.
    PollFills,
    /// Enforce the equal-leg invariant on open pairs.
    CheckDrift,
    ClosePair { pair_id: Uuid, reason: String },
    CloseAll { reason: String },
    /// Retry reducing orders for unresolved incidents.
    ResolveIncidents,
    /// Reconcile local state against venue-reported positions. Venues
    /// absent from the map are left untouched.
    Reconcile {
        venue_positions: HashMap<VenueId, Vec<VenuePosition>>,
    },
    // Internal results from spawned I/O tasks
    LegAcks {
        pair_id: Uuid,
        closing: bool,
        long: Result<(OrderAck, OrderStatus), VenueError>,
        short: Result<(OrderAck, OrderStatus), VenueError>,
    },
    FillUpdate {
        pair_id: Uuid,
        closing: bool,
        long: Option<OrderStatus>,
        short: Option<OrderStatus>,
    },
    PartialTimeout { pair_id: Uuid },
    Flattened { incident_id: Uuid, pair_id: Uuid, success: bool },
    Rebalanced {
        pair_id: Uuid,
        venue: VenueId,
        reduced: BaseQty,
        success: bool,
    },
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable handle to the engine task.
#[derive(Clone)]
pub struct ExecutionEngine {
    cmd_tx: mpsc::Sender<EngineCommand>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
}

impl ExecutionEngine {
    pub fn spawn(
        venues: HashMap<VenueId, Arc<dyn PerpVenue>>,
        store: Arc<dyn Store>,
        metrics: SharedMetrics,
        config: EngineConfig,
        restored: Vec<Position>,
        restored_incidents: Vec<SingleLegIncident>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot {
            orphans: restored.clone(),
            incidents: restored_incidents.clone(),
            ..Default::default()
        });
        let core = EngineCore {
            venues,
            store,
            metrics,
            config,
            pairs: HashMap::new(),
            orphans: restored,
            incidents: restored_incidents,
            latest_scan_id: 0,
            cmd_tx: cmd_tx.clone(),
            snapshot_tx,
        };
        tokio::spawn(core.run(cmd_rx));
        ExecutionEngine {
            cmd_tx,
            snapshot_rx,
        }
    }

    pub async fn send(&self, cmd: EngineCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("engine task is gone; command dropped");
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Orderly shutdown: close everything and wait until the book is flat
    /// or the deadline passes.
    pub async fn close_all_and_drain(&self, reason: &str, deadline: Duration) -> bool {
        self.send(EngineCommand::CloseAll {
            reason: reason.to_string(),
        })
        .await;
        let mut rx = self.snapshot_rx.clone();
        let drained = tokio::time::timeout(deadline, async {
            loop {
                if !rx.borrow().has_live_work() {
                    return;
                }
                let _ = self.cmd_tx.send(EngineCommand::PollFills).await;
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!("shutdown deadline hit with live positions remaining");
        }
        drained
    }
}

// ── Core task ───────────────────────────────────────────────────────

struct EngineCore {
    venues: HashMap<VenueId, Arc<dyn PerpVenue>>,
    store: Arc<dyn Store>,
    metrics: SharedMetrics,
    config: EngineConfig,
    pairs: HashMap<Uuid, PairRecord>,
    orphans: Vec<Position>,
    incidents: Vec<SingleLegIncident>,
    latest_scan_id: u64,
    cmd_tx: mpsc::Sender<EngineCommand>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl EngineCore {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<EngineCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            self.handle(cmd);
            self.publish();
        }
        info!("engine command channel closed; task exiting");
    }

    fn publish(&self) {
        let snapshot = EngineSnapshot {
            pairs: self.pairs.values().cloned().collect(),
            orphans: self.orphans.clone(),
            incidents: self.incidents.clone(),
            latest_scan_id: self.latest_scan_id,
        };
        let _ = self.snapshot_tx.send(snapshot);
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn persist(&self, event: StoredEvent) {
        if let Err(e) = self.store.append(&event) {
            error!(error = %e, "failed to persist engine event");
        }
    }

    fn note_error(&self, source: &str, message: String) {
        self.metrics
            .lock()
            .unwrap()
            .record_error(Self::now(), source, message);
    }

    fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Submit(plan) => self.on_submit(*plan),
            EngineCommand::NoteScan { scan_id } => {
                self.latest_scan_id = self.latest_scan_id.max(scan_id);
            }
            EngineCommand::PollFills => self.on_poll_fills(),
            EngineCommand::CheckDrift => self.on_check_drift(),
            EngineCommand::ClosePair { pair_id, reason } => self.on_close_pair(pair_id, reason),
            EngineCommand::CloseAll { reason } => {
                let ids: Vec<Uuid> = self
                    .pairs
                    .values()
                    .filter(|p| p.state == PairState::Open)
                    .map(|p| p.id)
                    .collect();
                for id in ids {
                    self.on_close_pair(id, reason.clone());
                }
                self.close_orphans();
            }
            EngineCommand::ResolveIncidents => self.on_resolve_incidents(),
            EngineCommand::Reconcile { venue_positions } => {
                self.on_reconcile(venue_positions);
            }
            EngineCommand::LegAcks {
                pair_id,
                closing,
                long,
                short,
            } => {
                self.on_leg_acks(pair_id, closing, long, short);
            }
            EngineCommand::FillUpdate {
                pair_id,
                closing,
                long,
                short,
            } => self.on_fill_update(pair_id, closing, long, short),
            EngineCommand::PartialTimeout { pair_id } => self.on_partial_timeout(pair_id),
            EngineCommand::Flattened {
                incident_id,
                pair_id,
                success,
            } => self.on_flattened(incident_id, pair_id, success),
            EngineCommand::Rebalanced {
                pair_id,
                venue,
                reduced,
                success,
            } => self.on_rebalanced(pair_id, venue, reduced, success),
        }
    }

    // ── Submission ──────────────────────────────────────────────────

    fn on_submit(&mut self, plan: ExecutionPlan) {
        if plan.opportunity.scan_id < self.latest_scan_id {
            warn!(
                plan = %plan.id,
                plan_scan = plan.opportunity.scan_id,
                latest = self.latest_scan_id,
                "rejecting stale plan"
            );
            return;
        }
        if let Err(reason) = plan.validate() {
            self.note_error("engine", format!("plan {} invalid: {reason}", plan.id));
            return;
        }
        let Some(long_venue) = self.venues.get(&plan.long_order.venue).cloned() else {
            self.note_error("engine", format!("no adapter for {}", plan.long_order.venue));
            return;
        };
        let Some(short_venue) = self.venues.get(&plan.short_order.venue).cloned() else {
            self.note_error("engine", format!("no adapter for {}", plan.short_order.venue));
            return;
        };

        let now = Self::now();
        let record = PairRecord {
            id: plan.id,
            state: PairState::Submitting,
            long_leg: LegStatus::from_spec(&plan.long_order),
            short_leg: LegStatus::from_spec(&plan.short_order),
            close_long: None,
            close_short: None,
            positions: Vec::new(),
            close_reason: None,
            created_at: now,
            updated_at: now,
            plan: plan.clone(),
        };
        self.persist(StoredEvent::PlanSubmitted {
            plan: Box::new(plan.clone()),
        });
        info!(pair = %record.id, symbol = %plan.opportunity.symbol, notional = %plan.notional, "submitting pair");
        self.pairs.insert(record.id, record);

        let tx = self.cmd_tx.clone();
        let pair_id = plan.id;
        let long_spec = plan.long_order.clone();
        let short_spec = plan.short_order.clone();
        tokio::spawn(async move {
            let (long, short) = tokio::join!(
                place_leg(long_venue, long_spec),
                place_leg(short_venue, short_spec),
            );
            let _ = tx
                .send(EngineCommand::LegAcks {
                    pair_id,
                    closing: false,
                    long,
                    short,
                })
                .await;
        });
    }

    fn on_leg_acks(
        &mut self,
        pair_id: Uuid,
        closing: bool,
        long: Result<(OrderAck, OrderStatus), VenueError>,
        short: Result<(OrderAck, OrderStatus), VenueError>,
    ) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if closing {
            if let Some(leg) = pair.close_long.as_mut() {
                apply_ack(leg, long);
            }
            if let Some(leg) = pair.close_short.as_mut() {
                apply_ack(leg, short);
            }
            pair.updated_at = Self::now();
            self.reevaluate_close(pair_id);
        } else {
            apply_ack(&mut pair.long_leg, long);
            apply_ack(&mut pair.short_leg, short);
            pair.updated_at = Self::now();
            self.reevaluate_entry(pair_id);
        }
    }

    fn on_fill_update(
        &mut self,
        pair_id: Uuid,
        closing: bool,
        long: Option<OrderStatus>,
        short: Option<OrderStatus>,
    ) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if closing {
            if let (Some(leg), Some(status)) = (pair.close_long.as_mut(), long) {
                leg.status = Some(status);
            }
            if let (Some(leg), Some(status)) = (pair.close_short.as_mut(), short) {
                leg.status = Some(status);
            }
            pair.updated_at = Self::now();
            self.reevaluate_close(pair_id);
        } else {
            if let Some(status) = long {
                pair.long_leg.status = Some(status);
            }
            if let Some(status) = short {
                pair.short_leg.status = Some(status);
            }
            pair.updated_at = Self::now();
            self.reevaluate_entry(pair_id);
        }
    }

    /// Drive the entry state machine after any leg change.
    fn reevaluate_entry(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if !matches!(pair.state, PairState::Submitting | PairState::Partial) {
            return;
        }

        let long_filled = pair.long_leg.is_fully_filled();
        let short_filled = pair.short_leg.is_fully_filled();
        let long_dead = pair.long_leg.is_dead();
        let short_dead = pair.short_leg.is_dead();
        let exposure = pair.long_leg.has_exposure() || pair.short_leg.has_exposure();

        if long_filled && short_filled {
            self.promote_open(pair_id);
            return;
        }
        if long_dead && short_dead {
            if exposure {
                // Both orders are terminal but one left a partial fill
                self.enter_partial(pair_id);
                self.on_partial_timeout(pair_id);
            } else {
                self.fail_pair(pair_id, "both legs failed without fills");
            }
            return;
        }
        // One side has exposure while the other is dead or still pending
        let one_sided = (long_filled || pair.long_leg.has_exposure()) != (short_filled
            || pair.short_leg.has_exposure());
        if one_sided && (long_dead || short_dead || long_filled || short_filled) {
            self.enter_partial(pair_id);
        }
    }

    fn enter_partial(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if pair.state == PairState::Partial {
            return;
        }
        pair.state = PairState::Partial;
        pair.updated_at = Self::now();
        warn!(pair = %pair_id, "single leg filled; starting partial timer");
        let tx = self.cmd_tx.clone();
        let timeout = self.config.partial_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineCommand::PartialTimeout { pair_id }).await;
        });
    }

    fn promote_open(&mut self, pair_id: Uuid) {
        let drift_limit = self.config.drift_limit;
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        let now = Self::now();
        let long_qty = pair.long_leg.filled_qty();
        let short_qty = pair.short_leg.filled_qty();
        let long_price = pair
            .long_leg
            .avg_fill_price(pair.plan.opportunity.long_mark);
        let short_price = pair
            .short_leg
            .avg_fill_price(pair.plan.opportunity.short_mark);
        let collateral = Usd(pair.plan.notional.0 / pair.plan.leverage.max(1.0));

        pair.positions = vec![
            Position {
                id: Uuid::new_v4(),
                strategy_id: pair.id,
                venue: pair.long_leg.venue.clone(),
                symbol: pair.plan.opportunity.symbol.clone(),
                side: PositionSide::Long,
                size: long_qty,
                entry_price: long_price,
                collateral,
                borrowed: Usd::ZERO,
                opened_at: now,
                status: PositionStatus::Open,
            },
            Position {
                id: Uuid::new_v4(),
                strategy_id: pair.id,
                venue: pair.short_leg.venue.clone(),
                symbol: pair.plan.opportunity.symbol.clone(),
                side: PositionSide::Short,
                size: short_qty,
                entry_price: short_price,
                collateral,
                borrowed: Usd::ZERO,
                opened_at: now,
                status: PositionStatus::Open,
            },
        ];
        pair.state = PairState::Open;
        pair.updated_at = now;

        let avg = (long_qty.0 + short_qty.0) / 2.0;
        let drift = if avg > 0.0 {
            (long_qty.0 - short_qty.0).abs() / avg
        } else {
            0.0
        };
        info!(pair = %pair_id, drift = %format!("{:.4}", drift), "pair open");
        if drift > drift_limit {
            warn!(pair = %pair_id, drift, "fills breached drift limit; rebalance pending");
        }
        let positions = pair.positions.clone();
        self.persist(StoredEvent::PairOpened { pair_id, positions });
    }

    fn fail_pair(&mut self, pair_id: Uuid, reason: &str) {
        if let Some(pair) = self.pairs.get_mut(&pair_id) {
            pair.state = PairState::Failed;
            pair.close_reason = Some(reason.to_string());
            pair.updated_at = Self::now();
        }
        warn!(pair = %pair_id, reason, "pair failed");
        self.persist(StoredEvent::PairFailed {
            pair_id,
            reason: reason.to_string(),
        });
        self.note_error("engine", format!("pair {pair_id} failed: {reason}"));
    }

    // ── Partial resolution ──────────────────────────────────────────

    fn on_partial_timeout(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        match pair.state {
            PairState::Partial => {}
            PairState::Closing => {
                self.close_partial_timeout(pair_id);
                return;
            }
            _ => return,
        }

        // Identify filled vs hanging legs
        let (filled, hanging) = if pair.long_leg.has_exposure() {
            (pair.long_leg.clone(), pair.short_leg.clone())
        } else {
            (pair.short_leg.clone(), pair.long_leg.clone())
        };
        let symbol = pair.plan.opportunity.symbol.clone();
        let size = filled.filled_qty();
        pair.state = PairState::Failed;
        pair.close_reason = Some("single leg hanging past timeout".into());
        pair.updated_at = Self::now();

        let incident = SingleLegIncident {
            id: Uuid::new_v4(),
            pair_id,
            symbol: symbol.clone(),
            venue: filled.venue.clone(),
            reduce_side: filled.side.opposite(),
            size,
            created_at: Self::now(),
            attempts: 0,
            resolved: false,
        };
        warn!(pair = %pair_id, venue = %incident.venue, "raising single-leg incident");
        self.persist(StoredEvent::IncidentRaised {
            incident: incident.clone(),
        });
        self.incidents.push(incident.clone());

        // Cancel the hanging order, then flatten the filled side
        let hanging_venue = self.venues.get(&hanging.venue).cloned();
        let filled_venue = self.venues.get(&incident.venue).cloned();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let (Some(venue), Some(order_id)) = (hanging_venue, hanging.order_id) {
                if let Err(e) = venue.cancel_order(&order_id).await {
                    warn!(error = %e, "cancel of hanging leg failed");
                }
            }
            let success = match filled_venue {
                Some(venue) => flatten(venue, &incident).await,
                None => false,
            };
            let _ = tx
                .send(EngineCommand::Flattened {
                    incident_id: incident.id,
                    pair_id,
                    success,
                })
                .await;
        });
    }

    fn close_partial_timeout(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get(&pair_id) else {
            return;
        };
        let plan_size = pair.plan.size_base;
        let symbol = pair.plan.opportunity.symbol.clone();
        let legs: Vec<LegStatus> = [pair.close_long.clone(), pair.close_short.clone()]
            .into_iter()
            .flatten()
            .collect();

        // A close leg that never filled leaves that side open: reduce it
        let mut raised = Vec::new();
        for leg in legs {
            if leg.is_fully_filled() {
                continue;
            }
            let remaining = BaseQty(plan_size.0 - leg.filled_qty().0);
            if remaining.0 <= 0.0 {
                continue;
            }
            raised.push(SingleLegIncident {
                id: Uuid::new_v4(),
                pair_id,
                symbol: symbol.clone(),
                venue: leg.venue.clone(),
                reduce_side: leg.side,
                size: remaining,
                created_at: Self::now(),
                attempts: 0,
                resolved: false,
            });
        }
        for incident in raised {
            warn!(pair = %pair_id, venue = %incident.venue, "close leg hanging; raising incident");
            self.persist(StoredEvent::IncidentRaised {
                incident: incident.clone(),
            });
            self.incidents.push(incident);
        }
        self.on_resolve_incidents();
    }

    fn on_resolve_incidents(&mut self) {
        let pending: Vec<SingleLegIncident> = self
            .incidents
            .iter_mut()
            .filter(|i| !i.resolved)
            .map(|i| {
                i.attempts += 1;
                i.clone()
            })
            .collect();
        for incident in pending {
            let Some(venue) = self.venues.get(&incident.venue).cloned() else {
                continue;
            };
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let success = flatten(venue, &incident).await;
                let _ = tx
                    .send(EngineCommand::Flattened {
                        incident_id: incident.id,
                        pair_id: incident.pair_id,
                        success,
                    })
                    .await;
            });
        }
    }

    fn on_flattened(&mut self, incident_id: Uuid, pair_id: Uuid, success: bool) {
        let Some(idx) = self.incidents.iter().position(|i| i.id == incident_id) else {
            return;
        };
        if self.incidents[idx].resolved {
            return;
        }
        if !success {
            warn!(incident = %incident_id, "flatten attempt failed; retry loop owns it");
            return;
        }
        self.incidents[idx].resolved = true;
        info!(incident = %incident_id, "single-leg incident resolved");
        self.persist(StoredEvent::IncidentResolved { incident_id });
        // A resolved close-incident means the pair is finally flat
        let was_closing = self
            .pairs
            .get(&pair_id)
            .is_some_and(|p| p.state == PairState::Closing);
        if was_closing {
            self.finish_close(pair_id);
        }
    }

    // ── Drift enforcement ───────────────────────────────────────────

    fn on_check_drift(&mut self) {
        let drift_limit = self.config.drift_limit;
        let mut rebalances: Vec<(Uuid, VenueId, String, Side, BaseQty)> = Vec::new();
        for pair in self.pairs.values() {
            if pair.state != PairState::Open || pair.positions.len() != 2 {
                continue;
            }
            let long = &pair.positions[0];
            let short = &pair.positions[1];
            let avg = (long.size.0 + short.size.0) / 2.0;
            if avg <= 0.0 {
                continue;
            }
            let drift = (long.size.0 - short.size.0).abs() / avg;
            if drift <= drift_limit {
                continue;
            }
            // Reduce the heavier leg back to the lighter one
            let (heavy, reduce_side) = if long.size.0 > short.size.0 {
                (long, Side::Sell)
            } else {
                (short, Side::Buy)
            };
            let excess = BaseQty((long.size.0 - short.size.0).abs());
            warn!(pair = %pair.id, drift = %format!("{:.4}", drift), venue = %heavy.venue, "rebalancing drifted pair");
            rebalances.push((
                pair.id,
                heavy.venue.clone(),
                heavy.symbol.clone(),
                reduce_side,
                excess,
            ));
        }

        for (pair_id, venue_id, symbol, side, qty) in rebalances {
            let Some(venue) = self.venues.get(&venue_id).cloned() else {
                continue;
            };
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let req = OrderRequest {
                    symbol,
                    side,
                    order_type: OrderType::Market,
                    size: qty,
                    price: None,
                    tif: Tif::Ioc,
                    reduce_only: true,
                    client_order_id: format!("{pair_id}-rebal-{}", Uuid::new_v4()),
                };
                let success = venue.place_order(&req).await.is_ok();
                let _ = tx
                    .send(EngineCommand::Rebalanced {
                        pair_id,
                        venue: venue.id().to_string(),
                        reduced: qty,
                        success,
                    })
                    .await;
            });
        }
    }

    fn on_rebalanced(&mut self, pair_id: Uuid, venue: VenueId, reduced: BaseQty, success: bool) {
        if !success {
            self.note_error("engine", format!("rebalance on {venue} failed"));
            return;
        }
        if let Some(pair) = self.pairs.get_mut(&pair_id) {
            for position in &mut pair.positions {
                if position.venue == venue {
                    position.size = BaseQty((position.size.0 - reduced.0).max(0.0));
                }
            }
            pair.updated_at = Self::now();
        }
    }

    // ── Fill polling ────────────────────────────────────────────────

    fn on_poll_fills(&mut self) {
        for pair in self.pairs.values() {
            match pair.state {
                PairState::Submitting | PairState::Partial => {
                    self.spawn_poll(pair, false);
                }
                PairState::Closing => {
                    self.spawn_poll(pair, true);
                }
                _ => {}
            }
        }
    }

    fn spawn_poll(&self, pair: &PairRecord, closing: bool) {
        let (long_leg, short_leg) = if closing {
            (pair.close_long.clone(), pair.close_short.clone())
        } else {
            (Some(pair.long_leg.clone()), Some(pair.short_leg.clone()))
        };
        let long_venue = long_leg
            .as_ref()
            .and_then(|l| self.venues.get(&l.venue).cloned());
        let short_venue = short_leg
            .as_ref()
            .and_then(|l| self.venues.get(&l.venue).cloned());
        let pair_id = pair.id;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let long = poll_leg(long_venue, long_leg).await;
            let short = poll_leg(short_venue, short_leg).await;
            if long.is_some() || short.is_some() {
                let _ = tx
                    .send(EngineCommand::FillUpdate {
                        pair_id,
                        closing,
                        long,
                        short,
                    })
                    .await;
            }
        });
    }

    // ── Closing ─────────────────────────────────────────────────────

    fn on_close_pair(&mut self, pair_id: Uuid, reason: String) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if pair.state != PairState::Open {
            return;
        }
        pair.state = PairState::Closing;
        pair.close_reason = Some(reason.clone());
        pair.updated_at = Self::now();
        for position in &mut pair.positions {
            position.status = PositionStatus::Closing;
        }

        let symbol = pair.plan.opportunity.symbol.clone();
        let size = BaseQty(
            pair.positions
                .iter()
                .map(|p| p.size.0)
                .fold(f64::INFINITY, f64::min),
        );
        let size = if size.0.is_finite() { size } else { pair.plan.size_base };

        let close_long = OrderSpec {
            venue: pair.long_leg.venue.clone(),
            symbol: symbol.clone(),
            side: Side::Sell,
            order_type: OrderType::Market,
            size,
            limit_price: None,
            tif: Tif::Ioc,
            reduce_only: true,
            client_order_id: format!("{pair_id}-CL"),
        };
        let close_short = OrderSpec {
            venue: pair.short_leg.venue.clone(),
            symbol,
            side: Side::Buy,
            order_type: OrderType::Market,
            size,
            limit_price: None,
            tif: Tif::Ioc,
            reduce_only: true,
            client_order_id: format!("{pair_id}-CS"),
        };
        pair.close_long = Some(LegStatus::from_spec(&close_long));
        pair.close_short = Some(LegStatus::from_spec(&close_short));

        info!(pair = %pair_id, reason, "closing pair");
        self.persist(StoredEvent::PairClosing {
            pair_id,
            reason: reason.clone(),
        });

        let long_venue = self.venues.get(&close_long.venue).cloned();
        let short_venue = self.venues.get(&close_short.venue).cloned();
        let tx = self.cmd_tx.clone();
        let timeout = self.config.partial_timeout;
        tokio::spawn(async move {
            // Resting orders are always cancelled before reducing; never
            // rely on exchange auto-cancel
            if let Some(venue) = &long_venue {
                let _ = venue.cancel_all(&close_long.symbol).await;
            }
            if let Some(venue) = &short_venue {
                let _ = venue.cancel_all(&close_short.symbol).await;
            }
            let (long, short) = tokio::join!(
                place_leg_opt(long_venue, close_long),
                place_leg_opt(short_venue, close_short),
            );
            let _ = tx
                .send(EngineCommand::LegAcks {
                    pair_id,
                    closing: true,
                    long,
                    short,
                })
                .await;
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineCommand::PartialTimeout { pair_id }).await;
        });
    }

    fn reevaluate_close(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get(&pair_id) else {
            return;
        };
        if pair.state != PairState::Closing {
            return;
        }
        let long_done = pair
            .close_long
            .as_ref()
            .is_some_and(|l| l.is_fully_filled());
        let short_done = pair
            .close_short
            .as_ref()
            .is_some_and(|l| l.is_fully_filled());
        if long_done && short_done {
            self.finish_close(pair_id);
        }
    }

    fn finish_close(&mut self, pair_id: Uuid) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        let now = Self::now();
        let mut realized = 0.0;
        let long_exit = pair
            .close_long
            .as_ref()
            .map(|l| l.avg_fill_price(pair.plan.opportunity.long_mark));
        let short_exit = pair
            .close_short
            .as_ref()
            .map(|l| l.avg_fill_price(pair.plan.opportunity.short_mark));
        for position in &mut pair.positions {
            let exit = match position.side {
                PositionSide::Long => long_exit,
                PositionSide::Short => short_exit,
            };
            if let Some(exit) = exit {
                let per_unit = match position.side {
                    PositionSide::Long => exit.0 - position.entry_price.0,
                    PositionSide::Short => position.entry_price.0 - exit.0,
                };
                realized += per_unit * position.size.0;
            }
            position.status = PositionStatus::Closed;
        }
        pair.state = PairState::Closed;
        pair.updated_at = now;
        info!(pair = %pair_id, realized = %format!("{realized:.2}"), "pair closed");
        self.metrics
            .lock()
            .unwrap()
            .record_close_pnl(Usd(realized));
        self.persist(StoredEvent::PairClosed {
            pair_id,
            realized_pnl: realized,
        });
    }

    fn close_orphans(&mut self) {
        for orphan in &self.orphans {
            let Some(venue) = self.venues.get(&orphan.venue).cloned() else {
                continue;
            };
            let req = OrderRequest {
                symbol: orphan.symbol.clone(),
                side: match orphan.side {
                    PositionSide::Long => Side::Sell,
                    PositionSide::Short => Side::Buy,
                },
                order_type: OrderType::Market,
                size: orphan.size,
                price: None,
                tif: Tif::Ioc,
                reduce_only: true,
                client_order_id: format!("{}-orphan-close", orphan.id),
            };
            tokio::spawn(async move {
                if let Err(e) = venue.place_order(&req).await {
                    warn!(error = %e, "orphan close failed");
                }
            });
        }
        self.orphans.clear();
    }

    // ── Reconciliation ──────────────────────────────────────────────

    fn on_reconcile(&mut self, venue_positions: HashMap<VenueId, Vec<VenuePosition>>) {
        let outcome = reconcile::apply(
            &mut self.pairs,
            &mut self.orphans,
            &mut self.incidents,
            &venue_positions,
        );
        if outcome.mutated() {
            warn!(
                ghosts = outcome.ghosts_dropped,
                strays = outcome.strays_seen,
                adopted = outcome.adopted,
                "reconciliation adjusted local state"
            );
            self.persist(StoredEvent::Reconciled {
                ghosts_dropped: outcome.ghosts_dropped,
                strays_seen: outcome.strays_seen,
                timestamp: Self::now(),
            });
        }
        if self.config.close_strays {
            for (venue_id, stray) in outcome.unclaimed_strays {
                let Some(venue) = self.venues.get(&venue_id).cloned() else {
                    continue;
                };
                let req = OrderRequest {
                    symbol: stray.symbol.clone(),
                    side: stray.side.opposite(),
                    order_type: OrderType::Market,
                    size: stray.size,
                    price: None,
                    tif: Tif::Ioc,
                    reduce_only: true,
                    client_order_id: format!("stray-{}-{}", venue_id, Uuid::new_v4()),
                };
                warn!(venue = %venue_id, symbol = %stray.symbol, "auto-closing stray venue position");
                tokio::spawn(async move {
                    if let Err(e) = venue.place_order(&req).await {
                        warn!(error = %e, "stray close failed");
                    }
                });
            }
        }
        // Re-run the entry machine for pairs that adopted fills
        let ids: Vec<Uuid> = self
            .pairs
            .values()
            .filter(|p| matches!(p.state, PairState::Submitting | PairState::Partial))
            .map(|p| p.id)
            .collect();
        for id in ids {
            self.reevaluate_entry(id);
        }
    }
}

// ── Leg I/O helpers ─────────────────────────────────────────────────

fn apply_ack(leg: &mut LegStatus, result: Result<(OrderAck, OrderStatus), VenueError>) {
    match result {
        Ok((ack, status)) => {
            leg.order_id = Some(ack.order_id);
            leg.status = Some(status);
        }
        Err(e) => {
            leg.error = Some(e.to_string());
        }
    }
}

fn order_request(spec: &OrderSpec) -> OrderRequest {
    OrderRequest {
        symbol: spec.symbol.clone(),
        side: spec.side,
        order_type: spec.order_type,
        size: spec.size,
        price: spec.limit_price,
        tif: spec.tif,
        reduce_only: spec.reduce_only,
        client_order_id: spec.client_order_id.clone(),
    }
}

/// Place one leg. A `RateLimited` response waits out the venue's stated
/// backoff and retries exactly once; the client order id makes the retry
/// idempotent on the venue side.
async fn place_leg(
    venue: Arc<dyn PerpVenue>,
    spec: OrderSpec,
) -> Result<(OrderAck, OrderStatus), VenueError> {
    let req = order_request(&spec);
    let ack = match venue.place_order(&req).await {
        Ok(ack) => ack,
        Err(VenueError::RateLimited { retry_after }) => {
            warn!(venue = venue.id(), "rate limited; retrying leg once after backoff");
            tokio::time::sleep(retry_after).await;
            venue.place_order(&req).await?
        }
        Err(e) => return Err(e),
    };
    let status = venue
        .order_status(&ack.order_id)
        .await
        .unwrap_or(OrderStatus::New);
    Ok((ack, status))
}

async fn place_leg_opt(
    venue: Option<Arc<dyn PerpVenue>>,
    spec: OrderSpec,
) -> Result<(OrderAck, OrderStatus), VenueError> {
    match venue {
        Some(venue) => place_leg(venue, spec).await,
        None => Err(VenueError::Unknown("no adapter for venue".into())),
    }
}

async fn poll_leg(
    venue: Option<Arc<dyn PerpVenue>>,
    leg: Option<LegStatus>,
) -> Option<OrderStatus> {
    let venue = venue?;
    let leg = leg?;
    let order_id = leg.order_id?;
    match venue.order_status(&order_id).await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, "fill poll failed");
            None
        }
    }
}

/// Place the reducing order that resolves an incident. Success means the
/// venue accepted and fully filled it.
async fn flatten(venue: Arc<dyn PerpVenue>, incident: &SingleLegIncident) -> bool {
    let req = OrderRequest {
        symbol: incident.symbol.clone(),
        side: incident.reduce_side,
        order_type: OrderType::Market,
        size: incident.size,
        price: None,
        tif: Tif::Ioc,
        reduce_only: true,
        client_order_id: incident.flatten_client_id(),
    };
    match venue.place_order(&req).await {
        Ok(ack) => matches!(
            venue.order_status(&ack.order_id).await,
            Ok(OrderStatus::Filled { .. })
        ),
        Err(e) => {
            warn!(venue = venue.id(), error = %e, "flatten order failed");
            false
        }
    }
}
