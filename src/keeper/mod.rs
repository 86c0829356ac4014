//! Periodic control loops. Each loop runs on its own tokio task with a
//! fixed period, never re-enters itself (the next tick waits for the body
//! to return), and pays for venue traffic out of a per-venue token bucket
//! — exhausted budgets defer the loop without blocking the others.

pub mod metrics;
pub mod rate_limit;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::aggregator::{FundingAggregator, ScanResult};
use crate::config::KeeperConfig;
use crate::engine::{EngineCommand, ExecutionEngine, PairState};
use crate::history::HistoricalStore;
use crate::model::units::{FundingRate, Usd};
use crate::model::VenueId;
use crate::neutral::DeltaNeutralController;
use crate::planner::{ExecutionPlanBuilder, PlanError};
use crate::portfolio::{PortfolioOptimizer, QualityTargets};
use crate::store::{KeeperSnapshot, Store, StoredEvent, SCHEMA_VERSION};
use crate::venues::{LendingVenue, PerpVenue};

use metrics::SharedMetrics;
use rate_limit::RateBudgets;

/// Grace period for closing everything on shutdown.
pub const SHUTDOWN_CLOSE_DEADLINE: Duration = Duration::from_secs(300);
/// Cached balances older than this are refreshed before use.
const BALANCE_CACHE_TTL_SECS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct LoopDef {
    pub name: &'static str,
    pub period_secs: u64,
    pub weight: f64,
}

/// The full loop table with default periods and per-venue weights.
pub const LOOPS: &[LoopDef] = &[
    LoopDef { name: "scan_opportunities", period_secs: 15, weight: 5.0 },
    LoopDef { name: "verify_recent_fills", period_secs: 45, weight: 2.0 },
    LoopDef { name: "check_position_balance", period_secs: 60, weight: 1.0 },
    LoopDef { name: "refresh_capital", period_secs: 60, weight: 2.0 },
    LoopDef { name: "retry_single_leg", period_secs: 90, weight: 2.0 },
    LoopDef { name: "verify_position_state", period_secs: 90, weight: 3.0 },
    LoopDef { name: "update_metrics", period_secs: 120, weight: 2.0 },
    LoopDef { name: "close_unprofitable", period_secs: 120, weight: 1.0 },
    LoopDef { name: "cleanup_stale_orders", period_secs: 300, weight: 2.0 },
    LoopDef { name: "spread_rotation", period_secs: 600, weight: 1.0 },
    LoopDef { name: "emergency_health_check", period_secs: 30, weight: 2.0 },
];

enum LoopOutcome {
    Done,
    /// Budget exhausted or precondition missing; try again next period.
    Deferred,
    /// Transient venue failure; skip an extra period before retrying.
    BackOff,
}

#[derive(Default)]
struct CapitalCache {
    balances: HashMap<VenueId, Usd>,
    fetched_at: i64,
}

#[derive(Default)]
struct RotationState {
    /// (challenger key, held pair under challenge, consecutive wins).
    challenger: Option<(String, uuid::Uuid, u32)>,
}

/// Everything the loops need, shared immutably. The engine serializes all
/// position mutations; the keeper only sends commands and reads snapshots.
pub struct KeeperCtx {
    pub config: KeeperConfig,
    pub symbols: Vec<String>,
    /// Perp venues only — scanned for funding.
    pub perps: HashMap<VenueId, Arc<dyn PerpVenue>>,
    /// Spot quote venues for perp-spot pairs.
    pub spots: HashMap<VenueId, Arc<dyn PerpVenue>>,
    pub lendings: HashMap<VenueId, Arc<dyn LendingVenue>>,
    /// Perps + spots: every venue an order leg can land on.
    pub trade_venues: HashMap<VenueId, Arc<dyn PerpVenue>>,
    pub aggregator: FundingAggregator,
    pub history: Arc<HistoricalStore>,
    pub portfolio: PortfolioOptimizer,
    pub quality: QualityTargets,
    /// Maker fee per venue for sizing projections.
    pub fee_rates: HashMap<VenueId, f64>,
    pub planner: ExecutionPlanBuilder,
    pub engine: ExecutionEngine,
    pub budgets: RateBudgets,
    pub metrics: SharedMetrics,
    pub store: Arc<dyn Store>,
    pub neutral: Option<tokio::sync::Mutex<DeltaNeutralController>>,
    capital: Mutex<CapitalCache>,
    rotation: Mutex<RotationState>,
    last_scan: Mutex<Option<ScanResult>>,
    /// Set on Fatal: no new plans, everything closing.
    drained: AtomicBool,
    /// Consecutive leveraged health-check failures.
    health_failures: std::sync::atomic::AtomicU32,
}

impl KeeperCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: KeeperConfig,
        perps: HashMap<VenueId, Arc<dyn PerpVenue>>,
        spots: HashMap<VenueId, Arc<dyn PerpVenue>>,
        lendings: HashMap<VenueId, Arc<dyn LendingVenue>>,
        aggregator: FundingAggregator,
        history: Arc<HistoricalStore>,
        portfolio: PortfolioOptimizer,
        quality: QualityTargets,
        planner: ExecutionPlanBuilder,
        engine: ExecutionEngine,
        budgets: RateBudgets,
        metrics: SharedMetrics,
        store: Arc<dyn Store>,
        neutral: Option<DeltaNeutralController>,
    ) -> Self {
        let symbols = config.effective_symbols();
        let fee_rates = config
            .venues
            .iter()
            .map(|(id, v)| (id.clone(), v.fee_rates.maker))
            .collect();
        let mut trade_venues = perps.clone();
        trade_venues.extend(spots.clone());
        KeeperCtx {
            config,
            symbols,
            perps,
            spots,
            lendings,
            trade_venues,
            aggregator,
            history,
            portfolio,
            quality,
            fee_rates,
            planner,
            engine,
            budgets,
            metrics,
            store,
            neutral: neutral.map(tokio::sync::Mutex::new),
            capital: Mutex::new(CapitalCache::default()),
            rotation: Mutex::new(RotationState::default()),
            last_scan: Mutex::new(None),
            drained: AtomicBool::new(false),
            health_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Enter the drained state: stop planning, close everything. Called on
    /// invariant violations.
    pub async fn trigger_fatal(&self, reason: &str) {
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "FATAL: draining keeper");
        self.metrics
            .lock()
            .unwrap()
            .record_error(Self::now(), "fatal", reason.to_string());
        self.engine
            .send(EngineCommand::CloseAll {
                reason: format!("fatal: {reason}"),
            })
            .await;
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    fn perp_ids(&self) -> Vec<VenueId> {
        self.perps.keys().cloned().collect()
    }

    fn note_error(&self, source: &str, message: String) {
        self.metrics
            .lock()
            .unwrap()
            .record_error(Self::now(), source, message);
    }

    // ── Loop bodies ─────────────────────────────────────────────────

    async fn run_loop(&self, name: &str, weight: f64) -> Result<LoopOutcome> {
        match name {
            "scan_opportunities" => self.scan_opportunities(weight).await,
            "verify_recent_fills" => self.verify_recent_fills(weight).await,
            "check_position_balance" => self.check_position_balance().await,
            "refresh_capital" => self.refresh_capital(weight).await,
            "retry_single_leg" => self.retry_single_leg().await,
            "verify_position_state" => self.verify_position_state(weight).await,
            "update_metrics" => self.update_metrics(weight).await,
            "close_unprofitable" => self.close_unprofitable().await,
            "cleanup_stale_orders" => self.cleanup_stale_orders(weight).await,
            "spread_rotation" => self.spread_rotation().await,
            "emergency_health_check" => self.emergency_health_check(weight).await,
            other => {
                warn!(name = other, "unknown loop");
                Ok(LoopOutcome::Done)
            }
        }
    }

    async fn scan_opportunities(&self, weight: f64) -> Result<LoopOutcome> {
        if self.is_drained() {
            return Ok(LoopOutcome::Deferred);
        }
        if !self.budgets.try_acquire_all(&self.perp_ids(), weight) {
            return Ok(LoopOutcome::Deferred);
        }
        let now = Self::now();
        let scan = self
            .aggregator
            .scan(
                &self.symbols,
                &self.perps,
                &self.spots,
                &self.lendings,
                &self.history,
                now,
            )
            .await;
        self.engine
            .send(EngineCommand::NoteScan {
                scan_id: scan.scan_id,
            })
            .await;

        let capital = self.deployable_capital().await;
        let outcome = self.portfolio.allocate(
            &scan.opportunities,
            capital,
            &self.history,
            &self.fee_rates,
            &self.quality,
            now,
        );
        for warning in &outcome.data_quality_warnings {
            debug!(warning = %warning, "data quality");
        }

        // One live pair per symbol; in-flight submissions count as held
        let snapshot = self.engine.snapshot();
        let held: HashSet<String> = snapshot
            .pairs
            .iter()
            .filter(|p| {
                matches!(
                    p.state,
                    PairState::Submitting | PairState::Partial | PairState::Open | PairState::Closing
                )
            })
            .map(|p| p.plan.opportunity.symbol.clone())
            .collect();

        for allocation in outcome.allocations {
            let opp = &allocation.opportunity;
            if held.contains(&opp.symbol) {
                continue;
            }
            // Lending-hedged spreads belong to the leveraged controller
            if opp.strategy == crate::model::StrategyType::PerpLend {
                continue;
            }
            match self
                .planner
                .build(opp, allocation.amount, &self.trade_venues, now)
                .await
            {
                Ok(plan) => {
                    self.engine.send(EngineCommand::Submit(Box::new(plan))).await;
                }
                Err(e @ PlanError::Venue(_)) => {
                    warn!(symbol = %opp.symbol, error = %e, "planner venue error");
                    self.note_error("planner", e.to_string());
                    return Ok(LoopOutcome::BackOff);
                }
                Err(e) => {
                    // Planner-level gates filter the opportunity this tick
                    warn!(symbol = %opp.symbol, error = %e, "opportunity filtered");
                }
            }
        }
        *self.last_scan.lock().unwrap() = Some(scan);
        Ok(LoopOutcome::Done)
    }

    async fn verify_recent_fills(&self, weight: f64) -> Result<LoopOutcome> {
        let in_flight = self.engine.snapshot().pairs.iter().any(|p| {
            matches!(
                p.state,
                PairState::Submitting | PairState::Partial | PairState::Closing
            )
        });
        if !in_flight {
            return Ok(LoopOutcome::Done);
        }
        if !self.budgets.try_acquire_all(&self.perp_ids(), weight) {
            return Ok(LoopOutcome::Deferred);
        }
        self.engine.send(EngineCommand::PollFills).await;
        Ok(LoopOutcome::Done)
    }

    async fn check_position_balance(&self) -> Result<LoopOutcome> {
        self.engine.send(EngineCommand::CheckDrift).await;
        Ok(LoopOutcome::Done)
    }

    async fn refresh_capital(&self, weight: f64) -> Result<LoopOutcome> {
        if !self.budgets.try_acquire_all(&self.perp_ids(), weight) {
            return Ok(LoopOutcome::Deferred);
        }
        let mut balances = HashMap::new();
        for (id, venue) in &self.perps {
            match venue.balance().await {
                Ok(balance) => {
                    balances.insert(id.clone(), balance);
                }
                Err(e) => {
                    warn!(venue = %id, error = %e, "balance refresh failed");
                    if e.is_transient() {
                        return Ok(LoopOutcome::BackOff);
                    }
                }
            }
        }
        let mut cache = self.capital.lock().unwrap();
        cache.balances = balances;
        cache.fetched_at = Self::now();
        Ok(LoopOutcome::Done)
    }

    /// Total deployable capital across perp venues, from the cache when
    /// fresh enough.
    async fn deployable_capital(&self) -> Usd {
        {
            let cache = self.capital.lock().unwrap();
            if Self::now() - cache.fetched_at <= BALANCE_CACHE_TTL_SECS {
                return cache.balances.values().copied().sum();
            }
        }
        let mut total = Usd::ZERO;
        for venue in self.perps.values() {
            if let Ok(balance) = venue.balance().await {
                total = total + balance;
            }
        }
        total
    }

    async fn retry_single_leg(&self) -> Result<LoopOutcome> {
        let unresolved = self
            .engine
            .snapshot()
            .incidents
            .iter()
            .any(|i| !i.resolved);
        if unresolved {
            self.engine.send(EngineCommand::ResolveIncidents).await;
        }
        Ok(LoopOutcome::Done)
    }

    async fn verify_position_state(&self, weight: f64) -> Result<LoopOutcome> {
        let venue_ids: Vec<VenueId> = self.trade_venues.keys().cloned().collect();
        if !self.budgets.try_acquire_all(&venue_ids, weight) {
            return Ok(LoopOutcome::Deferred);
        }
        let mut venue_positions = HashMap::new();
        for (id, venue) in &self.trade_venues {
            match venue.positions().await {
                Ok(positions) => {
                    venue_positions.insert(id.clone(), positions);
                }
                Err(e) => {
                    warn!(venue = %id, error = %e, "position query failed; skipping venue");
                    if e.is_transient() {
                        return Ok(LoopOutcome::BackOff);
                    }
                }
            }
        }
        if !venue_positions.is_empty() {
            self.engine
                .send(EngineCommand::Reconcile { venue_positions })
                .await;
        }
        Ok(LoopOutcome::Done)
    }

    async fn update_metrics(&self, weight: f64) -> Result<LoopOutcome> {
        if !self.budgets.try_acquire_all(&self.perp_ids(), weight) {
            return Ok(LoopOutcome::Deferred);
        }
        let now = Self::now();
        for (id, venue) in &self.perps {
            let from = self
                .metrics
                .lock()
                .unwrap()
                .payment_cursor
                .get(id)
                .copied()
                .unwrap_or(now - 24 * 3600);
            let payments = match venue.funding_payments(from, now).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(venue = %id, error = %e, "funding payments unavailable");
                    continue;
                }
            };
            let mut metrics = self.metrics.lock().unwrap();
            for payment in &payments {
                metrics.record_funding(id, payment);
                if let Err(e) = self.store.append(&StoredEvent::FundingCollected {
                    venue: id.clone(),
                    payment: payment.clone(),
                }) {
                    warn!(error = %e, "failed to persist funding payment");
                }
            }
            metrics.payment_cursor.insert(id.clone(), now);
        }

        // Estimated APY of what we currently hold
        let snapshot = self.engine.snapshot();
        let mut weighted = 0.0;
        let mut notional = 0.0;
        for pair in snapshot.open_pairs() {
            weighted += pair.plan.opportunity.expected_return_apr.0 * pair.plan.notional.0;
            notional += pair.plan.notional.0;
        }
        if notional > 0.0 {
            self.metrics
                .lock()
                .unwrap()
                .record_apy_sample(now, weighted / notional);
        }
        Ok(LoopOutcome::Done)
    }

    /// Close pairs whose re-evaluated spread APY has decayed below the
    /// configured floor. A spread dip right after entry never triggers
    /// this: the pair must have been held for the whole rolling window.
    async fn close_unprofitable(&self) -> Result<LoopOutcome> {
        let now = Self::now();
        let window_secs = (self.config.close.window_hours * 3600.0) as i64;
        let threshold_pct = self.config.close.apy_threshold * 100.0;
        let snapshot = self.engine.snapshot();

        for pair in snapshot.open_pairs() {
            if now - pair.created_at < window_secs {
                continue;
            }
            let opp = &pair.plan.opportunity;
            let long_rate = self
                .history
                .weighted_average_rate(&opp.long_venue, &opp.symbol, now);
            let short_rate = self
                .history
                .weighted_average_rate(&opp.short_venue, &opp.symbol, now);
            let (Some(long_rate), Some(short_rate)) = (long_rate, short_rate) else {
                continue;
            };
            let spread = (short_rate - long_rate).abs();
            let apr = FundingRate::new(spread, opp.short_rate.intervals_per_day).annualized();
            if apr.0 < threshold_pct {
                info!(
                    pair = %pair.id,
                    symbol = %opp.symbol,
                    rolling_apr = %apr,
                    "rolling APY below threshold; closing"
                );
                self.engine
                    .send(EngineCommand::ClosePair {
                        pair_id: pair.id,
                        reason: format!("rolling APY {apr} below threshold"),
                    })
                    .await;
            }
        }
        Ok(LoopOutcome::Done)
    }

    async fn cleanup_stale_orders(&self, weight: f64) -> Result<LoopOutcome> {
        let venue_ids: Vec<VenueId> = self.trade_venues.keys().cloned().collect();
        if !self.budgets.try_acquire_all(&venue_ids, weight) {
            return Ok(LoopOutcome::Deferred);
        }
        let cutoff = Self::now() - self.config.stale_order_max_age_secs as i64;
        for (id, venue) in &self.trade_venues {
            let orders = match venue.open_orders(None).await {
                Ok(orders) => orders,
                Err(e) => {
                    debug!(venue = %id, error = %e, "open order query failed");
                    continue;
                }
            };
            for order in orders {
                if order.created_at < cutoff {
                    info!(venue = %id, order = %order.order_id, "cancelling stale order");
                    if let Err(e) = venue.cancel_order(&order.order_id).await {
                        warn!(venue = %id, error = %e, "stale cancel failed");
                    }
                }
            }
        }
        Ok(LoopOutcome::Done)
    }

    /// Rotate into a structurally better spread: a challenger must beat a
    /// held pair by `rotate_margin` APY for `rotate_dwell` consecutive
    /// scans before the incumbent is closed.
    async fn spread_rotation(&self) -> Result<LoopOutcome> {
        let margin_pct = self.config.rotate_margin * 100.0;
        let scan = self.last_scan.lock().unwrap().clone();
        let Some(scan) = scan else {
            return Ok(LoopOutcome::Done);
        };
        let snapshot = self.engine.snapshot();
        let held: Vec<_> = snapshot.open_pairs().collect();
        if held.is_empty() {
            self.rotation.lock().unwrap().challenger = None;
            return Ok(LoopOutcome::Done);
        }
        // Weakest incumbent vs strongest unheld challenger
        let weakest = held
            .iter()
            .min_by(|a, b| {
                a.plan
                    .opportunity
                    .expected_return_apr
                    .partial_cmp(&b.plan.opportunity.expected_return_apr)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| (p.id, p.plan.opportunity.expected_return_apr));
        let held_symbols: HashSet<&str> = held
            .iter()
            .map(|p| p.plan.opportunity.symbol.as_str())
            .collect();
        let challenger = scan
            .opportunities
            .iter()
            .filter(|o| !held_symbols.contains(o.symbol.as_str()))
            .max_by(|a, b| {
                a.expected_return_apr
                    .partial_cmp(&b.expected_return_apr)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let (Some((weak_id, weak_apr)), Some(challenger)) = (weakest, challenger) else {
            self.rotation.lock().unwrap().challenger = None;
            return Ok(LoopOutcome::Done);
        };
        let key = format!(
            "{}:{}:{}",
            challenger.symbol, challenger.long_venue, challenger.short_venue
        );
        let should_close = {
            let mut rotation = self.rotation.lock().unwrap();
            let mut close_streak = None;
            if challenger.expected_return_apr.0 >= weak_apr.0 + margin_pct {
                let streak = match &rotation.challenger {
                    Some((prev_key, prev_id, streak)) if *prev_key == key && *prev_id == weak_id => {
                        streak + 1
                    }
                    _ => 1,
                };
                rotation.challenger = Some((key, weak_id, streak));
                if streak >= self.config.rotate_dwell {
                    close_streak = Some(streak);
                    rotation.challenger = None;
                }
            } else {
                rotation.challenger = None;
            }
            close_streak
        };
        if let Some(streak) = should_close {
            info!(
                challenger = %challenger.symbol,
                streak,
                "rotation dwell met; closing incumbent"
            );
            self.engine
                .send(EngineCommand::ClosePair {
                    pair_id: weak_id,
                    reason: "spread rotation: better opportunity sustained".into(),
                })
                .await;
        }
        Ok(LoopOutcome::Done)
    }

    async fn emergency_health_check(&self, weight: f64) -> Result<LoopOutcome> {
        let Some(neutral) = &self.neutral else {
            return Ok(LoopOutcome::Done);
        };
        if let Some(lev) = &self.config.leveraged {
            if !self.budgets.try_acquire(&lev.venue, weight) {
                return Ok(LoopOutcome::Deferred);
            }
        }
        let mut controller = neutral.lock().await;
        match controller.tick(Self::now()).await {
            Ok(action) => {
                self.health_failures.store(0, Ordering::SeqCst);
                debug!(action = ?action, "health check pass");
            }
            Err(e) => {
                warn!(error = %e, "leveraged health check failed");
                self.note_error("health_check", e.to_string());
                drop(controller);
                // Three misses in a row counts as a fatal invariant break
                let failures = self.health_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= 3 {
                    self.trigger_fatal("emergency health check failing repeatedly")
                        .await;
                }
                return Ok(LoopOutcome::BackOff);
            }
        }
        Ok(LoopOutcome::Done)
    }

    /// Run one named loop body immediately with its default weight. Used
    /// by `--once` mode and the startup reconcile pass.
    pub async fn run_loop_once(&self, name: &str) -> Result<()> {
        let weight = LOOPS
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.weight)
            .unwrap_or(1.0);
        self.run_loop(name, weight).await.map(|_| ())
    }

    /// Single pass over every loop in table order, for `--once`.
    pub async fn run_all_once(&self) -> Result<()> {
        for def in LOOPS {
            if let Err(e) = self.run_loop(def.name, def.weight).await {
                warn!(name = def.name, error = %format!("{e:#}"), "once-pass loop failed");
            }
        }
        Ok(())
    }

    /// Snapshot positions, incidents and realized totals for restart.
    pub fn persist_snapshot(&self) {
        let engine = self.engine.snapshot();
        let metrics = self.metrics.lock().unwrap();
        let snapshot = KeeperSnapshot {
            schema_version: SCHEMA_VERSION,
            positions: engine.live_positions(),
            incidents: engine.incidents.clone(),
            realized_funding: metrics.realized_funding,
            realized_pnl: metrics.realized_pnl,
            saved_at: Self::now(),
        };
        if let Err(e) = self.store.save_snapshot(&snapshot) {
            warn!(error = %e, "failed to persist keeper snapshot");
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

pub struct KeeperScheduler {
    ctx: Arc<KeeperCtx>,
}

impl KeeperScheduler {
    pub fn new(ctx: Arc<KeeperCtx>) -> Self {
        KeeperScheduler { ctx }
    }

    fn resolve(&self, def: &LoopDef) -> (Duration, f64) {
        let over = self.ctx.config.loops.get(def.name);
        let period = over
            .and_then(|o| o.period_secs)
            .unwrap_or(def.period_secs);
        let weight = over.and_then(|o| o.budget_weight).unwrap_or(def.weight);
        (Duration::from_secs(period), weight)
    }

    /// Spawn every loop and block until shutdown flips, then drain: loops
    /// finish their current iteration, the engine closes all positions
    /// under the deadline, state persists.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for def in LOOPS {
            let (period, weight) = self.resolve(def);
            let ctx = self.ctx.clone();
            let mut shutdown = shutdown.clone();
            let name = def.name;
            tasks.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            match ctx.run_loop(name, weight).await {
                                Ok(LoopOutcome::Done) => {}
                                Ok(LoopOutcome::Deferred) => {
                                    debug!(name, "loop deferred");
                                }
                                Ok(LoopOutcome::BackOff) => {
                                    debug!(name, "loop backing off one period");
                                    interval.reset_after(period * 2);
                                }
                                Err(e) => {
                                    warn!(name, error = %format!("{e:#}"), "loop iteration failed");
                                    ctx.note_error(name, format!("{e:#}"));
                                }
                            }
                        }
                    }
                }
                debug!(name, "loop stopped");
            });
        }

        info!(loops = LOOPS.len(), "keeper loops running");
        while tasks.join_next().await.is_some() {}

        info!("loops drained; closing open positions");
        self.ctx
            .engine
            .close_all_and_drain("shutdown", SHUTDOWN_CLOSE_DEADLINE)
            .await;
        self.ctx.persist_snapshot();
        info!("keeper shutdown complete");
        Ok(())
    }
}
