//! Turns a sized opportunity into a validated two-leg execution plan, or a
//! typed rejection that filters it from this tick.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::costs;
use crate::liquidity::{DepthProfile, LiquidityOptimizer};
use crate::model::opportunity::ArbitrageOpportunity;
use crate::model::plan::{EstimatedCosts, ExecutionPlan, OrderSpec, OrderType, Side, Tif};
use crate::model::units::{Price, Usd};
use crate::model::VenueId;
use crate::venues::{PerpVenue, VenueError};

/// Planner-level rejection. Logged at WARN and dropped for the tick; the
/// opportunity is not retried until its inputs change.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no adapter configured for venue '{0}'")]
    VenueUnavailable(VenueId),
    #[error("insufficient balance: deployable {deployable} below minimum {minimum}")]
    InsufficientBalance { deployable: Usd, minimum: Usd },
    #[error("liquidity too low: market supports {cap} below minimum {minimum}")]
    LiquidityTooLow { cap: Usd, minimum: Usd },
    #[error("unprofitable: net {net_return}/h, break-even {break_even_hours:.1}h")]
    Unprofitable {
        net_return: Usd,
        break_even_hours: f64,
    },
    #[error("data quality: {0}")]
    DataQuality(String),
    #[error("stale quote: {0}")]
    StaleQuote(String),
    #[error(transparent)]
    Venue(#[from] VenueError),
}

/// Per-venue trading fees, decimal fractions of notional.
#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        FeeSchedule {
            maker: costs::DEFAULT_FEE_RATE,
            taker: costs::DEFAULT_FEE_RATE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub leverage: f64,
    /// Fraction of the smaller free balance the planner may commit.
    pub balance_usage_pct: f64,
    pub min_position_usd: Usd,
    pub max_break_even_hours: f64,
    pub fees: HashMap<VenueId, FeeSchedule>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            leverage: 2.0,
            balance_usage_pct: 0.9,
            min_position_usd: Usd(1000.0),
            max_break_even_hours: 7.0 * 24.0,
            fees: HashMap::new(),
        }
    }
}

pub struct ExecutionPlanBuilder {
    pub config: PlannerConfig,
    pub liquidity: LiquidityOptimizer,
}

impl ExecutionPlanBuilder {
    pub fn new(config: PlannerConfig, liquidity: LiquidityOptimizer) -> Self {
        ExecutionPlanBuilder { config, liquidity }
    }

    fn fees(&self, venue: &str) -> FeeSchedule {
        self.config.fees.get(venue).copied().unwrap_or_default()
    }

    /// Build a plan for an opportunity at (up to) the allocated size.
    pub async fn build(
        &self,
        opp: &ArbitrageOpportunity,
        allocation: Usd,
        venues: &HashMap<VenueId, Arc<dyn PerpVenue>>,
        now: i64,
    ) -> Result<ExecutionPlan, PlanError> {
        let long = venues
            .get(&opp.long_venue)
            .ok_or_else(|| PlanError::VenueUnavailable(opp.long_venue.clone()))?;
        let short = venues
            .get(&opp.short_venue)
            .ok_or_else(|| PlanError::VenueUnavailable(opp.short_venue.clone()))?;

        // Refresh marks if the scan did not carry them
        let long_mark = if opp.long_mark.is_positive() {
            opp.long_mark
        } else {
            long.mark_price(&opp.symbol).await?
        };
        let short_mark = if opp.short_mark.is_positive() {
            opp.short_mark
        } else {
            short.mark_price(&opp.symbol).await?
        };

        // Deployable capital: the thinner balance bounds both legs
        let long_balance = long.balance().await?;
        let short_balance = short.balance().await?;
        let available = Usd(long_balance.0.min(short_balance.0) * self.config.balance_usage_pct);
        let leveraged = Usd(available.0 * self.config.leverage);
        let mut position_usd = Usd(allocation.0.min(leveraged.0));
        if position_usd < self.config.min_position_usd {
            return Err(PlanError::InsufficientBalance {
                deployable: position_usd,
                minimum: self.config.min_position_usd,
            });
        }

        let avg_mark = Price((long_mark.0 + short_mark.0) / 2.0);
        if avg_mark.0 <= 0.0 {
            return Err(PlanError::StaleQuote("zero mark price".into()));
        }

        // Liquidity cap from the live books
        let (long_bid, long_ask) = long.best_bid_ask(&opp.symbol).await?;
        let (short_bid, short_ask) = short.best_bid_ask(&opp.symbol).await?;
        let depth = DepthProfile {
            // Conservative: the wider of the two books
            bid: Price(long_bid.0.min(short_bid.0)),
            ask: Price(long_ask.0.max(short_ask.0)),
            long_oi: opp.long_oi,
            short_oi: opp.short_oi,
        };
        let fee_rate = self.fees(&opp.short_venue).maker;
        let sizing = self.liquidity.max_viable_size(
            Some(&depth),
            opp.expected_return_apr,
            Some(fee_rate),
            opp.long_oi,
            opp.short_oi,
        );
        if sizing.size < self.config.min_position_usd {
            return Err(PlanError::LiquidityTooLow {
                cap: sizing.size,
                minimum: self.config.min_position_usd,
            });
        }
        if sizing.size < position_usd {
            debug!(
                symbol = %opp.symbol,
                capped = %sizing.size,
                wanted = %position_usd,
                "liquidity cap shrank the position"
            );
            position_usd = sizing.size;
        }

        let size_base = position_usd.to_base(avg_mark);

        // Costs: maker entry on both legs, taker exit on both legs
        let long_fees = self.fees(&opp.long_venue);
        let short_fees = self.fees(&opp.short_venue);
        let entry_fees = costs::fee_cost(position_usd, Some(long_fees.maker))
            + costs::fee_cost(position_usd, Some(short_fees.maker));
        let exit_fees = costs::fee_cost(position_usd, Some(long_fees.taker))
            + costs::fee_cost(position_usd, Some(short_fees.taker));
        let entry_slip =
            costs::slippage_cost(position_usd, long_bid, long_ask, OrderType::Limit, opp.long_oi)
                + costs::slippage_cost(
                    position_usd,
                    short_bid,
                    short_ask,
                    OrderType::Limit,
                    opp.short_oi,
                );
        // Exits may have to cross the spread
        let exit_slip =
            costs::slippage_cost(position_usd, long_bid, long_ask, OrderType::Market, opp.long_oi)
                + costs::slippage_cost(
                    position_usd,
                    short_bid,
                    short_ask,
                    OrderType::Market,
                    opp.short_oi,
                );
        let slippage = entry_slip + exit_slip;
        let total_costs = entry_fees + exit_fees + slippage;
        let estimated = EstimatedCosts {
            entry_fees,
            exit_fees,
            slippage,
            total: total_costs,
        };

        // Our own flow moves the rates: longs push up what we pay, our
        // short dampens what we collect
        let long_impact = costs::funding_impact(
            opp.long_rate.per_interval,
            position_usd,
            opp.long_oi,
            true,
        );
        let short_impact = costs::funding_impact(
            opp.short_rate.per_interval,
            position_usd,
            opp.short_oi,
            false,
        );
        let adjusted_spread =
            (opp.short_rate.per_interval + short_impact) - (opp.long_rate.per_interval + long_impact);
        let impact_shift = (adjusted_spread - opp.spread).abs();
        let effective_spread = if impact_shift > 0.01 * opp.spread.abs() {
            adjusted_spread
        } else {
            opp.spread
        };

        let intervals = opp.short_rate.intervals_per_day.max(1) as f64;
        let hourly_return = Usd(position_usd.0 * effective_spread * intervals / 24.0);
        let break_even_hours = costs::break_even_hours(total_costs, hourly_return);
        let amortization_periods = if break_even_hours.is_finite() {
            (break_even_hours.ceil() as i64).clamp(1, 24) as f64
        } else {
            1.0
        };
        let net_return = Usd(hourly_return.0 - total_costs.0 / amortization_periods);

        let profitable = net_return.0 > 0.0
            || (break_even_hours <= self.config.max_break_even_hours && hourly_return.0 > 0.0);
        if !profitable {
            return Err(PlanError::Unprofitable {
                net_return,
                break_even_hours,
            });
        }

        // Post-at-mark maker policy on both legs
        let id = Uuid::new_v4();
        let plan = ExecutionPlan {
            id,
            opportunity: opp.clone(),
            long_order: OrderSpec {
                venue: opp.long_venue.clone(),
                symbol: opp.symbol.clone(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                size: size_base,
                limit_price: Some(long_mark),
                tif: Tif::Gtc,
                reduce_only: false,
                client_order_id: ExecutionPlan::long_client_id(&id),
            },
            short_order: OrderSpec {
                venue: opp.short_venue.clone(),
                symbol: opp.symbol.clone(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                size: size_base,
                limit_price: Some(short_mark),
                tif: Tif::Gtc,
                reduce_only: false,
                client_order_id: ExecutionPlan::short_client_id(&id),
            },
            size_base,
            notional: position_usd,
            leverage: self.config.leverage,
            costs: estimated,
            hourly_return,
            expected_net_return_per_hour: net_return,
            break_even_hours,
            created_at: now,
        };

        plan.validate().map_err(PlanError::DataQuality)?;
        Ok(plan)
    }
}
