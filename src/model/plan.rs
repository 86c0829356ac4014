use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::opportunity::ArbitrageOpportunity;
use super::units::{BaseQty, Price, Usd};
use super::VenueId;

/// Tolerance for the plan price invariants: a long limit may not exceed its
/// mark by more than this fraction, and vice versa for the short.
pub const LIMIT_PRICE_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time-in-force for resting orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Tif {
    Gtc,
    Ioc,
}

/// One leg of a plan, ready to hand to a venue adapter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OrderSpec {
    pub venue: VenueId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: BaseQty,
    pub limit_price: Option<Price>,
    pub tif: Tif,
    pub reduce_only: bool,
    /// Derived from the plan id; venues dedup on this.
    pub client_order_id: String,
}

/// Entry/exit cost estimate in USD terms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct EstimatedCosts {
    pub entry_fees: Usd,
    pub exit_fees: Usd,
    pub slippage: Usd,
    pub total: Usd,
}

/// A validated two-leg entry ready for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub opportunity: ArbitrageOpportunity,
    pub long_order: OrderSpec,
    pub short_order: OrderSpec,
    /// Per-leg size in base asset.
    pub size_base: BaseQty,
    /// Per-leg notional in USD.
    pub notional: Usd,
    pub leverage: f64,
    pub costs: EstimatedCosts,
    /// Funding income per hour at the planned size.
    pub hourly_return: Usd,
    /// Income per hour net of amortized entry/exit costs.
    pub expected_net_return_per_hour: Usd,
    /// Hours of holding before funding covers total costs.
    pub break_even_hours: f64,
    /// Unix seconds.
    pub created_at: i64,
}

impl ExecutionPlan {
    /// Client order id for the long leg.
    pub fn long_client_id(id: &Uuid) -> String {
        format!("{id}-L")
    }

    /// Client order id for the short leg.
    pub fn short_client_id(id: &Uuid) -> String {
        format!("{id}-S")
    }

    /// Check the construction invariants: equal leg sizes and limit prices
    /// within epsilon of the marks.
    pub fn validate(&self) -> Result<(), String> {
        if (self.long_order.size.0 - self.short_order.size.0).abs() > 1e-12 {
            return Err(format!(
                "leg sizes differ: long {} vs short {}",
                self.long_order.size, self.short_order.size
            ));
        }
        if let Some(limit) = self.long_order.limit_price {
            let cap = self.opportunity.long_mark.0 * (1.0 + LIMIT_PRICE_EPSILON);
            if limit.0 > cap {
                return Err(format!("long limit {} above mark cap {:.4}", limit, cap));
            }
        }
        if let Some(limit) = self.short_order.limit_price {
            let floor = self.opportunity.short_mark.0 * (1.0 - LIMIT_PRICE_EPSILON);
            if limit.0 < floor {
                return Err(format!("short limit {} below mark floor {:.4}", limit, floor));
            }
        }
        if !self.opportunity.is_well_formed() {
            return Err("opportunity legs share a venue".to_string());
        }
        Ok(())
    }
}
