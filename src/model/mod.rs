pub mod opportunity;
pub mod plan;
pub mod position;
pub mod snapshot;
pub mod units;

/// Configured venue name ("binance", "hyperliquid", ...).
pub type VenueId = String;

pub use opportunity::{ArbitrageOpportunity, StrategyType};
pub use plan::{EstimatedCosts, ExecutionPlan, OrderSpec, OrderType, Side, Tif};
pub use position::{HealthFactor, Position, PositionSide, PositionStatus};
pub use snapshot::{FundingSnapshot, ReserveSnapshot};
pub use units::{BaseQty, FundingRate, Pct, Price, Usd};
