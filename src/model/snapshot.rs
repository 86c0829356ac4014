use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::units::{FundingRate, Pct, Price, Usd};
use super::VenueId;

/// Point-in-time funding observation for one (venue, symbol).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FundingSnapshot {
    pub venue: VenueId,
    pub symbol: String,
    pub rate: FundingRate,
    pub mark_price: Price,
    pub open_interest: Usd,
    /// Unix seconds.
    pub timestamp: i64,
}

impl FundingSnapshot {
    pub fn annualized_apr(&self) -> Pct {
        self.rate.annualized()
    }
}

/// Point-in-time lending reserve observation for one (venue, asset).
///
/// All rates are annualized percentages. `incentive_apr` is `None` when the
/// venue cannot derive it from real emission rates; callers must not assume
/// a default.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReserveSnapshot {
    pub venue: VenueId,
    pub asset: String,
    pub supply_apr: Pct,
    pub borrow_apr: Pct,
    pub incentive_apr: Option<Pct>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl ReserveSnapshot {
    /// Net carry of a borrow position hedged by funding income: the caller
    /// subtracts `borrow_apr` from the perp funding APR.
    pub fn net_carry(&self, funding_apr: Pct) -> Pct {
        funding_apr - self.borrow_apr
    }
}
