use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::units::{FundingRate, Pct, Price, Usd};
use super::VenueId;

/// Which pair of instruments the spread is collected across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    /// Long perp on one venue, short perp on another.
    PerpPerp,
    /// Perp hedged with a spot position on the same or another venue.
    PerpSpot,
    /// Perp hedged with a lending-market borrow.
    PerpLend,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyType::PerpPerp => write!(f, "perp-perp"),
            StrategyType::PerpSpot => write!(f, "perp-spot"),
            StrategyType::PerpLend => write!(f, "perp-lend"),
        }
    }
}

/// One fundable spread found by a scan. Ephemeral: rebuilt every tick.
///
/// `long_venue` is the leg we buy, `short_venue` the leg we sell. Rates are
/// sign-aware; the aggregator has already oriented the legs so the short leg
/// collects the higher funding.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArbitrageOpportunity {
    pub symbol: String,
    pub strategy: StrategyType,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub long_rate: FundingRate,
    pub short_rate: FundingRate,
    /// Absolute per-interval rate difference (decimal).
    pub spread: f64,
    pub expected_return_apr: Pct,
    pub long_mark: Price,
    pub short_mark: Price,
    pub long_oi: Usd,
    pub short_oi: Usd,
    /// Monotonically increasing id of the scan that produced this.
    pub scan_id: u64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl ArbitrageOpportunity {
    /// Construction invariant: a perp-perp pair must span two venues.
    pub fn is_well_formed(&self) -> bool {
        match self.strategy {
            StrategyType::PerpPerp => self.long_venue != self.short_venue,
            _ => true,
        }
    }

    /// Average of the two marks, used for base-asset sizing.
    pub fn avg_mark(&self) -> Price {
        Price((self.long_mark.0 + self.short_mark.0) / 2.0)
    }

    /// Smaller of the two open interests — the liquidity bound.
    pub fn min_oi(&self) -> Usd {
        Usd(self.long_oi.0.min(self.short_oi.0))
    }

    /// Per-hour decimal return of the spread.
    pub fn spread_per_hour(&self) -> f64 {
        let intervals = self.short_rate.intervals_per_day.max(1) as f64;
        self.spread * intervals / 24.0
    }
}
