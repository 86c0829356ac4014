use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fixed-point scale used by lending protocols that report rates in ray.
pub const RAY: f64 = 1e27;

/// Annualized rate expressed as a percentage (35.0 = 35% per year).
///
/// Never a decimal fraction. Crossing between `Pct` and decimal fractions
/// goes through [`Pct::from_decimal`] / [`Pct::as_decimal`] only.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Pct(pub f64);

impl Pct {
    /// Build from a decimal fraction (0.35 → 35%).
    pub fn from_decimal(d: f64) -> Self {
        Pct(d * 100.0)
    }

    /// Decimal fraction view (35% → 0.35).
    pub fn as_decimal(self) -> f64 {
        self.0 / 100.0
    }

    /// Convert a lending-protocol ray value (1e27 = 100%) to a percentage.
    pub fn from_ray(ray: f64) -> Self {
        Pct(ray * 100.0 / RAY)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl std::ops::Add for Pct {
    type Output = Pct;
    fn add(self, rhs: Pct) -> Pct {
        Pct(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Pct {
    type Output = Pct;
    fn sub(self, rhs: Pct) -> Pct {
        Pct(self.0 - rhs.0)
    }
}

impl std::fmt::Display for Pct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.0)
    }
}

/// A venue price in quote currency (USD).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Price(pub f64);

impl Price {
    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// A notional amount in USD.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Usd(pub f64);

impl Usd {
    pub const ZERO: Usd = Usd(0.0);

    pub fn value(self) -> f64 {
        self.0
    }

    /// Base-asset size this notional buys at `price`. Zero price yields zero.
    pub fn to_base(self, price: Price) -> BaseQty {
        if price.0 <= 0.0 {
            BaseQty(0.0)
        } else {
            BaseQty(self.0 / price.0)
        }
    }
}

impl std::ops::Add for Usd {
    type Output = Usd;
    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Usd {
    type Output = Usd;
    fn sub(self, rhs: Usd) -> Usd {
        Usd(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        Usd(iter.map(|u| u.0).sum())
    }
}

impl std::fmt::Display for Usd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.2}", self.0)
    }
}

/// A position size in base-asset units (e.g. ETH).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BaseQty(pub f64);

impl BaseQty {
    pub fn value(self) -> f64 {
        self.0
    }

    /// Notional value at `price`.
    pub fn to_usd(self, price: Price) -> Usd {
        Usd(self.0 * price.0)
    }

    pub fn abs(self) -> BaseQty {
        BaseQty(self.0.abs())
    }
}

impl std::fmt::Display for BaseQty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// A perp funding rate: per-interval decimal plus the venue's interval count.
///
/// Sign-aware: positive means longs pay shorts under the default convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FundingRate {
    /// Per-interval decimal rate (e.g. 0.0003 for 0.03% per 8h interval).
    pub per_interval: f64,
    /// Funding intervals per day (3 for 8h venues, 24 for hourly venues).
    pub intervals_per_day: u32,
}

impl FundingRate {
    pub fn new(per_interval: f64, intervals_per_day: u32) -> Self {
        FundingRate {
            per_interval,
            intervals_per_day,
        }
    }

    /// Annualized APR as a percentage: per-interval × intervals/day × 365 × 100.
    pub fn annualized(&self) -> Pct {
        Pct(self.per_interval * self.intervals_per_day as f64 * 365.0 * 100.0)
    }

    /// Rebuild a per-interval rate from an annualized percentage.
    pub fn from_annualized(apr: Pct, intervals_per_day: u32) -> Self {
        let per_interval = apr.0 / 100.0 / 365.0 / intervals_per_day as f64;
        FundingRate {
            per_interval,
            intervals_per_day,
        }
    }

    /// Per-hour decimal rate, used for break-even math.
    pub fn per_hour(&self) -> f64 {
        self.per_interval * self.intervals_per_day as f64 / 24.0
    }

    pub fn is_valid(&self) -> bool {
        self.per_interval.is_finite() && self.intervals_per_day > 0
    }
}

impl Default for FundingRate {
    fn default() -> Self {
        FundingRate {
            per_interval: 0.0,
            intervals_per_day: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annualized_round_trips_per_interval() {
        let rate = FundingRate::new(0.0003, 3);
        let apr = rate.annualized();
        let back = FundingRate::from_annualized(apr, 3);
        assert!((back.per_interval - 0.0003).abs() < 1e-12);
    }

    #[test]
    fn ray_conversion_matches_contract() {
        // 5% APR stored in ray
        let ray = 0.05 * RAY;
        assert!((Pct::from_ray(ray).value() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn pct_decimal_crossing_is_explicit() {
        assert_eq!(Pct::from_decimal(0.35).value(), 35.0);
        assert!((Pct(35.0).as_decimal() - 0.35).abs() < 1e-12);
    }
}
