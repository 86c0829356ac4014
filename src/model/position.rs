use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::units::{BaseQty, Price, Usd};
use super::VenueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Opening,
    Open,
    Rescuing,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// One leg of a held pair. Persisted; mutated only through the engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub id: Uuid,
    /// Groups the two legs of a pair (the plan id).
    pub strategy_id: Uuid,
    pub venue: VenueId,
    pub symbol: String,
    pub side: PositionSide,
    pub size: BaseQty,
    pub entry_price: Price,
    pub collateral: Usd,
    pub borrowed: Usd,
    /// Unix seconds.
    pub opened_at: i64,
    pub status: PositionStatus,
}

impl Position {
    pub fn notional(&self) -> Usd {
        self.size.to_usd(self.entry_price)
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::Opening
                | PositionStatus::Open
                | PositionStatus::Rescuing
                | PositionStatus::Closing
        )
    }
}

/// Liquidation-distance metric for a collateralized position.
///
/// `HF = collateral × liquidation_threshold / debt`; infinite with no debt,
/// liquidatable below 1.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct HealthFactor(pub f64);

impl HealthFactor {
    pub const INFINITE: HealthFactor = HealthFactor(f64::INFINITY);

    pub fn compute(collateral: Usd, liquidation_threshold: f64, debt: Usd) -> Self {
        if debt.0 <= 0.0 {
            return HealthFactor::INFINITE;
        }
        HealthFactor(collateral.0 * liquidation_threshold / debt.0)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_liquidatable(self) -> bool {
        self.0 < 1.0
    }
}

impl std::fmt::Display for HealthFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_infinite() {
            write!(f, "∞")
        } else {
            write!(f, "{:.3}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_infinite_without_debt() {
        let hf = HealthFactor::compute(Usd(1000.0), 0.85, Usd(0.0));
        assert!(hf.value().is_infinite());
    }

    #[test]
    fn hf_below_one_is_liquidatable() {
        let hf = HealthFactor::compute(Usd(1000.0), 0.8, Usd(900.0));
        assert!(hf.is_liquidatable());
    }
}
