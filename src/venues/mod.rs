pub mod paper;

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::snapshot::ReserveSnapshot;
use crate::model::units::{BaseQty, FundingRate, Price, Usd};
use crate::model::{HealthFactor, OrderType, Side, Tif};

/// Fallback half-spread applied when a venue cannot serve depth: the core
/// synthesizes `mark × (1 ± 0.0005)`.
pub const DEPTH_FALLBACK_SPREAD: f64 = 0.0005;

// ── Error contract ──────────────────────────────────────────────────

/// Typed failure for every adapter operation. Adapters never retry network
/// errors themselves; the keeper decides.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("network: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("auth: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("venue error: {0}")]
    Unknown(String),
}

impl VenueError {
    /// Transient errors the scheduler may retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Network(_) | VenueError::RateLimited { .. }
        )
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

// ── Wire-facing types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: BaseQty,
    pub price: Option<Price>,
    pub tif: Tif,
    pub reduce_only: bool,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum OrderStatus {
    New,
    PartiallyFilled { filled: BaseQty, avg_price: Price },
    Filled { filled: BaseQty, avg_price: Price },
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled { .. }
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn filled_qty(&self) -> BaseQty {
        match self {
            OrderStatus::PartiallyFilled { filled, .. } | OrderStatus::Filled { filled, .. } => {
                *filled
            }
            _ => BaseQty(0.0),
        }
    }
}

/// A position as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub size: BaseQty,
    pub entry_price: Price,
    pub unrealized_pnl: Usd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: BaseQty,
    pub price: Option<Price>,
    /// Unix seconds.
    pub created_at: i64,
}

/// A realized funding transfer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FundingPayment {
    pub symbol: String,
    /// Positive = received, negative = paid.
    pub amount: Usd,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Who pays whom when the funding rate is positive. Differs per venue and
/// must be declared by each adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FundingConvention {
    LongsPayShorts,
    ShortsPayLongs,
}

/// Collateral/debt view of a lending account, enough to compute HF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LendingAccount {
    pub collateral: Usd,
    pub debt: Usd,
    pub liquidation_threshold: f64,
}

impl LendingAccount {
    pub fn health_factor(&self) -> HealthFactor {
        HealthFactor::compute(self.collateral, self.liquidation_threshold, self.debt)
    }
}

// ── Adapter traits ──────────────────────────────────────────────────

/// Uniform perp-venue capability set the core consumes. Spot venues
/// implement the same trait with `funding_rate` returning a zero rate.
///
/// Implementations live outside the core (REST/WS clients, signing,
/// symbol normalization); [`paper::PaperVenue`] is the in-process stand-in
/// used by dry runs and tests.
#[async_trait]
pub trait PerpVenue: Send + Sync {
    fn id(&self) -> &str;

    /// Funding sign convention for this venue.
    fn funding_convention(&self) -> FundingConvention {
        FundingConvention::LongsPayShorts
    }

    async fn mark_price(&self, symbol: &str) -> VenueResult<Price>;

    /// Best bid/ask. Adapters without depth fall back to
    /// `mark × (1 ± DEPTH_FALLBACK_SPREAD)`.
    async fn best_bid_ask(&self, symbol: &str) -> VenueResult<(Price, Price)>;

    async fn funding_rate(&self, symbol: &str) -> VenueResult<FundingRate>;

    /// Total open notional on the contract, USD.
    async fn open_interest(&self, symbol: &str) -> VenueResult<Usd>;

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> VenueResult<()>;

    async fn cancel_all(&self, symbol: &str) -> VenueResult<()>;

    async fn order_status(&self, order_id: &str) -> VenueResult<OrderStatus>;

    async fn positions(&self) -> VenueResult<Vec<VenuePosition>>;

    async fn open_orders(&self, symbol: Option<&str>) -> VenueResult<Vec<OpenOrder>>;

    /// Free cash available for new positions.
    async fn balance(&self) -> VenueResult<Usd>;

    /// Cash plus unrealized PnL.
    async fn equity(&self) -> VenueResult<Usd>;

    /// Realized funding transfers in `[from, to)`. May be empty.
    async fn funding_payments(&self, from: i64, to: i64) -> VenueResult<Vec<FundingPayment>>;

    /// Top up isolated margin for a symbol. Venues without margin
    /// transfers reject.
    async fn add_margin(&self, _symbol: &str, _amount: Usd) -> VenueResult<()> {
        Err(VenueError::InvalidRequest(
            "margin transfers not supported".into(),
        ))
    }
}

/// Lending-market capability set for the perp-lend strategy and the
/// leveraged delta-neutral controller.
#[async_trait]
pub trait LendingVenue: Send + Sync {
    fn id(&self) -> &str;

    async fn reserve_rates(&self, asset: &str) -> VenueResult<ReserveSnapshot>;

    async fn account(&self) -> VenueResult<LendingAccount>;

    async fn deposit(&self, asset: &str, amount: Usd) -> VenueResult<()>;

    async fn withdraw(&self, asset: &str, amount: Usd) -> VenueResult<()>;

    async fn borrow(&self, asset: &str, amount: Usd) -> VenueResult<()>;

    async fn repay(&self, asset: &str, amount: Usd) -> VenueResult<()>;
}
