//! In-process simulated venue used by `--dry-run` and the test suite.
//!
//! Tracks balances, orders and signed positions per symbol, accrues funding
//! on `advance()`, and can be scripted to fill, rest, partially fill or
//! reject the next orders — enough to exercise every engine transition
//! without a live exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::snapshot::ReserveSnapshot;
use crate::model::units::{BaseQty, FundingRate, Price, Usd};
use crate::model::{OrderType, Side};

use super::{
    FundingConvention, FundingPayment, LendingAccount, LendingVenue, OpenOrder, OrderAck,
    OrderRequest, OrderStatus, PerpVenue, VenueError, VenuePosition, VenueResult,
};

/// Scripted response for the next `place_order` call.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    /// Fill the full size at the limit (or jittered mark for market orders).
    Fill,
    /// Fill this fraction of the size, leave the rest resting.
    Partial(f64),
    /// Accept the order but leave it resting unfilled.
    Rest,
    /// Reject with the given error.
    Fail(VenueError),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    client_order_id: String,
    symbol: String,
    side: Side,
    size: BaseQty,
    price: Option<Price>,
    status: OrderStatus,
    created_at: i64,
}

#[derive(Debug, Default)]
struct MarketState {
    mark: f64,
    funding: FundingRate,
    open_interest: f64,
    /// Signed base-asset position (positive = long).
    position: f64,
    entry_price: f64,
}

struct Inner {
    now: i64,
    balance: f64,
    markets: HashMap<String, MarketState>,
    orders: HashMap<String, PaperOrder>,
    seen_client_ids: HashMap<String, String>,
    script: VecDeque<OrderOutcome>,
    payments: Vec<FundingPayment>,
    order_seq: u64,
    rng: StdRng,
}

/// Simulated perp venue. All state behind one mutex; methods are
/// trivially async.
pub struct PaperVenue {
    id: String,
    half_spread: f64,
    max_slippage_bps: f64,
    convention: FundingConvention,
    inner: Mutex<Inner>,
}

impl PaperVenue {
    pub fn new(id: &str, seed: u64) -> Self {
        PaperVenue {
            id: id.to_string(),
            half_spread: super::DEPTH_FALLBACK_SPREAD,
            max_slippage_bps: 2.0,
            convention: FundingConvention::LongsPayShorts,
            inner: Mutex::new(Inner {
                now: chrono::Utc::now().timestamp(),
                balance: 0.0,
                markets: HashMap::new(),
                orders: HashMap::new(),
                seen_client_ids: HashMap::new(),
                script: VecDeque::new(),
                payments: Vec::new(),
                order_seq: 0,
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    // ── Test/dry-run controls ───────────────────────────────────────

    pub fn set_now(&self, now: i64) {
        self.inner.lock().unwrap().now = now;
    }

    pub fn set_balance(&self, balance: Usd) {
        self.inner.lock().unwrap().balance = balance.0;
    }

    pub fn set_market(&self, symbol: &str, mark: Price, funding: FundingRate, oi: Usd) {
        let mut inner = self.inner.lock().unwrap();
        let market = inner.markets.entry(symbol.to_string()).or_default();
        market.mark = mark.0;
        market.funding = funding;
        market.open_interest = oi.0;
    }

    /// Queue a scripted outcome for the next order. Unscripted orders fill.
    pub fn push_order_outcome(&self, outcome: OrderOutcome) {
        self.inner.lock().unwrap().script.push_back(outcome);
    }

    /// Signed position for a symbol (tests).
    pub fn position_qty(&self, symbol: &str) -> BaseQty {
        let inner = self.inner.lock().unwrap();
        BaseQty(inner.markets.get(symbol).map(|m| m.position).unwrap_or(0.0))
    }

    /// Advance the clock and accrue funding on open positions.
    ///
    /// Under `LongsPayShorts`, a positive rate pays shorts and charges longs.
    pub fn advance(&self, dt: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.now += dt.as_secs() as i64;
        let now = inner.now;
        let hours = dt.as_secs_f64() / 3600.0;
        let mut accrued: Vec<FundingPayment> = Vec::new();
        for (symbol, market) in inner.markets.iter_mut() {
            if market.position.abs() < 1e-12 {
                continue;
            }
            let notional = market.position.abs() * market.mark;
            let per_hour = market.funding.per_hour();
            let sign = if market.position > 0.0 { -1.0 } else { 1.0 };
            let amount = sign * notional * per_hour * hours;
            accrued.push(FundingPayment {
                symbol: symbol.clone(),
                amount: Usd(amount),
                timestamp: now,
            });
        }
        for payment in accrued {
            inner.balance += payment.amount.0;
            inner.payments.push(payment);
        }
    }

    fn fill_order(inner: &mut Inner, order: &mut PaperOrder, qty: BaseQty, price: Price) {
        let market = inner.markets.entry(order.symbol.clone()).or_default();
        let signed = match order.side {
            Side::Buy => qty.0,
            Side::Sell => -qty.0,
        };
        let old = market.position;
        let new = old + signed;
        if old.abs() < 1e-12 || old.signum() == signed.signum() {
            let old_notional = old.abs() * market.entry_price;
            let add_notional = qty.0 * price.0;
            market.entry_price = if new.abs() > 1e-12 {
                (old_notional + add_notional) / new.abs()
            } else {
                0.0
            };
        } else {
            // Reducing or flipping: realize PnL on the closed amount
            let closed = qty.0.min(old.abs());
            let pnl_per_unit = if old > 0.0 {
                price.0 - market.entry_price
            } else {
                market.entry_price - price.0
            };
            inner.balance += closed * pnl_per_unit;
            if new.abs() < 1e-12 {
                market.entry_price = 0.0;
            }
        }
        market.position = new;
        order.status = if qty.0 + order.status.filled_qty().0 >= order.size.0 - 1e-12 {
            OrderStatus::Filled {
                filled: order.size,
                avg_price: price,
            }
        } else {
            OrderStatus::PartiallyFilled {
                filled: BaseQty(qty.0 + order.status.filled_qty().0),
                avg_price: price,
            }
        };
    }
}

#[async_trait]
impl PerpVenue for PaperVenue {
    fn id(&self) -> &str {
        &self.id
    }

    fn funding_convention(&self) -> FundingConvention {
        self.convention
    }

    async fn mark_price(&self, symbol: &str) -> VenueResult<Price> {
        let inner = self.inner.lock().unwrap();
        inner
            .markets
            .get(symbol)
            .filter(|m| m.mark > 0.0)
            .map(|m| Price(m.mark))
            .ok_or_else(|| VenueError::NotFound(format!("no market for {symbol}")))
    }

    async fn best_bid_ask(&self, symbol: &str) -> VenueResult<(Price, Price)> {
        let mark = self.mark_price(symbol).await?;
        Ok((
            Price(mark.0 * (1.0 - self.half_spread)),
            Price(mark.0 * (1.0 + self.half_spread)),
        ))
    }

    async fn funding_rate(&self, symbol: &str) -> VenueResult<FundingRate> {
        let inner = self.inner.lock().unwrap();
        inner
            .markets
            .get(symbol)
            .map(|m| m.funding)
            .ok_or_else(|| VenueError::NotFound(format!("no market for {symbol}")))
    }

    async fn open_interest(&self, symbol: &str) -> VenueResult<Usd> {
        let inner = self.inner.lock().unwrap();
        inner
            .markets
            .get(symbol)
            .map(|m| Usd(m.open_interest))
            .ok_or_else(|| VenueError::NotFound(format!("no market for {symbol}")))
    }

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<OrderAck> {
        let mut inner = self.inner.lock().unwrap();

        // Client-order-id dedup: one attempt per id
        if let Some(order_id) = inner.seen_client_ids.get(&req.client_order_id) {
            return Ok(OrderAck {
                order_id: order_id.clone(),
                client_order_id: req.client_order_id.clone(),
            });
        }

        let outcome = match inner.script.pop_front().unwrap_or(OrderOutcome::Fill) {
            OrderOutcome::Fail(err) => return Err(err),
            other => other,
        };

        if !inner.markets.contains_key(&req.symbol) {
            return Err(VenueError::NotFound(format!("no market for {}", req.symbol)));
        }

        inner.order_seq += 1;
        let order_id = format!("{}-{}", self.id, inner.order_seq);
        let mark = inner.markets[&req.symbol].mark;

        let fill_price = match req.order_type {
            OrderType::Limit => req.price.unwrap_or(Price(mark)),
            OrderType::Market => {
                let jitter: f64 = inner.rng.random::<f64>() * self.max_slippage_bps / 10_000.0;
                match req.side {
                    Side::Buy => Price(mark * (1.0 + self.half_spread + jitter)),
                    Side::Sell => Price(mark * (1.0 - self.half_spread - jitter)),
                }
            }
        };

        let mut order = PaperOrder {
            order_id: order_id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            size: req.size,
            price: req.price,
            status: OrderStatus::New,
            created_at: inner.now,
        };

        match outcome {
            OrderOutcome::Fill => {
                Self::fill_order(&mut inner, &mut order, req.size, fill_price);
            }
            OrderOutcome::Partial(fraction) => {
                let qty = BaseQty(req.size.0 * fraction.clamp(0.0, 1.0));
                Self::fill_order(&mut inner, &mut order, qty, fill_price);
            }
            OrderOutcome::Rest => {}
            OrderOutcome::Fail(_) => unreachable!(),
        }

        inner
            .seen_client_ids
            .insert(req.client_order_id.clone(), order_id.clone());
        inner.orders.insert(order_id.clone(), order);

        Ok(OrderAck {
            order_id,
            client_order_id: req.client_order_id.clone(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> VenueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| VenueError::NotFound(format!("order {order_id}")))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> VenueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for order in inner.orders.values_mut() {
            if order.symbol == symbol && !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> VenueResult<OrderStatus> {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .get(order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| VenueError::NotFound(format!("order {order_id}")))
    }

    async fn positions(&self) -> VenueResult<Vec<VenuePosition>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .markets
            .iter()
            .filter(|(_, m)| m.position.abs() > 1e-12)
            .map(|(symbol, m)| VenuePosition {
                symbol: symbol.clone(),
                side: if m.position > 0.0 { Side::Buy } else { Side::Sell },
                size: BaseQty(m.position.abs()),
                entry_price: Price(m.entry_price),
                unrealized_pnl: Usd((m.mark - m.entry_price) * m.position),
            })
            .collect())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> VenueResult<Vec<OpenOrder>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                client_order_id: o.client_order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                size: o.size,
                price: o.price,
                created_at: o.created_at,
            })
            .collect())
    }

    async fn balance(&self) -> VenueResult<Usd> {
        Ok(Usd(self.inner.lock().unwrap().balance))
    }

    async fn equity(&self) -> VenueResult<Usd> {
        let inner = self.inner.lock().unwrap();
        let upnl: f64 = inner
            .markets
            .values()
            .map(|m| (m.mark - m.entry_price) * m.position)
            .sum();
        Ok(Usd(inner.balance + upnl))
    }

    async fn funding_payments(&self, from: i64, to: i64) -> VenueResult<Vec<FundingPayment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.timestamp >= from && p.timestamp < to)
            .cloned()
            .collect())
    }

    async fn add_margin(&self, _symbol: &str, amount: Usd) -> VenueResult<()> {
        self.inner.lock().unwrap().balance += amount.0;
        Ok(())
    }
}

// ── Paper lending market ────────────────────────────────────────────

struct LendingInner {
    collateral: f64,
    debt: f64,
    supply_apr: f64,
    borrow_apr: f64,
}

/// Simulated lending market for the perp-lend strategy and HF rescue tests.
pub struct PaperLending {
    id: String,
    liquidation_threshold: f64,
    inner: Mutex<LendingInner>,
}

impl PaperLending {
    pub fn new(id: &str, liquidation_threshold: f64) -> Self {
        PaperLending {
            id: id.to_string(),
            liquidation_threshold,
            inner: Mutex::new(LendingInner {
                collateral: 0.0,
                debt: 0.0,
                supply_apr: 0.0,
                borrow_apr: 0.0,
            }),
        }
    }

    pub fn set_rates(&self, supply_apr: f64, borrow_apr: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.supply_apr = supply_apr;
        inner.borrow_apr = borrow_apr;
    }

    pub fn set_account(&self, collateral: Usd, debt: Usd) {
        let mut inner = self.inner.lock().unwrap();
        inner.collateral = collateral.0;
        inner.debt = debt.0;
    }
}

#[async_trait]
impl LendingVenue for PaperLending {
    fn id(&self) -> &str {
        &self.id
    }

    async fn reserve_rates(&self, asset: &str) -> VenueResult<ReserveSnapshot> {
        let inner = self.inner.lock().unwrap();
        Ok(ReserveSnapshot {
            venue: self.id.clone(),
            asset: asset.to_string(),
            supply_apr: crate::model::Pct(inner.supply_apr),
            borrow_apr: crate::model::Pct(inner.borrow_apr),
            incentive_apr: None,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    async fn account(&self) -> VenueResult<LendingAccount> {
        let inner = self.inner.lock().unwrap();
        Ok(LendingAccount {
            collateral: Usd(inner.collateral),
            debt: Usd(inner.debt),
            liquidation_threshold: self.liquidation_threshold,
        })
    }

    async fn deposit(&self, _asset: &str, amount: Usd) -> VenueResult<()> {
        self.inner.lock().unwrap().collateral += amount.0;
        Ok(())
    }

    async fn withdraw(&self, _asset: &str, amount: Usd) -> VenueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if amount.0 > inner.collateral {
            return Err(VenueError::InsufficientBalance);
        }
        inner.collateral -= amount.0;
        Ok(())
    }

    async fn borrow(&self, _asset: &str, amount: Usd) -> VenueResult<()> {
        self.inner.lock().unwrap().debt += amount.0;
        Ok(())
    }

    async fn repay(&self, _asset: &str, amount: Usd) -> VenueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.debt = (inner.debt - amount.0).max(0.0);
        Ok(())
    }
}
