//! Leveraged single-venue delta-neutral controller: leveraged long on the
//! lending market, matching perp short, funding collected while the health
//! factor is actively defended.
//!
//! Rescue moves value between the two legs of the same position to restore
//! risk metrics without breaking neutrality. Every rescue plan degrades to
//! the next coarser action when a sub-step fails:
//! rescue-and-releverage → partial rescue → reduce leverage → deleverage.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LeveragedConfig;
use crate::model::plan::{OrderType, Side, Tif};
use crate::model::units::{BaseQty, Pct, Price, Usd};
use crate::model::HealthFactor;
use crate::venues::{LendingVenue, OrderRequest, PerpVenue, VenuePosition};

/// Rescue only moves money when at least this much PnL is realizable.
const MIN_RESCUE_USD: f64 = 10.0;
/// Fraction of realized PnL that actually lands as new collateral.
const RESCUE_DEPOSIT_FRACTION: f64 = 0.9;
/// Perp margin ratio below which the perp leg itself needs rescue.
const MIN_PERP_MARGIN_RATIO: f64 = 0.05;
/// Reverse rescue may only drain lending collateral above this HF.
const REVERSE_RESCUE_MIN_HF: f64 = 2.0;

/// What the controller did this tick, for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    None,
    Opened { notional: Usd, leverage: f64 },
    RescueReleverage { realized: Usd, deposited: Usd },
    PartialRescue { realized: Usd, deposited: Usd },
    ReducedLeverage { closed: BaseQty },
    Deleveraged,
    ReverseRescue { moved: Usd },
    Closed { reason: String },
    Rebalanced { adjusted: BaseQty },
}

pub struct DeltaNeutralController {
    config: LeveragedConfig,
    perp: Arc<dyn PerpVenue>,
    lending: Arc<dyn LendingVenue>,
    last_rebalance: i64,
}

impl DeltaNeutralController {
    pub fn new(
        config: LeveragedConfig,
        perp: Arc<dyn PerpVenue>,
        lending: Arc<dyn LendingVenue>,
    ) -> Self {
        DeltaNeutralController {
            config,
            perp,
            lending,
            last_rebalance: 0,
        }
    }

    /// One control pass. At most one action fires per tick; the HF ladder
    /// outranks carry checks, which outrank drift.
    pub async fn tick(&mut self, now: i64) -> Result<ControllerAction> {
        let asset = self.config.asset.clone();
        let funding = self
            .perp
            .funding_rate(&asset)
            .await
            .context("reading funding rate")?;
        let reserve = self
            .lending
            .reserve_rates(&asset)
            .await
            .context("reading reserve rates")?;
        let account = self.lending.account().await.context("reading lending account")?;
        let mark = self.perp.mark_price(&asset).await.context("reading mark")?;
        let hf = account.health_factor();

        let position = self.find_short(&asset).await?;
        let net_carry = funding.annualized() - reserve.borrow_apr;

        let Some(position) = position else {
            return self.maybe_open(funding.per_interval, net_carry, &account.collateral, mark).await;
        };

        // 1. Health-factor ladder
        if hf.value() < self.config.emergency_hf {
            warn!(hf = %hf, "HF below emergency threshold");
            return self.emergency_ladder(&position, &account.collateral, account.debt, mark).await;
        }
        if hf.value() < self.config.min_hf {
            warn!(hf = %hf, "HF below minimum; partial rescue");
            return self.partial_ladder(&position, account.debt, mark).await;
        }
        if hf.value() < self.config.warn_hf {
            info!(hf = %hf, "HF in warning band");
        }

        // 2. Carry gates
        if funding.per_interval < self.config.funding_flip_threshold || net_carry.0 <= 0.0 {
            let reason = format!(
                "carry gone: funding {:.6}/interval, net carry {}",
                funding.per_interval, net_carry
            );
            self.close_all(&position, account.debt).await?;
            return Ok(ControllerAction::Closed { reason });
        }

        // 3. Perp-side margin rescue
        let notional = position.size.to_usd(mark);
        let perp_equity = self.perp.equity().await.unwrap_or(Usd::ZERO);
        if notional.0 > 0.0 && perp_equity.0 / notional.0 < MIN_PERP_MARGIN_RATIO {
            if hf.value() >= REVERSE_RESCUE_MIN_HF {
                let needed = Usd(notional.0 * MIN_PERP_MARGIN_RATIO * 2.0 - perp_equity.0);
                self.lending
                    .withdraw(&asset, needed)
                    .await
                    .context("reverse rescue withdraw")?;
                self.perp
                    .add_margin(&asset, needed)
                    .await
                    .context("reverse rescue margin top-up")?;
                warn!(moved = %needed, "reverse rescue: lending collateral moved to perp margin");
                return Ok(ControllerAction::ReverseRescue { moved: needed });
            }
            warn!("perp margin thin and HF too low to raid; closing position");
            self.close_all(&position, account.debt).await?;
            return Ok(ControllerAction::Closed {
                reason: "perp margin below 5% with no rescue headroom".into(),
            });
        }

        // 4. Delta drift
        let spot_size = account.collateral.to_base(mark);
        if spot_size.0 > 0.0 {
            let drift = (spot_size.0 - position.size.0).abs() / spot_size.0;
            let cooldown_over = now - self.last_rebalance
                >= self.config.rebalance_cooldown_secs as i64;
            if drift > self.config.drift_limit && cooldown_over {
                let adjust = BaseQty(spot_size.0 - position.size.0);
                let side = if adjust.0 > 0.0 { Side::Sell } else { Side::Buy };
                self.place_perp(&asset, side, adjust.abs(), adjust.0 < 0.0)
                    .await
                    .context("drift rebalance order")?;
                self.last_rebalance = now;
                info!(drift = %format!("{drift:.4}"), "delta drift rebalanced");
                return Ok(ControllerAction::Rebalanced { adjusted: adjust.abs() });
            }
        }

        Ok(ControllerAction::None)
    }

    // ── Entry ───────────────────────────────────────────────────────

    async fn maybe_open(
        &self,
        funding_per_interval: f64,
        net_carry: Pct,
        collateral: &Usd,
        mark: Price,
    ) -> Result<ControllerAction> {
        if funding_per_interval < self.config.min_funding_rate {
            return Ok(ControllerAction::None);
        }
        if net_carry.as_decimal() < self.config.min_carry_apy {
            return Ok(ControllerAction::None);
        }
        if collateral.0 <= 0.0 {
            return Ok(ControllerAction::None);
        }

        // Leverage that lands HF exactly on target
        let leverage = (1.0 + self.config.liquidation_threshold / self.config.target_hf)
            .min(self.config.max_leverage);
        let notional = Usd((collateral.0 * leverage).min(self.config.max_position_usd));
        let borrowed = Usd((notional.0 - collateral.0).max(0.0));

        if borrowed.0 > 0.0 {
            self.lending
                .borrow("USDC", borrowed)
                .await
                .context("opening borrow")?;
            self.lending
                .deposit(&self.config.asset, borrowed)
                .await
                .context("depositing borrowed collateral")?;
        }
        let size = notional.to_base(mark);
        self.place_perp(&self.config.asset, Side::Sell, size, false)
            .await
            .context("opening perp short")?;

        info!(notional = %notional, leverage, "opened leveraged delta-neutral position");
        Ok(ControllerAction::Opened { notional, leverage })
    }

    // ── Rescue ladder ───────────────────────────────────────────────

    /// HF below emergency: rescue from perp profit when there is any; an
    /// unprofitable perp goes straight to full deleverage. A failed rescue
    /// sub-step degrades through reduce-leverage before the full exit.
    async fn emergency_ladder(
        &self,
        position: &VenuePosition,
        collateral: &Usd,
        debt: Usd,
        mark: Price,
    ) -> Result<ControllerAction> {
        match self.rescue_and_releverage(position, collateral, debt, mark).await {
            Ok(Some(action)) => return Ok(action),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "rescue-and-releverage failed; degrading");
                if let Ok(action) = self.reduce_leverage(position, debt).await {
                    return Ok(action);
                }
            }
        }
        self.close_all(position, debt).await?;
        Ok(ControllerAction::Deleveraged)
    }

    /// HF below minimum: partial rescue, else halve the position.
    async fn partial_ladder(
        &self,
        position: &VenuePosition,
        debt: Usd,
        mark: Price,
    ) -> Result<ControllerAction> {
        let upnl = position.unrealized_pnl;
        if upnl.0 >= MIN_RESCUE_USD {
            // Move half of the available profit across
            let realize_target = Usd(upnl.0 / 2.0);
            match self.realize_and_deposit(position, realize_target, mark, true).await {
                Ok((realized, deposited)) => {
                    return Ok(ControllerAction::PartialRescue { realized, deposited });
                }
                Err(e) => warn!(error = %e, "partial rescue failed; reducing leverage"),
            }
        }
        self.reduce_leverage(position, debt).await
    }

    /// Close enough perp to realize ≈ the collateral deficit, deposit the
    /// proceeds, re-open the same size to keep delta flat. `None` when the
    /// perp is not profitable enough to be worth it.
    async fn rescue_and_releverage(
        &self,
        position: &VenuePosition,
        collateral: &Usd,
        debt: Usd,
        mark: Price,
    ) -> Result<Option<ControllerAction>> {
        let upnl = position.unrealized_pnl;
        if upnl.0 < MIN_RESCUE_USD {
            return Ok(None);
        }
        let required = Usd(self.config.target_hf * debt.0 / self.config.liquidation_threshold);
        let deficit = Usd((required.0 - collateral.0).max(0.0));
        if deficit.0 < MIN_RESCUE_USD {
            return Ok(None);
        }
        let realize_target = Usd(deficit.0 / RESCUE_DEPOSIT_FRACTION);
        let (realized, deposited) = self
            .realize_and_deposit(position, realize_target, mark, true)
            .await?;

        let hf_after = HealthFactor::compute(
            Usd(collateral.0 + deposited.0),
            self.config.liquidation_threshold,
            debt,
        );
        info!(
            realized = %realized,
            deposited = %deposited,
            hf_after = %hf_after,
            "rescue-and-releverage complete"
        );
        Ok(Some(ControllerAction::RescueReleverage { realized, deposited }))
    }

    /// Close the fraction of the perp that realizes `target` PnL, deposit
    /// 90% of it to lending, and (optionally) re-open the closed size so
    /// the delta is unchanged.
    async fn realize_and_deposit(
        &self,
        position: &VenuePosition,
        target: Usd,
        mark: Price,
        reopen: bool,
    ) -> Result<(Usd, Usd)> {
        let upnl = position.unrealized_pnl;
        let fraction = (target.0 / upnl.0).clamp(0.0, 1.0);
        let close_size = BaseQty(position.size.0 * fraction);
        if close_size.to_usd(mark).0 < MIN_RESCUE_USD {
            anyhow::bail!("rescue slice below minimum worthwhile size");
        }

        // Short leg: closing means buying back
        self.place_perp(&self.config.asset, Side::Buy, close_size, true)
            .await
            .context("rescue close slice")?;
        let realized = Usd(upnl.0 * fraction);
        let deposit = Usd(realized.0 * RESCUE_DEPOSIT_FRACTION);
        self.lending
            .deposit(&self.config.asset, deposit)
            .await
            .context("rescue deposit")?;

        if reopen {
            self.place_perp(&self.config.asset, Side::Sell, close_size, false)
                .await
                .context("rescue re-open")?;
        }
        Ok((realized, deposit))
    }

    /// Halve the perp and repay a matching share of the debt.
    async fn reduce_leverage(
        &self,
        position: &VenuePosition,
        debt: Usd,
    ) -> Result<ControllerAction> {
        let half = BaseQty(position.size.0 / 2.0);
        self.place_perp(&self.config.asset, Side::Buy, half, true)
            .await
            .context("halving perp")?;
        if debt.0 > 0.0 {
            let repay = Usd(debt.0 / 2.0);
            self.lending
                .withdraw(&self.config.asset, repay)
                .await
                .context("withdrawing for repay")?;
            self.lending
                .repay("USDC", repay)
                .await
                .context("repaying half the debt")?;
        }
        warn!("reduced leverage by half");
        Ok(ControllerAction::ReducedLeverage { closed: half })
    }

    /// Full exit: flatten the perp and clear the debt.
    async fn close_all(&self, position: &VenuePosition, debt: Usd) -> Result<()> {
        self.place_perp(&self.config.asset, Side::Buy, position.size, true)
            .await
            .context("closing perp leg")?;
        if debt.0 > 0.0 {
            self.lending
                .withdraw(&self.config.asset, debt)
                .await
                .context("withdrawing collateral for repay")?;
            self.lending
                .repay("USDC", debt)
                .await
                .context("repaying debt")?;
        }
        info!("leveraged position fully closed");
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn find_short(&self, asset: &str) -> Result<Option<VenuePosition>> {
        let positions = self.perp.positions().await.context("reading perp positions")?;
        Ok(positions
            .into_iter()
            .find(|p| p.symbol == asset && p.side == Side::Sell))
    }

    async fn place_perp(
        &self,
        symbol: &str,
        side: Side,
        size: BaseQty,
        reduce_only: bool,
    ) -> Result<()> {
        if size.0 <= 0.0 {
            return Ok(());
        }
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            tif: Tif::Ioc,
            reduce_only,
            client_order_id: format!("dn-{}", Uuid::new_v4()),
        };
        self.perp
            .place_order(&req)
            .await
            .map_err(|e| anyhow::anyhow!("perp order failed: {e}"))?;
        Ok(())
    }
}
