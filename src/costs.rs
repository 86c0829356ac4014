//! Slippage, fee, funding-impact and break-even math. Pure functions,
//! no state; every caller passes observed market inputs explicitly.

use crate::model::units::{Price, Usd};
use crate::model::OrderType;

/// Default relative spread assumed when the mid is unusable.
const DEFAULT_SPREAD_PCT: f64 = 0.001;
/// Resting limit orders still pay ~1bp of adverse selection.
const MAKER_BASE_SLIPPAGE: f64 = 0.0001;
/// Market-impact component is capped at 2% of notional.
const MAX_IMPACT_PCT: f64 = 0.02;
/// Fee rate applied when the venue is not configured.
pub const DEFAULT_FEE_RATE: f64 = 0.0005;

/// Relative bid/ask spread: `(ask − bid) / mid`, defaulting when mid is 0.
pub fn spread_pct(bid: Price, ask: Price) -> f64 {
    let mid = (ask.0 + bid.0) / 2.0;
    if mid <= 0.0 {
        return DEFAULT_SPREAD_PCT;
    }
    (ask.0 - bid.0) / mid
}

/// Expected slippage cost in USD for one leg.
///
/// Market orders cross half the spread; limit orders pay the maker base.
/// On top of either, square-root market impact scaled by position size
/// relative to open interest, capped at [`MAX_IMPACT_PCT`].
pub fn slippage_cost(
    position_usd: Usd,
    bid: Price,
    ask: Price,
    order_type: OrderType,
    open_interest: Usd,
) -> Usd {
    let spread = spread_pct(bid, ask);
    let base = match order_type {
        OrderType::Market => spread / 2.0,
        OrderType::Limit => MAKER_BASE_SLIPPAGE,
    };
    let impact = if open_interest.0 > 0.0 {
        let participation = (position_usd.0 / open_interest.0).min(1.0);
        (participation.sqrt() * spread * 2.0).min(MAX_IMPACT_PCT)
    } else {
        0.0
    };
    Usd(position_usd.0 * (base + impact))
}

/// Predicted shift of the funding rate caused by our own position.
///
/// Longs push the rate up, shorts pull it down; the impact factor is
/// capped at 10% of the current rate.
pub fn funding_impact(current_rate: f64, position_usd: Usd, open_interest: Usd, is_long: bool) -> f64 {
    if open_interest.0 <= 0.0 || !current_rate.is_finite() {
        return 0.0;
    }
    let impact_factor = ((position_usd.0 / open_interest.0).sqrt() * 0.1).min(0.1);
    let magnitude = current_rate * impact_factor;
    if is_long {
        magnitude
    } else {
        -magnitude
    }
}

/// Trading fee for one leg.
pub fn fee_cost(position_usd: Usd, fee_rate: Option<f64>) -> Usd {
    Usd(position_usd.0 * fee_rate.unwrap_or(DEFAULT_FEE_RATE))
}

/// Hours of holding required before funding income covers total costs.
///
/// Zero when there is nothing to recover; infinite when the position
/// never earns.
pub fn break_even_hours(total_costs: Usd, hourly_return: Usd) -> f64 {
    if total_costs.0 <= 0.0 {
        return 0.0;
    }
    if hourly_return.0 <= 0.0 {
        return f64::INFINITY;
    }
    total_costs.0 / hourly_return.0
}

/// Projected net APY of a two-leg position at a given size, with entry and
/// exit costs amortized over the holding horizon. Shared by the liquidity
/// sweep and the portfolio sizing search.
pub fn projected_net_apy(
    position_usd: Usd,
    gross_apr_pct: f64,
    bid: Price,
    ask: Price,
    open_interest: Usd,
    fee_rate: Option<f64>,
    horizon_hours: f64,
) -> f64 {
    if position_usd.0 <= 0.0 || horizon_hours <= 0.0 {
        return 0.0;
    }
    let slippage = slippage_cost(position_usd, bid, ask, OrderType::Limit, open_interest);
    let fees = fee_cost(position_usd, fee_rate);
    // Two legs in, two legs out
    let round_trip = (slippage.0 + fees.0) * 4.0;
    let cost_apr = round_trip / position_usd.0 * (8760.0 / horizon_hours) * 100.0;
    gross_apr_pct - cost_apr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_pct_defaults_on_zero_mid() {
        assert_eq!(spread_pct(Price(0.0), Price(0.0)), DEFAULT_SPREAD_PCT);
    }

    #[test]
    fn market_orders_cost_more_than_limits() {
        let bid = Price(2999.0);
        let ask = Price(3001.0);
        let oi = Usd(1_000_000.0);
        let market = slippage_cost(Usd(10_000.0), bid, ask, OrderType::Market, oi);
        let limit = slippage_cost(Usd(10_000.0), bid, ask, OrderType::Limit, oi);
        assert!(market.0 > limit.0);
    }

    #[test]
    fn impact_caps_at_two_percent() {
        // Position dwarfing OI with a wide spread
        let cost = slippage_cost(
            Usd(1_000_000.0),
            Price(900.0),
            Price(1100.0),
            OrderType::Limit,
            Usd(100.0),
        );
        // base 0.0001 + capped impact 0.02
        let expected = 1_000_000.0 * (MAKER_BASE_SLIPPAGE + MAX_IMPACT_PCT);
        assert!((cost.0 - expected).abs() < 1e-6);
    }

    #[test]
    fn funding_impact_zero_without_oi() {
        assert_eq!(funding_impact(0.0003, Usd(1000.0), Usd(0.0), true), 0.0);
    }

    #[test]
    fn funding_impact_signed_by_direction() {
        let long = funding_impact(0.0003, Usd(10_000.0), Usd(1_000_000.0), true);
        let short = funding_impact(0.0003, Usd(10_000.0), Usd(1_000_000.0), false);
        assert!(long > 0.0);
        assert!(short < 0.0);
        assert!((long + short).abs() < 1e-12);
    }

    #[test]
    fn break_even_edge_cases() {
        assert_eq!(break_even_hours(Usd(0.0), Usd(1.0)), 0.0);
        assert!(break_even_hours(Usd(10.0), Usd(0.0)).is_infinite());
        assert_eq!(break_even_hours(Usd(10.0), Usd(2.0)), 5.0);
    }
}
