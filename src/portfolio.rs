//! Capital allocation across the scanned opportunity set: size each
//! opportunity to the target APY, haircut by spread stability and data
//! quality, then distribute capital proportionally. Fully deterministic.

use std::collections::HashMap;

use tracing::debug;

use crate::costs;
use crate::history::HistoricalStore;
use crate::model::opportunity::ArbitrageOpportunity;
use crate::model::units::{Pct, Price, Usd};
use crate::model::VenueId;
use crate::venues::DEPTH_FALLBACK_SPREAD;

/// Binary-search iterations for the size search.
const MAX_SIZE_SEARCH_ITERS: u32 = 40;
/// Lower bound of the size search, USD.
const SIZE_SEARCH_FLOOR: f64 = 1000.0;
/// Upper bound as a fraction of the thinner side's open interest.
const OI_CAP_FRACTION: f64 = 0.1;
/// Historical spreads above this per-interval decimal are data errors.
const MAX_PLAUSIBLE_SPREAD: f64 = 0.5;

/// Per-venue target sample counts for the data-quality factor. Venues with
/// 8h funding accumulate ~21 samples a week; hourly venues 168.
#[derive(Debug, Clone)]
pub struct QualityTargets {
    pub per_venue: HashMap<VenueId, usize>,
    pub default: usize,
}

impl Default for QualityTargets {
    fn default() -> Self {
        QualityTargets {
            per_venue: HashMap::new(),
            default: 168,
        }
    }
}

impl QualityTargets {
    fn target(&self, venue: &str) -> usize {
        self.per_venue.get(venue).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub opportunity: ArbitrageOpportunity,
    /// Capital assigned to this opportunity.
    pub amount: Usd,
    /// The adjusted cap the amount was scaled from.
    pub cap: Usd,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub allocations: Vec<Allocation>,
    pub data_quality_warnings: Vec<String>,
    /// Allocation-weighted expected APR.
    pub aggregate_apy: Pct,
}

#[derive(Debug, Clone)]
pub struct PortfolioOptimizer {
    /// Yield target on capital employed (notional / leverage).
    pub target_apy: Pct,
    /// Leverage both legs run at; funding accrues on notional, so the
    /// capital APY scales with it.
    pub leverage: f64,
    /// Window over which spread history is consulted, seconds.
    pub spread_window_secs: i64,
    /// Holding horizon for cost amortization in the size search.
    pub horizon_hours: f64,
}

impl Default for PortfolioOptimizer {
    fn default() -> Self {
        PortfolioOptimizer {
            target_apy: Pct(35.0),
            leverage: 2.0,
            spread_window_secs: 7 * 24 * 3600,
            horizon_hours: 720.0,
        }
    }
}

impl PortfolioOptimizer {
    /// Allocate `capital` across `opportunities`. Rejected opportunities
    /// surface as warnings, never as errors.
    pub fn allocate(
        &self,
        opportunities: &[ArbitrageOpportunity],
        capital: Usd,
        history: &HistoricalStore,
        fee_rates: &HashMap<VenueId, f64>,
        targets: &QualityTargets,
        now: i64,
    ) -> AllocationOutcome {
        let mut outcome = AllocationOutcome::default();
        let mut capped: Vec<(ArbitrageOpportunity, Usd)> = Vec::new();

        for opp in opportunities {
            let label = format!("{} {}→{}", opp.symbol, opp.long_venue, opp.short_venue);

            let Some(base_cap) = self.max_portfolio_for_target_apy(opp, fee_rates) else {
                debug!(%label, "below target APY at any size");
                continue;
            };

            // Volatility haircut from the recorded spread series
            let metrics = history.spread_volatility_metrics(
                &opp.symbol,
                &opp.long_venue,
                &opp.short_venue,
                self.spread_window_secs,
                now,
            );
            let stability = metrics.stability_score.clamp(0.3, 1.0);

            // Data-quality factor: the thinner venue history bounds the pair
            let quality = [&opp.long_venue, &opp.short_venue]
                .iter()
                .map(|venue| {
                    let n = history.funding_sample_count(venue, &opp.symbol);
                    let t = targets.target(venue).max(1);
                    if n < t / 10 {
                        0.3
                    } else {
                        (n as f64 / t as f64).clamp(0.3, 1.0)
                    }
                })
                .fold(1.0_f64, f64::min);
            if quality < 1.0 {
                outcome.data_quality_warnings.push(format!(
                    "{label}: thin history, quality factor {quality:.2}"
                ));
            }

            // Sanity checks on the historical series itself
            if let Some(avg_spread) = history.average_spread(
                &opp.symbol,
                &opp.long_venue,
                &opp.short_venue,
                self.spread_window_secs,
                now,
            ) {
                if avg_spread > MAX_PLAUSIBLE_SPREAD {
                    outcome.data_quality_warnings.push(format!(
                        "{label}: rejected, historical spread {avg_spread:.4} implausible"
                    ));
                    continue;
                }
                if (avg_spread - opp.spread).abs() < 1e-12 {
                    outcome.data_quality_warnings.push(format!(
                        "{label}: rejected, history is a fallback sentinel of the current spread"
                    ));
                    continue;
                }
            } else {
                outcome
                    .data_quality_warnings
                    .push(format!("{label}: no matched spread history"));
            }

            let cap = Usd(base_cap.0 * stability * quality);
            if cap.0 > 0.0 {
                capped.push((opp.clone(), cap));
            }
        }

        // Proportional allocation, bounded by total capital and each cap
        let total_cap: f64 = capped.iter().map(|(_, c)| c.0).sum();
        if total_cap <= 0.0 {
            return outcome;
        }
        let scale = (capital.0 / total_cap).min(1.0);

        let mut weighted_apr = 0.0;
        let mut allocated = 0.0;
        for (opp, cap) in capped {
            let amount = Usd(cap.0 * scale);
            weighted_apr += opp.expected_return_apr.0 * amount.0;
            allocated += amount.0;
            outcome.allocations.push(Allocation {
                opportunity: opp,
                amount,
                cap,
            });
        }
        if allocated > 0.0 {
            outcome.aggregate_apy = Pct(weighted_apr / allocated);
        }
        outcome
    }

    /// Largest position for which projected net APY still meets the target,
    /// found by binary search over `[SIZE_SEARCH_FLOOR, min(OI) × 0.1]`.
    /// `None` when the target is unreachable or open interest is zero.
    pub fn max_portfolio_for_target_apy(
        &self,
        opp: &ArbitrageOpportunity,
        fee_rates: &HashMap<VenueId, f64>,
    ) -> Option<Usd> {
        let min_oi = opp.min_oi();
        if min_oi.0 <= 0.0 {
            return None;
        }
        let hi_bound = min_oi.0 * OI_CAP_FRACTION;
        if hi_bound < SIZE_SEARCH_FLOOR {
            return None;
        }

        let fee = fee_rates
            .get(&opp.short_venue)
            .or_else(|| fee_rates.get(&opp.long_venue))
            .copied();
        let mark = opp.avg_mark();
        let bid = Price(mark.0 * (1.0 - DEPTH_FALLBACK_SPREAD));
        let ask = Price(mark.0 * (1.0 + DEPTH_FALLBACK_SPREAD));
        let net_apy = |size: f64| {
            costs::projected_net_apy(
                Usd(size),
                opp.expected_return_apr.0,
                bid,
                ask,
                min_oi,
                fee,
                self.horizon_hours,
            ) * self.leverage.max(1.0)
        };

        if net_apy(SIZE_SEARCH_FLOOR) < self.target_apy.0 {
            return None;
        }
        if net_apy(hi_bound) >= self.target_apy.0 {
            return Some(Usd(hi_bound));
        }

        let mut lo = SIZE_SEARCH_FLOOR;
        let mut hi = hi_bound;
        for _ in 0..MAX_SIZE_SEARCH_ITERS {
            let mid = (lo + hi) / 2.0;
            if net_apy(mid) >= self.target_apy.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1.0 {
                break;
            }
        }
        Some(Usd(lo))
    }
}
