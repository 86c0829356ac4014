//! Cross-venue funding scan: normalize rates, orient leg pairs, emit the
//! opportunity set for one tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::history::HistoricalStore;
use crate::model::opportunity::{ArbitrageOpportunity, StrategyType};
use crate::model::snapshot::FundingSnapshot;
use crate::model::units::{FundingRate, Price, Usd};
use crate::model::VenueId;
use crate::venues::{LendingVenue, PerpVenue};

/// Marks diverging by more than this across venues mean a stale quote.
const MAX_MARK_DIVERGENCE: f64 = 0.01;

/// Canonical symbol table: venues disagree on names ("ETH-PERP",
/// "ETHUSDT", "ETH/USD"); the scan keys everything by canonical symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolAliases {
    /// venue → (venue-native symbol → canonical).
    to_canonical: HashMap<VenueId, HashMap<String, String>>,
    /// venue → (canonical → venue-native symbol).
    from_canonical: HashMap<VenueId, HashMap<String, String>>,
}

impl SymbolAliases {
    pub fn insert(&mut self, venue: &str, native: &str, canonical: &str) {
        self.to_canonical
            .entry(venue.to_string())
            .or_default()
            .insert(native.to_string(), canonical.to_string());
        self.from_canonical
            .entry(venue.to_string())
            .or_default()
            .insert(canonical.to_string(), native.to_string());
    }

    /// The symbol this venue knows the canonical symbol by. Identity when
    /// no alias is registered.
    pub fn native<'a>(&'a self, venue: &str, canonical: &'a str) -> &'a str {
        self.from_canonical
            .get(venue)
            .and_then(|m| m.get(canonical))
            .map(String::as_str)
            .unwrap_or(canonical)
    }

    pub fn canonical<'a>(&'a self, venue: &str, native: &'a str) -> &'a str {
        self.to_canonical
            .get(venue)
            .and_then(|m| m.get(native))
            .map(String::as_str)
            .unwrap_or(native)
    }
}

/// One venue's view of a symbol during a scan.
#[derive(Debug, Clone)]
struct VenueQuote {
    venue: VenueId,
    rate: FundingRate,
    mark: Price,
    oi: Usd,
}

/// Everything one scan produced.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub scan_id: u64,
    pub opportunities: Vec<ArbitrageOpportunity>,
    pub snapshots: Vec<FundingSnapshot>,
}

pub struct FundingAggregator {
    /// Minimum per-interval spread (decimal) worth acting on.
    pub min_spread: f64,
    pub aliases: SymbolAliases,
    scan_seq: AtomicU64,
}

impl FundingAggregator {
    pub fn new(min_spread: f64, aliases: SymbolAliases) -> Self {
        FundingAggregator {
            min_spread,
            aliases,
            scan_seq: AtomicU64::new(0),
        }
    }

    pub fn last_scan_id(&self) -> u64 {
        self.scan_seq.load(Ordering::SeqCst)
    }

    /// Collect rates from every configured venue for the symbol set and
    /// emit the opportunity set. Snapshots and spreads are appended to the
    /// historical store as a side effect.
    pub async fn scan(
        &self,
        symbols: &[String],
        perps: &HashMap<VenueId, Arc<dyn PerpVenue>>,
        spots: &HashMap<VenueId, Arc<dyn PerpVenue>>,
        lendings: &HashMap<VenueId, Arc<dyn LendingVenue>>,
        history: &HistoricalStore,
        now: i64,
    ) -> ScanResult {
        let scan_id = self.scan_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut opportunities = Vec::new();
        let mut snapshots = Vec::new();

        for symbol in symbols {
            let quotes = self.collect_quotes(symbol, perps, now, history, &mut snapshots).await;

            self.pair_perp_perp(symbol, &quotes, scan_id, now, history, &mut opportunities);
            self.pair_perp_spot(symbol, &quotes, spots, scan_id, now, &mut opportunities)
                .await;
            self.pair_perp_lend(symbol, &quotes, lendings, scan_id, now, &mut opportunities)
                .await;
        }

        debug!(
            scan_id,
            opportunities = opportunities.len(),
            "funding scan complete"
        );
        ScanResult {
            scan_id,
            opportunities,
            snapshots,
        }
    }

    async fn collect_quotes(
        &self,
        symbol: &str,
        perps: &HashMap<VenueId, Arc<dyn PerpVenue>>,
        now: i64,
        history: &HistoricalStore,
        snapshots: &mut Vec<FundingSnapshot>,
    ) -> Vec<VenueQuote> {
        let mut quotes = Vec::new();
        for (venue_id, venue) in perps {
            let native = self.aliases.native(venue_id, symbol);
            let rate = match venue.funding_rate(native).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(venue = %venue_id, symbol, error = %e, "funding rate unavailable");
                    continue;
                }
            };
            let mark = match venue.mark_price(native).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(venue = %venue_id, symbol, error = %e, "mark price unavailable");
                    continue;
                }
            };
            let oi = venue.open_interest(native).await.unwrap_or(Usd::ZERO);

            history.record_funding(venue_id, symbol, now, rate.per_interval);
            history.record_mark(venue_id, symbol, now, mark);
            snapshots.push(FundingSnapshot {
                venue: venue_id.clone(),
                symbol: symbol.to_string(),
                rate,
                mark_price: mark,
                open_interest: oi,
                timestamp: now,
            });
            quotes.push(VenueQuote {
                venue: venue_id.clone(),
                rate,
                mark,
                oi,
            });
        }
        quotes
    }

    /// All unordered venue pairs; the higher-rate venue becomes the short
    /// leg (shorts collect positive funding), the lower-rate venue the long.
    fn pair_perp_perp(
        &self,
        symbol: &str,
        quotes: &[VenueQuote],
        scan_id: u64,
        now: i64,
        history: &HistoricalStore,
        out: &mut Vec<ArbitrageOpportunity>,
    ) {
        for i in 0..quotes.len() {
            for j in (i + 1)..quotes.len() {
                let (a, b) = (&quotes[i], &quotes[j]);
                let (short, long) = if a.rate.per_hour() >= b.rate.per_hour() {
                    (a, b)
                } else {
                    (b, a)
                };

                let spread = spread_per_interval(&short.rate, &long.rate);
                history.record_spread(symbol, &long.venue, &short.venue, now, spread);

                if short.oi.0 <= 0.0 || long.oi.0 <= 0.0 {
                    debug!(symbol, long = %long.venue, short = %short.venue, "skipped: zero open interest");
                    continue;
                }
                if mark_divergence(long.mark, short.mark) > MAX_MARK_DIVERGENCE {
                    warn!(symbol, long = %long.venue, short = %short.venue, "skipped: marks diverge, stale quote");
                    continue;
                }
                if spread < self.min_spread {
                    continue;
                }

                let expected = FundingRate::new(spread, short.rate.intervals_per_day).annualized();
                out.push(ArbitrageOpportunity {
                    symbol: symbol.to_string(),
                    strategy: StrategyType::PerpPerp,
                    long_venue: long.venue.clone(),
                    short_venue: short.venue.clone(),
                    long_rate: long.rate,
                    short_rate: short.rate,
                    spread,
                    expected_return_apr: expected,
                    long_mark: long.mark,
                    short_mark: short.mark,
                    long_oi: long.oi,
                    short_oi: short.oi,
                    scan_id,
                    timestamp: now,
                });
            }
        }
    }

    /// Perp against a spot quote. The sign of the perp rate picks the leg
    /// direction: positive funding means short the perp and hold spot.
    async fn pair_perp_spot(
        &self,
        symbol: &str,
        quotes: &[VenueQuote],
        spots: &HashMap<VenueId, Arc<dyn PerpVenue>>,
        scan_id: u64,
        now: i64,
        out: &mut Vec<ArbitrageOpportunity>,
    ) {
        for (spot_id, spot) in spots {
            let native = self.aliases.native(spot_id, symbol);
            let spot_mark = match spot.mark_price(native).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            for quote in quotes {
                let spread = quote.rate.per_interval.abs();
                if spread < self.min_spread || quote.oi.0 <= 0.0 {
                    continue;
                }
                if mark_divergence(quote.mark, spot_mark) > MAX_MARK_DIVERGENCE {
                    continue;
                }
                let zero = FundingRate::new(0.0, quote.rate.intervals_per_day);
                let positive = quote.rate.per_interval > 0.0;
                let (long_venue, short_venue, long_rate, short_rate, long_mark, short_mark) =
                    if positive {
                        // Short perp collects; spot leg is the long
                        (
                            spot_id.clone(),
                            quote.venue.clone(),
                            zero,
                            quote.rate,
                            spot_mark,
                            quote.mark,
                        )
                    } else {
                        (
                            quote.venue.clone(),
                            spot_id.clone(),
                            quote.rate,
                            zero,
                            quote.mark,
                            spot_mark,
                        )
                    };
                out.push(ArbitrageOpportunity {
                    symbol: symbol.to_string(),
                    strategy: StrategyType::PerpSpot,
                    long_venue,
                    short_venue,
                    long_rate,
                    short_rate,
                    spread,
                    expected_return_apr: FundingRate::new(spread, quote.rate.intervals_per_day)
                        .annualized(),
                    long_mark,
                    short_mark,
                    long_oi: quote.oi,
                    short_oi: quote.oi,
                    scan_id,
                    timestamp: now,
                });
            }
        }
    }

    /// Perp against a lending reserve's net carry (funding − borrow).
    async fn pair_perp_lend(
        &self,
        symbol: &str,
        quotes: &[VenueQuote],
        lendings: &HashMap<VenueId, Arc<dyn LendingVenue>>,
        scan_id: u64,
        now: i64,
        out: &mut Vec<ArbitrageOpportunity>,
    ) {
        for (lend_id, lending) in lendings {
            let asset = self.aliases.native(lend_id, symbol);
            let reserve = match lending.reserve_rates(asset).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(venue = %lend_id, asset, error = %e, "reserve rates unavailable");
                    continue;
                }
            };
            for quote in quotes {
                if quote.oi.0 <= 0.0 {
                    continue;
                }
                let net_carry = quote.rate.annualized() - reserve.borrow_apr;
                // Borrow leg priced as a negative funding stream
                let borrow_rate =
                    FundingRate::from_annualized(reserve.borrow_apr, quote.rate.intervals_per_day);
                let spread = quote.rate.per_interval - borrow_rate.per_interval;
                if spread < self.min_spread || net_carry.0 <= 0.0 {
                    continue;
                }
                out.push(ArbitrageOpportunity {
                    symbol: symbol.to_string(),
                    strategy: StrategyType::PerpLend,
                    long_venue: lend_id.clone(),
                    short_venue: quote.venue.clone(),
                    long_rate: borrow_rate,
                    short_rate: quote.rate,
                    spread,
                    expected_return_apr: net_carry,
                    long_mark: quote.mark,
                    short_mark: quote.mark,
                    long_oi: quote.oi,
                    short_oi: quote.oi,
                    scan_id,
                    timestamp: now,
                });
            }
        }
    }
}

/// Per-interval spread between two venues, normalized to the short leg's
/// interval when the venues fund on different schedules.
fn spread_per_interval(short: &FundingRate, long: &FundingRate) -> f64 {
    if short.intervals_per_day == long.intervals_per_day {
        (short.per_interval - long.per_interval).abs()
    } else {
        let per_hour = (short.per_hour() - long.per_hour()).abs();
        per_hour * 24.0 / short.intervals_per_day.max(1) as f64
    }
}

fn mark_divergence(a: Price, b: Price) -> f64 {
    let avg = (a.0 + b.0) / 2.0;
    if avg <= 0.0 {
        return f64::INFINITY;
    }
    (a.0 - b.0).abs() / avg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_default_to_identity() {
        let aliases = SymbolAliases::default();
        assert_eq!(aliases.native("binance", "ETH"), "ETH");
        assert_eq!(aliases.canonical("binance", "ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn aliases_map_both_ways() {
        let mut aliases = SymbolAliases::default();
        aliases.insert("binance", "ETHUSDT", "ETH");
        assert_eq!(aliases.native("binance", "ETH"), "ETHUSDT");
        assert_eq!(aliases.canonical("binance", "ETHUSDT"), "ETH");
    }

    #[test]
    fn spread_normalizes_across_intervals() {
        let short = FundingRate::new(0.0003, 3); // 8h venue
        let long = FundingRate::new(0.0000125, 24); // hourly venue
        // per-hour: 0.0003*3/24 = 0.0000375 vs 0.0000125 → diff 0.000025/h
        // scaled to 8h interval: 0.0002
        let s = spread_per_interval(&short, &long);
        assert!((s - 0.0002).abs() < 1e-9);
    }
}
