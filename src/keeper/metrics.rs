//! Realized-performance accounting shared by the engine, the metrics loop
//! and the diagnostics surface.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::model::units::Usd;
use crate::venues::FundingPayment;

const MAX_RECENT_ERRORS: usize = 50;
const MAX_APY_SAMPLES: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct MetricsState {
    pub started_at: i64,
    /// Funding received minus paid since the last reset.
    pub realized_funding: f64,
    pub funding_by_exchange: HashMap<String, f64>,
    /// Close PnL realized since the last reset.
    pub realized_pnl: f64,
    /// Rolling (timestamp, net APY pct) observations from the metrics loop.
    apy_samples: VecDeque<(i64, f64)>,
    recent_errors: VecDeque<ErrorRecord>,
    /// High-water mark of queried funding payments per venue, so the
    /// metrics loop never double-counts.
    pub payment_cursor: HashMap<String, i64>,
}

pub type SharedMetrics = Arc<Mutex<MetricsState>>;

pub fn shared(started_at: i64) -> SharedMetrics {
    Arc::new(Mutex::new(MetricsState {
        started_at,
        ..Default::default()
    }))
}

impl MetricsState {
    pub fn record_funding(&mut self, venue: &str, payment: &FundingPayment) {
        self.realized_funding += payment.amount.0;
        *self.funding_by_exchange.entry(venue.to_string()).or_default() += payment.amount.0;
    }

    pub fn record_close_pnl(&mut self, pnl: Usd) {
        self.realized_pnl += pnl.0;
    }

    pub fn record_error(&mut self, timestamp: i64, source: &str, message: String) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            timestamp,
            source: source.to_string(),
            message,
        });
    }

    pub fn record_apy_sample(&mut self, timestamp: i64, apy_pct: f64) {
        if self.apy_samples.len() == MAX_APY_SAMPLES {
            self.apy_samples.pop_front();
        }
        self.apy_samples.push_back((timestamp, apy_pct));
    }

    /// Mean net APY over the trailing window. `None` without samples.
    pub fn rolling_apy(&self, window_secs: i64, now: i64) -> Option<f64> {
        let from = now - window_secs;
        let mut sum = 0.0;
        let mut count = 0usize;
        for &(ts, apy) in self.apy_samples.iter().rev() {
            if ts < from {
                break;
            }
            sum += apy;
            count += 1;
        }
        (count > 0).then(|| sum / count as f64)
    }

    /// Annualized realized yield on deployed capital since start/reset.
    pub fn realized_apy(&self, deployed: Usd, now: i64) -> f64 {
        let elapsed_years = (now - self.started_at).max(1) as f64 / (365.0 * 24.0 * 3600.0);
        if deployed.0 <= 0.0 {
            return 0.0;
        }
        (self.realized_funding + self.realized_pnl) / deployed.0 / elapsed_years * 100.0
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.iter().cloned().collect()
    }

    pub fn uptime_hours(&self, now: i64) -> f64 {
        (now - self.started_at).max(0) as f64 / 3600.0
    }

    /// Reset the realized accumulators; positions and cursors are untouched.
    pub fn reset_realized(&mut self) {
        self.realized_funding = 0.0;
        self.realized_pnl = 0.0;
        self.funding_by_exchange.clear();
        self.apy_samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_accumulators_only() {
        let mut metrics = MetricsState {
            started_at: 0,
            ..Default::default()
        };
        metrics.record_funding(
            "a",
            &FundingPayment {
                symbol: "ETH".into(),
                amount: Usd(5.0),
                timestamp: 10,
            },
        );
        metrics.payment_cursor.insert("a".into(), 10);
        metrics.reset_realized();
        assert_eq!(metrics.realized_funding, 0.0);
        assert!(metrics.funding_by_exchange.is_empty());
        // Cursor survives so payments are not re-counted after a reset
        assert_eq!(metrics.payment_cursor.get("a"), Some(&10));
    }

    #[test]
    fn rolling_apy_windows_correctly() {
        let mut metrics = MetricsState::default();
        metrics.record_apy_sample(100, 10.0);
        metrics.record_apy_sample(200, 20.0);
        metrics.record_apy_sample(300, 30.0);
        assert_eq!(metrics.rolling_apy(150, 310), Some(25.0));
        assert_eq!(metrics.rolling_apy(10, 1000), None);
    }
}
