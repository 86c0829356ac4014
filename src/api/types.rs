//! Wire shapes of the diagnostics surface.

use std::collections::HashMap;

use serde::Serialize;

use crate::keeper::metrics::ErrorRecord;

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub apy: ApySection,
    pub positions: PositionsSection,
    pub health: HealthSection,
    pub errors: ErrorsSection,
    pub uptime: UptimeSection,
}

#[derive(Debug, Serialize)]
pub struct ApySection {
    /// Realized annualized yield since start or last reset, percent.
    pub realized: f64,
    /// Expected APY of the currently held book, percent.
    pub estimated: f64,
    /// Net realized funding income, USD.
    pub net_funding: f64,
    pub by_exchange: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct PositionsSection {
    pub count: usize,
    pub total_value: f64,
    pub unrealized_pnl: f64,
    /// Held notional per venue, USD.
    pub by_exchange: HashMap<String, f64>,
    pub active: Vec<ActivePosition>,
}

#[derive(Debug, Serialize)]
pub struct ActivePosition {
    pub id: String,
    pub venue: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub notional: f64,
    pub status: String,
    pub opened_at: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthSection {
    /// OK, DEGRADED or FAILED.
    pub overall: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorsSection {
    pub recent: Vec<ErrorRecord>,
}

#[derive(Debug, Serialize)]
pub struct UptimeSection {
    pub hours: f64,
}
