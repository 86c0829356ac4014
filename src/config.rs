//! Enumerated keeper configuration. Unknown fields reject at load time;
//! every knob has a default so a minimal file only names venues and
//! symbols. Credentials resolve through the environment, never from the
//! config file itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::venues::FundingConvention;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KeeperConfig {
    pub venues: HashMap<String, VenueConfig>,
    /// Canonical symbol whitelist.
    pub symbols: Vec<String>,
    /// Applied after the whitelist.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Minimum per-interval funding spread (decimal) worth acting on.
    #[serde(default = "defaults::min_spread")]
    pub min_spread: f64,
    /// Target APY as a decimal fraction (0.35 = 35%).
    #[serde(default = "defaults::target_apy")]
    pub target_apy: f64,
    #[serde(default = "defaults::min_position_usd")]
    pub min_position_usd: f64,
    #[serde(default = "defaults::leverage")]
    pub leverage: f64,
    #[serde(default = "defaults::balance_usage_pct")]
    pub balance_usage_pct: f64,
    #[serde(default = "defaults::max_break_even_days")]
    pub max_break_even_days: f64,
    #[serde(default = "defaults::drift_limit")]
    pub drift_limit: f64,
    /// Another opportunity must beat the held one by this APY fraction to
    /// trigger rotation.
    #[serde(default = "defaults::rotate_margin")]
    pub rotate_margin: f64,
    /// Consecutive scans the challenger must keep winning.
    #[serde(default = "defaults::rotate_dwell")]
    pub rotate_dwell: u32,
    /// Seconds a lagging leg may hang before the filled side is flattened.
    #[serde(default = "defaults::partial_timeout_secs")]
    pub partial_timeout_secs: u64,
    /// Resting orders older than this are cancelled by the cleanup loop.
    #[serde(default = "defaults::stale_order_max_age_secs")]
    pub stale_order_max_age_secs: u64,

    /// Per-loop `{period_secs, budget_weight}` overrides, keyed by loop
    /// name as listed in `keeper::LOOPS`.
    #[serde(default)]
    pub loops: HashMap<String, LoopOverride>,

    #[serde(default)]
    pub history: HistoryOptions,
    #[serde(default)]
    pub liquidity: LiquidityOptions,
    #[serde(default)]
    pub close: CloseOptions,
    #[serde(default)]
    pub reconcile: ReconcileOptions,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Leveraged single-venue delta-neutral variant. Absent = disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leveraged: Option<LeveragedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VenueConfig {
    #[serde(default)]
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialSource>,
    #[serde(default = "defaults::weight_per_minute")]
    pub weight_per_minute: u32,
    #[serde(default)]
    pub fee_rates: FeeRates,
    #[serde(default)]
    pub is_testnet: bool,
    #[serde(default = "defaults::intervals_per_day")]
    pub intervals_per_day: u32,
    /// Target sample count for the data-quality factor (21 for 8h-funding
    /// venues over a week, 168 for hourly ones).
    #[serde(default = "defaults::target_samples")]
    pub target_samples: usize,
    #[serde(default = "defaults::funding_convention")]
    pub funding_convention: FundingConvention,
    #[serde(default)]
    pub kind: VenueKind,
    /// canonical symbol → venue-native symbol.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    #[default]
    Perp,
    Spot,
    Lending,
}

/// Where an API credential comes from. The `file` variant keeps secrets
/// out of `env` output in containers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CredentialSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl CredentialSource {
    pub fn resolve(&self) -> Result<String> {
        if let Some(var) = &self.env {
            if let Ok(value) = std::env::var(var) {
                return Ok(value);
            }
        }
        if let Some(path) = &self.file {
            return Ok(std::fs::read_to_string(path)
                .with_context(|| format!("reading credential file {}", path.display()))?
                .trim()
                .to_string());
        }
        bail!("credential not found: set the env var or provide a file path")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FeeRates {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeRates {
    fn default() -> Self {
        FeeRates {
            maker: 0.0002,
            taker: 0.0005,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoopOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_weight: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HistoryOptions {
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,
    #[serde(default = "defaults::half_life_hours")]
    pub half_life_hours: f64,
    #[serde(default = "defaults::min_samples")]
    pub min_samples: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        HistoryOptions {
            retention_days: defaults::retention_days(),
            half_life_hours: defaults::half_life_hours(),
            min_samples: defaults::min_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LiquidityOptions {
    /// APY floor as a decimal fraction (0.15 = 15%).
    #[serde(default = "defaults::apy_floor")]
    pub apy_floor: f64,
    #[serde(default = "defaults::horizon_hours")]
    pub horizon_hours: f64,
}

impl Default for LiquidityOptions {
    fn default() -> Self {
        LiquidityOptions {
            apy_floor: defaults::apy_floor(),
            horizon_hours: defaults::horizon_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CloseOptions {
    /// Close positions whose rolling net APY falls below this decimal
    /// fraction.
    #[serde(default = "defaults::close_apy_threshold")]
    pub apy_threshold: f64,
    /// Rolling window; also the minimum hold before the gate applies.
    #[serde(default = "defaults::close_window_hours")]
    pub window_hours: f64,
}

impl Default for CloseOptions {
    fn default() -> Self {
        CloseOptions {
            apy_threshold: defaults::close_apy_threshold(),
            window_hours: defaults::close_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReconcileOptions {
    /// Auto-close venue positions we do not recognize. Positions opened
    /// out-of-band die with this on, so it defaults off.
    #[serde(default)]
    pub close_strays: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default, rename = "type")]
    pub kind: StorageKind,
    /// Directory for `file`, database path for `sql`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "defaults::api_host")]
    pub host: String,
    #[serde(default = "defaults::api_port")]
    pub port: u16,
    #[serde(default = "defaults::api_enabled")]
    pub enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: defaults::api_host(),
            port: defaults::api_port(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LeveragedConfig {
    /// Perp venue carrying the short leg.
    pub venue: String,
    /// Lending venue carrying the borrow.
    pub lending_venue: String,
    /// Asset borrowed and shorted.
    pub asset: String,
    #[serde(default = "defaults::min_hf")]
    pub min_hf: f64,
    #[serde(default = "defaults::target_hf")]
    pub target_hf: f64,
    #[serde(default = "defaults::emergency_hf")]
    pub emergency_hf: f64,
    #[serde(default = "defaults::warn_hf")]
    pub warn_hf: f64,
    #[serde(default = "defaults::max_leverage")]
    pub max_leverage: f64,
    /// Close when the per-interval funding rate falls below this.
    #[serde(default)]
    pub funding_flip_threshold: f64,
    /// Minimum entry funding rate (per-interval decimal).
    #[serde(default = "defaults::min_funding_rate")]
    pub min_funding_rate: f64,
    /// Minimum net carry (funding APR − borrow APR) as a decimal fraction.
    #[serde(default = "defaults::min_carry_apy")]
    pub min_carry_apy: f64,
    #[serde(default = "defaults::liquidation_threshold")]
    pub liquidation_threshold: f64,
    #[serde(default = "defaults::drift_limit")]
    pub drift_limit: f64,
    #[serde(default = "defaults::rebalance_cooldown_secs")]
    pub rebalance_cooldown_secs: u64,
    #[serde(default = "defaults::max_position_usd")]
    pub max_position_usd: f64,
}

mod defaults {
    use crate::venues::FundingConvention;

    pub fn min_spread() -> f64 {
        0.0001
    }
    pub fn target_apy() -> f64 {
        0.35
    }
    pub fn min_position_usd() -> f64 {
        1000.0
    }
    pub fn leverage() -> f64 {
        2.0
    }
    pub fn balance_usage_pct() -> f64 {
        0.9
    }
    pub fn max_break_even_days() -> f64 {
        7.0
    }
    pub fn drift_limit() -> f64 {
        0.02
    }
    pub fn rotate_margin() -> f64 {
        0.05
    }
    pub fn rotate_dwell() -> u32 {
        3
    }
    pub fn partial_timeout_secs() -> u64 {
        60
    }
    pub fn stale_order_max_age_secs() -> u64 {
        600
    }
    pub fn weight_per_minute() -> u32 {
        1200
    }
    pub fn intervals_per_day() -> u32 {
        3
    }
    pub fn target_samples() -> usize {
        168
    }
    pub fn funding_convention() -> FundingConvention {
        FundingConvention::LongsPayShorts
    }
    pub fn retention_days() -> u32 {
        30
    }
    pub fn half_life_hours() -> f64 {
        24.0
    }
    pub fn min_samples() -> usize {
        6
    }
    pub fn apy_floor() -> f64 {
        0.15
    }
    pub fn horizon_hours() -> f64 {
        720.0
    }
    pub fn close_apy_threshold() -> f64 {
        0.05
    }
    pub fn close_window_hours() -> f64 {
        6.0
    }
    pub fn api_host() -> String {
        "127.0.0.1".to_string()
    }
    pub fn api_port() -> u16 {
        8080
    }
    pub fn api_enabled() -> bool {
        true
    }
    pub fn min_hf() -> f64 {
        1.5
    }
    pub fn target_hf() -> f64 {
        2.0
    }
    pub fn emergency_hf() -> f64 {
        1.3
    }
    pub fn warn_hf() -> f64 {
        1.4
    }
    pub fn max_leverage() -> f64 {
        3.0
    }
    pub fn min_funding_rate() -> f64 {
        0.0001
    }
    pub fn min_carry_apy() -> f64 {
        0.05
    }
    pub fn liquidation_threshold() -> f64 {
        0.8
    }
    pub fn rebalance_cooldown_secs() -> u64 {
        3600
    }
    pub fn max_position_usd() -> f64 {
        100_000.0
    }
}

impl KeeperConfig {
    /// Load from a TOML or JSON file, by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: KeeperConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&body).context("parsing JSON config")?,
            _ => toml::from_str(&body).context("parsing TOML config")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.venues.is_empty() {
            bail!("no venues configured");
        }
        if self.effective_symbols().is_empty() {
            bail!("symbol whitelist is empty after applying the blacklist");
        }
        if !(0.0..=1.0).contains(&self.balance_usage_pct) {
            bail!("balance_usage_pct must be within [0, 1]");
        }
        if self.leverage < 1.0 {
            bail!("leverage below 1 makes no sense for a two-leg pair");
        }
        if let Some(lev) = &self.leveraged {
            if !self.venues.contains_key(&lev.venue) {
                bail!("leveraged.venue '{}' is not a configured venue", lev.venue);
            }
            if !self.venues.contains_key(&lev.lending_venue) {
                bail!(
                    "leveraged.lending_venue '{}' is not a configured venue",
                    lev.lending_venue
                );
            }
            if !(lev.emergency_hf < lev.warn_hf
                && lev.warn_hf < lev.min_hf
                && lev.min_hf < lev.target_hf)
            {
                bail!("leveraged HF thresholds must satisfy emergency < warn < min < target");
            }
        }
        Ok(())
    }

    /// Whitelist minus blacklist, order preserved.
    pub fn effective_symbols(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter(|s| !self.blacklist.contains(s))
            .cloned()
            .collect()
    }

    /// Example config for `funding-keeper example`.
    pub fn example() -> Self {
        let mut venues = HashMap::new();
        venues.insert(
            "hypercore".to_string(),
            VenueConfig {
                api_base: "https://api.hyperliquid.xyz".to_string(),
                credentials: Some(CredentialSource {
                    env: Some("KEEPER_HYPERCORE_KEY".to_string()),
                    file: None,
                }),
                weight_per_minute: 1200,
                fee_rates: FeeRates {
                    maker: 0.00015,
                    taker: 0.00045,
                },
                is_testnet: true,
                intervals_per_day: 24,
                target_samples: 168,
                funding_convention: FundingConvention::LongsPayShorts,
                kind: VenueKind::Perp,
                aliases: HashMap::new(),
            },
        );
        venues.insert(
            "binance".to_string(),
            VenueConfig {
                api_base: "https://fapi.binance.com".to_string(),
                credentials: Some(CredentialSource {
                    env: Some("KEEPER_BINANCE_KEY".to_string()),
                    file: None,
                }),
                weight_per_minute: 2400,
                fee_rates: FeeRates::default(),
                is_testnet: true,
                intervals_per_day: 3,
                target_samples: 21,
                funding_convention: FundingConvention::LongsPayShorts,
                kind: VenueKind::Perp,
                aliases: HashMap::from([("ETH".to_string(), "ETHUSDT".to_string())]),
            },
        );
        KeeperConfig {
            venues,
            symbols: vec!["ETH".to_string(), "BTC".to_string()],
            blacklist: Vec::new(),
            min_spread: defaults::min_spread(),
            target_apy: defaults::target_apy(),
            min_position_usd: defaults::min_position_usd(),
            leverage: defaults::leverage(),
            balance_usage_pct: defaults::balance_usage_pct(),
            max_break_even_days: defaults::max_break_even_days(),
            drift_limit: defaults::drift_limit(),
            rotate_margin: defaults::rotate_margin(),
            rotate_dwell: defaults::rotate_dwell(),
            partial_timeout_secs: defaults::partial_timeout_secs(),
            stale_order_max_age_secs: defaults::stale_order_max_age_secs(),
            loops: HashMap::new(),
            history: HistoryOptions::default(),
            liquidity: LiquidityOptions::default(),
            close: CloseOptions::default(),
            reconcile: ReconcileOptions::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            leveraged: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_validates() {
        assert!(KeeperConfig::example().validate().is_ok());
    }

    #[test]
    fn unknown_fields_reject_at_load() {
        let body = r#"
            symbols = ["ETH"]
            not_a_real_option = true
            [venues.a]
        "#;
        let parsed: std::result::Result<KeeperConfig, _> = toml::from_str(body);
        assert!(parsed.is_err());
    }

    #[test]
    fn blacklist_applies_after_whitelist() {
        let mut config = KeeperConfig::example();
        config.symbols = vec!["ETH".into(), "BTC".into()];
        config.blacklist = vec!["BTC".into()];
        assert_eq!(config.effective_symbols(), vec!["ETH".to_string()]);
    }
}
