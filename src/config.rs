// =============================================================================
// Runtime configuration — strategy and risk tunables for the arbitrage engine
// =============================================================================
//
// The two exchange secrets (`BINANCE_API_KEY`, `BINANCE_API_SECRET`) are read
// directly from the process environment via `dotenv` + `std::env` in `main`;
// there is no flag parser and no config file. Everything else below is a
// plain, serde-deserializable set of tunables constructed in code, with
// `#[serde(default)]` values matching the literals this engine is specified
// against, so unit tests can exercise them without environment coupling.
//
// =============================================================================

use serde::{Deserialize, Serialize};

fn default_max_depth() -> usize {
    4
}

fn default_min_profit_percent() -> f64 {
    0.1
}

fn default_max_paths() -> usize {
    100_000
}

fn default_min_notional() -> f64 {
    10.0
}

fn default_taker_commission() -> f64 {
    0.001
}

fn default_maker_commission() -> f64 {
    0.0001
}

/// Parameters governing a single Path Engine enumeration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Maximum path length (inclusive) explored by the BFS.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Minimum `profit_percent` for a path to be recorded.
    #[serde(default = "default_min_profit_percent")]
    pub min_profit_percent: f64,

    /// Hard cap on BFS-expanded states per enumeration.
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,

    /// Minimum notional (quote units) for a starting amount to be considered.
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,

    /// Fallback taker commission when the exchange does not report one.
    #[serde(default = "default_taker_commission")]
    pub taker_commission: f64,

    /// Fallback maker commission when the exchange does not report one.
    #[serde(default = "default_maker_commission")]
    pub maker_commission: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            min_profit_percent: default_min_profit_percent(),
            max_paths: default_max_paths(),
            min_notional: default_min_notional(),
            taker_commission: default_taker_commission(),
            maker_commission: default_maker_commission(),
        }
    }
}

/// Selects which of the three position-sizing regimes the allocator applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSizingMethod {
    Fixed,
    Volatility,
    Kelly,
}

impl Default for PositionSizingMethod {
    fn default() -> Self {
        Self::Kelly
    }
}

fn default_risk_free_rate() -> f64 {
    0.02
}

fn default_min_sharpe_ratio() -> f64 {
    0.5
}

fn default_max_portfolio_risk() -> f64 {
    0.05
}

fn default_max_daily_loss() -> f64 {
    0.02
}

fn default_stop_loss_percentage() -> f64 {
    0.01
}

fn default_take_profit_percentage() -> f64 {
    0.02
}

fn default_max_concurrent_positions() -> u32 {
    5
}

fn default_min_position_size() -> f64 {
    10.0
}

fn default_max_correlation_threshold() -> f64 {
    0.7
}

/// Tunable risk limits and scoring thresholds consumed by the Risk & Allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    #[serde(default = "default_max_correlation_threshold")]
    pub max_correlation_threshold: f64,

    #[serde(default = "default_min_sharpe_ratio")]
    pub min_sharpe_ratio: f64,

    #[serde(default = "default_max_portfolio_risk")]
    pub max_portfolio_risk: f64,

    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default)]
    pub position_sizing_method: PositionSizingMethod,

    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: f64,

    #[serde(default = "default_take_profit_percentage")]
    pub take_profit_percentage: f64,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default = "default_min_position_size")]
    pub min_position_size: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            risk_free_rate: default_risk_free_rate(),
            max_correlation_threshold: default_max_correlation_threshold(),
            min_sharpe_ratio: default_min_sharpe_ratio(),
            max_portfolio_risk: default_max_portfolio_risk(),
            max_daily_loss: default_max_daily_loss(),
            position_sizing_method: PositionSizingMethod::default(),
            stop_loss_percentage: default_stop_loss_percentage(),
            take_profit_percentage: default_take_profit_percentage(),
            max_concurrent_positions: default_max_concurrent_positions(),
            min_position_size: default_min_position_size(),
        }
    }
}

fn default_primary_host() -> String {
    "https://api.binance.com".to_string()
}

fn default_alternate_hosts() -> Vec<String> {
    vec![
        "https://api1.binance.com".to_string(),
        "https://api2.binance.com".to_string(),
        "https://api3.binance.com".to_string(),
        "https://api4.binance.com".to_string(),
    ]
}

/// Fixed host pool for the Exchange Client's endpoint failover cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_primary_host")]
    pub primary: String,

    #[serde(default = "default_alternate_hosts")]
    pub alternates: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_host(),
            alternates: default_alternate_hosts(),
        }
    }
}

fn default_db_path() -> String {
    "hydra_memory.db".to_string()
}

/// Top-level runtime configuration for the arbitrage engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub strategy_params: StrategyParams,

    #[serde(default)]
    pub risk_limits: RiskLimits,

    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Path to the local SQLite trade-history store.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Credentials pulled from the process environment. Not part of
/// `RuntimeConfig` itself: these are secrets, never serialized or logged.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Load `BINANCE_API_KEY` / `BINANCE_API_SECRET` from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY")
            .map_err(|_| anyhow::anyhow!("missing BINANCE_API_KEY environment variable"))?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .map_err(|_| anyhow::anyhow!("missing BINANCE_API_SECRET environment variable"))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.strategy_params.max_paths, 100_000);
        assert_eq!(cfg.strategy_params.min_notional, 10.0);
        assert_eq!(cfg.strategy_params.taker_commission, 0.001);
        assert_eq!(cfg.risk_limits.max_concurrent_positions, 5);
        assert_eq!(cfg.risk_limits.min_position_size, 10.0);
        assert_eq!(cfg.risk_limits.risk_free_rate, 0.02);
        assert_eq!(cfg.db_path, "hydra_memory.db");
        assert_eq!(cfg.endpoints.primary, "https://api.binance.com");
        assert_eq!(cfg.endpoints.alternates.len(), 4);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.risk_limits.position_sizing_method, PositionSizingMethod::Kelly);
        assert_eq!(cfg.strategy_params.max_depth, 4);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "risk_limits": { "position_sizing_method": "fixed" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.risk_limits.position_sizing_method, PositionSizingMethod::Fixed);
        assert_eq!(cfg.risk_limits.max_daily_loss, 0.02);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.strategy_params.max_paths, cfg2.strategy_params.max_paths);
        assert_eq!(cfg.endpoints.primary, cfg2.endpoints.primary);
    }
}
