// =============================================================================
// Shared primitive types used across the arbitrage engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// A tradable asset identifier, e.g. "BTC", "USDT". Always stored uppercase so
/// it can be used as a hash map key without repeated normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset(pub String);

impl Asset {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Asset {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Asset {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Order side on a single hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: Asset,
    #[serde(default)]
    pub free: rust_decimal::Decimal,
    #[serde(default)]
    pub locked: rust_decimal::Decimal,
}
