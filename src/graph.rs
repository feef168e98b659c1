// =============================================================================
// Pair Graph (C2) — undirected adjacency over tradable assets
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{error, instrument, warn};

use crate::exchange::client::ExchangeClient;
use crate::types::Asset;

/// Numeric LOT_SIZE / MIN_NOTIONAL filters for a single symbol, always exact
/// decimals — never floats — so quantity arithmetic never drifts.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

/// An ordered (base, quote) pair with a platform-assigned name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub base: Asset,
    pub quote: Asset,
    pub status: String,
    pub filters: SymbolFilters,
}

impl Symbol {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

/// Undirected graph over tradable assets, plus the symbol→(base, quote) index
/// needed to resolve a hop in O(1).
#[derive(Debug, Clone, Default)]
pub struct PairGraph {
    adjacency: HashMap<Asset, HashSet<Asset>>,
    symbols: HashMap<String, Symbol>,
}

const BUILD_RETRIES: u32 = 3;
const BUILD_BACKOFF: Duration = Duration::from_secs(10);

impl PairGraph {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a fresh graph from the exchange's symbol metadata, retrying up
    /// to `BUILD_RETRIES` times with a fixed back-off on failure. On final
    /// failure the returned graph is empty; the caller is expected to log a
    /// hard warning rather than terminate.
    #[instrument(skip(client))]
    pub async fn build(client: &ExchangeClient) -> Self {
        for attempt in 1..=BUILD_RETRIES {
            match client.exchange_info().await {
                Ok(symbols) => {
                    let graph = Self::from_symbols(symbols);
                    if graph.symbols.is_empty() {
                        warn!(attempt, "exchange_info returned no usable symbols");
                    } else {
                        return graph;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "failed to fetch exchange_info for graph build");
                }
            }
            if attempt < BUILD_RETRIES {
                tokio::time::sleep(BUILD_BACKOFF).await;
            }
        }
        error!("pair graph build exhausted all retries; continuing with an empty graph");
        Self::empty()
    }

    pub(crate) fn from_symbols(symbols: Vec<Symbol>) -> Self {
        let mut adjacency: HashMap<Asset, HashSet<Asset>> = HashMap::new();
        let mut index = HashMap::new();

        for symbol in symbols {
            if !symbol.is_trading() {
                continue;
            }
            adjacency
                .entry(symbol.base.clone())
                .or_default()
                .insert(symbol.quote.clone());
            adjacency
                .entry(symbol.quote.clone())
                .or_default()
                .insert(symbol.base.clone());
            index.insert(symbol.name.clone(), symbol);
        }

        Self {
            adjacency,
            symbols: index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn contains_asset(&self, asset: &Asset) -> bool {
        self.adjacency.contains_key(asset)
    }

    pub fn neighbors(&self, asset: &Asset) -> impl Iterator<Item = &Asset> {
        self.adjacency.get(asset).into_iter().flatten()
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Resolve the tradable symbol and side for a hop from `from` to `to`.
    ///
    /// Tries `from+to` first (forward, SELL base for quote), then `to+from`
    /// (reverse, BUY base with quote). Returns `None` if neither exists.
    pub fn resolve_hop(&self, from: &Asset, to: &Asset) -> Option<(&Symbol, crate::types::Side)> {
        let forward_name = format!("{from}{to}");
        if let Some(sym) = self.symbols.get(&forward_name) {
            if sym.is_trading() {
                return Some((sym, crate::types::Side::Sell));
            }
        }
        let reverse_name = format!("{to}{from}");
        if let Some(sym) = self.symbols.get(&reverse_name) {
            if sym.is_trading() {
                return Some((sym, crate::types::Side::Buy));
            }
        }
        None
    }

    pub fn asset_count(&self) -> usize {
        self.adjacency.len()
    }
}

#[allow(dead_code)]
fn assert_send_sync()
where
    PairGraph: Send + Sync,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            min_qty: dec!(0.001),
            max_qty: dec!(100),
            step_size: dec!(0.0001),
            min_notional: dec!(10),
        }
    }

    fn symbol(name: &str, base: &str, quote: &str, status: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            base: Asset::new(base),
            quote: Asset::new(quote),
            status: status.to_string(),
            filters: filters(),
        }
    }

    #[test]
    fn trading_symbols_produce_bidirectional_edges() {
        let graph = PairGraph::from_symbols(vec![
            symbol("BTCUSDT", "BTC", "USDT", "TRADING"),
            symbol("ETHBTC", "ETH", "BTC", "TRADING"),
        ]);
        assert!(graph.neighbors(&Asset::new("BTC")).any(|a| a.as_str() == "USDT"));
        assert!(graph.neighbors(&Asset::new("USDT")).any(|a| a.as_str() == "BTC"));
        assert!(graph.neighbors(&Asset::new("BTC")).any(|a| a.as_str() == "ETH"));
        assert!(graph.neighbors(&Asset::new("ETH")).any(|a| a.as_str() == "BTC"));
    }

    #[test]
    fn non_trading_symbols_are_excluded() {
        let graph =
            PairGraph::from_symbols(vec![symbol("BTCUSDT", "BTC", "USDT", "BREAK")]);
        assert!(graph.is_empty());
    }

    #[test]
    fn resolve_hop_prefers_forward_then_reverse() {
        let graph = PairGraph::from_symbols(vec![symbol("BTCUSDT", "BTC", "USDT", "TRADING")]);
        let (sym, side) = graph
            .resolve_hop(&Asset::new("BTC"), &Asset::new("USDT"))
            .expect("forward resolves");
        assert_eq!(sym.name, "BTCUSDT");
        assert_eq!(side, crate::types::Side::Sell);

        let (sym, side) = graph
            .resolve_hop(&Asset::new("USDT"), &Asset::new("BTC"))
            .expect("reverse resolves");
        assert_eq!(sym.name, "BTCUSDT");
        assert_eq!(side, crate::types::Side::Buy);
    }

    #[test]
    fn resolve_hop_returns_none_when_absent() {
        let graph = PairGraph::empty();
        assert!(graph
            .resolve_hop(&Asset::new("BTC"), &Asset::new("USDT"))
            .is_none());
    }
}
