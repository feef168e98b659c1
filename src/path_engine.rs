// =============================================================================
// Path Engine (C3) — bounded BFS enumeration, per-hop pricing, profit ranking
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::StrategyParams;
use crate::graph::PairGraph;
use crate::market_data::{OrderBookSnapshot, TickerSnapshot};
use crate::types::{Asset, Side};

/// An ordered sequence of assets of length >= 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(pub Vec<Asset>);

impl Path {
    pub fn returns_to_start(&self) -> bool {
        match (self.0.first(), self.0.last()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn len_hops(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    pub fn unique_assets(&self) -> usize {
        self.0.iter().collect::<HashSet<_>>().len()
    }

    pub fn hops(&self) -> impl Iterator<Item = (&Asset, &Asset)> {
        self.0.windows(2).map(|w| (&w[0], &w[1]))
    }
}

/// A priced candidate path.
#[derive(Debug, Clone)]
pub struct PathProfit {
    pub path: Path,
    pub initial_amount: Decimal,
    pub final_amount: Decimal,
    pub profit: Decimal,
    pub profit_percent: f64,
}

/// Everything the pricing rule needs to resolve and price a single hop.
pub struct PricingContext<'a> {
    pub graph: &'a PairGraph,
    pub tickers: &'a HashMap<String, TickerSnapshot>,
    pub books: &'a HashMap<String, OrderBookSnapshot>,
    pub fees: &'a HashMap<String, Decimal>,
    pub default_fee: Decimal,
}

/// Price a single hop from `from` to `to` carrying `amount`. Returns zero if
/// the hop has no tradable symbol, lacks any usable price source, or fails
/// the symbol's min-notional filter.
pub fn price_hop(ctx: &PricingContext, from: &Asset, to: &Asset, amount: Decimal) -> Decimal {
    if amount.is_sign_negative() || amount.is_zero() {
        return Decimal::ZERO;
    }

    let Some((symbol, side)) = ctx.graph.resolve_hop(from, to) else {
        return Decimal::ZERO;
    };

    let fee = ctx
        .fees
        .get(&symbol.name)
        .copied()
        .unwrap_or(ctx.default_fee);
    let one_minus_fee = Decimal::ONE - fee;
    let book = ctx
        .books
        .get(&symbol.name)
        .filter(|b| !b.bids.is_empty() && !b.asks.is_empty());
    let ticker = ctx.tickers.get(&symbol.name);

    match side {
        Side::Sell => {
            // forward: q_out = q * best_bid * (1 - fee)
            let notional = amount
                * ticker
                    .map(|t| t.bid)
                    .or_else(|| book.and_then(|b| b.best_bid()))
                    .unwrap_or_default();
            if notional < symbol.filters.min_notional {
                return Decimal::ZERO;
            }
            let bid = book
                .and_then(|b| b.best_bid())
                .or_else(|| ticker.map(|t| t.bid));
            match bid {
                Some(bid) if !bid.is_zero() => amount * bid * one_minus_fee,
                _ => Decimal::ZERO,
            }
        }
        Side::Buy => {
            // reverse: q_out = (q / best_ask) * (1 - fee); notional = q itself.
            if amount < symbol.filters.min_notional {
                return Decimal::ZERO;
            }
            let ask = book
                .and_then(|b| b.best_ask())
                .or_else(|| ticker.map(|t| t.ask));
            match ask {
                Some(ask) if !ask.is_zero() => (amount / ask) * one_minus_fee,
                _ => Decimal::ZERO,
            }
        }
    }
}

/// Recompute the full path's final amount from `initial`, repricing every hop
/// fresh. Returns zero the moment any hop is invalid.
pub fn evaluate_path(ctx: &PricingContext, path: &Path, initial: Decimal) -> Decimal {
    let mut amount = initial;
    for (from, to) in path.hops() {
        amount = price_hop(ctx, from, to, amount);
        if amount.is_zero() {
            return Decimal::ZERO;
        }
    }
    amount
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Enumerate simple paths from `start` of length 2..=max_depth, returning
/// those whose `profit_percent` exceeds `params.min_profit_percent`, sorted
/// descending (stable within ties). BFS over (asset, depth) states, capped at
/// `params.max_paths` expanded states, revisits of the same state pruned.
pub fn find_profitable_paths(
    ctx: &PricingContext,
    start: &Asset,
    initial_amount: Decimal,
    params: &StrategyParams,
) -> Vec<PathProfit> {
    let min_notional = Decimal::try_from(params.min_notional).unwrap_or_default();
    if initial_amount < min_notional || !ctx.graph.contains_asset(start) {
        return Vec::new();
    }

    let mut results = Vec::new();
    let mut visited: HashSet<(Asset, usize)> = HashSet::new();
    visited.insert((start.clone(), 0));

    let mut queue: VecDeque<Vec<Asset>> = VecDeque::new();
    queue.push_back(vec![start.clone()]);

    'bfs: while let Some(current) = queue.pop_front() {
        let depth = current.len() - 1;
        if depth >= params.max_depth.saturating_sub(1) {
            continue;
        }
        let last = current.last().expect("path always non-empty").clone();

        for neighbor in ctx.graph.neighbors(&last).cloned().collect::<Vec<_>>() {
            let key = (neighbor.clone(), depth + 1);
            if visited.contains(&key) {
                continue;
            }
            if visited.len() >= params.max_paths {
                break 'bfs;
            }
            visited.insert(key);

            let mut child = current.clone();
            child.push(neighbor);
            let path = Path(child.clone());

            let final_amount = evaluate_path(ctx, &path, initial_amount);
            if !final_amount.is_zero() {
                let profit = final_amount - initial_amount;
                let profit_percent =
                    decimal_to_f64(profit / initial_amount * Decimal::from(100));
                if profit_percent > params.min_profit_percent {
                    results.push(PathProfit {
                        path: path.clone(),
                        initial_amount,
                        final_amount,
                        profit,
                        profit_percent,
                    });
                }
            }

            queue.push_back(child);
        }
    }

    results.sort_by(|a, b| {
        b.profit_percent
            .partial_cmp(&a.profit_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Symbol, SymbolFilters};
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            min_qty: dec!(0.0001),
            max_qty: dec!(1000),
            step_size: dec!(0.0001),
            min_notional: dec!(10),
        }
    }

    fn symbol(name: &str, base: &str, quote: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            base: Asset::new(base),
            quote: Asset::new(quote),
            status: "TRADING".to_string(),
            filters: filters(),
        }
    }

    fn triangle_graph() -> PairGraph {
        PairGraph::from_symbols(vec![
            symbol("BTCUSDT", "BTC", "USDT"),
            symbol("ETHUSDT", "ETH", "USDT"),
            symbol("ETHBTC", "ETH", "BTC"),
        ])
    }

    fn book(symbol: &str, bid: Decimal, ask: Decimal) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: vec![(bid, dec!(10))],
            asks: vec![(ask, dec!(10))],
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn unprofitable_three_hop_cycle_is_rejected() {
        let graph = triangle_graph();
        let books: HashMap<String, OrderBookSnapshot> = [
            ("BTCUSDT".to_string(), book("BTCUSDT", dec!(40000), dec!(40001))),
            ("ETHUSDT".to_string(), book("ETHUSDT", dec!(1999), dec!(2000))),
            ("ETHBTC".to_string(), book("ETHBTC", dec!(0.05), dec!(0.0501))),
        ]
        .into_iter()
        .collect();
        let tickers = HashMap::new();
        let fees = HashMap::new();
        let ctx = PricingContext {
            graph: &graph,
            tickers: &tickers,
            books: &books,
            fees: &fees,
            default_fee: dec!(0.001),
        };

        let path = Path(vec![
            Asset::new("USDT"),
            Asset::new("BTC"),
            Asset::new("ETH"),
            Asset::new("USDT"),
        ]);
        let final_amount = evaluate_path(&ctx, &path, dec!(1000));
        assert!(final_amount < dec!(1000));
    }

    #[test]
    fn profitable_three_hop_cycle_is_accepted() {
        let graph = triangle_graph();
        let books: HashMap<String, OrderBookSnapshot> = [
            ("BTCUSDT".to_string(), book("BTCUSDT", dec!(40200), dec!(40201))),
            ("ETHUSDT".to_string(), book("ETHUSDT", dec!(1989), dec!(1990))),
            ("ETHBTC".to_string(), book("ETHBTC", dec!(0.0502), dec!(0.0503))),
        ]
        .into_iter()
        .collect();
        let tickers = HashMap::new();
        let fees = HashMap::new();
        let ctx = PricingContext {
            graph: &graph,
            tickers: &tickers,
            books: &books,
            fees: &fees,
            default_fee: dec!(0.001),
        };

        let path = Path(vec![
            Asset::new("USDT"),
            Asset::new("BTC"),
            Asset::new("ETH"),
            Asset::new("USDT"),
        ]);
        let final_amount = evaluate_path(&ctx, &path, dec!(1000));
        assert!(final_amount > dec!(1000));
    }

    #[test]
    fn below_min_notional_start_amount_returns_empty() {
        let graph = triangle_graph();
        let tickers = HashMap::new();
        let books = HashMap::new();
        let fees = HashMap::new();
        let ctx = PricingContext {
            graph: &graph,
            tickers: &tickers,
            books: &books,
            fees: &fees,
            default_fee: dec!(0.001),
        };
        let params = StrategyParams::default();
        let results = find_profitable_paths(&ctx, &Asset::new("USDT"), dec!(1), &params);
        assert!(results.is_empty());
    }

    #[test]
    fn start_asset_absent_from_graph_returns_empty() {
        let graph = triangle_graph();
        let tickers = HashMap::new();
        let books = HashMap::new();
        let fees = HashMap::new();
        let ctx = PricingContext {
            graph: &graph,
            tickers: &tickers,
            books: &books,
            fees: &fees,
            default_fee: dec!(0.001),
        };
        let params = StrategyParams::default();
        let results = find_profitable_paths(&ctx, &Asset::new("XRP"), dec!(1000), &params);
        assert!(results.is_empty());
    }

    #[test]
    fn results_are_sorted_descending_by_profit_percent() {
        let graph = triangle_graph();
        let books: HashMap<String, OrderBookSnapshot> = [
            ("BTCUSDT".to_string(), book("BTCUSDT", dec!(40200), dec!(40201))),
            ("ETHUSDT".to_string(), book("ETHUSDT", dec!(1989), dec!(1990))),
            ("ETHBTC".to_string(), book("ETHBTC", dec!(0.0502), dec!(0.0503))),
        ]
        .into_iter()
        .collect();
        let tickers = HashMap::new();
        let fees = HashMap::new();
        let ctx = PricingContext {
            graph: &graph,
            tickers: &tickers,
            books: &books,
            fees: &fees,
            default_fee: dec!(0.001),
        };
        let mut params = StrategyParams::default();
        params.min_profit_percent = -100.0;
        let results = find_profitable_paths(&ctx, &Asset::new("USDT"), dec!(1000), &params);
        for window in results.windows(2) {
            assert!(window[0].profit_percent >= window[1].profit_percent);
        }
    }
}
