// =============================================================================
// Order Executor (C5) — single-order fills, multi-hop real-fill accounting,
// bounded parallel dispatch, execution history, and persistence
// =============================================================================
//
// The critical invariant carried through this whole module: each hop feeds
// its successor the amount it actually received (from the exchange's own
// fills), never a fresh simulation of what the hop "should" have produced.
//
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{instrument, warn};

use crate::errors::ExecutionError;
use crate::exchange::client::ExchangeClient;
use crate::graph::{PairGraph, Symbol};
use crate::path_engine::Path;
use crate::persistence::{TradeHistoryRecord, TradeStore};
use crate::risk::adjust_quantity_to_filters;
use crate::types::{Asset, Side};

/// A price lookup used to convert a commission paid in a third asset into
/// quote-asset terms (e.g. via USDT), when neither the quote nor base asset
/// matches the commission asset directly.
pub type PriceLookup = Arc<dyn Fn(&str) -> Option<Decimal> + Send + Sync>;

// ---------------------------------------------------------------------------
// Fills and commission conversion
// ---------------------------------------------------------------------------

struct Fill {
    price: Decimal,
    qty: Decimal,
    commission: Decimal,
    commission_asset: String,
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = value.as_str() {
        s.parse().ok()
    } else {
        value.as_f64().and_then(|n| Decimal::try_from(n).ok())
    }
}

fn parse_fills(order: &serde_json::Value) -> Vec<Fill> {
    order["fills"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|f| {
                    Some(Fill {
                        price: parse_decimal(&f["price"])?,
                        qty: parse_decimal(&f["qty"])?,
                        commission: parse_decimal(&f["commission"]).unwrap_or_default(),
                        commission_asset: f["commissionAsset"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Sum each fill's commission in quote-asset terms: direct if it was charged
/// in the quote asset, converted by `price` if charged in the base asset,
/// otherwise looked up via `price_lookup` (e.g. a USDT cross) — falling back
/// to the raw commission value with a warning if no conversion path exists.
fn commission_in_quote(fills: &[Fill], quote_asset: &str, base_asset: &str, price_lookup: &dyn Fn(&str) -> Option<Decimal>) -> Decimal {
    let mut total = Decimal::ZERO;
    for fill in fills {
        if fill.commission_asset == quote_asset {
            total += fill.commission;
        } else if fill.commission_asset == base_asset {
            total += fill.commission * fill.price;
        } else if let Some(price) = price_lookup(&fill.commission_asset) {
            total += fill.commission * price;
        } else {
            warn!(asset = %fill.commission_asset, "no price path to quote asset for commission, using raw value");
            total += fill.commission;
        }
    }
    total
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub symbol: String,
    pub side: Side,
    pub requested_qty: Decimal,
    pub order_id: Option<u64>,
    pub executed_price: Option<Decimal>,
    pub commission_in_quote: Option<Decimal>,
    pub error: Option<String>,
    pub wall_time: f64,
}

impl ExecutionResult {
    fn failed(symbol: &str, side: Side, requested_qty: Decimal, error: impl Into<String>, wall_time: f64) -> Self {
        Self {
            success: false,
            symbol: symbol.to_string(),
            side,
            requested_qty,
            order_id: None,
            executed_price: None,
            commission_in_quote: None,
            error: Some(error.into()),
            wall_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathExecutionResult {
    pub path: Path,
    pub success: bool,
    pub initial_amount: Decimal,
    pub final_amount: Decimal,
    pub profit_loss: Decimal,
    pub hop_results: Vec<ExecutionResult>,
    pub total_commission: Decimal,
    pub wall_time: f64,
}

impl PathExecutionResult {
    fn aborted(path: Path, initial_amount: Decimal, hop_results: Vec<ExecutionResult>, total_commission: Decimal, wall_time: f64) -> Self {
        Self {
            path,
            success: false,
            initial_amount,
            final_amount: Decimal::ZERO,
            profit_loss: -initial_amount,
            hop_results,
            total_commission,
            wall_time,
        }
    }

    fn panicked(path: Path, initial_amount: Decimal) -> Self {
        Self {
            path,
            success: false,
            initial_amount,
            final_amount: Decimal::ZERO,
            profit_loss: -initial_amount,
            hop_results: Vec::new(),
            total_commission: Decimal::ZERO,
            wall_time: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Single order
// ---------------------------------------------------------------------------

/// Place a single MARKET order: verify the symbol is trading, adjust the
/// quantity to its LOT_SIZE filter, submit a test order first, then the real
/// order, then retrieve the authoritative fills for commission accounting.
#[instrument(skip(client, price_lookup), fields(symbol = %symbol.name, side = %side))]
pub async fn execute_order(
    client: &ExchangeClient,
    symbol: &Symbol,
    side: Side,
    requested_qty: Decimal,
    price_lookup: &dyn Fn(&str) -> Option<Decimal>,
) -> ExecutionResult {
    let start = std::time::Instant::now();

    if !symbol.is_trading() {
        return ExecutionResult::failed(
            &symbol.name,
            side,
            requested_qty,
            ExecutionError::SymbolNotTrading(symbol.name.clone()).to_string(),
            start.elapsed().as_secs_f64(),
        );
    }

    let adjusted = adjust_quantity_to_filters(requested_qty, &symbol.filters);
    if adjusted <= Decimal::ZERO {
        return ExecutionResult::failed(
            &symbol.name,
            side,
            requested_qty,
            ExecutionError::QuantityAdjustedToZero(symbol.name.clone()).to_string(),
            start.elapsed().as_secs_f64(),
        );
    }

    if let Err(e) = client.test_place_order(&symbol.name, side, adjusted).await {
        return ExecutionResult::failed(&symbol.name, side, adjusted, e.to_string(), start.elapsed().as_secs_f64());
    }

    let placed = match client.place_order(&symbol.name, side, adjusted).await {
        Ok(v) => v,
        Err(e) => {
            return ExecutionResult::failed(&symbol.name, side, adjusted, e.to_string(), start.elapsed().as_secs_f64());
        }
    };

    let order_id = placed["orderId"].as_u64();
    let order = match order_id {
        Some(id) => client.get_order(&symbol.name, id).await,
        None => Err(crate::errors::ExchangeError::Malformed("order response missing orderId".into())),
    };
    let order = match order {
        Ok(v) => v,
        Err(e) => {
            return ExecutionResult::failed(&symbol.name, side, adjusted, e.to_string(), start.elapsed().as_secs_f64());
        }
    };

    let fills = parse_fills(&order);
    if fills.is_empty() {
        return ExecutionResult::failed(
            &symbol.name,
            side,
            adjusted,
            ExecutionError::NoFills.to_string(),
            start.elapsed().as_secs_f64(),
        );
    }

    let sum_qty: Decimal = fills.iter().map(|f| f.qty).sum();
    let sum_quote_qty: Decimal = fills.iter().map(|f| f.price * f.qty).sum();
    let commission = commission_in_quote(&fills, symbol.quote.as_str(), symbol.base.as_str(), price_lookup);
    let executed_price = if sum_qty.is_zero() { None } else { Some(sum_quote_qty / sum_qty) };

    ExecutionResult {
        success: true,
        symbol: symbol.name.clone(),
        side,
        requested_qty: adjusted,
        order_id,
        executed_price,
        commission_in_quote: Some(commission),
        error: None,
        wall_time: start.elapsed().as_secs_f64(),
    }
}

/// Execute one hop and return the actually-received amount of `next_asset`
/// (never a re-simulated one), net of any commission charged in that asset.
async fn execute_hop(
    client: &ExchangeClient,
    symbol: &Symbol,
    side: Side,
    qty: Decimal,
    next_asset: &Asset,
    price_lookup: &dyn Fn(&str) -> Option<Decimal>,
) -> (ExecutionResult, Decimal) {
    let start = std::time::Instant::now();

    if let Err(e) = client.test_place_order(&symbol.name, side, qty).await {
        return (
            ExecutionResult::failed(&symbol.name, side, qty, e.to_string(), start.elapsed().as_secs_f64()),
            Decimal::ZERO,
        );
    }

    let placed = match client.place_order(&symbol.name, side, qty).await {
        Ok(v) => v,
        Err(e) => {
            return (
                ExecutionResult::failed(&symbol.name, side, qty, e.to_string(), start.elapsed().as_secs_f64()),
                Decimal::ZERO,
            );
        }
    };

    let order_id = placed["orderId"].as_u64();
    let order = match order_id {
        Some(id) => client.get_order(&symbol.name, id).await,
        None => Err(crate::errors::ExchangeError::Malformed("order response missing orderId".into())),
    };
    let order = match order {
        Ok(v) => v,
        Err(e) => {
            return (
                ExecutionResult::failed(&symbol.name, side, qty, e.to_string(), start.elapsed().as_secs_f64()),
                Decimal::ZERO,
            );
        }
    };

    let fills = parse_fills(&order);
    if fills.is_empty() {
        return (
            ExecutionResult::failed(&symbol.name, side, qty, ExecutionError::NoFills.to_string(), start.elapsed().as_secs_f64()),
            Decimal::ZERO,
        );
    }

    let sum_qty: Decimal = fills.iter().map(|f| f.qty).sum();
    let sum_quote_qty: Decimal = fills.iter().map(|f| f.price * f.qty).sum();
    let commission_in_next_asset: Decimal = fills
        .iter()
        .filter(|f| f.commission_asset == next_asset.as_str())
        .map(|f| f.commission)
        .sum();

    let next_amount = match side {
        Side::Buy => sum_qty - commission_in_next_asset,
        Side::Sell => sum_quote_qty - commission_in_next_asset,
    };
    let commission = commission_in_quote(&fills, symbol.quote.as_str(), symbol.base.as_str(), price_lookup);
    let executed_price = if sum_qty.is_zero() { None } else { Some(sum_quote_qty / sum_qty) };

    (
        ExecutionResult {
            success: true,
            symbol: symbol.name.clone(),
            side,
            requested_qty: qty,
            order_id,
            executed_price,
            commission_in_quote: Some(commission),
            error: None,
            wall_time: start.elapsed().as_secs_f64(),
        },
        next_amount.max(Decimal::ZERO),
    )
}

// ---------------------------------------------------------------------------
// Multi-hop execution
// ---------------------------------------------------------------------------

/// Walk every hop of `path` sequentially, feeding each successor the amount
/// the exchange actually reported for the prior hop. Aborts (without failing
/// sibling paths) on an unresolved hop, a zeroed LOT_SIZE adjustment, or a
/// failed order.
#[instrument(skip(client, graph, price_lookup), fields(hops = path.len_hops()))]
pub async fn execute_path(
    client: &ExchangeClient,
    graph: &PairGraph,
    path: &Path,
    initial_amount: Decimal,
    price_lookup: &dyn Fn(&str) -> Option<Decimal>,
) -> PathExecutionResult {
    let start = std::time::Instant::now();
    let mut current = initial_amount;
    let mut hop_results = Vec::new();
    let mut total_commission = Decimal::ZERO;

    for (from, to) in path.hops() {
        let Some((symbol, side)) = graph.resolve_hop(from, to) else {
            return PathExecutionResult::aborted(
                path.clone(),
                initial_amount,
                hop_results,
                total_commission,
                start.elapsed().as_secs_f64(),
            );
        };

        let adjusted = adjust_quantity_to_filters(current, &symbol.filters);
        if adjusted <= Decimal::ZERO {
            return PathExecutionResult::aborted(
                path.clone(),
                initial_amount,
                hop_results,
                total_commission,
                start.elapsed().as_secs_f64(),
            );
        }

        let (hop_result, next_amount) = execute_hop(client, symbol, side, adjusted, to, price_lookup).await;
        let hop_succeeded = hop_result.success;
        if let Some(commission) = hop_result.commission_in_quote {
            total_commission += commission;
        }
        hop_results.push(hop_result);

        if !hop_succeeded || next_amount.is_zero() {
            return PathExecutionResult::aborted(
                path.clone(),
                initial_amount,
                hop_results,
                total_commission,
                start.elapsed().as_secs_f64(),
            );
        }
        current = next_amount;
    }

    let final_amount = current;
    PathExecutionResult {
        path: path.clone(),
        success: final_amount > initial_amount,
        initial_amount,
        final_amount,
        profit_loss: final_amount - initial_amount,
        hop_results,
        total_commission,
        wall_time: start.elapsed().as_secs_f64(),
    }
}

// ---------------------------------------------------------------------------
// Parallel dispatch
// ---------------------------------------------------------------------------

/// One path selected by the allocator, carrying the metadata needed for
/// persistence once executed.
#[derive(Debug, Clone)]
pub struct ExecutionInstruction {
    pub path: Path,
    pub initial_amount: Decimal,
    pub predicted_profit_percent: f64,
    pub operating_regime: String,
}

const MAX_WORKERS: usize = 5;

/// Execute every instruction concurrently through a worker pool bounded to
/// `min(|instructions|, 5)`. A panicking or erroring task produces a failed
/// `PathExecutionResult` for that instruction alone; it never fails peers.
pub async fn execute_instructions_parallel(
    client: Arc<ExchangeClient>,
    graph: Arc<PairGraph>,
    instructions: Vec<ExecutionInstruction>,
    price_lookup: PriceLookup,
) -> Vec<PathExecutionResult> {
    if instructions.is_empty() {
        return Vec::new();
    }
    let pool_size = instructions.len().min(MAX_WORKERS);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(pool_size));

    // Collect (JoinHandle, path, initial_amount) triples up front so a
    // panicking task still yields a labeled failure instead of losing its path.
    let mut labeled = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        let client = client.clone();
        let graph = graph.clone();
        let semaphore = semaphore.clone();
        let price_lookup = price_lookup.clone();
        let path_for_panic = instruction.path.clone();
        let initial_for_panic = instruction.initial_amount;
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            execute_path(&client, &graph, &instruction.path, instruction.initial_amount, price_lookup.as_ref()).await
        });
        labeled.push((handle, path_for_panic, initial_for_panic));
    }

    let mut results = Vec::with_capacity(labeled.len());
    for (handle, path, initial_amount) in labeled {
        match handle.await {
            Ok(result) => results.push(result),
            Err(_) => results.push(PathExecutionResult::panicked(path, initial_amount)),
        }
    }
    results
}

// ---------------------------------------------------------------------------
// Execution history and statistics (supplemental, diagnostic-only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ExecutionStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_profit: Decimal,
    pub total_commission: Decimal,
}

impl ExecutionStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

const HISTORY_CAPACITY: usize = 1000;

/// The executor's own running summary over its in-memory execution history,
/// independent of the Orchestrator's aggregate trading statistics.
pub struct ExecutionHistory {
    records: parking_lot::Mutex<VecDeque<PathExecutionResult>>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self {
            records: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, result: PathExecutionResult) {
        let mut records = self.records.lock();
        records.push_back(result);
        if records.len() > HISTORY_CAPACITY {
            records.pop_front();
        }
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        let records = self.records.lock();
        let mut stats = ExecutionStatistics::default();
        for r in records.iter() {
            stats.total += 1;
            if r.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            stats.total_profit += r.profit_loss;
            stats.total_commission += r.total_commission;
        }
        stats
    }

    /// Historical win rate and average win/loss (as a fraction of the initial
    /// amount risked), for the Kelly position-sizing regime. `None` when the
    /// history is empty, so the caller falls back to neutral defaults
    /// (0.5 / 0.02 / 0.01) instead of dividing by zero.
    pub fn win_loss_stats(&self) -> Option<(f64, f64, f64)> {
        let records = self.records.lock();
        if records.is_empty() {
            return None;
        }
        let returns: Vec<f64> = records
            .iter()
            .filter(|r| !r.initial_amount.is_zero())
            .map(|r| (r.profit_loss / r.initial_amount).to_f64().unwrap_or(0.0))
            .collect();
        if returns.is_empty() {
            return None;
        }

        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).map(f64::abs).collect();

        let win_rate = wins.len() as f64 / returns.len() as f64;
        let avg_win = if wins.is_empty() {
            0.02
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.01
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };
        Some((win_rate, avg_win, avg_loss))
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a batch of instructions to completion, recording each result in
/// `history` and appending it to `store` as an append-only row.
pub async fn execute_instructions(
    client: Arc<ExchangeClient>,
    graph: Arc<PairGraph>,
    instructions: Vec<ExecutionInstruction>,
    price_lookup: PriceLookup,
    history: &ExecutionHistory,
    store: &TradeStore,
) -> Vec<PathExecutionResult> {
    let metadata: Vec<(f64, String)> = instructions
        .iter()
        .map(|i| (i.predicted_profit_percent, i.operating_regime.clone()))
        .collect();

    let results = execute_instructions_parallel(client, graph, instructions, price_lookup).await;

    for (result, (predicted_profit_percent, operating_regime)) in results.iter().zip(metadata) {
        history.record(result.clone());

        let path_label = result
            .path
            .0
            .iter()
            .map(|a| a.as_str().to_string())
            .collect::<Vec<_>>()
            .join("->");

        let record = TradeHistoryRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: path_label,
            success: result.success,
            profit_loss: result.profit_loss.to_string().parse().unwrap_or(0.0),
            initial_amount: result.initial_amount.to_string().parse().unwrap_or(0.0),
            final_amount: result.final_amount.to_string().parse().unwrap_or(0.0),
            execution_time: result.wall_time,
            total_commission: result.total_commission.to_string().parse().unwrap_or(0.0),
            predicted_profit_percent,
            operating_regime,
        };
        if let Err(e) = store.insert(&record) {
            warn!(error = %e, "failed to persist execution result");
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SymbolFilters;
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            min_qty: dec!(0.0001),
            max_qty: dec!(100),
            step_size: dec!(0.0001),
            min_notional: dec!(10),
        }
    }

    fn fill(price: Decimal, qty: Decimal, commission: Decimal, commission_asset: &str) -> Fill {
        Fill {
            price,
            qty,
            commission,
            commission_asset: commission_asset.to_string(),
        }
    }

    #[test]
    fn commission_matching_quote_asset_is_added_directly() {
        let fills = vec![fill(dec!(2000), dec!(1), dec!(2), "USDT")];
        let total = commission_in_quote(&fills, "USDT", "ETH", &|_| None);
        assert_eq!(total, dec!(2));
    }

    #[test]
    fn commission_matching_base_asset_is_converted_by_price() {
        let fills = vec![fill(dec!(2000), dec!(1), dec!(0.0005), "ETH")];
        let total = commission_in_quote(&fills, "USDT", "ETH", &|_| None);
        assert_eq!(total, dec!(1.0));
    }

    #[test]
    fn commission_in_third_asset_converts_via_lookup() {
        let fills = vec![fill(dec!(2000), dec!(1), dec!(10), "BNB")];
        let total = commission_in_quote(&fills, "USDT", "ETH", &|asset| {
            if asset == "BNB" {
                Some(dec!(300))
            } else {
                None
            }
        });
        assert_eq!(total, dec!(3000));
    }

    #[test]
    fn commission_in_third_asset_falls_back_to_raw_value_without_lookup() {
        let fills = vec![fill(dec!(2000), dec!(1), dec!(10), "BNB")];
        let total = commission_in_quote(&fills, "USDT", "ETH", &|_| None);
        assert_eq!(total, dec!(10));
    }

    #[test]
    fn next_hop_amount_matches_literal_fill_accounting_example() {
        // BUY 1.0 ETH on ETHUSDT at 2000, commission 0.0005 ETH -> next input 0.9995 ETH.
        let fills = vec![fill(dec!(2000), dec!(1.0), dec!(0.0005), "ETH")];
        let sum_qty: Decimal = fills.iter().map(|f| f.qty).sum();
        let commission_in_next: Decimal = fills
            .iter()
            .filter(|f| f.commission_asset == "ETH")
            .map(|f| f.commission)
            .sum();
        assert_eq!(sum_qty - commission_in_next, dec!(0.9995));

        // Same fill, commission in BNB -> next-hop input is the full 1.0 ETH.
        let fills = vec![fill(dec!(2000), dec!(1.0), dec!(0.0005), "BNB")];
        let sum_qty: Decimal = fills.iter().map(|f| f.qty).sum();
        let commission_in_next: Decimal = fills
            .iter()
            .filter(|f| f.commission_asset == "ETH")
            .map(|f| f.commission)
            .sum();
        assert_eq!(sum_qty - commission_in_next, dec!(1.0));
    }

    #[test]
    fn execution_history_caps_at_capacity_and_summarizes() {
        let history = ExecutionHistory::new();
        for _ in 0..3 {
            history.record(PathExecutionResult {
                path: Path(vec![Asset::new("USDT"), Asset::new("BTC")]),
                success: true,
                initial_amount: dec!(100),
                final_amount: dec!(101),
                profit_loss: dec!(1),
                hop_results: Vec::new(),
                total_commission: dec!(0.1),
                wall_time: 0.5,
            });
        }
        let stats = history.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.total_profit, dec!(3));
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[allow(dead_code)]
    fn assert_filters_unused(_f: SymbolFilters) {}
}
