// =============================================================================
// Orchestrator (C6) — ties the Exchange Client, Pair Graph, Path Engine, Risk
// & Allocator, and Order Executor into one running engine
// =============================================================================
//
// Two independent drivers push analysis cycles forward: every 10th incoming
// ticker message triggers one, and a graph rebuild runs every 21600 ticks of
// a 1-second timer (~6 hours). A cycle in flight suppresses a second
// concurrent cycle rather than queuing one up behind it.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{RiskLimits, StrategyParams};
use crate::exchange::client::ExchangeClient;
use crate::exchange::streams::{self, DepthSubscriptions, DepthUpdate, TickerUpdate};
use crate::execution::{self, ExecutionInstruction, ExecutionHistory, PriceLookup};
use crate::graph::PairGraph;
use crate::market_data::{OrderBookMap, TickerMap, TickerSnapshot};
use crate::observer::{Observer, TradingStatistics};
use crate::path_engine::{self, Path, PricingContext};
use crate::persistence::TradeStore;
use crate::position::{Position, PositionManager};
use crate::risk::{self, RiskState};
use crate::types::Asset;

const TICKER_MESSAGES_PER_CYCLE: u64 = 10;
const GRAPH_REBUILD_TICKS: u64 = 21_600;
const TOP_VOLUME_ASSET_COUNT: usize = 20;

/// Every hop symbol touched by `path`, by the resolved name — the set a
/// cycle subscribes depth streams to for the paths it is about to trade.
fn get_path_symbols(path: &Path, graph: &PairGraph) -> HashSet<String> {
    path.hops()
        .filter_map(|(from, to)| graph.resolve_hop(from, to))
        .map(|(symbol, _side)| symbol.name.clone())
        .collect()
}

/// Look up `asset`'s USDT cross from the current ticker snapshot. Used both
/// to convert stray commission assets to quote terms and to mark open
/// positions in a forward path's terminal asset.
fn usdt_price(tickers: &HashMap<String, TickerSnapshot>, asset: &str) -> Option<Decimal> {
    if asset == "USDT" {
        return Some(Decimal::ONE);
    }
    tickers.get(&format!("{asset}USDT")).map(|t| t.bid)
}

pub struct Orchestrator {
    client: Arc<ExchangeClient>,
    graph: RwLock<Arc<PairGraph>>,
    tickers: Arc<TickerMap>,
    books: Arc<OrderBookMap>,
    depth_subs: Arc<DepthSubscriptions>,
    fees: RwLock<HashMap<String, Decimal>>,
    risk_state: Arc<RiskState>,
    positions: Arc<PositionManager>,
    history: Arc<ExecutionHistory>,
    store: Arc<TradeStore>,
    stats: Mutex<TradingStatistics>,
    observer: Arc<dyn Observer>,
    strategy_params: StrategyParams,
    risk_limits: RiskLimits,
    message_count: AtomicU64,
    cycle_running: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ExchangeClient>,
        graph: PairGraph,
        tickers: Arc<TickerMap>,
        books: Arc<OrderBookMap>,
        risk_state: Arc<RiskState>,
        positions: Arc<PositionManager>,
        history: Arc<ExecutionHistory>,
        store: Arc<TradeStore>,
        observer: Arc<dyn Observer>,
        strategy_params: StrategyParams,
        risk_limits: RiskLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            graph: RwLock::new(Arc::new(graph)),
            tickers,
            books,
            depth_subs: Arc::new(DepthSubscriptions::new()),
            fees: RwLock::new(HashMap::new()),
            risk_state,
            positions,
            history,
            store,
            stats: Mutex::new(TradingStatistics::new()),
            observer,
            strategy_params,
            risk_limits,
            message_count: AtomicU64::new(0),
            cycle_running: AtomicBool::new(false),
        })
    }

    /// Spawn the ticker stream, the depth-driven order-book fan-in, and the
    /// 1-second graph-rebuild tick loop. Returns their join handles so the
    /// caller can await a clean shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let ticker_engine = self.clone();
        let ticker_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            streams::run_ticker_stream(ticker_shutdown, move |update: TickerUpdate| {
                Self::on_ticker(&ticker_engine, update);
            })
            .await;
        }));

        let tick_engine = self.clone();
        let mut tick_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = tick_shutdown.changed() => {
                        if *tick_shutdown.borrow() {
                            return;
                        }
                    }
                    _ = interval.tick() => {
                        ticks += 1;
                        if ticks >= GRAPH_REBUILD_TICKS {
                            ticks = 0;
                            tick_engine.rebuild_graph().await;
                        }
                    }
                }
            }
        }));

        handles
    }

    fn on_ticker(self_: &Arc<Self>, update: TickerUpdate) {
        self_.tickers.update(update);
        let count = self_.message_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % TICKER_MESSAGES_PER_CYCLE != 0 {
            return;
        }
        if self_
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let engine = self_.clone();
        tokio::spawn(async move {
            engine.run_cycle().await;
            engine.cycle_running.store(false, Ordering::Release);
        });
    }

    #[instrument(skip(self))]
    async fn rebuild_graph(&self) {
        info!("rebuilding pair graph");
        let graph = PairGraph::build(&self.client).await;
        if !graph.is_empty() {
            *self.graph.write() = Arc::new(graph);
        } else {
            warn!("graph rebuild produced an empty graph, keeping the previous one");
        }
    }

    fn price_lookup(&self) -> PriceLookup {
        let tickers = self.tickers.snapshot();
        Arc::new(move |asset: &str| usdt_price(&tickers, asset))
    }

    /// Run one full analysis cycle: steps 1-9 of the design — system-status
    /// check, market-quality metrics, dynamic risk scaling, major-asset
    /// derivation, per-start-asset path enumeration and allocation, depth
    /// subscription reconciliation, risk-gated sizing, parallel execution,
    /// and state/observer updates.
    #[instrument(skip(self))]
    async fn run_cycle(&self) {
        match self.client.system_status().await {
            Ok(status) if status != 0 => {
                warn!(status, "exchange system status is not normal, skipping cycle");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to query system status, skipping cycle");
                return;
            }
            _ => {}
        }

        let graph = self.graph.read().clone();
        if graph.is_empty() {
            debug!("pair graph is empty, skipping cycle");
            return;
        }

        let ticker_snapshot = self.tickers.snapshot();
        let book_snapshot = self.books.snapshot();
        let fees = self.fees.read().clone();

        let (avg_spread_pct, total_volume_24h) = market_quality(&ticker_snapshot);
        let scaled = risk::scale_risk_limits(&self.risk_limits, Some(avg_spread_pct));

        self.close_triggered_positions(&ticker_snapshot).await;

        let mut by_volume: Vec<&TickerSnapshot> = ticker_snapshot.values().collect();
        by_volume.sort_by(|a, b| b.quote_volume.cmp(&a.quote_volume));
        let major_assets: HashSet<Asset> = by_volume
            .into_iter()
            .take(TOP_VOLUME_ASSET_COUNT)
            .filter_map(|t| graph.symbol(&t.symbol))
            .flat_map(|s| [s.base.clone(), s.quote.clone()])
            .collect();

        let balances = match self.client.balances().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to fetch balances, skipping cycle");
                return;
            }
        };

        let mut start_assets: Vec<(Asset, Decimal)> = balances
            .iter()
            .filter(|b| b.free > Decimal::ZERO && graph.contains_asset(&b.asset))
            .filter(|b| major_assets.contains(&b.asset))
            .map(|b| (b.asset.clone(), b.free))
            .collect();
        if start_assets.is_empty() {
            start_assets = balances
                .iter()
                .filter(|b| b.free > Decimal::ZERO && graph.contains_asset(&b.asset))
                .map(|b| (b.asset.clone(), b.free))
                .collect();
        }

        let ctx = PricingContext {
            graph: &graph,
            tickers: &ticker_snapshot,
            books: &book_snapshot,
            fees: &fees,
            default_fee: Decimal::try_from(self.strategy_params.taker_commission).unwrap_or_default(),
        };

        let win_loss = self.history.win_loss_stats();

        let mut wanted_symbols: HashSet<String> = HashSet::new();
        let mut instructions: Vec<ExecutionInstruction> = Vec::new();

        for (asset, free) in &start_assets {
            let candidates = path_engine::find_profitable_paths(&ctx, asset, *free, &self.strategy_params);
            if candidates.is_empty() {
                continue;
            }

            let analyses: Vec<_> = candidates
                .iter()
                .map(|profit| risk::analyze_path(&ctx, profit, self.risk_limits.risk_free_rate))
                .collect();

            for analysis in &analyses {
                wanted_symbols.extend(get_path_symbols(&analysis.profit.path, &graph));
            }

            let Some(allocation) = risk::allocate_for_start_asset(&analyses, self.risk_limits.min_sharpe_ratio) else {
                continue;
            };

            for alloc in &allocation.allocations {
                let Some(path_analysis) = analyses.iter().find(|a| a.profit.path == alloc.path) else {
                    continue;
                };
                let max_drawdown = path_analysis.max_drawdown;

                // Regime-selected capital budget, then split across this start
                // asset's selected paths by the hydra allocation fraction.
                let regime_capital = risk::dynamic_position_size(
                    self.risk_limits.position_sizing_method,
                    *free,
                    path_analysis,
                    scaled.max_portfolio_risk,
                    win_loss,
                );
                let investment = risk::investment_size(
                    regime_capital,
                    alloc.allocation_fraction,
                    scaled.max_portfolio_risk,
                    Decimal::try_from(self.risk_limits.min_position_size).unwrap_or_default(),
                );
                if investment.is_zero() {
                    continue;
                }
                if !risk::passes_risk_gates(
                    &self.risk_state,
                    &self.risk_limits,
                    *free,
                    investment,
                    max_drawdown,
                ) {
                    debug!(asset = %asset, "proposed allocation failed risk gates");
                    continue;
                }
                instructions.push(ExecutionInstruction {
                    path: alloc.path.clone(),
                    initial_amount: investment,
                    predicted_profit_percent: (alloc.expected_profit / investment).to_f64().unwrap_or(0.0) * 100.0,
                    operating_regime: allocation.strategy_label.clone(),
                });
            }
        }

        if !wanted_symbols.is_empty() {
            let books = self.books.clone();
            let added = self.depth_subs.reconcile(&wanted_symbols, || {
                let books = books.clone();
                Arc::new(move |update: DepthUpdate| books.update(update)) as Arc<dyn Fn(DepthUpdate) + Send + Sync>
            });
            if added {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }

        if instructions.is_empty() {
            self.publish_snapshot(ticker_snapshot.len(), avg_spread_pct, total_volume_24h);
            return;
        }

        let price_lookup = self.price_lookup();
        let results = execution::execute_instructions(
            self.client.clone(),
            graph.clone(),
            instructions,
            price_lookup,
            &self.history,
            &self.store,
        )
        .await;

        for result in &results {
            if result.success && result.path.returns_to_start() {
                // Atomic round-trip: settle PnL immediately, no resident position.
                self.risk_state.record_realized_pnl(result.profit_loss);
            } else if result.success {
                // Forward path: capital now sits in a new terminal asset, open a
                // monitored position instead of settling PnL now.
                self.risk_state.position_opened();
                self.open_forward_position(result, &ticker_snapshot, &scaled);
            } else {
                self.risk_state.record_realized_pnl(result.profit_loss);
            }
            self.stats
                .lock()
                .record_execution(result.success, result.profit_loss, result.wall_time);
        }

        self.publish_snapshot(ticker_snapshot.len(), avg_spread_pct, total_volume_24h);
    }

    /// A forward (non-returning) path leaves capital sitting in a new
    /// terminal asset; open a monitored position with stop/take thresholds
    /// derived from the scaled risk limits rather than settling its PnL now.
    fn open_forward_position(
        &self,
        result: &crate::execution::PathExecutionResult,
        tickers: &HashMap<String, TickerSnapshot>,
        scaled: &risk::ScaledRiskLimits,
    ) {
        let Some(terminal) = result.path.0.last() else {
            return;
        };
        let Some(entry_price) = usdt_price(tickers, terminal.as_str()) else {
            warn!(asset = %terminal, "no USDT price available, cannot open monitored position");
            return;
        };
        let stop_loss = entry_price * (Decimal::ONE - Decimal::try_from(scaled.stop_loss_percentage).unwrap_or_default());
        let take_profit = entry_price * (Decimal::ONE + Decimal::try_from(scaled.take_profit_percentage).unwrap_or_default());
        let position = Position::open(result.path.clone(), result.final_amount, entry_price, stop_loss, take_profit);
        self.positions.insert(position);
    }

    /// Evaluate every open position's terminal asset against its stop/take
    /// thresholds once per cycle, closing and settling any that trip.
    async fn close_triggered_positions(&self, tickers: &HashMap<String, TickerSnapshot>) {
        for position in self.positions.open_positions() {
            let Some(terminal) = position.path.0.last() else {
                continue;
            };
            let Some(current_price) = usdt_price(tickers, terminal.as_str()) else {
                continue;
            };
            if position.exit_triggered(current_price) {
                if let Some(pnl) = self.positions.close(position.id, current_price) {
                    self.risk_state.record_realized_pnl(pnl);
                    self.risk_state.position_closed();
                    info!(path = ?position.path.0, pnl = %pnl, "closed monitored position");
                }
            }
        }
    }

    fn publish_snapshot(&self, active_tickers: usize, avg_spread_pct: f64, total_volume_24h: Decimal) {
        let snapshot = self.stats.lock().snapshot(active_tickers, avg_spread_pct, total_volume_24h);
        self.observer.on_snapshot(&snapshot);
    }
}

/// Average bid/ask spread across every quoted symbol (a volatility proxy
/// consistent with the per-hop spread the allocator already uses), plus
/// total 24h quote volume across the same set.
fn market_quality(tickers: &HashMap<String, TickerSnapshot>) -> (f64, Decimal) {
    if tickers.is_empty() {
        return (0.0, Decimal::ZERO);
    }
    let mut spread_sum = 0.0;
    let mut spread_count = 0u32;
    let mut total_volume = Decimal::ZERO;
    for ticker in tickers.values() {
        if !ticker.bid.is_zero() && !ticker.ask.is_zero() {
            spread_sum += ((ticker.ask - ticker.bid) / ticker.bid).to_f64().unwrap_or(0.0);
            spread_count += 1;
        }
        total_volume += ticker.quote_volume;
    }
    let avg = if spread_count == 0 { 0.0 } else { spread_sum / spread_count as f64 };
    (avg, total_volume)
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

    #[test]
    fn path_symbols_collects_every_hop_once() {
        let graph = PairGraph::from_symbols(vec![
            symbol("BTCUSDT", "BTC", "USDT"),
            symbol("ETHBTC", "ETH", "BTC"),
        ]);
        let path = Path(vec![Asset::new("USDT"), Asset::new("BTC"), Asset::new("ETH")]);
        let symbols = get_path_symbols(&path, &graph);
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains("BTCUSDT"));
        assert!(symbols.contains("ETHBTC"));
    }

    #[test]
    fn market_quality_averages_spread_and_sums_volume() {
        let mut tickers = HashMap::new();
        tickers.insert(
            "BTCUSDT".to_string(),
            TickerSnapshot {
                symbol: "BTCUSDT".to_string(),
                bid: dec!(100),
                ask: dec!(101),
                quote_volume: dec!(1000),
                updated_at: chrono::Utc::now(),
            },
        );
        tickers.insert(
            "ETHUSDT".to_string(),
            TickerSnapshot {
                symbol: "ETHUSDT".to_string(),
                bid: dec!(50),
                ask: dec!(51),
                quote_volume: dec!(500),
                updated_at: chrono::Utc::now(),
            },
        );
        let (avg, volume) = market_quality(&tickers);
        assert!(avg > 0.0);
        assert_eq!(volume, dec!(1500));
    }

    #[test]
    fn market_quality_is_zero_with_no_tickers() {
        let tickers = HashMap::new();
        let (avg, volume) = market_quality(&tickers);
        assert_eq!(avg, 0.0);
        assert_eq!(volume, Decimal::ZERO);
    }
}
