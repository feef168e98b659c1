// =============================================================================
// Vortex Arb — Main Entry Point
// =============================================================================
//
// Wires the Exchange Client, Pair Graph, and Orchestrator together, then
// waits on ctrl-c for a graceful shutdown: the shutdown signal stops the
// streams from reconnecting, in-flight executions are left to finish on
// their own tasks, and the trade history database is already durable since
// every fill is persisted as it happens.
//
// =============================================================================

mod config;
mod errors;
mod exchange;
mod execution;
mod graph;
mod market_data;
mod observer;
mod orchestrator;
mod path_engine;
mod persistence;
mod position;
mod risk;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Credentials, RuntimeConfig};
use crate::exchange::client::ExchangeClient;
use crate::execution::ExecutionHistory;
use crate::graph::PairGraph;
use crate::market_data::{OrderBookMap, TickerMap};
use crate::observer::TracingObserver;
use crate::orchestrator::Orchestrator;
use crate::persistence::TradeStore;
use crate::position::PositionManager;
use crate::risk::RiskState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("vortex-arb starting up");

    let config = RuntimeConfig::default();
    let credentials = Credentials::from_env()?;

    let client = Arc::new(ExchangeClient::connect(credentials, &config.endpoints).await?);
    info!("exchange client connected and clock-synced");

    let graph = PairGraph::build(&client).await;
    if graph.is_empty() {
        warn!("starting with an empty pair graph; the orchestrator will retry on its rebuild schedule");
    } else {
        info!(assets = graph.asset_count(), "pair graph built");
    }

    let tickers = Arc::new(TickerMap::new());
    let books = Arc::new(OrderBookMap::new());
    let risk_state = Arc::new(RiskState::new());
    let positions = Arc::new(PositionManager::new());
    let history = Arc::new(ExecutionHistory::new());
    let store = Arc::new(TradeStore::open(&config.db_path)?);
    let observer = Arc::new(TracingObserver);

    let orchestrator = Orchestrator::new(
        client.clone(),
        graph,
        tickers,
        books,
        risk_state,
        positions,
        history,
        store,
        observer,
        config.strategy_params.clone(),
        config.risk_limits.clone(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = orchestrator.spawn(shutdown_rx.clone());

    let user_data_shutdown = shutdown_rx.clone();
    let user_data_client = client.clone();
    let user_data_handle = tokio::spawn(async move {
        let listen_key = match user_data_client.user_data_stream_key().await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "failed to acquire user-data stream key, skipping stream");
                return;
            }
        };
        exchange::streams::run_user_data_stream(listen_key, user_data_shutdown, |message| {
            info!(?message, "user-data stream event");
        })
        .await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping streams");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    let _ = user_data_handle.await;

    info!("vortex-arb shut down cleanly");
    Ok(())
}
