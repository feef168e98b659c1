// =============================================================================
// Streaming subscriptions — ticker@arr, user-data, per-symbol depth5@1000ms
// =============================================================================
//
// Three logical streams, each with a {starting, running, stopped} lifecycle.
// The ticker and user-data streams auto-reconnect 5s after a remote close
// unless the process-wide shutdown signal has fired. Depth streams are keyed
// by symbol, started lazily and idempotently by the orchestrator, and do NOT
// auto-reconnect: a close always means an explicit unsubscribe.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const STREAM_BASE: &str = "wss://stream.binance.com:9443";
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// One per-symbol best bid/ask/volume update from the all-market ticker array.
#[derive(Debug, Clone)]
pub struct TickerUpdate {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub quote_volume: Decimal,
}

/// A single depth-stream update (top 5 bid/ask levels).
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub symbol: String,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// `true` once the process-wide shutdown signal has fired.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Run the all-market ticker stream, invoking `on_update` for every element
/// of every incoming array message. Reconnects after `RECONNECT_DELAY` on
/// remote close unless `shutdown` has fired; returns only on shutdown.
pub async fn run_ticker_stream(
    mut shutdown: ShutdownSignal,
    on_update: impl Fn(TickerUpdate) + Send + Sync + 'static,
) {
    let url = format!("{STREAM_BASE}/ws/!ticker@arr");
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!("ticker stream connected");
                let (_, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("ticker stream stopping for shutdown");
                                return;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    for update in parse_ticker_array(&text) {
                                        on_update(update);
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "ticker stream read error");
                                    break;
                                }
                                None => {
                                    warn!("ticker stream ended by remote");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to connect ticker stream");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Run the authenticated user-data stream on a given `listen_key`. Same
/// reconnect contract as the ticker stream.
pub async fn run_user_data_stream(
    listen_key: String,
    mut shutdown: ShutdownSignal,
    on_message: impl Fn(serde_json::Value) + Send + Sync + 'static,
) {
    let url = format!("{STREAM_BASE}/ws/{listen_key}");
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!("user-data stream connected");
                let (_, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("user-data stream stopping for shutdown");
                                return;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str(&text) {
                                        on_message(value);
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "user-data stream read error");
                                    break;
                                }
                                None => {
                                    warn!("user-data stream ended by remote");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to connect user-data stream");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_single_depth_stream(symbol: String, on_update: Arc<dyn Fn(DepthUpdate) + Send + Sync>) {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE}/ws/{lower}@depth5@1000ms");

    let (stream, _) = match connect_async(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(symbol = %symbol, error = %e, "failed to connect depth stream");
            return;
        }
    };

    info!(symbol = %symbol, "depth stream connected");
    let (_, mut read) = stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(update) = parse_depth_message(&symbol, &text) {
                    on_update(update);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(symbol = %symbol, error = %e, "depth stream read error");
                return;
            }
        }
    }
    debug!(symbol = %symbol, "depth stream ended");
}

/// Tracks active per-symbol depth-stream subscriptions. Starting an
/// already-running symbol is a no-op; stopping a symbol aborts its task and
/// releases the entry without any reconnect attempt.
pub struct DepthSubscriptions {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DepthSubscriptions {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self, symbol: &str, on_update: Arc<dyn Fn(DepthUpdate) + Send + Sync>) {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(symbol) {
            return;
        }
        let sym = symbol.to_string();
        let handle = tokio::spawn(run_single_depth_stream(sym, on_update));
        tasks.insert(symbol.to_string(), handle);
    }

    pub fn stop(&self, symbol: &str) {
        if let Some(handle) = self.tasks.lock().remove(symbol) {
            handle.abort();
        }
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Subscribe to every symbol in `wanted` that is not already subscribed,
    /// and unsubscribe from every active symbol not in `wanted`. Returns
    /// whether any new subscription was added (callers sleep 2s in that case
    /// to let depth snapshots arrive).
    pub fn reconcile(
        &self,
        wanted: &std::collections::HashSet<String>,
        on_update: impl Fn() -> Arc<dyn Fn(DepthUpdate) + Send + Sync>,
    ) -> bool {
        let current: std::collections::HashSet<String> =
            self.active_symbols().into_iter().collect();

        let mut added = false;
        for symbol in wanted.difference(&current) {
            self.start(symbol, on_update());
            added = true;
        }
        for symbol in current.difference(wanted) {
            self.stop(symbol);
        }
        added
    }
}

impl Default for DepthSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_decimal_str(v: &serde_json::Value) -> Option<Decimal> {
    v.as_str().and_then(|s| s.parse().ok())
}

/// Parse the `!ticker@arr` array message into individual `TickerUpdate`s.
/// Binance's compact per-symbol object uses `s`/`b`/`a`/`q` keys.
fn parse_ticker_array(text: &str) -> Vec<TickerUpdate> {
    let Ok(serde_json::Value::Array(entries)) = serde_json::from_str::<serde_json::Value>(text)
    else {
        return Vec::new();
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let symbol = entry["s"].as_str()?.to_string();
            let bid = parse_decimal_str(&entry["b"])?;
            let ask = parse_decimal_str(&entry["a"])?;
            let quote_volume = parse_decimal_str(&entry["q"]).unwrap_or_default();
            Some(TickerUpdate {
                symbol,
                bid,
                ask,
                quote_volume,
            })
        })
        .collect()
}

/// Parse a partial-depth (`depthUpdate`) message into a `DepthUpdate`.
fn parse_depth_message(symbol: &str, text: &str) -> Option<DepthUpdate> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let parse_levels = |levels: &serde_json::Value| -> Vec<(Decimal, Decimal)> {
        levels
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|level| {
                        let price = parse_decimal_str(level.get(0)?)?;
                        let qty = parse_decimal_str(level.get(1)?)?;
                        Some((price, qty))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let bids = parse_levels(&root["b"]);
    let asks = parse_levels(&root["a"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }

    Some(DepthUpdate {
        symbol: symbol.to_string(),
        bids,
        asks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ticker_array_message() {
        let text = r#"[{"s":"BTCUSDT","b":"40000.00","a":"40010.00","q":"1234.5"}]"#;
        let updates = parse_ticker_array(text);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].symbol, "BTCUSDT");
        assert_eq!(updates[0].bid, Decimal::new(4000000, 2));
    }

    #[test]
    fn parses_depth_message() {
        let text = r#"{"e":"depthUpdate","s":"BTCUSDT","b":[["40000.0","1.5"]],"a":[["40010.0","1.2"]]}"#;
        let update = parse_depth_message("BTCUSDT", text).unwrap();
        assert_eq!(update.bids[0].0, Decimal::new(400000, 1));
        assert_eq!(update.asks[0].1, Decimal::new(12, 1));
    }

    #[test]
    fn depth_subscriptions_start_is_idempotent() {
        let subs = DepthSubscriptions::new();
        assert_eq!(subs.active_symbols().len(), 0);
    }
}
