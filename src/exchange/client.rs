// =============================================================================
// Exchange Client (C1) — REST I/O, endpoint failover, signing, clock sync
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::config::{Credentials, EndpointConfig};
use crate::errors::ExchangeError;
use crate::exchange::rate_limit::WeightGate;
use crate::graph::{Symbol, SymbolFilters};
use crate::types::Asset;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait, in seconds, for a 429/418 response lacking `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
/// Transient-network retry budget before the caller fails the request.
const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(1);
const TRANSIENT_MAX_DELAY: Duration = Duration::from_secs(60);

/// A single REST host, its measured ping latency (used only at selection
/// time), ordered into the failover cycle ascending by latency.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
}

/// Binance-compatible REST client with endpoint failover, a 6000/60s
/// request-weight gate, HMAC-SHA256 signing, and server-clock sync.
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    http: reqwest::Client,
    endpoints: RwLock<Vec<Endpoint>>,
    active: AtomicUsize,
    offset_ms: AtomicI64,
    weight_gate: WeightGate,
}

impl ExchangeClient {
    /// Ping every configured host, discard unreachable ones, order the
    /// survivors ascending by latency, and select the lowest. Aborts startup
    /// if none are reachable (§7, Fatal).
    pub async fn connect(creds: Credentials, config: &EndpointConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONNECT_TIMEOUT)
            .build()?;

        let mut hosts = vec![config.primary.clone()];
        hosts.extend(config.alternates.iter().cloned());

        let mut latencies: Vec<(String, Duration)> = Vec::new();
        for host in hosts {
            let start = std::time::Instant::now();
            let ok = http
                .get(format!("{host}/api/v3/ping"))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if ok {
                latencies.push((host, start.elapsed()));
            }
        }

        if latencies.is_empty() {
            anyhow::bail!(ExchangeError::NoReachableEndpoint);
        }

        latencies.sort_by_key(|(_, latency)| *latency);
        let endpoints = latencies
            .into_iter()
            .map(|(host, _)| Endpoint { host })
            .collect();

        let client = Self {
            api_key: creds.api_key,
            secret: creds.api_secret,
            http,
            endpoints: RwLock::new(endpoints),
            active: AtomicUsize::new(0),
            offset_ms: AtomicI64::new(0),
            weight_gate: WeightGate::new(),
        };

        client.sync_clock().await;
        Ok(client)
    }

    fn active_host(&self) -> String {
        let endpoints = self.endpoints.read();
        let idx = self.active.load(Ordering::Relaxed) % endpoints.len();
        endpoints[idx].host.clone()
    }

    /// Advance the active endpoint to the next entry in the cyclic list and
    /// re-synchronize the server clock, per the failover contract.
    async fn failover(&self) {
        let len = self.endpoints.read().len();
        let next = (self.active.load(Ordering::Relaxed) + 1) % len;
        self.active.store(next, Ordering::Relaxed);
        warn!(new_host = %self.active_host(), "failed over to next endpoint");
        self.sync_clock().await;
    }

    /// Fetch server time and set `offset_ms = server - local`. Defaults to 0
    /// on failure rather than failing the caller.
    #[instrument(skip(self))]
    async fn sync_clock(&self) {
        let url = format!("{}/api/v3/time", self.active_host());
        let local_before = now_ms();
        let result: Result<serde_json::Value, _> = async {
            let resp = self.http.get(&url).send().await?;
            resp.json().await
        }
        .await;

        match result {
            Ok(body) => {
                if let Some(server) = body["serverTime"].as_i64() {
                    let offset = server - local_before;
                    self.offset_ms.store(offset, Ordering::Relaxed);
                    debug!(offset_ms = offset, "clock synced");
                    return;
                }
                warn!("server time response missing serverTime field");
            }
            Err(e) => warn!(error = %e, "failed to sync server clock"),
        }
        self.offset_ms.store(0, Ordering::Relaxed);
    }

    fn timestamp_ms(&self) -> i64 {
        now_ms() + self.offset_ms.load(Ordering::Relaxed)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Core request dispatch: weight gate, signing, failover, rate-limit retry
    // -------------------------------------------------------------------------

    async fn dispatch(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        weight: u32,
        signed: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.weight_gate.acquire(weight).await;

        let mut attempt = 0;
        loop {
            let qs = if signed {
                self.signed_query(query)
            } else {
                query.to_string()
            };
            let url = if qs.is_empty() {
                format!("{}{}", self.active_host(), path)
            } else {
                format!("{}{}?{}", self.active_host(), path, qs)
            };

            let req = self
                .http
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &self.api_key);

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let used_weight = resp
                        .headers()
                        .get("X-MBX-USED-WEIGHT-1M")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u32>().ok());
                    self.weight_gate.update_from_header(used_weight);

                    if status == StatusCode::TOO_MANY_REQUESTS
                        || status.as_u16() == 418
                    {
                        let retry_after = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                        warn!(retry_after, "rate limited, sleeping before retry");
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }

                    let body: serde_json::Value = resp
                        .json()
                        .await
                        .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

                    if status.is_client_error() {
                        warn!(%status, %body, "client error, advancing endpoint");
                        self.failover().await;
                        if attempt == 0 {
                            attempt += 1;
                            continue;
                        }
                        return Err(ExchangeError::ClientError {
                            status: status.as_u16(),
                            body: body.to_string(),
                        });
                    }

                    if !status.is_success() {
                        return Err(ExchangeError::ClientError {
                            status: status.as_u16(),
                            body: body.to_string(),
                        });
                    }

                    return Ok(body);
                }
                Err(e) => {
                    if attempt >= TRANSIENT_RETRIES {
                        self.failover().await;
                        return Err(ExchangeError::Network(e));
                    }
                    let delay = std::cmp::min(
                        TRANSIENT_BASE_DELAY * 2u32.pow(attempt),
                        TRANSIENT_MAX_DELAY,
                    );
                    warn!(attempt, error = %e, delay_secs = delay.as_secs(), "transient network error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Public REST operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn exchange_info(&self) -> Result<Vec<Symbol>, ExchangeError> {
        let body = self
            .dispatch(reqwest::Method::GET, "/api/v3/exchangeInfo", "", 20, false)
            .await?;
        parse_exchange_info(&body)
    }

    #[instrument(skip(self))]
    pub async fn account_info(&self) -> Result<serde_json::Value, ExchangeError> {
        self.dispatch(reqwest::Method::GET, "/api/v3/account", "", 20, true)
            .await
    }

    pub async fn balances(&self) -> Result<Vec<crate::types::BalanceInfo>, ExchangeError> {
        let account = self.account_info().await?;
        let raw = account["balances"]
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("account response missing balances".into()))?;

        let mut out = Vec::with_capacity(raw.len());
        for b in raw {
            let asset = b["asset"].as_str().unwrap_or_default();
            let free = parse_decimal(&b["free"]).unwrap_or_default();
            let locked = parse_decimal(&b["locked"]).unwrap_or_default();
            out.push(crate::types::BalanceInfo {
                asset: Asset::new(asset),
                free,
                locked,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn system_status(&self) -> Result<i64, ExchangeError> {
        let body = self
            .dispatch(reqwest::Method::GET, "/sapi/v1/system/status", "", 1, false)
            .await?;
        body["status"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Malformed("system status missing 'status'".into()))
    }

    #[instrument(skip(self))]
    pub async fn trade_fees(&self) -> Result<serde_json::Value, ExchangeError> {
        self.dispatch(reqwest::Method::GET, "/sapi/v1/asset/tradeFee", "", 10, true)
            .await
    }

    /// Mint a `listenKey` for the user-data stream. Not itself enumerated in
    /// the public-operations list, but required to open the authenticated
    /// stream those operations' §4.1 contract describes.
    #[instrument(skip(self))]
    pub async fn user_data_stream_key(&self) -> Result<String, ExchangeError> {
        let body = self
            .dispatch(reqwest::Method::POST, "/api/v3/userDataStream", "", 1, false)
            .await?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Malformed("userDataStream response missing listenKey".into()))
    }

    #[instrument(skip(self))]
    pub async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let query = format!("symbol={symbol}");
        let body = self
            .dispatch(reqwest::Method::GET, "/api/v3/ticker/price", &query, 1, false)
            .await?;
        parse_decimal(&body["price"])
            .ok_or_else(|| ExchangeError::Malformed("ticker price missing 'price'".into()))
    }

    #[instrument(skip(self))]
    pub async fn my_trades(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let limit = if limit == 0 { 1000 } else { limit };
        let query = format!("symbol={symbol}&limit={limit}");
        let body = self
            .dispatch(reqwest::Method::GET, "/api/v3/myTrades", &query, 10, true)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let query = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self
            .dispatch(reqwest::Method::GET, "/api/v3/openOrders", &query, 2, true)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        self.dispatch(reqwest::Method::DELETE, "/api/v3/order", &query, 1, true)
            .await
    }

    #[instrument(skip(self))]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: crate::types::Side,
        quantity: Decimal,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}"
        );
        self.dispatch(reqwest::Method::POST, "/api/v3/order", &query, 1, true)
            .await
    }

    #[instrument(skip(self))]
    pub async fn test_place_order(
        &self,
        symbol: &str,
        side: crate::types::Side,
        quantity: Decimal,
    ) -> Result<(), ExchangeError> {
        let query = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}"
        );
        self.dispatch(reqwest::Method::POST, "/api/v3/order/test", &query, 1, true)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        self.dispatch(reqwest::Method::GET, "/api/v3/order", &query, 2, true)
            .await
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = value.as_str() {
        s.parse().ok()
    } else if let Some(n) = value.as_f64() {
        Decimal::try_from(n).ok()
    } else {
        None
    }
}

/// Parse the raw `exchangeInfo` payload into `Symbol`s carrying exact-decimal
/// LOT_SIZE / MIN_NOTIONAL filters, falling back to a 10-quote-unit minimum
/// notional when the exchange does not publish one for a symbol.
fn parse_exchange_info(body: &serde_json::Value) -> Result<Vec<Symbol>, ExchangeError> {
    let raw = body["symbols"]
        .as_array()
        .ok_or_else(|| ExchangeError::Malformed("exchangeInfo missing 'symbols'".into()))?;

    let mut symbols = Vec::with_capacity(raw.len());
    for entry in raw {
        let name = entry["symbol"].as_str().unwrap_or_default().to_string();
        let base = entry["baseAsset"].as_str().unwrap_or_default();
        let quote = entry["quoteAsset"].as_str().unwrap_or_default();
        let status = entry["status"].as_str().unwrap_or("BREAK").to_string();
        if name.is_empty() || base.is_empty() || quote.is_empty() {
            continue;
        }

        let mut min_qty = Decimal::ZERO;
        let mut max_qty = Decimal::MAX;
        let mut step_size = Decimal::new(1, 8);
        let mut min_notional = Decimal::new(10, 0);

        if let Some(filters) = entry["filters"].as_array() {
            for filter in filters {
                match filter["filterType"].as_str() {
                    Some("LOT_SIZE") => {
                        min_qty = parse_decimal(&filter["minQty"]).unwrap_or(min_qty);
                        max_qty = parse_decimal(&filter["maxQty"]).unwrap_or(max_qty);
                        step_size = parse_decimal(&filter["stepSize"]).unwrap_or(step_size);
                    }
                    Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                        if let Some(n) = parse_decimal(&filter["minNotional"]) {
                            min_notional = n;
                        }
                    }
                    _ => {}
                }
            }
        }

        symbols.push(Symbol {
            name,
            base: Asset::new(base),
            quote: Asset::new(quote),
            status,
            filters: SymbolFilters {
                min_qty,
                max_qty,
                step_size,
                min_notional,
            },
        });
    }

    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exchange_info_extracts_lot_size_and_notional() {
        let body = serde_json::json!({
            "symbols": [
                {
                    "symbol": "BTCUSDT",
                    "baseAsset": "BTC",
                    "quoteAsset": "USDT",
                    "status": "TRADING",
                    "filters": [
                        { "filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "100", "stepSize": "0.0001" },
                        { "filterType": "MIN_NOTIONAL", "minNotional": "10.0" }
                    ]
                }
            ]
        });
        let symbols = parse_exchange_info(&body).unwrap();
        assert_eq!(symbols.len(), 1);
        let sym = &symbols[0];
        assert_eq!(sym.name, "BTCUSDT");
        assert_eq!(sym.filters.min_qty, Decimal::new(1, 3));
        assert_eq!(sym.filters.step_size, Decimal::new(1, 4));
        assert_eq!(sym.filters.min_notional, Decimal::new(10, 0));
    }

    #[test]
    fn parse_exchange_info_falls_back_to_default_min_notional() {
        let body = serde_json::json!({
            "symbols": [
                {
                    "symbol": "ETHBTC",
                    "baseAsset": "ETH",
                    "quoteAsset": "BTC",
                    "status": "TRADING",
                    "filters": []
                }
            ]
        });
        let symbols = parse_exchange_info(&body).unwrap();
        assert_eq!(symbols[0].filters.min_notional, Decimal::new(10, 0));
    }
}
