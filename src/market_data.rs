// =============================================================================
// Ticker / order-book snapshots — owned exclusively by the Orchestrator (C6)
// =============================================================================
//
// The Exchange Client streams raw `TickerUpdate`/`DepthUpdate` messages; the
// Orchestrator is the sole writer of the snapshot maps derived from them.
// All other components receive immutable copies for the duration of a cycle.
//
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::exchange::streams::{DepthUpdate, TickerUpdate};

/// Per-symbol best bid, best ask, and 24h quote volume, timestamped.
#[derive(Debug, Clone)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub quote_volume: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<TickerUpdate> for TickerSnapshot {
    fn from(update: TickerUpdate) -> Self {
        Self {
            symbol: update.symbol,
            bid: update.bid,
            ask: update.ask,
            quote_volume: update.quote_volume,
            updated_at: Utc::now(),
        }
    }
}

/// Per-symbol sorted bid/ask levels. Absent from the map forces callers to
/// fall back to the ticker.
#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub updated_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }
}

impl From<DepthUpdate> for OrderBookSnapshot {
    fn from(update: DepthUpdate) -> Self {
        Self {
            symbol: update.symbol,
            bids: update.bids,
            asks: update.asks,
            updated_at: Utc::now(),
        }
    }
}

/// Guarded ticker map; readers snapshot by copy under a short critical
/// section, never holding the lock across network I/O.
#[derive(Default)]
pub struct TickerMap {
    inner: RwLock<HashMap<String, TickerSnapshot>>,
}

impl TickerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, update: TickerUpdate) {
        let snapshot = TickerSnapshot::from(update);
        self.inner.write().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, TickerSnapshot> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guarded order-book map, same locking discipline as `TickerMap`.
#[derive(Default)]
pub struct OrderBookMap {
    inner: RwLock<HashMap<String, OrderBookSnapshot>>,
}

impl OrderBookMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, update: DepthUpdate) {
        let snapshot = OrderBookSnapshot::from(update);
        self.inner.write().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, OrderBookSnapshot> {
        self.inner.read().clone()
    }

    pub fn remove(&self, symbol: &str) {
        self.inner.write().remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_map_tracks_latest_update_per_symbol() {
        let map = TickerMap::new();
        assert!(map.is_empty());
        map.update(TickerUpdate {
            symbol: "BTCUSDT".to_string(),
            bid: dec!(40000),
            ask: dec!(40001),
            quote_volume: dec!(1000),
        });
        map.update(TickerUpdate {
            symbol: "BTCUSDT".to_string(),
            bid: dec!(40010),
            ask: dec!(40011),
            quote_volume: dec!(1100),
        });
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("BTCUSDT").unwrap().bid, dec!(40010));
    }

    #[test]
    fn order_book_map_exposes_best_levels_and_removal() {
        let map = OrderBookMap::new();
        map.update(DepthUpdate {
            symbol: "ETHUSDT".to_string(),
            bids: vec![(dec!(2000), dec!(5)), (dec!(1999), dec!(3))],
            asks: vec![(dec!(2001), dec!(4))],
        });
        let book = map.get("ETHUSDT").unwrap();
        assert_eq!(book.best_bid(), Some(dec!(2000)));
        assert_eq!(book.best_ask(), Some(dec!(2001)));

        map.remove("ETHUSDT");
        assert!(map.get("ETHUSDT").is_none());
    }
}
