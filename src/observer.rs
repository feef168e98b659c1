// =============================================================================
// Observer — pushed snapshot contract consumed by an external dashboard
// =============================================================================
//
// The Orchestrator calls `on_snapshot` synchronously after step 9 of every
// analysis cycle. No HTTP/WS server framework lives in this crate: a
// `tokio::sync::watch`-backed implementation lets an external process
// subscribe to snapshots without the engine depending on one.
//
// =============================================================================

use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::info;

/// Published after every analysis cycle.
#[derive(Debug, Clone, Default)]
pub struct TradingSnapshot {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub total_profit: Decimal,
    pub success_rate: f64,
    pub avg_profit: Decimal,
    pub active_tickers: usize,
    pub market_volatility: f64,
    pub market_volume: Decimal,
}

/// The mutable aggregate state a `TradingSnapshot` is derived from. Mutated
/// exclusively by the Orchestrator's post-execution step.
#[derive(Debug, Clone, Default)]
pub struct TradingStatistics {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub total_profit: Decimal,
    execution_times: std::collections::VecDeque<f64>,
}

const ROLLING_WINDOW: usize = 100;

impl TradingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&mut self, success: bool, profit: Decimal, wall_time: f64) {
        self.total_trades += 1;
        if success {
            self.successful_trades += 1;
        } else {
            self.failed_trades += 1;
        }
        self.total_profit += profit;

        self.execution_times.push_back(wall_time);
        if self.execution_times.len() > ROLLING_WINDOW {
            self.execution_times.pop_front();
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.successful_trades as f64 / self.total_trades as f64
        }
    }

    pub fn avg_profit(&self) -> Decimal {
        if self.total_trades == 0 {
            Decimal::ZERO
        } else {
            self.total_profit / Decimal::from(self.total_trades)
        }
    }

    pub fn avg_execution_time(&self) -> f64 {
        if self.execution_times.is_empty() {
            0.0
        } else {
            self.execution_times.iter().sum::<f64>() / self.execution_times.len() as f64
        }
    }

    pub fn snapshot(&self, active_tickers: usize, market_volatility: f64, market_volume: Decimal) -> TradingSnapshot {
        TradingSnapshot {
            total_trades: self.total_trades,
            successful_trades: self.successful_trades,
            failed_trades: self.failed_trades,
            total_profit: self.total_profit,
            success_rate: self.success_rate(),
            avg_profit: self.avg_profit(),
            active_tickers,
            market_volatility,
            market_volume,
        }
    }
}

/// Receives a snapshot after every analysis cycle.
pub trait Observer: Send + Sync {
    fn on_snapshot(&self, snapshot: &TradingSnapshot);
}

/// Discards every snapshot. Used when no dashboard collaborator is attached.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_snapshot(&self, _snapshot: &TradingSnapshot) {}
}

/// Logs each snapshot at `info` with structured fields.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_snapshot(&self, snapshot: &TradingSnapshot) {
        info!(
            total_trades = snapshot.total_trades,
            success_rate = snapshot.success_rate,
            total_profit = %snapshot.total_profit,
            active_tickers = snapshot.active_tickers,
            "trading snapshot"
        );
    }
}

/// Publishes each snapshot on a `watch` channel so an external process can
/// subscribe without this crate depending on any server framework.
pub struct ChannelObserver {
    sender: watch::Sender<TradingSnapshot>,
}

impl ChannelObserver {
    pub fn new() -> (Self, watch::Receiver<TradingSnapshot>) {
        let (sender, receiver) = watch::channel(TradingSnapshot::default());
        (Self { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn on_snapshot(&self, snapshot: &TradingSnapshot) {
        let _ = self.sender.send(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn statistics_accumulate_and_roll_off_execution_times() {
        let mut stats = TradingStatistics::new();
        for i in 0..150 {
            stats.record_execution(i % 3 != 0, dec!(1), 0.1);
        }
        assert_eq!(stats.total_trades, 150);
        assert!(stats.avg_execution_time() > 0.0);
        // only the most recent ROLLING_WINDOW samples are retained
        assert_eq!(stats.execution_times.len(), ROLLING_WINDOW);
    }

    #[test]
    fn success_rate_and_avg_profit_are_zero_with_no_trades() {
        let stats = TradingStatistics::new();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_profit(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn channel_observer_publishes_snapshot() {
        let (observer, mut rx) = ChannelObserver::new();
        let snapshot = TradingSnapshot {
            total_trades: 5,
            ..Default::default()
        };
        observer.on_snapshot(&snapshot);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().total_trades, 5);
    }
}
