// =============================================================================
// Position model — single stop_loss/take_profit pair, open/closed lifecycle
// =============================================================================
//
// No partial-take-profit ladder, no trailing-stop state: exit evaluation is a
// single current-price-vs-threshold comparison run once per analysis cycle
// against each open position's path-final-asset price.
//
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::path_engine::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// An open trade record: the path being executed, its entry size/price, a
/// single stop_loss/take_profit pair, and realized PnL once closed.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub path: Path,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub realized_pnl: Decimal,
    pub status: PositionStatus,
}

impl Position {
    pub fn open(path: Path, size: Decimal, entry_price: Decimal, stop_loss: Decimal, take_profit: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            size,
            entry_price,
            entry_time: Utc::now(),
            stop_loss,
            take_profit,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
        }
    }

    /// A position whose final-asset price has crossed either threshold.
    pub fn exit_triggered(&self, current_price: Decimal) -> bool {
        if self.status != PositionStatus::Open {
            return false;
        }
        current_price <= self.stop_loss || current_price >= self.take_profit
    }
}

/// Tracks all open and closed positions. Guarded by a short critical section,
/// matching the ticker/order-book map locking discipline.
#[derive(Default)]
pub struct PositionManager {
    positions: RwLock<HashMap<Uuid, Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, position: Position) -> Uuid {
        let id = position.id;
        self.positions.write().insert(id, position);
        id
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .count()
    }

    /// Close a position at `exit_price`, recording realized PnL as
    /// `(exit_price - entry_price) * size`. Returns the realized PnL.
    pub fn close(&self, id: Uuid, exit_price: Decimal) -> Option<Decimal> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(&id)?;
        if position.status == PositionStatus::Closed {
            return None;
        }
        let pnl = (exit_price - position.entry_price) * position.size;
        position.realized_pnl = pnl;
        position.status = PositionStatus::Closed;
        Some(pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Asset;
    use rust_decimal_macros::dec;

    fn sample_path() -> Path {
        Path(vec![Asset::new("USDT"), Asset::new("BTC"), Asset::new("USDT")])
    }

    #[test]
    fn exit_triggers_on_stop_loss() {
        let position = Position::open(sample_path(), dec!(100), dec!(40000), dec!(39000), dec!(42000));
        assert!(position.exit_triggered(dec!(38999)));
        assert!(!position.exit_triggered(dec!(40000)));
    }

    #[test]
    fn exit_triggers_on_take_profit() {
        let position = Position::open(sample_path(), dec!(100), dec!(40000), dec!(39000), dec!(42000));
        assert!(position.exit_triggered(dec!(42001)));
    }

    #[test]
    fn closing_a_position_records_pnl_and_removes_from_open_set() {
        let manager = PositionManager::new();
        let id = manager.insert(Position::open(sample_path(), dec!(10), dec!(100), dec!(90), dec!(120)));
        assert_eq!(manager.open_count(), 1);

        let pnl = manager.close(id, dec!(120)).unwrap();
        assert_eq!(pnl, dec!(200));
        assert_eq!(manager.open_count(), 0);
    }

    #[test]
    fn closing_twice_is_a_no_op() {
        let manager = PositionManager::new();
        let id = manager.insert(Position::open(sample_path(), dec!(10), dec!(100), dec!(90), dec!(120)));
        manager.close(id, dec!(110));
        assert!(manager.close(id, dec!(200)).is_none());
    }
}
