use crate::{baseline::Baseline, signal::Direction};
use derive_more::Constructor;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tradeflow_data::{connection::ConnectionState, exchange::ExchangeId};

/// `{time, buy, sell}` record stored in the per-exchange and global history rings.
#[derive(Debug, Clone, Copy, PartialEq, Constructor, Deserialize, Serialize)]
pub struct VolumePoint {
    /// Window end, epoch milliseconds.
    pub time: i64,
    pub buy: f64,
    pub sell: f64,
}

/// One exchange's contribution to a completed window.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ExchangeWindow {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub last_price: f64,
    pub trade_count: u64,
    /// Whether the exchange was connected at rollover, and so included in the totals.
    pub connected: bool,
}

/// Sum over the exchanges connected at rollover.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct WindowTotals {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub total_volume: f64,
    /// Last non-zero price among included exchanges, in aggregation order.
    pub last_price: f64,
    pub connected_count: usize,
}

/// Immutable record of a completed window.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WindowSnapshot {
    pub window_start: i64,
    pub window_end: i64,
    pub exchanges: IndexMap<ExchangeId, ExchangeWindow>,
    pub totals: WindowTotals,
    pub direction: Direction,
}

impl WindowSnapshot {
    pub fn point(&self) -> VolumePoint {
        VolumePoint::new(self.window_end, self.totals.buy_volume, self.totals.sell_volume)
    }
}

/// Lifecycle state of the
/// [`VolumeAggregator`](crate::aggregator::VolumeAggregator).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorState {
    Idle,
    Running,
    Stopped,
}

/// Point-in-time view of the aggregator for external consumers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregatorStatus {
    pub state: AggregatorState,
    pub interval_ms: i64,
    pub exchanges: Vec<ExchangeId>,
    pub window_start: Option<i64>,
    pub next_boundary: Option<i64>,
    pub baseline: Baseline,
    pub global_history: Vec<VolumePoint>,
    pub exchange_history: IndexMap<ExchangeId, Vec<VolumePoint>>,
    pub interval_history: Vec<WindowSnapshot>,
}

/// Whole-system view combining connection status and the aggregator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemStatus {
    pub exchanges: usize,
    pub connections: IndexMap<ExchangeId, ConnectionState>,
    pub all_connections_checked: bool,
    pub aggregator: Option<AggregatorStatus>,
}
