use crate::{
    accumulator::VolumeAccumulator,
    baseline::Baseline,
    report::VolumeReport,
    ring::HistoryRing,
    signal::Direction,
    snapshot::{
        AggregatorState, AggregatorStatus, ExchangeWindow, VolumePoint, WindowSnapshot,
        WindowTotals,
    },
};
use indexmap::IndexMap;
use itertools::Itertools;
use tracing::{debug, info, warn};
use tradeflow_data::{exchange::ExchangeId, trade::CanonicalTrade};

/// Default window length, windows end at `:00` and `:30` of every minute.
pub const DEFAULT_INTERVAL_MS: i64 = 30_000;
pub const DEFAULT_EXCHANGE_HISTORY: usize = 6;
pub const DEFAULT_GLOBAL_HISTORY: usize = 6;
pub const DEFAULT_INTERVAL_HISTORY: usize = 10;

/// Next multiple of `interval_ms` strictly after `now_ms`.
pub fn next_boundary(now_ms: i64, interval_ms: i64) -> i64 {
    (now_ms.div_euclid(interval_ms) + 1) * interval_ms
}

/// Window length and history depths of a [`VolumeAggregator`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AggregatorConfig {
    pub interval_ms: i64,
    pub exchange_history: usize,
    pub global_history: usize,
    pub interval_history: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            exchange_history: DEFAULT_EXCHANGE_HISTORY,
            global_history: DEFAULT_GLOBAL_HISTORY,
            interval_history: DEFAULT_INTERVAL_HISTORY,
        }
    }
}

/// Wall-clock aligned buy/sell volume windows across a fixed set of exchanges.
///
/// The aggregator is a plain state machine owned by a single task. The caller drives it with
/// trades via [`record`](Self::record) and boundary timer expiries via
/// [`rollover`](Self::rollover), rearming the timer from [`schedule`](Self::schedule).
#[derive(Debug, Clone)]
pub struct VolumeAggregator {
    config: AggregatorConfig,
    state: AggregatorState,
    accumulators: IndexMap<ExchangeId, VolumeAccumulator>,
    exchange_history: IndexMap<ExchangeId, HistoryRing<VolumePoint>>,
    global_history: HistoryRing<VolumePoint>,
    interval_history: HistoryRing<WindowSnapshot>,
    baseline: Baseline,
    window_start: Option<i64>,
    next_boundary: Option<i64>,
}

impl VolumeAggregator {
    pub fn new<Exchanges>(exchanges: Exchanges, config: AggregatorConfig) -> Self
    where
        Exchanges: IntoIterator<Item = ExchangeId>,
    {
        let exchanges = exchanges.into_iter().unique().collect::<Vec<_>>();

        Self {
            config,
            state: AggregatorState::Idle,
            accumulators: exchanges
                .iter()
                .map(|exchange| (*exchange, VolumeAccumulator::default()))
                .collect(),
            exchange_history: exchanges
                .iter()
                .map(|exchange| (*exchange, HistoryRing::new(config.exchange_history)))
                .collect(),
            global_history: HistoryRing::new(config.global_history),
            interval_history: HistoryRing::new(config.interval_history),
            baseline: Baseline::unloaded(),
            window_start: None,
            next_boundary: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn config(&self) -> AggregatorConfig {
        self.config
    }

    pub fn exchanges(&self) -> impl Iterator<Item = ExchangeId> + '_ {
        self.accumulators.keys().copied()
    }

    pub fn accumulator(&self, exchange: ExchangeId) -> Option<&VolumeAccumulator> {
        self.accumulators.get(&exchange)
    }

    pub fn exchange_history(&self, exchange: ExchangeId) -> Option<&HistoryRing<VolumePoint>> {
        self.exchange_history.get(&exchange)
    }

    pub fn global_history(&self) -> &HistoryRing<VolumePoint> {
        &self.global_history
    }

    pub fn interval_history(&self) -> &HistoryRing<WindowSnapshot> {
        &self.interval_history
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn window_start(&self) -> Option<i64> {
        self.window_start
    }

    pub fn next_boundary(&self) -> Option<i64> {
        self.next_boundary
    }

    pub fn set_baseline(&mut self, baseline: Baseline) {
        debug!(loaded = baseline.loaded, buy_ratio = ?baseline.buy_ratio(), "aggregator baseline updated");
        self.baseline = baseline;
    }

    /// Transition to [`AggregatorState::Running`] with a first (partial) window starting at
    /// `now_ms`, returning the first boundary. Starting a running aggregator is a no-op.
    pub fn start(&mut self, now_ms: i64) -> i64 {
        if let (AggregatorState::Running, Some(boundary)) = (self.state, self.next_boundary) {
            warn!("volume aggregator already running");
            return boundary;
        }

        self.state = AggregatorState::Running;
        self.window_start = Some(now_ms);
        for accumulator in self.accumulators.values_mut() {
            accumulator.reset(now_ms);
        }

        let boundary = self.schedule(now_ms);
        info!(
            exchanges = %self.exchanges().join(","),
            interval_ms = self.config.interval_ms,
            next_boundary = boundary,
            "volume aggregator started"
        );
        boundary
    }

    /// Compute and store the next boundary strictly after `now_ms`.
    pub fn schedule(&mut self, now_ms: i64) -> i64 {
        let boundary = next_boundary(now_ms, self.config.interval_ms);
        self.next_boundary = Some(boundary);
        boundary
    }

    /// Add a trade to its exchange's accumulator. Ignored unless running, or when the exchange
    /// is not aggregated.
    pub fn record(&mut self, trade: &CanonicalTrade) -> bool {
        if self.state != AggregatorState::Running {
            return false;
        }

        match self.accumulators.get_mut(&trade.exchange) {
            Some(accumulator) => {
                accumulator.record(trade);
                true
            }
            None => false,
        }
    }

    /// Close the current window at `window_end`.
    ///
    /// Every exchange is captured and pushed to its history, but only those for which
    /// `is_connected` holds contribute to the totals. Accumulators then reset for the next
    /// window, keeping their last price.
    pub fn rollover<F>(&mut self, window_end: i64, is_connected: F) -> Option<WindowSnapshot>
    where
        F: Fn(ExchangeId) -> bool,
    {
        if self.state != AggregatorState::Running {
            return None;
        }

        let window_start = self.window_start.unwrap_or(window_end - self.config.interval_ms);
        let mut totals = WindowTotals::default();
        let mut exchanges = IndexMap::with_capacity(self.accumulators.len());

        for (exchange, accumulator) in &mut self.accumulators {
            let connected = is_connected(*exchange);
            let window = ExchangeWindow {
                buy_volume: accumulator.buy_volume,
                sell_volume: accumulator.sell_volume,
                last_price: accumulator.last_price,
                trade_count: accumulator.trade_count,
                connected,
            };

            if let Some(history) = self.exchange_history.get_mut(exchange) {
                history.push(VolumePoint::new(window_end, window.buy_volume, window.sell_volume));
            }

            if connected {
                totals.buy_volume += window.buy_volume;
                totals.sell_volume += window.sell_volume;
                totals.connected_count += 1;
                if window.last_price > 0.0 {
                    totals.last_price = window.last_price;
                }
            }

            exchanges.insert(*exchange, window);
            accumulator.reset(window_end);
        }
        totals.total_volume = totals.buy_volume + totals.sell_volume;

        let snapshot = WindowSnapshot {
            window_start,
            window_end,
            exchanges,
            totals,
            direction: Direction::classify(
                totals.buy_volume,
                totals.sell_volume,
                self.baseline.buy_ratio(),
            ),
        };

        self.global_history.push(snapshot.point());
        self.interval_history.push(snapshot.clone());
        self.window_start = Some(window_end);

        debug!(
            window_end,
            buy_volume = totals.buy_volume,
            sell_volume = totals.sell_volume,
            connected = totals.connected_count,
            direction = %snapshot.direction,
            "volume window closed"
        );

        Some(snapshot)
    }

    /// Render the last global windows against the current baseline.
    pub fn report(&self) -> VolumeReport {
        VolumeReport::new(
            self.config.interval_ms,
            self.global_history.iter(),
            self.baseline.buy_ratio(),
        )
    }

    /// Transition to [`AggregatorState::Stopped`], discarding the pending boundary.
    pub fn stop(&mut self) {
        if self.state == AggregatorState::Running {
            info!("volume aggregator stopped");
        }
        self.state = AggregatorState::Stopped;
        self.next_boundary = None;
    }

    pub fn status(&self) -> AggregatorStatus {
        AggregatorStatus {
            state: self.state,
            interval_ms: self.config.interval_ms,
            exchanges: self.exchanges().collect(),
            window_start: self.window_start,
            next_boundary: self.next_boundary,
            baseline: self.baseline,
            global_history: self.global_history.to_vec(),
            exchange_history: self
                .exchange_history
                .iter()
                .map(|(exchange, history)| (*exchange, history.to_vec()))
                .collect(),
            interval_history: self.interval_history.to_vec(),
        }
    }
}
