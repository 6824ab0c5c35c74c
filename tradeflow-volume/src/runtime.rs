use crate::{
    aggregator::{AggregatorConfig, VolumeAggregator},
    baseline::{
        Baseline, BaselineError, HistoricalBaselineClient, HistoricalSource,
        HttpHistoricalSource, Lookback,
    },
    config::{Config, ConfigError},
    report::VolumeReport,
    snapshot::{AggregatorStatus, SystemStatus},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use tradeflow_data::{
    connection::{
        ConnectionHandle, ConnectionManager,
        socket::SocketConnector,
        status::{ConnectionStatusTracker, GateSummary, StatusBoard},
    },
    error::DataError,
    exchange::registry_for,
    trade::CanonicalTrade,
};

/// Wall-clock source in epoch milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// Errors that prevent the runtime from starting.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("data: {0}")]
    Data(#[from] DataError),

    #[error("baseline: {0}")]
    Baseline(#[from] BaselineError),
}

/// Run the whole system until `shutdown` flips to `true`, then join every task.
///
/// Rendered [`VolumeReport`]s are sent to `reports_tx` on every window rollover.
pub async fn run(
    config: Config,
    connector: Arc<dyn SocketConnector>,
    reports_tx: mpsc::UnboundedSender<VolumeReport>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RuntimeError> {
    let source = Arc::new(HttpHistoricalSource::new(
        &config.historical_url,
        config.historical_markets.clone(),
    )?);

    Runtime::new(config, connector, source)?
        .spawn(reports_tx, shutdown)?
        .join()
        .await;

    Ok(())
}

/// Collaborators of one system run.
pub struct Runtime {
    config: Config,
    connector: Arc<dyn SocketConnector>,
    source: Arc<dyn HistoricalSource>,
    clock: Clock,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        config: Config,
        connector: Arc<dyn SocketConnector>,
        source: Arc<dyn HistoricalSource>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        Ok(Self {
            config,
            connector,
            source,
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn every connection, the status tracker, the baseline fetch and the supervisor that
    /// starts aggregation once the startup gate fires.
    pub fn spawn(
        self,
        reports_tx: mpsc::UnboundedSender<VolumeReport>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RuntimeHandle, RuntimeError> {
        let Self {
            config,
            connector,
            source,
            clock,
        } = self;

        let adapters = registry_for(&config.exchanges)?;
        let exchanges = adapters.iter().map(|adapter| adapter.exchange).collect::<Vec<_>>();
        info!(exchanges = exchanges.len(), "starting tradeflow");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (trades_tx, trades_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = oneshot::channel();
        let (baseline_tx, baseline_rx) = watch::channel(Baseline::unloaded());
        let (status_tx, status_rx) = watch::channel(None);

        let tracker = Arc::new(ConnectionStatusTracker::new(exchanges));
        let tracker_task = tokio::spawn(Arc::clone(&tracker).run(
            events_rx,
            config.gate_timeout,
            gate_tx,
        ));

        // Manager is dropped once spawned, so the event channel closes when every task ends
        let connections = ConnectionManager::new(
            connector,
            config.connection.clone(),
            events_tx,
            trades_tx,
            shutdown.clone(),
        )
        .spawn_all(adapters);

        let baseline_task = tokio::spawn(run_baseline(
            HistoricalBaselineClient::new(source, config.aggregator.interval_ms),
            config.lookback,
            config.baseline_refresh,
            baseline_tx,
            Arc::clone(&clock),
            shutdown.clone(),
        ));

        let supervisor = Supervisor {
            aggregator: config.aggregator,
            tracker: Arc::clone(&tracker),
            connections,
            tracker_task,
            baseline_task,
            channels: AggregatorChannels {
                trades_rx,
                baseline_rx,
                reports_tx,
                status_tx,
            },
            clock,
            shutdown,
        };

        Ok(RuntimeHandle {
            tracker,
            aggregator: status_rx,
            task: tokio::spawn(supervisor.run(gate_rx)),
        })
    }
}

/// Handle to a spawned [`Runtime`].
#[derive(Debug)]
pub struct RuntimeHandle {
    tracker: Arc<ConnectionStatusTracker>,
    aggregator: watch::Receiver<Option<AggregatorStatus>>,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    pub fn board(&self) -> StatusBoard {
        self.tracker.board()
    }

    /// Latest [`AggregatorStatus`], published at start, after every rollover and at stop.
    pub fn aggregator_status(&self) -> watch::Receiver<Option<AggregatorStatus>> {
        self.aggregator.clone()
    }

    pub fn status(&self) -> SystemStatus {
        let board = self.tracker.board();
        SystemStatus {
            exchanges: board.len(),
            connections: board.snapshot(),
            all_connections_checked: self.tracker.is_checked(),
            aggregator: self.aggregator.borrow().clone(),
        }
    }

    /// Wait for every task to finish after shutdown.
    pub async fn join(self) {
        if let Err(error) = self.task.await {
            error!(%error, "runtime supervisor panicked");
        }
    }
}

struct AggregatorChannels {
    trades_rx: mpsc::UnboundedReceiver<CanonicalTrade>,
    baseline_rx: watch::Receiver<Baseline>,
    reports_tx: mpsc::UnboundedSender<VolumeReport>,
    status_tx: watch::Sender<Option<AggregatorStatus>>,
}

struct Supervisor {
    aggregator: AggregatorConfig,
    tracker: Arc<ConnectionStatusTracker>,
    connections: Vec<ConnectionHandle>,
    tracker_task: JoinHandle<()>,
    baseline_task: JoinHandle<()>,
    channels: AggregatorChannels,
    clock: Clock,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self, gate_rx: oneshot::Receiver<GateSummary>) {
        let gate = tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => None,
            gate = gate_rx => gate.ok(),
        };

        match gate {
            Some(summary) if !summary.connected.is_empty() => {
                let task = AggregatorTask {
                    aggregator: VolumeAggregator::new(summary.connected, self.aggregator),
                    board: self.tracker.board(),
                    channels: self.channels,
                    clock: self.clock,
                    shutdown: self.shutdown.clone(),
                };
                task.run().await;
            }
            Some(summary) => {
                warn!(
                    failed = summary.failed.len(),
                    pending = summary.pending.len(),
                    "no exchange connected at startup, volume aggregation not started"
                );
                // Late connections must not buffer trades nobody will aggregate
                drop(self.channels.trades_rx);
                shutdown_requested(&mut self.shutdown).await;
            }
            None => {}
        }

        for connection in self.connections {
            connection.join().await;
        }

        // Only still running when shutdown beat the gate
        if !self.tracker.is_checked() {
            self.tracker_task.abort();
        }
        join_quietly("status tracker", self.tracker_task).await;
        join_quietly("baseline", self.baseline_task).await;

        info!("tradeflow shut down");
    }
}

async fn join_quietly(name: &'static str, task: JoinHandle<()>) {
    if let Err(error) = task.await {
        if error.is_panic() {
            error!(task = name, %error, "task panicked");
        }
    }
}

/// Owns the [`VolumeAggregator`] and drives it with trades, baseline updates and the
/// boundary-aligned rollover timer.
struct AggregatorTask {
    aggregator: VolumeAggregator,
    board: StatusBoard,
    channels: AggregatorChannels,
    clock: Clock,
    shutdown: watch::Receiver<bool>,
}

impl AggregatorTask {
    async fn run(mut self) {
        // Trades that arrived before the gate fired belong to no window
        let mut discarded = 0_usize;
        while self.channels.trades_rx.try_recv().is_ok() {
            discarded += 1;
        }
        debug!(discarded, "discarded trades received before aggregation started");

        let baseline = *self.channels.baseline_rx.borrow_and_update();
        self.aggregator.set_baseline(baseline);

        let mut boundary = self.aggregator.start((self.clock)());
        self.publish();

        let rollover = tokio::time::sleep(self.delay_until(boundary));
        tokio::pin!(rollover);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => break,

                Some(trade) = self.channels.trades_rx.recv() => {
                    self.aggregator.record(&trade);
                }

                Ok(()) = self.channels.baseline_rx.changed() => {
                    let baseline = *self.channels.baseline_rx.borrow_and_update();
                    self.aggregator.set_baseline(baseline);
                    self.publish();
                }

                _ = &mut rollover => {
                    self.close_window(boundary);

                    // Rearm from the wall clock, never before the boundary just closed
                    boundary = self.aggregator.schedule((self.clock)().max(boundary));
                    rollover.as_mut().reset(Instant::now() + self.delay_until(boundary));
                    self.publish();
                }
            }
        }

        self.aggregator.stop();
        self.publish();
    }

    fn close_window(&mut self, window_end: i64) {
        let board = &self.board;
        let Some(snapshot) = self
            .aggregator
            .rollover(window_end, |exchange| board.is_connected(exchange))
        else {
            return;
        };

        let report = self.aggregator.report();
        info!(
            window_end,
            buy_volume = snapshot.totals.buy_volume,
            sell_volume = snapshot.totals.sell_volume,
            last_price = snapshot.totals.last_price,
            connected = snapshot.totals.connected_count,
            direction = %snapshot.direction,
            "volume window"
        );

        if self.channels.reports_tx.send(report).is_err() {
            debug!("report receiver dropped");
        }
    }

    fn delay_until(&self, boundary: i64) -> Duration {
        let remaining = boundary - (self.clock)();
        Duration::from_millis(remaining.max(0) as u64)
    }

    fn publish(&self) {
        self.channels
            .status_tx
            .send_replace(Some(self.aggregator.status()));
    }
}

/// Fetch the baseline once, then again every `refresh` period when configured.
///
/// A failed refresh keeps the previously loaded baseline.
async fn run_baseline(
    client: HistoricalBaselineClient,
    lookback: Lookback,
    refresh: Option<Duration>,
    baseline_tx: watch::Sender<Baseline>,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let fetch = client.fetch_averages(lookback, clock());
        let baseline = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            baseline = fetch => baseline,
        };

        if baseline.loaded || !baseline_tx.borrow().loaded {
            baseline_tx.send_replace(baseline);
        } else {
            warn!(%lookback, "baseline refresh failed, keeping previous baseline");
        }

        let Some(period) = refresh else {
            return;
        };

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = tokio::time::sleep(period) => {}
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also stops the runtime
    let _ = shutdown.wait_for(|shutdown| *shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        baseline::HistoricalResponse, signal::Direction, snapshot::AggregatorState,
    };
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt, channel::mpsc as socket_channel};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use tradeflow_data::{
        connection::{
            ConnectionConfig, ConnectionState,
            socket::{WsError, WsMessage, WsSink, WsStream},
        },
        error::SocketError,
        exchange::{ExchangeId, adapter},
        trade::Side,
    };
    use url::Url;

    // Aligned to a 30s boundary
    const BASE: i64 = 1_700_000_010_000;

    struct Remote {
        sent: socket_channel::UnboundedReceiver<WsMessage>,
        inbound: socket_channel::UnboundedSender<Result<WsMessage, WsError>>,
    }

    fn session() -> (WsSink, WsStream, Remote) {
        let (sent_tx, sent) = socket_channel::unbounded();
        let (inbound, inbound_rx) = socket_channel::unbounded();

        let sink: WsSink = Box::pin(sent_tx.sink_map_err(|_| WsError::ConnectionClosed));
        let stream: WsStream = Box::pin(inbound_rx);

        (sink, stream, Remote { sent, inbound })
    }

    /// Hands out scripted sessions per endpoint, failing every other connect.
    #[derive(Default)]
    struct RoutedConnector {
        routes: Mutex<HashMap<String, VecDeque<(WsSink, WsStream)>>>,
    }

    impl RoutedConnector {
        fn route(self, exchange: ExchangeId, session: (WsSink, WsStream)) -> Self {
            let endpoint = adapter(exchange).unwrap().endpoint.to_string();
            self.routes.lock().entry(endpoint).or_default().push_back(session);
            self
        }
    }

    #[async_trait]
    impl SocketConnector for RoutedConnector {
        async fn connect(&self, url: &Url) -> Result<(WsSink, WsStream), SocketError> {
            let session = self
                .routes
                .lock()
                .get_mut(url.as_str())
                .and_then(VecDeque::pop_front);

            session.ok_or_else(|| SocketError::Connect {
                url: url.to_string(),
                error: WsError::ConnectionClosed,
            })
        }
    }

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<HistoricalResponse, BaselineError>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<HistoricalResponse, BaselineError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl HistoricalSource for ScriptedSource {
        async fn fetch(&self, _: i64, _: i64, _: i64) -> Result<HistoricalResponse, BaselineError> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(BaselineError::Status(503)))
        }
    }

    fn historical(vbuy: f64, vsell: f64) -> HistoricalResponse {
        serde_json::from_value(json!({
            "columns": {"time": 0, "vbuy": 1, "vsell": 2},
            "results": [[BASE - 30_000, vbuy, vsell]]
        }))
        .unwrap()
    }

    fn paused_clock() -> Clock {
        let origin = Instant::now();
        Arc::new(move || BASE + origin.elapsed().as_millis() as i64)
    }

    fn config(exchanges: Vec<ExchangeId>) -> Config {
        Config::default()
            .with_exchanges(exchanges)
            .with_connection(ConnectionConfig::default().with_connect_attempts(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_aggregates_connected_exchanges() {
        let (sink, stream, mut remote) = session();
        let connector = RoutedConnector::default().route(ExchangeId::Okx, (sink, stream));
        let source = ScriptedSource::new(vec![Ok(historical(10.0, 90.0))]);

        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Runtime::new(
            config(vec![ExchangeId::Okx, ExchangeId::Bitstamp]),
            Arc::new(connector),
            source,
        )
        .unwrap()
        .with_clock(paused_clock())
        .spawn(reports_tx, shutdown_rx)
        .unwrap();

        remote
            .inbound
            .unbounded_send(Ok(WsMessage::text(
                json!({
                    "arg": { "channel": "trades", "instId": "BTC-USDT-SWAP" },
                    "data": [
                        { "px": "40000", "sz": "0.5", "side": "buy", "ts": "1700000011000" },
                        { "px": "40001", "sz": "2", "side": "sell", "ts": "1700000011001" }
                    ]
                })
                .to_string(),
            )))
            .unwrap();

        let report = reports_rx.recv().await.unwrap();
        let current = report.current().unwrap();
        assert_eq!(current.time, BASE + 30_000);
        assert_eq!(current.buy, 20000.0);
        assert_eq!(current.sell, 80002.0);
        // Buy ratio 0.2 against a 0.1 baseline
        assert_eq!(current.direction, Direction::BuyDominant);
        assert!(report.columns[..5].iter().all(Option::is_none));

        let subscription = remote.sent.next().await.unwrap();
        assert!(subscription.to_text().unwrap().contains("BTC-USDT-SWAP"));

        let status = handle.status();
        assert!(status.all_connections_checked);
        assert_eq!(status.exchanges, 2);
        assert_eq!(
            status.connections[&ExchangeId::Okx],
            ConnectionState::Connected
        );
        assert_eq!(
            status.connections[&ExchangeId::Bitstamp],
            ConnectionState::Error
        );

        let aggregator = status.aggregator.unwrap();
        assert_eq!(aggregator.state, AggregatorState::Running);
        assert_eq!(aggregator.exchanges, vec![ExchangeId::Okx]);
        assert_eq!(aggregator.next_boundary, Some(BASE + 60_000));
        assert!(aggregator.baseline.loaded);
        assert_eq!(aggregator.interval_history.len(), 1);

        let aggregator_rx = handle.aggregator_status();
        shutdown_tx.send(true).unwrap();
        handle.join().await;

        let stopped = aggregator_rx.borrow().clone().unwrap();
        assert_eq!(stopped.state, AggregatorState::Stopped);
        assert_eq!(stopped.next_boundary, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_without_connected_exchanges_does_not_aggregate() {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Runtime::new(
            config(vec![ExchangeId::Deribit]),
            Arc::new(RoutedConnector::default()),
            ScriptedSource::new(vec![]),
        )
        .unwrap()
        .with_clock(paused_clock())
        .spawn(reports_tx, shutdown_rx)
        .unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;

        let status = handle.status();
        assert!(status.all_connections_checked);
        assert_eq!(
            status.connections[&ExchangeId::Deribit],
            ConnectionState::Error
        );
        assert_eq!(status.aggregator, None);

        shutdown_tx.send(true).unwrap();
        handle.join().await;
        assert!(reports_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_connected_gate_closes_trade_channel() {
        let (trades_tx, trades_rx) = mpsc::unbounded_channel();
        let (_baseline_tx, baseline_rx) = watch::channel(Baseline::unloaded());
        let (reports_tx, _reports_rx) = mpsc::unbounded_channel();
        let (status_tx, _status_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = oneshot::channel();

        let supervisor = Supervisor {
            aggregator: AggregatorConfig::default(),
            tracker: Arc::new(ConnectionStatusTracker::new([ExchangeId::Deribit])),
            connections: vec![],
            tracker_task: tokio::spawn(async {}),
            baseline_task: tokio::spawn(async {}),
            channels: AggregatorChannels {
                trades_rx,
                baseline_rx,
                reports_tx,
                status_tx,
            },
            clock: paused_clock(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run(gate_rx));

        gate_tx
            .send(GateSummary {
                connected: vec![],
                failed: vec![],
                pending: vec![ExchangeId::Deribit],
                timed_out: true,
            })
            .unwrap();

        // A connection finishing its initial attempts after the gate finds the receiver gone
        trades_tx.closed().await;
        let trade = CanonicalTrade::new(
            ExchangeId::Deribit,
            40000.0,
            1000.0,
            Side::Buy,
            BASE + 100_000,
        );
        assert!(trades_tx.send(trade).is_err());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_shutdown_before_gate() {
        let (reports_tx, _reports_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Runtime::new(
            config(vec![ExchangeId::Okx]).with_connection(ConnectionConfig::default()),
            Arc::new(RoutedConnector::default()),
            ScriptedSource::new(vec![]),
        )
        .unwrap()
        .with_clock(paused_clock())
        .spawn(reports_tx, shutdown_rx)
        .unwrap();

        shutdown_tx.send(true).unwrap();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_refresh_keeps_loaded_on_failure() {
        let source = ScriptedSource::new(vec![
            Ok(historical(30.0, 70.0)),
            Err(BaselineError::Status(502)),
            Ok(historical(60.0, 40.0)),
        ]);
        let (baseline_tx, mut baseline_rx) = watch::channel(Baseline::unloaded());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_baseline(
            HistoricalBaselineClient::new(source, 30_000),
            Lookback::FiveMinutes,
            Some(Duration::from_secs(60)),
            baseline_tx,
            paused_clock(),
            shutdown_rx,
        ));

        baseline_rx.changed().await.unwrap();
        assert_eq!(baseline_rx.borrow_and_update().averages.avg_buy_volume, 30.0);

        // Failed refresh at 60s leaves the first baseline in place
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!baseline_rx.has_changed().unwrap());
        assert_eq!(baseline_rx.borrow().averages.avg_buy_volume, 30.0);

        baseline_rx.changed().await.unwrap();
        assert_eq!(baseline_rx.borrow().averages.avg_buy_volume, 60.0);
        assert_eq!(baseline_rx.borrow().buy_ratio(), Some(0.6));
    }

    #[test]
    fn test_runtime_rejects_invalid_config() {
        let error = Runtime::new(
            Config::default().with_exchanges(vec![]),
            Arc::new(RoutedConnector::default()),
            ScriptedSource::new(vec![]),
        )
        .unwrap_err();

        assert!(matches!(error, RuntimeError::Config(ConfigError::Empty { .. })));
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        let now = system_clock()();
        assert!(now > 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        shutdown_requested(&mut shutdown_rx).await;
    }
}
