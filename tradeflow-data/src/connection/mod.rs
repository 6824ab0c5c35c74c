use self::socket::{SocketConnector, WsMessage, WsSink, WsStream};
use crate::{
    error::SocketError,
    exchange::{ExchangeAdapter, ExchangeId, Keepalive},
    streams::timeout::{DEFAULT_READ_TIMEOUT, TimeoutStream},
    trade::CanonicalTrade,
};
use derive_more::Display;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, Interval},
};
use tracing::{debug, error, info, warn};
use url::Url;

/// [`SocketConnector`] seam and the production `tokio-tungstenite` implementation.
pub mod socket;

/// [`ConnectionStatusTracker`](status::ConnectionStatusTracker), live status board and the
/// startup readiness gate.
pub mod status;

/// Lifecycle state of one exchange connection.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("error")]
    Error,
    #[display("disconnected")]
    Disconnected,
}

impl ConnectionState {
    /// Determine if the connection has settled for the purposes of the startup gate.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Error)
    }
}

/// Lifecycle event emitted by a managed connection.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub enum ConnectionEvent {
    Connecting(ExchangeId),
    Connected(ExchangeId),
    /// Initial connect attempt budget exhausted. The connection is abandoned for this run.
    Failed { exchange: ExchangeId, error: String },
    Disconnected(ExchangeId),
}

impl ConnectionEvent {
    pub fn exchange(&self) -> ExchangeId {
        match self {
            ConnectionEvent::Connecting(exchange)
            | ConnectionEvent::Connected(exchange)
            | ConnectionEvent::Disconnected(exchange) => *exchange,
            ConnectionEvent::Failed { exchange, .. } => *exchange,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionEvent::Connecting(_) => ConnectionState::Connecting,
            ConnectionEvent::Connected(_) => ConnectionState::Connected,
            ConnectionEvent::Failed { .. } => ConnectionState::Error,
            ConnectionEvent::Disconnected(_) => ConnectionState::Disconnected,
        }
    }
}

/// Timing and retry policy shared by every managed connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Initial connect attempt budget.
    pub connect_attempts: u32,
    /// Delay after failed initial attempt `k` is `k * backoff_base`.
    pub backoff_base: Duration,
    /// Fixed delay before reconnecting an established connection that closed.
    pub reconnect_delay: Duration,
    /// Delay between connecting and sending subscriptions.
    pub subscribe_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            backoff_base: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(5000),
            subscribe_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Spawns and owns one connection task per [`ExchangeAdapter`].
///
/// Every task forwards parsed [`CanonicalTrade`]s and [`ConnectionEvent`]s to the shared
/// channels, and stops once the shutdown signal flips to `true`.
pub struct ConnectionManager {
    connector: Arc<dyn SocketConnector>,
    config: ConnectionConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    trades_tx: mpsc::UnboundedSender<CanonicalTrade>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        config: ConnectionConfig,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        trades_tx: mpsc::UnboundedSender<CanonicalTrade>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            config,
            events_tx,
            trades_tx,
            shutdown,
        }
    }

    /// Spawn the connection task for the provided [`ExchangeAdapter`].
    pub fn spawn(&self, adapter: ExchangeAdapter) -> ConnectionHandle {
        let exchange = adapter.exchange;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            adapter,
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            events_tx: self.events_tx.clone(),
            trades_tx: self.trades_tx.clone(),
            state_tx,
            outbound_rx,
            shutdown: self.shutdown.clone(),
        };

        ConnectionHandle {
            exchange,
            state: state_rx,
            outbound_tx,
            task: tokio::spawn(task.run()),
        }
    }

    /// Spawn one connection task per [`ExchangeAdapter`], preserving order.
    pub fn spawn_all<Adapters>(&self, adapters: Adapters) -> Vec<ConnectionHandle>
    where
        Adapters: IntoIterator<Item = ExchangeAdapter>,
    {
        adapters
            .into_iter()
            .map(|adapter| self.spawn(adapter))
            .collect()
    }
}

/// Handle to a running connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    exchange: ExchangeId,
    state: watch::Receiver<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send a payload over the socket. Dropped with a warning unless currently connected.
    pub fn send(&self, payload: Value) {
        if self.state() != ConnectionState::Connected {
            warn!(exchange = %self.exchange, %payload, "dropping payload, socket not connected");
            return;
        }

        if self.outbound_tx.send(payload).is_err() {
            warn!(exchange = %self.exchange, "dropping payload, connection task has ended");
        }
    }

    /// Wait for the connection task to finish.
    pub async fn join(self) {
        if let Err(error) = self.task.await {
            error!(exchange = %self.exchange, %error, "connection task panicked");
        }
    }
}

/// How an established session ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SessionEnd {
    Closed,
    Shutdown,
}

struct ConnectionTask {
    adapter: ExchangeAdapter,
    connector: Arc<dyn SocketConnector>,
    config: ConnectionConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    trades_tx: mpsc::UnboundedSender<CanonicalTrade>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_rx: mpsc::UnboundedReceiver<Value>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let exchange = self.adapter.exchange;

        let Some(mut session) = self.connect_initial().await else {
            return;
        };

        loop {
            let (sink, stream) = session;
            if self.run_session(sink, stream).await == SessionEnd::Shutdown {
                self.transition(ConnectionEvent::Disconnected(exchange));
                info!(%exchange, "connection shut down");
                return;
            }

            self.transition(ConnectionEvent::Disconnected(exchange));
            warn!(
                %exchange,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "connection closed, reconnecting"
            );

            session = match self.reconnect().await {
                Some(session) => session,
                None => {
                    info!(%exchange, "connection shut down while reconnecting");
                    return;
                }
            };
        }
    }

    /// Attempt the first connection within the bounded attempt budget, backing off linearly.
    async fn connect_initial(&mut self) -> Option<(WsSink, WsStream)> {
        let exchange = self.adapter.exchange;
        let attempts = self.config.connect_attempts.max(1);
        self.transition(ConnectionEvent::Connecting(exchange));
        info!(%exchange, url = %self.adapter.endpoint, "connecting");

        for attempt in 1..=attempts {
            let connect = connect_once(
                &*self.connector,
                &self.adapter.endpoint,
                self.config.connect_timeout,
            );
            let result = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return None,
                result = connect => result,
            };

            let error = match result {
                Ok(session) => return Some(session),
                Err(error) => error,
            };

            if attempt == attempts {
                error!(%exchange, attempts, %error, "connection failed, giving up for this run");
                self.transition(ConnectionEvent::Failed {
                    exchange,
                    error: error.to_string(),
                });
                return None;
            }

            let delay = self.config.backoff_base * attempt;
            warn!(
                %exchange,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "connection attempt failed, retrying"
            );

            if !self.sleep_unless_shutdown(delay).await {
                return None;
            }
        }

        None
    }

    /// Reconnect an established connection with a fixed delay until it succeeds.
    async fn reconnect(&mut self) -> Option<(WsSink, WsStream)> {
        let exchange = self.adapter.exchange;

        loop {
            if !self.sleep_unless_shutdown(self.config.reconnect_delay).await {
                return None;
            }

            self.transition(ConnectionEvent::Connecting(exchange));
            let connect = connect_once(
                &*self.connector,
                &self.adapter.endpoint,
                self.config.connect_timeout,
            );
            let result = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return None,
                result = connect => result,
            };

            match result {
                Ok(session) => return Some(session),
                Err(error) => {
                    warn!(%exchange, %error, "reconnect attempt failed");
                    self.transition(ConnectionEvent::Disconnected(exchange));
                }
            }
        }
    }

    async fn run_session(&mut self, mut sink: WsSink, stream: WsStream) -> SessionEnd {
        let exchange = self.adapter.exchange;
        self.transition(ConnectionEvent::Connected(exchange));
        info!(%exchange, "connected");

        if !self.sleep_unless_shutdown(self.config.subscribe_delay).await {
            close(exchange, &mut sink).await;
            return SessionEnd::Shutdown;
        }

        for subscription in &self.adapter.subscriptions {
            if let Err(error) = send_json(&mut sink, subscription).await {
                warn!(%exchange, %error, "failed to send subscription");
                return SessionEnd::Closed;
            }
        }
        debug!(
            %exchange,
            subscriptions = self.adapter.subscriptions.len(),
            "sent subscriptions"
        );

        let mut stream = TimeoutStream::new(exchange, stream, self.config.read_timeout);
        let mut keepalive = self.adapter.keepalive.as_ref().map(KeepaliveTimer::new);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => {
                    close(exchange, &mut sink).await;
                    return SessionEnd::Shutdown;
                }

                Some(payload) = self.outbound_rx.recv() => {
                    if let Err(error) = send_json(&mut sink, &payload).await {
                        warn!(%exchange, %error, "failed to send payload");
                        return SessionEnd::Closed;
                    }
                }

                message = KeepaliveTimer::tick(keepalive.as_mut()) => {
                    if let Err(error) = send_json(&mut sink, message).await {
                        warn!(%exchange, %error, "failed to send keepalive");
                        return SessionEnd::Closed;
                    }
                    debug!(%exchange, "sent keepalive");
                }

                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.dispatch(text),
                        Err(error) => warn!(%exchange, %error, "dropping non utf-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(%exchange, ?frame, "socket closed by exchange");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%exchange, %error, "socket read failed");
                        return SessionEnd::Closed;
                    }
                    None => {
                        warn!(%exchange, "socket stream ended");
                        return SessionEnd::Closed;
                    }
                },
            }
        }
    }

    /// Parse one inbound text payload and forward every trade it contains.
    ///
    /// Failures are isolated to the message.
    fn dispatch(&self, text: &str) {
        let raw = match serde_json::from_str::<Value>(text) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(exchange = %self.adapter.exchange, %error, "failed to deserialise message");
                debug!(
                    exchange = %self.adapter.exchange,
                    payload = truncate(text, MAX_LOGGED_PAYLOAD),
                    "undecodable payload"
                );
                return;
            }
        };

        for trade in self.adapter.parse(&raw) {
            if self.trades_tx.send(trade).is_err() {
                debug!(exchange = %self.adapter.exchange, "trade receiver dropped");
                return;
            }
        }
    }

    /// Returns `false` if shutdown was requested before the delay elapsed.
    async fn sleep_unless_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        self.state_tx.send_replace(event.state());
        // Status tracker may have stopped listening during shutdown
        let _ = self.events_tx.send(event);
    }
}

struct KeepaliveTimer<'a> {
    message: &'a Value,
    interval: Interval,
}

impl<'a> KeepaliveTimer<'a> {
    fn new(keepalive: &'a Keepalive) -> Self {
        let start = Instant::now() + keepalive.interval;
        Self {
            message: &keepalive.message,
            interval: tokio::time::interval_at(start, keepalive.interval),
        }
    }

    /// Resolves with the keepalive payload each period, or never if there is no keepalive.
    async fn tick(timer: Option<&mut KeepaliveTimer<'a>>) -> &'a Value {
        match timer {
            Some(timer) => {
                timer.interval.tick().await;
                timer.message
            }
            None => std::future::pending().await,
        }
    }
}

/// Longest raw payload prefix included in debug logs.
const MAX_LOGGED_PAYLOAD: usize = 256;

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Open a socket, counting a handshake that outlives `timeout` as a failed attempt.
async fn connect_once(
    connector: &dyn SocketConnector,
    url: &Url,
    timeout: Duration,
) -> Result<(WsSink, WsStream), SocketError> {
    match tokio::time::timeout(timeout, connector.connect(url)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(SocketError::ConnectTimeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the connection
    let _ = shutdown.wait_for(|shutdown| *shutdown).await;
}

async fn send_json(sink: &mut WsSink, payload: &Value) -> Result<(), SocketError> {
    let text = serde_json::to_string(payload)?;
    sink.send(WsMessage::text(text)).await?;
    Ok(())
}

async fn close(exchange: ExchangeId, sink: &mut WsSink) {
    if let Err(error) = sink.close().await {
        debug!(%exchange, %error, "failed to close socket cleanly");
    }
}
