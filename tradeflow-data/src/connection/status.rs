use super::{ConnectionEvent, ConnectionState};
use crate::exchange::ExchangeId;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Default time the startup gate waits for every connection to settle.
pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Shared, ordered view of every managed exchange's [`ConnectionState`].
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<RwLock<IndexMap<ExchangeId, ConnectionState>>>);

impl StatusBoard {
    /// Construct a board with every exchange [`ConnectionState::Connecting`].
    pub fn new<Exchanges>(exchanges: Exchanges) -> Self
    where
        Exchanges: IntoIterator<Item = ExchangeId>,
    {
        let states = exchanges
            .into_iter()
            .map(|exchange| (exchange, ConnectionState::Connecting))
            .collect();
        Self(Arc::new(RwLock::new(states)))
    }

    pub fn get(&self, exchange: ExchangeId) -> Option<ConnectionState> {
        self.0.read().get(&exchange).copied()
    }

    pub fn is_connected(&self, exchange: ExchangeId) -> bool {
        self.get(exchange) == Some(ConnectionState::Connected)
    }

    pub fn snapshot(&self) -> IndexMap<ExchangeId, ConnectionState> {
        self.0.read().clone()
    }

    /// Exchanges currently [`ConnectionState::Connected`], in board order.
    pub fn connected(&self) -> Vec<ExchangeId> {
        self.with_state(ConnectionState::Connected)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    fn with_state(&self, state: ConnectionState) -> Vec<ExchangeId> {
        self.0
            .read()
            .iter()
            .filter(|(_, current)| **current == state)
            .map(|(exchange, _)| *exchange)
            .collect()
    }

    fn all_resolved(&self) -> bool {
        self.0.read().values().all(ConnectionState::is_resolved)
    }

    /// Unknown exchanges are ignored.
    fn set(&self, exchange: ExchangeId, state: ConnectionState) {
        if let Some(current) = self.0.write().get_mut(&exchange) {
            *current = state;
        }
    }
}

/// Summary computed once when the startup gate fires.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct GateSummary {
    pub connected: Vec<ExchangeId>,
    pub failed: Vec<ExchangeId>,
    /// Exchanges still neither connected nor failed, only possible when the gate timed out.
    pub pending: Vec<ExchangeId>,
    pub timed_out: bool,
}

impl GateSummary {
    pub fn total(&self) -> usize {
        self.connected.len() + self.failed.len() + self.pending.len()
    }
}

/// Observes [`ConnectionEvent`]s from every managed connection, maintains the [`StatusBoard`]
/// and fires the startup gate exactly once.
///
/// The gate fires when every exchange is [`ConnectionState::Connected`] or
/// [`ConnectionState::Error`], or when [`expire`](Self::expire) is called on timeout, whichever
/// happens first. Later events keep updating the board but never fire it again.
#[derive(Debug)]
pub struct ConnectionStatusTracker {
    board: StatusBoard,
    checked: AtomicBool,
}

impl ConnectionStatusTracker {
    pub fn new<Exchanges>(exchanges: Exchanges) -> Self
    where
        Exchanges: IntoIterator<Item = ExchangeId>,
    {
        let board = StatusBoard::new(exchanges);
        for exchange in board.snapshot().keys() {
            info!(%exchange, "connecting...");
        }

        Self {
            board,
            checked: AtomicBool::new(false),
        }
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Determine if the startup gate has fired.
    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Apply a [`ConnectionEvent`], returning the [`GateSummary`] if this event fired the gate.
    pub fn apply(&self, event: &ConnectionEvent) -> Option<GateSummary> {
        self.board.set(event.exchange(), event.state());

        if self.board.all_resolved() {
            self.fire(false)
        } else {
            None
        }
    }

    /// Force the gate on timeout, returning the [`GateSummary`] if it had not already fired.
    pub fn expire(&self) -> Option<GateSummary> {
        self.fire(true)
    }

    fn fire(&self, timed_out: bool) -> Option<GateSummary> {
        // First writer wins
        self.checked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let summary = GateSummary {
            connected: self.board.with_state(ConnectionState::Connected),
            failed: self.board.with_state(ConnectionState::Error),
            pending: self
                .board
                .snapshot()
                .into_iter()
                .filter(|(_, state)| !state.is_resolved())
                .map(|(exchange, _)| exchange)
                .collect(),
            timed_out,
        };

        log_summary(&summary);
        Some(summary)
    }

    /// Consume [`ConnectionEvent`]s until every sender is dropped, delivering the
    /// [`GateSummary`] once through `gate_tx`.
    pub async fn run(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        gate_timeout: Duration,
        gate_tx: oneshot::Sender<GateSummary>,
    ) {
        let mut gate_tx = Some(gate_tx);
        let deadline = tokio::time::sleep(gate_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => {
                        if let Some(summary) = self.apply(&event) {
                            deliver(&mut gate_tx, summary);
                        }
                    }
                    None => break,
                },

                _ = &mut deadline, if gate_tx.is_some() => {
                    if let Some(summary) = self.expire() {
                        deliver(&mut gate_tx, summary);
                    }
                    gate_tx = None;
                }
            }
        }

        // Every connection task has ended before the gate fired
        if gate_tx.is_some() {
            deadline.await;
            if let Some(summary) = self.expire() {
                deliver(&mut gate_tx, summary);
            }
        }
    }
}

fn deliver(gate_tx: &mut Option<oneshot::Sender<GateSummary>>, summary: GateSummary) {
    if let Some(tx) = gate_tx.take() {
        if tx.send(summary).is_err() {
            warn!("startup gate receiver dropped before gate fired");
        }
    }
}

fn log_summary(summary: &GateSummary) {
    for exchange in &summary.connected {
        info!(%exchange, "connected");
    }
    for exchange in &summary.failed {
        warn!(%exchange, "not connected");
    }
    for exchange in &summary.pending {
        warn!(%exchange, "still connecting at gate timeout");
    }

    info!(
        connected = summary.connected.len(),
        total = summary.total(),
        timed_out = summary.timed_out,
        "connection summary"
    );

    if summary.connected.is_empty() {
        error!("no exchanges connected, volume aggregation will not start");
    } else if !summary.failed.is_empty() {
        warn!(
            failed = summary.failed.len(),
            "continuing with the connected exchanges only"
        );
    }
}
