use crate::exchange::ExchangeId;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors generated while opening or writing to an exchange socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to connect to {url}: {error}")]
    Connect {
        url: String,
        #[source]
        error: tungstenite::Error,
    },

    #[error("connection attempt to {url} timed out after {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("failed to send payload: {0}")]
    Send(#[from] tungstenite::Error),

    #[error("failed to serialise payload: {0}")]
    Serialise(#[from] serde_json::Error),
}

/// All errors generated in `tradeflow-data`.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid endpoint for {exchange}: {error}")]
    Endpoint {
        exchange: ExchangeId,
        #[source]
        error: url::ParseError,
    },

    #[error("unknown exchange identifier: {0}")]
    UnknownExchange(String),
}
