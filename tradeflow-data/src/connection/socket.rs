use crate::error::SocketError;
use async_trait::async_trait;
use futures::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::debug;
use url::Url;

/// Convenient type alias for a tungstenite WebSocket message.
pub type WsMessage = tungstenite::Message;

/// Convenient type alias for a tungstenite WebSocket error.
pub type WsError = tungstenite::Error;

/// Write half of an established exchange socket.
pub type WsSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Read half of an established exchange socket.
pub type WsStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

/// Opens exchange sockets for the [`ConnectionManager`](super::ConnectionManager).
///
/// Production code uses [`TungsteniteConnector`]; tests substitute an in-memory implementation.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(WsSink, WsStream), SocketError>;
}

/// [`SocketConnector`] backed by `tokio-tungstenite` over rustls.
#[derive(Copy, Clone, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<(WsSink, WsStream), SocketError> {
        debug!(%url, "opening socket");

        let (socket, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|error| SocketError::Connect {
                    url: url.to_string(),
                    error,
                })?;

        let (sink, stream) = socket.split();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
