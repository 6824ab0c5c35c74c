//! Read timeout wrapper for exchange sockets.
//!
//! Some venues stop sending frames without ever closing the socket. Wrapping the read half in
//! a [`TimeoutStream`] turns that silence into an ordinary end of stream, which the
//! [`ConnectionManager`](crate::connection::ConnectionManager) treats as a close.

use crate::exchange::ExchangeId;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::warn;

/// Default read timeout for exchange sockets (2 minutes).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper that terminates once no item has been received for the configured timeout.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    exchange: ExchangeId,
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> TimeoutStream<S> {
    pub fn new(exchange: ExchangeId, inner: S, timeout: Duration) -> Self {
        Self {
            exchange,
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let timeout = self.timeout;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    warn!(
                        exchange = %self.exchange,
                        timeout_secs = timeout.as_secs(),
                        "socket read timeout, no frame received"
                    );

                    // Avoid an immediate second timeout if polled again
                    self.deadline.as_mut().reset(Instant::now() + timeout);
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
