#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    rust_2018_idioms,
    missing_debug_implementations
)]

//! # Tradeflow-Data
//! Normalised real-time trade ingestion from many cryptocurrency exchanges.
//!
//! **It is:**
//! * **Normalised**: every venue's trade message maps to one [`CanonicalTrade`](trade::CanonicalTrade).
//! * **Declarative**: each venue is an [`ExchangeAdapter`](exchange::ExchangeAdapter) value - endpoint,
//!   subscriptions, parser and optional keepalive - rather than a type hierarchy.
//! * **Resilient**: the [`ConnectionManager`](connection::ConnectionManager) retries failed
//!   connection attempts with linear backoff and reconnects established connections forever.
//! * **Gated**: the [`ConnectionStatusTracker`](connection::status::ConnectionStatusTracker) releases
//!   downstream consumers once every connection has settled, or a timeout elapses.

/// All [`Error`](std::error::Error)s generated in Tradeflow-Data.
pub mod error;

/// Serde deserialisation helpers shared by the exchange message models.
pub mod de;

/// Canonical trade model produced by every [`ExchangeAdapter`](exchange::ExchangeAdapter).
pub mod trade;

/// [`ExchangeAdapter`](exchange::ExchangeAdapter) values and the per-venue wire formats they parse.
pub mod exchange;

/// Socket lifecycle management, connection events and the startup readiness gate.
pub mod connection;

/// Stream wrappers applied to established sockets.
pub mod streams;
