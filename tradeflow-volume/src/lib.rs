#![forbid(unsafe_code)]
#![warn(unused, rust_2018_idioms, missing_debug_implementations)]

//! # Tradeflow-Volume
//! Wall-clock aligned buy/sell volume bars across many exchanges, signalled against a
//! historical baseline.
//!
//! Trades from every connected exchange are summed per window by the
//! [`VolumeAggregator`](aggregator::VolumeAggregator). Windows close on absolute UTC boundaries
//! (`:00` and `:30` by default) and each rollover renders a
//! [`VolumeReport`](report::VolumeReport) of the last six windows, coloured by
//! [`Direction`](signal::Direction).

/// Fixed capacity FIFO history used for per-exchange, global and interval histories.
pub mod ring;

/// Per-exchange buy/sell volume of the current window.
pub mod accumulator;

/// Completed window records and status views.
pub mod snapshot;

/// Buy/sell dominance of a completed window.
pub mod signal;

/// Window state machine.
pub mod aggregator;

/// Rendered table of recent windows.
pub mod report;

/// Historical average volume fetched from the historical data service.
pub mod baseline;

/// Process configuration read from `TRADEFLOW_*` environment variables.
pub mod config;

/// Wires connections, the startup gate, the baseline and the aggregator together.
pub mod runtime;

pub use aggregator::{AggregatorConfig, VolumeAggregator};
pub use config::{Config, ConfigError};
pub use report::VolumeReport;
pub use runtime::{Runtime, RuntimeError, RuntimeHandle, run};
