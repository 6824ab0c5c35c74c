use crate::{signal::Direction, snapshot::VolumePoint};
use chrono::DateTime;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Number of windows rendered in a [`VolumeReport`], oldest `-5` through `current`.
pub const REPORT_COLUMNS: usize = 6;

const LABEL_WIDTH: usize = 8;
const CELL_WIDTH: usize = 16;

/// One completed global window as rendered.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ReportColumn {
    pub time: i64,
    pub buy: f64,
    pub sell: f64,
    pub direction: Direction,
}

/// Table of the last [`REPORT_COLUMNS`] global windows, regenerated on every rollover.
///
/// Columns are ordered oldest first. Leading columns are `None` until enough windows exist.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VolumeReport {
    pub interval_ms: i64,
    pub columns: [Option<ReportColumn>; REPORT_COLUMNS],
}

impl VolumeReport {
    /// Build a report from global history points (oldest first), classifying each window
    /// against `baseline_buy_ratio`. Only the most recent [`REPORT_COLUMNS`] points are used.
    pub fn new<'a, Points>(interval_ms: i64, points: Points, baseline_buy_ratio: Option<f64>) -> Self
    where
        Points: IntoIterator<Item = &'a VolumePoint>,
        Points::IntoIter: ExactSizeIterator,
    {
        let points = points.into_iter();
        let skip = points.len().saturating_sub(REPORT_COLUMNS);
        let offset = REPORT_COLUMNS - (points.len() - skip);

        let mut columns = [None; REPORT_COLUMNS];
        for (slot, point) in columns[offset..].iter_mut().zip(points.skip(skip)) {
            *slot = Some(ReportColumn {
                time: point.time,
                buy: point.buy,
                sell: point.sell,
                direction: Direction::classify(point.buy, point.sell, baseline_buy_ratio),
            });
        }

        Self {
            interval_ms,
            columns,
        }
    }

    /// Most recent window.
    pub fn current(&self) -> Option<&ReportColumn> {
        self.columns[REPORT_COLUMNS - 1].as_ref()
    }

    fn row<F>(&self, label: &str, cell: F) -> String
    where
        F: Fn(&ReportColumn) -> String,
    {
        let cells = self
            .columns
            .iter()
            .map(|column| {
                let value = column.as_ref().map(&cell).unwrap_or_default();
                format!("{value:>CELL_WIDTH$}")
            })
            .join(" |");

        format!("{label:<LABEL_WIDTH$}|{cells}")
    }
}

impl Display for VolumeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let header = (1..REPORT_COLUMNS)
            .rev()
            .map(|back| format!("-{back}"))
            .chain(std::iter::once("current".to_string()))
            .map(|title| format!("{title:>CELL_WIDTH$}"))
            .join(" |");

        writeln!(f, "Volume ({}s bars, UTC)", self.interval_ms / 1000)?;
        writeln!(f, "{:<LABEL_WIDTH$}|{header}", "")?;
        writeln!(f, "{}", self.row("", |column| column.direction.indicator().to_string()))?;
        writeln!(f, "{}", self.row("time", |column| format_time(column.time)))?;
        writeln!(f, "{}", self.row("buy $", |column| format_usd(column.buy)))?;
        write!(f, "{}", self.row("sell $", |column| format_usd(column.sell)))
    }
}

/// Format a USD amount with `.` thousands grouping, `,` decimals and two decimal places, e.g.
/// `1234567.8` -> `1.234.567,80`.
pub fn format_usd(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (integer, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(fixed.len() + integer.len() / 3 + 1);
    if value < 0.0 && fixed != "0.00" {
        grouped.push('-');
    }
    for (index, digit) in integer.chars().enumerate() {
        if index > 0 && (integer.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    grouped.push(',');
    grouped.push_str(fraction);
    grouped
}

/// UTC `HH:MM:SS` of an epoch millisecond timestamp.
pub fn format_time(time_ms: i64) -> String {
    DateTime::from_timestamp_millis(time_ms)
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
