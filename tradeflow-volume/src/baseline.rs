//! Historical average buy/sell volume used as the reference ratio for directional signals.

use async_trait::async_trait;
use derive_more::Display;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_HISTORICAL_URL: &str = "https://api.aggr.trade/historical";

/// Instruments requested from the historical service, in request order.
pub const DEFAULT_MARKETS: [&str; 16] = [
    "BINANCE_FUTURES:btcusd_perp",
    "BITFINEX:BTCUSD",
    "BITMEX:XBTUSD",
    "BYBIT:BTCUSD",
    "COINBASE:BTC-USD",
    "DERIBIT:BTC-PERPETUAL",
    "BINANCE:btcusdt",
    "BINANCE_FUTURES:btcusdt",
    "BITFINEX:BTCUST",
    "BITFINEX:BTCF0:USTF0",
    "BITMEX:XBTUSDT",
    "BYBIT:BTCUSDT",
    "COINBASE:BTC-USDT",
    "BITSTAMP:btcusd",
    "OKEX:BTC-USD-SWAP",
    "OKEX:BTC-USDT-SWAP",
];

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// All errors generated while fetching the historical baseline.
///
/// None are fatal, every one resolves to [`Baseline::unloaded`].
#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("historical request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("historical request returned status {0}")]
    Status(u16),

    #[error("historical response has unexpected shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("invalid historical route: {0}")]
    Route(#[from] url::ParseError),
}

/// Historical range ending now that the baseline averages over.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize)]
pub enum Lookback {
    #[display("1m")]
    #[serde(rename = "1m")]
    OneMinute,
    #[display("5m")]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[display("15m")]
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[display("20m")]
    #[serde(rename = "20m")]
    TwentyMinutes,
    #[display("30m")]
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[default]
    #[display("1h")]
    #[serde(rename = "1h")]
    OneHour,
}

impl Lookback {
    pub fn duration(&self) -> Duration {
        let minutes = match self {
            Lookback::OneMinute => 1,
            Lookback::FiveMinutes => 5,
            Lookback::FifteenMinutes => 15,
            Lookback::TwentyMinutes => 20,
            Lookback::ThirtyMinutes => 30,
            Lookback::OneHour => 60,
        };
        Duration::from_secs(minutes * 60)
    }

    /// `(start_ms, end_ms)` of the range ending at `now_ms`.
    pub fn range(&self, now_ms: i64) -> (i64, i64) {
        (now_ms - self.duration().as_millis() as i64, now_ms)
    }
}

impl FromStr for Lookback {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "1m" => Ok(Lookback::OneMinute),
            "5m" => Ok(Lookback::FiveMinutes),
            "15m" => Ok(Lookback::FifteenMinutes),
            "20m" => Ok(Lookback::TwentyMinutes),
            "30m" => Ok(Lookback::ThirtyMinutes),
            "1h" => Ok(Lookback::OneHour),
            other => Err(other.to_string()),
        }
    }
}

/// Arithmetic means of `vbuy` and `vsell` over the historical rows.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct BaselineAverages {
    pub avg_buy_volume: f64,
    pub avg_sell_volume: f64,
    pub sample_count: usize,
}

impl BaselineAverages {
    /// `avg_buy / (avg_buy + avg_sell)`, or `None` when both are zero.
    pub fn buy_ratio(&self) -> Option<f64> {
        let total = self.avg_buy_volume + self.avg_sell_volume;
        (total > 0.0).then(|| self.avg_buy_volume / total)
    }
}

/// Baseline handed to the aggregator. An unloaded baseline is all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct Baseline {
    pub averages: BaselineAverages,
    pub loaded: bool,
}

impl Baseline {
    pub fn loaded(averages: BaselineAverages) -> Self {
        Self {
            averages,
            loaded: true,
        }
    }

    pub fn unloaded() -> Self {
        Self::default()
    }

    /// Reference buy ratio, only available once loaded with non-zero averages.
    pub fn buy_ratio(&self) -> Option<f64> {
        if self.loaded {
            self.averages.buy_ratio()
        } else {
            None
        }
    }
}

/// Columnar result set returned by the historical service.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HistoricalResponse {
    #[serde(default)]
    pub columns: IndexMap<String, usize>,
    #[serde(default)]
    pub results: Value,
}

/// Source of historical window rows.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    async fn fetch(
        &self,
        start_ms: i64,
        end_ms: i64,
        interval_ms: i64,
    ) -> Result<HistoricalResponse, BaselineError>;
}

/// [`HistoricalSource`] backed by the aggr.trade style HTTP API.
#[derive(Debug, Clone)]
pub struct HttpHistoricalSource {
    http: reqwest::Client,
    base: String,
    markets: Vec<String>,
}

impl HttpHistoricalSource {
    pub fn new(base: &str, markets: Vec<String>) -> Result<Self, BaselineError> {
        let base = Url::parse(base)?;
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
            markets,
        })
    }

    /// `{base}/{start_ms}/{end_ms}/{interval_ms}/{markets joined by '+'}`
    pub fn route(&self, start_ms: i64, end_ms: i64, interval_ms: i64) -> Result<Url, BaselineError> {
        let route = format!(
            "{}/{}/{}/{}/{}",
            self.base,
            start_ms,
            end_ms,
            interval_ms,
            self.markets.iter().join("+")
        );
        Ok(Url::parse(&route)?)
    }
}

#[async_trait]
impl HistoricalSource for HttpHistoricalSource {
    async fn fetch(
        &self,
        start_ms: i64,
        end_ms: i64,
        interval_ms: i64,
    ) -> Result<HistoricalResponse, BaselineError> {
        let route = self.route(start_ms, end_ms, interval_ms)?;
        debug!(%route, "requesting historical volume");

        let response = self.http.get(route).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BaselineError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Fetches and reduces the historical baseline, never failing the caller.
#[derive(Clone)]
pub struct HistoricalBaselineClient {
    source: Arc<dyn HistoricalSource>,
    interval_ms: i64,
}

impl std::fmt::Debug for HistoricalBaselineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalBaselineClient")
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

impl HistoricalBaselineClient {
    pub fn new(source: Arc<dyn HistoricalSource>, interval_ms: i64) -> Self {
        Self {
            source,
            interval_ms,
        }
    }

    /// Average historical volume over `lookback` ending at `now_ms`, at the live window
    /// granularity. Any error yields [`Baseline::unloaded`].
    pub async fn fetch_averages(&self, lookback: Lookback, now_ms: i64) -> Baseline {
        let (start_ms, end_ms) = lookback.range(now_ms);

        let response = match self.source.fetch(start_ms, end_ms, self.interval_ms).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%lookback, %error, "failed to fetch historical baseline, using zero baseline");
                return Baseline::unloaded();
            }
        };

        let rows = reshape_rows(&response);
        match averages(&rows) {
            Some(averages) => {
                info!(
                    %lookback,
                    avg_buy_volume = averages.avg_buy_volume,
                    avg_sell_volume = averages.avg_sell_volume,
                    sample_count = averages.sample_count,
                    "historical baseline loaded"
                );
                Baseline::loaded(averages)
            }
            None => {
                warn!(%lookback, "historical baseline returned no rows, using zero baseline");
                Baseline::unloaded()
            }
        }
    }
}

/// Reshape every result row into an object keyed by column name.
///
/// Positional rows are keyed through `columns`, object rows pass through as is and anything
/// else becomes an empty object. A non-array `results` yields no rows.
pub fn reshape_rows(response: &HistoricalResponse) -> Vec<Map<String, Value>> {
    let names = response
        .columns
        .iter()
        .map(|(name, index)| (*index, name.as_str()))
        .collect::<FnvHashMap<_, _>>();

    let Some(results) = response.results.as_array() else {
        return Vec::new();
    };

    results
        .iter()
        .map(|row| match row {
            Value::Array(values) => values
                .iter()
                .enumerate()
                .filter_map(|(index, value)| {
                    names
                        .get(&index)
                        .map(|name| (name.to_string(), value.clone()))
                })
                .collect(),
            Value::Object(object) => object.clone(),
            _ => Map::new(),
        })
        .collect()
}

/// Means of numeric `vbuy` and `vsell` across `rows`. Non-numeric values contribute zero but
/// still count toward the denominator. `None` when there are no rows.
pub fn averages(rows: &[Map<String, Value>]) -> Option<BaselineAverages> {
    if rows.is_empty() {
        return None;
    }

    let numeric = |row: &Map<String, Value>, key: &str| {
        row.get(key).and_then(Value::as_f64).unwrap_or_default()
    };

    let (total_buy, total_sell) = rows.iter().fold((0.0, 0.0), |(buy, sell), row| {
        (buy + numeric(row, "vbuy"), sell + numeric(row, "vsell"))
    });

    let sample_count = rows.len();
    Some(BaselineAverages {
        avg_buy_volume: total_buy / sample_count as f64,
        avg_sell_volume: total_sell / sample_count as f64,
        sample_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn response(raw: Value) -> HistoricalResponse {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_lookback_from_str() {
        struct TestCase {
            input: &'static str,
            expected: Result<Lookback, String>,
        }

        let tests = vec![
            TestCase {
                input: "1m",
                expected: Ok(Lookback::OneMinute),
            },
            TestCase {
                input: " 20m ",
                expected: Ok(Lookback::TwentyMinutes),
            },
            TestCase {
                input: "1h",
                expected: Ok(Lookback::OneHour),
            },
            TestCase {
                input: "2h",
                expected: Err("2h".to_string()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.parse::<Lookback>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        assert_eq!(Lookback::default(), Lookback::OneHour);
        assert_eq!(Lookback::FifteenMinutes.to_string(), "15m");
        assert_eq!(Lookback::OneHour.range(10_000_000), (6_400_000, 10_000_000));
    }

    #[test]
    fn test_route() {
        let source = HttpHistoricalSource::new(
            "https://api.aggr.trade/historical/",
            vec!["BITMEX:XBTUSD".to_string(), "BITFINEX:BTCF0:USTF0".to_string()],
        )
        .unwrap();

        let route = source.route(1000, 61000, 30000).unwrap();

        assert_eq!(
            route.as_str(),
            "https://api.aggr.trade/historical/1000/61000/30000/BITMEX:XBTUSD+BITFINEX:BTCF0:USTF0"
        );
    }

    #[test]
    fn test_reshape_rows() {
        struct TestCase {
            input: Value,
            expected: Vec<Value>,
        }

        let tests = vec![
            TestCase {
                // TC0: positional rows keyed through the column map
                input: json!({
                    "columns": {"time": 0, "vbuy": 1, "vsell": 2},
                    "results": [[1000, 10.5, 4.5], [31000, 2.0, 8.0]]
                }),
                expected: vec![
                    json!({"time": 1000, "vbuy": 10.5, "vsell": 4.5}),
                    json!({"time": 31000, "vbuy": 2.0, "vsell": 8.0}),
                ],
            },
            TestCase {
                // TC1: object rows pass through, scalars become empty objects
                input: json!({
                    "columns": {},
                    "results": [{"vbuy": 1.0}, 42, null]
                }),
                expected: vec![json!({"vbuy": 1.0}), json!({}), json!({})],
            },
            TestCase {
                // TC2: positions without a column are dropped
                input: json!({
                    "columns": {"vbuy": 0},
                    "results": [[3.0, 7.0]]
                }),
                expected: vec![json!({"vbuy": 3.0})],
            },
            TestCase {
                // TC3: non-array results
                input: json!({"columns": {"vbuy": 0}, "results": "unavailable"}),
                expected: vec![],
            },
            TestCase {
                // TC4: missing fields
                input: json!({}),
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = reshape_rows(&response(test.input))
                .into_iter()
                .map(Value::Object)
                .collect::<Vec<_>>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_averages() {
        let rows = reshape_rows(&response(json!({
            "columns": {"vbuy": 0, "vsell": 1},
            "results": [[30.0, 10.0], [10.0, 30.0], ["20.0", null], {"other": 1}]
        })));

        let actual = averages(&rows).unwrap();

        assert_eq!(
            actual,
            BaselineAverages {
                avg_buy_volume: 10.0,
                avg_sell_volume: 10.0,
                sample_count: 4,
            }
        );
        assert_eq!(actual.buy_ratio(), Some(0.5));
        assert_eq!(averages(&[]), None);
        assert_eq!(BaselineAverages::default().buy_ratio(), None);
    }

    struct MockSource {
        response: Mutex<Option<Result<HistoricalResponse, BaselineError>>>,
        requests: Mutex<Vec<(i64, i64, i64)>>,
    }

    impl MockSource {
        fn new(response: Result<HistoricalResponse, BaselineError>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HistoricalSource for MockSource {
        async fn fetch(
            &self,
            start_ms: i64,
            end_ms: i64,
            interval_ms: i64,
        ) -> Result<HistoricalResponse, BaselineError> {
            self.requests.lock().push((start_ms, end_ms, interval_ms));
            self.response
                .lock()
                .take()
                .unwrap_or(Err(BaselineError::Status(503)))
        }
    }

    #[tokio::test]
    async fn test_fetch_averages_loaded() {
        let source = MockSource::new(Ok(response(json!({
            "columns": {"time": 0, "vbuy": 1, "vsell": 2},
            "results": [[0, 300.0, 100.0], [30000, 100.0, 300.0], [60000, 200.0, 0.0]]
        }))));
        let client = HistoricalBaselineClient::new(source.clone(), 30_000);

        let baseline = client
            .fetch_averages(Lookback::FiveMinutes, 1_700_000_300_000)
            .await;

        assert!(baseline.loaded);
        assert_eq!(baseline.averages.avg_buy_volume, 200.0);
        assert_eq!(baseline.averages.sample_count, 3);
        assert!((baseline.buy_ratio().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(
            *source.requests.lock(),
            vec![(1_700_000_000_000, 1_700_000_300_000, 30_000)]
        );
    }

    #[tokio::test]
    async fn test_fetch_averages_errors_yield_unloaded_baseline() {
        struct TestCase {
            response: Result<HistoricalResponse, BaselineError>,
        }

        let tests = vec![
            TestCase {
                // TC0: http status
                response: Err(BaselineError::Status(500)),
            },
            TestCase {
                // TC1: malformed body
                response: Err(BaselineError::Shape(
                    serde_json::from_str::<Value>("{").unwrap_err(),
                )),
            },
            TestCase {
                // TC2: empty result set
                response: Ok(response(json!({"columns": {}, "results": []}))),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let client = HistoricalBaselineClient::new(MockSource::new(test.response), 30_000);
            let baseline = client.fetch_averages(Lookback::OneHour, 3_600_000).await;
            assert_eq!(baseline, Baseline::unloaded(), "TC{} failed", index);
            assert_eq!(baseline.buy_ratio(), None, "TC{} failed", index);
        }
    }
}
