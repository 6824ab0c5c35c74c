use crate::{
    de::de_str,
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_or_skip},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`BinanceSpot`](ExchangeId::BinanceSpot) server base url.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams>
pub const BASE_URL_BINANCE_SPOT: &str = "wss://data-stream.binance.vision:9443/ws";

/// [`BinanceFuturesUsd`](ExchangeId::BinanceFuturesUsd) server base url.
///
/// See docs: <https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams>
pub const BASE_URL_BINANCE_FUTURES_USD: &str = "wss://fstream.binance.com/ws";

/// [`BinanceFuturesCoin`](ExchangeId::BinanceFuturesCoin) server base url.
///
/// See docs: <https://developers.binance.com/docs/derivatives/coin-margined-futures/websocket-market-streams>
pub const BASE_URL_BINANCE_FUTURES_COIN: &str = "wss://dstream.binance.com/ws";

/// USD face value of one Binance COIN-M BTC contract.
pub const COIN_M_CONTRACT_USD: f64 = 100.0;

/// Binance Spot BTC/USDT aggregated trades adapter.
pub fn spot() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::BinanceSpot,
        BASE_URL_BINANCE_SPOT,
        vec![subscription("btcusdt")],
        None,
        parse_quote_notional,
    )
}

/// Binance USDT-M perpetual BTC/USDT aggregated trades adapter.
pub fn futures_usd() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::BinanceFuturesUsd,
        BASE_URL_BINANCE_FUTURES_USD,
        vec![subscription("btcusdt")],
        None,
        parse_quote_notional,
    )
}

/// Binance COIN-M perpetual BTC/USD aggregated trades adapter.
pub fn futures_coin() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::BinanceFuturesCoin,
        BASE_URL_BINANCE_FUTURES_COIN,
        vec![subscription("btcusd_perp")],
        None,
        parse_contract_notional,
    )
}

fn subscription(market: &str) -> Value {
    json!({
        "method": "SUBSCRIBE",
        "params": [format!("{market}@aggTrade")],
        "id": 1,
    })
}

/// Binance aggregated trade message.
///
/// `m` is true when the buyer was the maker, ie/ the aggressor sold.
///
/// ### Raw Payload Examples
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#aggregate-trade-streams>
/// ```json
/// {
///     "e": "aggTrade",
///     "E": 1672515782136,
///     "s": "BTCUSDT",
///     "a": 12345,
///     "p": "16578.50",
///     "q": "0.010",
///     "f": 100,
///     "l": 105,
///     "T": 1672515782136,
///     "m": true,
///     "M": true
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BinanceAggTrade {
    #[serde(rename = "p", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "q", deserialize_with = "de_str")]
    pub quantity: f64,

    #[serde(rename = "m")]
    pub buyer_is_maker: bool,

    #[serde(rename = "T")]
    pub time: i64,
}

impl BinanceAggTrade {
    fn side(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

fn agg_trade(exchange: ExchangeId, raw: &Value) -> Option<BinanceAggTrade> {
    if raw.get("e").and_then(Value::as_str) != Some("aggTrade") {
        return None;
    }
    deserialise_or_skip(exchange, raw)
}

fn parse_quote_notional(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    agg_trade(exchange, raw)
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.price * trade.quantity,
                trade.side(),
                trade.time,
            )
        })
        .into_iter()
        .collect()
}

fn parse_contract_notional(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    agg_trade(exchange, raw)
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.quantity * COIN_M_CONTRACT_USD,
                trade.side(),
                trade.time,
            )
        })
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agg_trade() {
        struct TestCase {
            adapter: ExchangeAdapter,
            input: Value,
            expected: Vec<CanonicalTrade>,
        }

        let tests = vec![
            TestCase {
                // TC0: spot buyer is maker -> aggressor sold
                adapter: spot().unwrap(),
                input: json!({
                    "e": "aggTrade", "E": 1672515782136i64, "s": "BTCUSDT", "a": 12345,
                    "p": "100.00", "q": "2.00", "f": 100, "l": 105,
                    "T": 1672515782136i64, "m": true, "M": true
                }),
                expected: vec![CanonicalTrade::new(
                    ExchangeId::BinanceSpot,
                    100.0,
                    200.0,
                    Side::Sell,
                    1672515782136,
                )],
            },
            TestCase {
                // TC1: usdt-m buyer is taker
                adapter: futures_usd().unwrap(),
                input: json!({
                    "e": "aggTrade", "E": 1672515782136i64, "s": "BTCUSDT", "a": 9,
                    "p": "30000.5", "q": "0.5", "f": 1, "l": 1,
                    "T": 1672515782100i64, "m": false
                }),
                expected: vec![CanonicalTrade::new(
                    ExchangeId::BinanceFuturesUsd,
                    30000.5,
                    15000.25,
                    Side::Buy,
                    1672515782100,
                )],
            },
            TestCase {
                // TC2: coin-m quantity is in 100 USD contracts
                adapter: futures_coin().unwrap(),
                input: json!({
                    "e": "aggTrade", "E": 1672515782136i64, "s": "BTCUSD_PERP", "a": 9,
                    "p": "30000.0", "q": "3", "f": 1, "l": 1,
                    "T": 1672515782200i64, "m": false
                }),
                expected: vec![CanonicalTrade::new(
                    ExchangeId::BinanceFuturesCoin,
                    30000.0,
                    300.0,
                    Side::Buy,
                    1672515782200,
                )],
            },
            TestCase {
                // TC3: subscription response
                adapter: spot().unwrap(),
                input: json!({ "result": null, "id": 1 }),
                expected: vec![],
            },
            TestCase {
                // TC4: malformed price is dropped
                adapter: spot().unwrap(),
                input: json!({
                    "e": "aggTrade", "p": "not-a-number", "q": "1", "T": 1, "m": false
                }),
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.adapter.parse(&test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_subscription_payload() {
        let adapter = futures_coin().unwrap();
        assert_eq!(
            adapter.subscriptions,
            vec![json!({ "method": "SUBSCRIBE", "params": ["btcusd_perp@aggTrade"], "id": 1 })]
        );
    }
}
