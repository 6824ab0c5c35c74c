use crate::{
    de::de_rfc3339_as_epoch_ms,
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_each},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`Bitmex`](ExchangeId::Bitmex) server base url.
///
/// See docs: <https://www.bitmex.com/app/wsAPI>
pub const BASE_URL_BITMEX: &str = "wss://www.bitmex.com/realtime";

/// BitMEX XBTUSD perpetual trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Bitmex,
        BASE_URL_BITMEX,
        vec![json!({ "op": "subscribe", "args": ["trade:XBTUSD"] })],
        None,
        parse,
    )
}

/// One fill of a BitMEX trade table message. Only `insert` actions carry new fills.
///
/// ### Raw Payload Examples
/// See docs: <https://www.bitmex.com/app/wsAPI#Subscriptions>
/// ```json
/// {
///     "table": "trade",
///     "action": "insert",
///     "data": [
///         {
///             "timestamp": "2023-02-18T09:27:59.701Z",
///             "symbol": "XBTUSD",
///             "side": "Sell",
///             "size": 200,
///             "price": 24564.5,
///             "tickDirection": "MinusTick",
///             "trdMatchID": "31e50cb7-e005-a44e-f354-86e88dff52eb",
///             "grossValue": 814184,
///             "homeNotional": 0.00814184,
///             "foreignNotional": 200,
///             "trdType": "Regular"
///         }
///     ]
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BitmexTrade {
    #[serde(deserialize_with = "de_rfc3339_as_epoch_ms")]
    pub timestamp: i64,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    #[serde(default)]
    pub foreign_notional: Option<f64>,
}

impl BitmexTrade {
    /// Quote notional, falling back to `price * size` when `foreignNotional` is absent.
    pub fn notional(&self) -> f64 {
        self.foreign_notional
            .unwrap_or(self.price * self.size)
    }
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    let is_insert = raw.get("table").and_then(Value::as_str) == Some("trade")
        && raw.get("action").and_then(Value::as_str) == Some("insert");
    if !is_insert {
        return vec![];
    }

    deserialise_each::<BitmexTrade>(exchange, raw.get("data"))
        .into_iter()
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.notional(),
                trade.side,
                trade.timestamp,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        struct TestCase {
            input: Value,
            expected: Vec<CanonicalTrade>,
        }

        let tests = vec![
            TestCase {
                // TC0: batched fills, one without foreignNotional
                input: json!({
                    "table": "trade",
                    "action": "insert",
                    "data": [
                        {
                            "timestamp": "2023-11-14T22:13:20.000Z",
                            "symbol": "XBTUSD",
                            "side": "Sell",
                            "size": 200,
                            "price": 24564.5,
                            "foreignNotional": 200
                        },
                        {
                            "timestamp": "2023-11-14T22:13:20.500Z",
                            "symbol": "XBTUSD",
                            "side": "Buy",
                            "size": 2,
                            "price": 25000.0
                        }
                    ]
                }),
                expected: vec![
                    CanonicalTrade::new(
                        ExchangeId::Bitmex,
                        24564.5,
                        200.0,
                        Side::Sell,
                        1_700_000_000_000,
                    ),
                    CanonicalTrade::new(
                        ExchangeId::Bitmex,
                        25000.0,
                        50000.0,
                        Side::Buy,
                        1_700_000_000_500,
                    ),
                ],
            },
            TestCase {
                // TC1: initial partial snapshot is not a new fill
                input: json!({
                    "table": "trade",
                    "action": "partial",
                    "data": [{
                        "timestamp": "2023-11-14T22:13:20.000Z",
                        "side": "Buy", "size": 1, "price": 1.0, "foreignNotional": 1
                    }]
                }),
                expected: vec![],
            },
            TestCase {
                // TC2: subscribe acknowledgement
                input: json!({ "success": true, "subscribe": "trade:XBTUSD" }),
                expected: vec![],
            },
            TestCase {
                // TC3: fill with an unparseable timestamp is dropped alone
                input: json!({
                    "table": "trade",
                    "action": "insert",
                    "data": [
                        { "timestamp": "yesterday", "side": "Buy", "size": 5, "price": 2.0 },
                        {
                            "timestamp": "2023-11-14T22:13:20.000Z",
                            "side": "Sell", "size": 100, "price": 35000.0, "foreignNotional": 100
                        }
                    ]
                }),
                expected: vec![CanonicalTrade::new(
                    ExchangeId::Bitmex,
                    35000.0,
                    100.0,
                    Side::Sell,
                    1_700_000_000_000,
                )],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = adapter().unwrap().parse(&test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
