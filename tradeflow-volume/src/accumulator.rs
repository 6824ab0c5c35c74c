use serde::{Deserialize, Serialize};
use tradeflow_data::trade::{CanonicalTrade, Side};

/// Per-exchange buy/sell USD volume for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct VolumeAccumulator {
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Price of the most recent trade, carried over between windows.
    pub last_price: f64,
    pub window_start: i64,
    pub trade_count: u64,
}

impl VolumeAccumulator {
    pub fn new(window_start: i64) -> Self {
        Self {
            window_start,
            ..Self::default()
        }
    }

    pub fn record(&mut self, trade: &CanonicalTrade) {
        match trade.side {
            Side::Buy => self.buy_volume += trade.volume_usd,
            Side::Sell => self.sell_volume += trade.volume_usd,
        }
        self.last_price = trade.price;
        self.trade_count += 1;
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    /// Start a new window, keeping `last_price` as the carry-over seed.
    pub fn reset(&mut self, window_start: i64) {
        *self = Self {
            last_price: self.last_price,
            ..Self::new(window_start)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeflow_data::exchange::ExchangeId;

    fn trade(price: f64, volume_usd: f64, side: Side) -> CanonicalTrade {
        CanonicalTrade::new(ExchangeId::Okx, price, volume_usd, side, 1_700_000_000_000)
    }

    #[test]
    fn test_record_sums_per_side() {
        let mut accumulator = VolumeAccumulator::new(1_700_000_000_000);
        let trades = [
            trade(100.0, 250.0, Side::Buy),
            trade(101.0, 50.0, Side::Sell),
            trade(102.0, 125.5, Side::Buy),
            trade(99.5, 10.0, Side::Sell),
        ];

        for trade in &trades {
            accumulator.record(trade);
        }

        let expected_buy: f64 = trades
            .iter()
            .filter(|trade| trade.side == Side::Buy)
            .map(|trade| trade.volume_usd)
            .sum();
        let expected_sell: f64 = trades
            .iter()
            .filter(|trade| trade.side == Side::Sell)
            .map(|trade| trade.volume_usd)
            .sum();

        assert_eq!(accumulator.buy_volume, expected_buy);
        assert_eq!(accumulator.sell_volume, expected_sell);
        assert_eq!(accumulator.total_volume(), expected_buy + expected_sell);
        assert_eq!(accumulator.last_price, 99.5);
        assert_eq!(accumulator.trade_count, 4);
    }

    #[test]
    fn test_reset_keeps_last_price() {
        let mut accumulator = VolumeAccumulator::new(0);
        accumulator.record(&trade(37000.0, 1000.0, Side::Buy));

        accumulator.reset(30_000);

        assert_eq!(
            accumulator,
            VolumeAccumulator {
                buy_volume: 0.0,
                sell_volume: 0.0,
                last_price: 37000.0,
                window_start: 30_000,
                trade_count: 0,
            }
        );
    }
}
