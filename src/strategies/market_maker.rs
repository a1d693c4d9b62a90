//! Spread-capture market making on a single token.

use anyhow::Result;
use async_trait::async_trait;

use super::{PriceHistory, Strategy, StrategyCore};
use crate::types::{OrderBook, Side, TradeSignal};

pub struct MarketMakerStrategy {
    core: StrategyCore,
    history: PriceHistory,
    min_spread: f64,
    base_size: f64,
}

impl MarketMakerStrategy {
    pub fn new() -> Self {
        Self::with_params(0.04, 10.0)
    }

    pub fn with_params(min_spread: f64, base_size: f64) -> Self {
        Self {
            core: StrategyCore::new("market-maker"),
            history: PriceHistory::new(20),
            min_spread,
            base_size,
        }
    }
}

impl Default for MarketMakerStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for MarketMakerStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn evaluate(&self, token_id: &str, book: &OrderBook) -> Result<Vec<TradeSignal>> {
        if !self.core.is_enabled() {
            return Ok(vec![]);
        }
        let (spread, mid) = match (book.spread(), book.mid_price()) {
            (Some(s), Some(m)) => (s, m),
            _ => return Ok(vec![]),
        };
        self.history.push(token_id, mid);

        if spread < self.min_spread {
            return Ok(vec![]);
        }

        // Quote inside the spread on the bid side; wider spreads carry
        // more edge and more confidence.
        let target = mid - spread / 4.0;
        if !(target > 0.0 && target < 1.0) {
            return Ok(vec![]);
        }

        let confidence = (0.5 + (spread - self.min_spread) / self.min_spread).min(1.0);
        Ok(vec![TradeSignal {
            token_id: token_id.to_string(),
            side: Side::Buy,
            confidence,
            target_price: target,
            size: self.base_size,
            reason: format!("Market making: spread {:.3} >= {:.3}", spread, self.min_spread),
        }])
    }

    async fn shutdown(&self) {
        self.history.clear();
    }
}
