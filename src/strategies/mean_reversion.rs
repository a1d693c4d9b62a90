//! Mean reversion against a rolling mid-price average.

use anyhow::Result;
use async_trait::async_trait;

use super::{PriceHistory, Strategy, StrategyCore};
use crate::types::{OrderBook, Side, TradeSignal};

const WINDOW: usize = 20;
const MIN_SAMPLES: usize = 10;

pub struct MeanReversionStrategy {
    core: StrategyCore,
    history: PriceHistory,
    threshold: f64,
    base_size: f64,
}

impl MeanReversionStrategy {
    pub fn new() -> Self {
        Self::with_params(0.10, 10.0)
    }

    pub fn with_params(threshold: f64, base_size: f64) -> Self {
        Self {
            core: StrategyCore::new("mean-reversion"),
            history: PriceHistory::new(WINDOW),
            threshold,
            base_size,
        }
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for MeanReversionStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn evaluate(&self, token_id: &str, book: &OrderBook) -> Result<Vec<TradeSignal>> {
        if !self.core.is_enabled() {
            return Ok(vec![]);
        }
        let mid = match book.mid_price() {
            Some(m) => m,
            None => return Ok(vec![]),
        };
        let window = self.history.push(token_id, mid);
        if window.len() < MIN_SAMPLES {
            return Ok(vec![]);
        }

        let mean = window.iter().sum::<f64>() / window.len() as f64;
        if mean == 0.0 {
            return Ok(vec![]);
        }
        let deviation = (mid - mean) / mean;

        let signal = if deviation < -self.threshold {
            // Price depressed relative to its own history: buy the dip
            book.best_ask().map(|ask| TradeSignal {
                token_id: token_id.to_string(),
                side: Side::Buy,
                confidence: (0.5 + deviation.abs()).min(1.0),
                target_price: ask.price,
                size: self.base_size,
                reason: format!("Mean reversion: {:.3} vs mean {:.3}", mid, mean),
            })
        } else if deviation > self.threshold {
            book.best_bid().map(|bid| TradeSignal {
                token_id: token_id.to_string(),
                side: Side::Sell,
                confidence: (0.5 + deviation.abs()).min(1.0),
                target_price: bid.price,
                size: self.base_size,
                reason: format!("Mean reversion: {:.3} vs mean {:.3}", mid, mean),
            })
        } else {
            None
        };

        Ok(signal.into_iter().collect())
    }

    async fn shutdown(&self) {
        self.history.clear();
    }
}
