//! Strategy substrate: the evaluator trait and shared bookkeeping.
//!
//! A strategy is a named, enable/disable-able evaluator with lifecycle
//! `initialize -> evaluate* -> shutdown`. [`StrategyCore`] carries the
//! common state (enable flag, per-trade metrics) so concrete strategies
//! only implement their detection logic.

mod bregman_arb;
mod market_maker;
mod mean_reversion;
mod momentum;

pub use bregman_arb::{ArbConfig, ArbCounters, BregmanArbStrategy};
pub use market_maker::MarketMakerStrategy;
pub use mean_reversion::MeanReversionStrategy;
pub use momentum::MomentumStrategy;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::events::OrderFill;
use crate::types::{MarketGroup, OrderBook, TradeSignal};

/// Snapshot of a strategy's performance counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyMetrics {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_pnl: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
}

#[derive(Default)]
struct MetricsState {
    total_trades: u64,
    winning_trades: u64,
    losing_trades: u64,
    total_pnl: f64,
    pnl_history: Vec<f64>,
    peak_pnl: f64,
    max_drawdown: f64,
}

/// Shared per-strategy state embedded by every concrete strategy.
pub struct StrategyCore {
    name: String,
    enabled: AtomicBool,
    metrics: Mutex<MetricsState>,
}

impl StrategyCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Count one executed trade without PnL attribution.
    pub fn record_trade(&self) {
        let mut m = self.metrics.lock().expect("metrics lock poisoned");
        m.total_trades += 1;
    }

    /// Fold one realized PnL sample into the counters, the drawdown
    /// tracker and the Sharpe series.
    pub fn record_pnl(&self, pnl: f64) {
        let mut m = self.metrics.lock().expect("metrics lock poisoned");
        m.total_trades += 1;
        if pnl > 0.0 {
            m.winning_trades += 1;
        } else if pnl < 0.0 {
            m.losing_trades += 1;
        }
        m.total_pnl += pnl;
        m.pnl_history.push(pnl);

        if m.total_pnl > m.peak_pnl {
            m.peak_pnl = m.total_pnl;
        }
        let drawdown = m.peak_pnl - m.total_pnl;
        if drawdown > m.max_drawdown {
            m.max_drawdown = drawdown;
        }
    }

    pub fn metrics(&self) -> StrategyMetrics {
        let m = self.metrics.lock().expect("metrics lock poisoned");
        StrategyMetrics {
            total_trades: m.total_trades,
            winning_trades: m.winning_trades,
            losing_trades: m.losing_trades,
            total_pnl: m.total_pnl,
            sharpe_ratio: sharpe(&m.pnl_history),
            max_drawdown: m.max_drawdown,
        }
    }
}

/// Sample mean over sample standard deviation of the per-trade PnL
/// series. No annualization, no risk-free rate. Zero when undefined.
fn sharpe(series: &[f64]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let variance = series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    if std == 0.0 {
        0.0
    } else {
        mean / std
    }
}

/// A pluggable evaluator. Disabled strategies are skipped by the engine;
/// `evaluate` errors are isolated per strategy.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn core(&self) -> &StrategyCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn is_enabled(&self) -> bool {
        self.core().is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.core().set_enabled(enabled)
    }

    fn metrics(&self) -> StrategyMetrics {
        self.core().metrics()
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// React to a fresh order book for one token, returning zero or more
    /// signals.
    async fn evaluate(&self, token_id: &str, book: &OrderBook) -> Result<Vec<TradeSignal>>;

    async fn on_order_filled(&self, _fill: &OrderFill) {
        self.core().record_trade();
    }

    /// Full replacement of the discovered market groups. Most strategies
    /// ignore this.
    async fn on_market_groups(&self, _groups: &[MarketGroup]) {}

    async fn shutdown(&self) {}
}

/// Per-token bounded price series kept in memory by the simple
/// strategies. Not persisted.
pub(crate) struct PriceHistory {
    capacity: usize,
    series: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Append a price and return the current window, oldest first.
    pub fn push(&self, token_id: &str, price: f64) -> Vec<f64> {
        let mut series = self.series.lock().expect("price history lock poisoned");
        let window = series.entry(token_id.to_string()).or_default();
        window.push_back(price);
        while window.len() > self.capacity {
            window.pop_front();
        }
        window.iter().copied().collect()
    }

    pub fn clear(&self) {
        self.series.lock().expect("price history lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pnl_counters() {
        let core = StrategyCore::new("test");
        core.record_pnl(2.0);
        core.record_pnl(-1.0);
        core.record_pnl(3.0);

        let m = core.metrics();
        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert!((m.total_pnl - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_drawdown_tracks_decline_from_peak() {
        let core = StrategyCore::new("test");
        core.record_pnl(5.0); // peak 5
        core.record_pnl(-3.0); // total 2, drawdown 3
        core.record_pnl(1.0); // total 3, drawdown still 3
        core.record_pnl(4.0); // total 7, new peak
        core.record_pnl(-2.0); // total 5, drawdown 2 < 3

        let m = core.metrics();
        assert!((m.max_drawdown - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_is_mean_over_sample_std() {
        // Series 1, 2, 3: mean 2, sample std 1
        assert!((sharpe(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-9);
        // Undefined cases collapse to zero
        assert_eq!(sharpe(&[]), 0.0);
        assert_eq!(sharpe(&[1.0]), 0.0);
        assert_eq!(sharpe(&[2.0, 2.0, 2.0]), 0.0);
    }

    #[test]
    fn test_enable_disable() {
        let core = StrategyCore::new("test");
        assert!(core.is_enabled());
        core.set_enabled(false);
        assert!(!core.is_enabled());
    }

    #[test]
    fn test_price_history_bounded() {
        let history = PriceHistory::new(3);
        for i in 0..5 {
            history.push("t1", i as f64);
        }
        let window = history.push("t1", 5.0);
        assert_eq!(window, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_price_history_is_per_token() {
        let history = PriceHistory::new(5);
        history.push("t1", 0.4);
        let other = history.push("t2", 0.6);
        assert_eq!(other, vec![0.6]);
    }
}
