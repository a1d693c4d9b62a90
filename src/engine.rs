//! The orchestrator: wires components, owns the strategy set, drives
//! evaluation on every order-book update and executes qualifying signals.
//!
//! The engine is the single owning container; bus handlers hold only
//! weak references back into it so no component keeps the orchestrator
//! alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::discovery::DiscoveryService;
use crate::events::{EventBus, EventData, EventType};
use crate::market_data::MarketDataService;
use crate::orders::OrderManager;
use crate::risk::{Exposure, RiskManager};
use crate::storage::Store;
use crate::strategies::{Strategy, StrategyMetrics};
use crate::types::{OrderBook, OrderRecord, OrderRequest, Position, RiskLimits, TradeSignal};

/// Signals at or below this confidence are silently discarded.
const CONFIDENCE_GATE: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub name: String,
    pub enabled: bool,
    pub metrics: StrategyMetrics,
}

/// Snapshot served to the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub strategies: Vec<StrategyStatus>,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OrderRecord>,
    pub risk_limits: RiskLimits,
    pub exposure: Exposure,
}

struct EngineInner {
    bus: Arc<EventBus>,
    market_data: Arc<MarketDataService>,
    discovery: Option<Arc<DiscoveryService>>,
    order_manager: Arc<OrderManager>,
    risk: Arc<RiskManager>,
    store: Arc<Store>,
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
    running: AtomicBool,
}

impl EngineInner {
    fn strategy_snapshot(&self) -> Vec<Arc<dyn Strategy>> {
        self.strategies
            .read()
            .expect("strategy lock poisoned")
            .clone()
    }

    /// Evaluate every enabled strategy against a fresh book and execute
    /// the qualifying signals sequentially. A failure inside one
    /// strategy is logged against its name and does not stop the rest.
    async fn handle_orderbook_update(&self, book: &OrderBook) {
        if !self.running.load(Ordering::SeqCst) || self.risk.is_halted() {
            return;
        }

        let mut collected: Vec<(String, TradeSignal)> = Vec::new();
        for strategy in self.strategy_snapshot() {
            if !strategy.is_enabled() {
                continue;
            }
            match strategy.evaluate(&book.token_id, book).await {
                Ok(signals) => {
                    let name = strategy.name().to_string();
                    collected.extend(signals.into_iter().map(|s| (name.clone(), s)));
                }
                Err(e) => {
                    error!("[ENGINE] Strategy '{}' evaluation failed: {:#}", strategy.name(), e);
                }
            }
        }

        for (strategy_name, signal) in collected {
            if signal.confidence <= CONFIDENCE_GATE {
                continue;
            }

            self.bus
                .emit(
                    EventType::StrategySignal,
                    EventData::Signal {
                        strategy: strategy_name.clone(),
                        signal: signal.clone(),
                    },
                )
                .await;

            let request = OrderRequest::gtc(
                signal.token_id.clone(),
                signal.side,
                signal.target_price,
                signal.size,
            );
            let result = self.order_manager.submit_order(request).await;
            if !result.success {
                warn!(
                    "[ENGINE] Signal from '{}' not executed: {}",
                    strategy_name,
                    result.error.unwrap_or_default()
                );
            }
        }
    }

    /// Union new group tokens into the market-data subscription and hand
    /// the replacement list to every strategy.
    async fn handle_market_groups(&self, groups: &[crate::types::MarketGroup]) {
        let tokens: Vec<String> = groups
            .iter()
            .flat_map(|g| g.token_ids.iter().cloned())
            .collect();
        if !tokens.is_empty() {
            self.market_data.subscribe(&tokens);
        }

        for strategy in self.strategy_snapshot() {
            strategy.on_market_groups(groups).await;
        }
    }
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        bus: Arc<EventBus>,
        market_data: Arc<MarketDataService>,
        discovery: Option<Arc<DiscoveryService>>,
        order_manager: Arc<OrderManager>,
        risk: Arc<RiskManager>,
        store: Arc<Store>,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            bus,
            market_data,
            discovery,
            order_manager,
            risk,
            store,
            strategies: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        });

        Self::wire(&inner);
        Self { inner }
    }

    /// Subscribe the engine's handlers. Handlers hold `Weak` references
    /// so dropping the engine tears the wiring down.
    fn wire(inner: &Arc<EngineInner>) {
        let weak: Weak<EngineInner> = Arc::downgrade(inner);

        {
            let weak = weak.clone();
            inner.bus.on(EventType::OrderbookUpdate, move |event| {
                let weak = weak.clone();
                async move {
                    if let (Some(inner), EventData::OrderBook(book)) =
                        (weak.upgrade(), &event.data)
                    {
                        inner.handle_orderbook_update(book).await;
                    }
                    Ok(())
                }
            });
        }

        {
            let weak = weak.clone();
            inner.bus.on(EventType::OrderFilled, move |event| {
                let weak = weak.clone();
                async move {
                    if let (Some(inner), EventData::Fill(fill)) = (weak.upgrade(), &event.data) {
                        for strategy in inner.strategy_snapshot() {
                            strategy.on_order_filled(fill).await;
                        }
                    }
                    Ok(())
                }
            });
        }

        {
            let weak = weak.clone();
            inner.bus.on(EventType::RiskBreach, move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        if let EventData::RiskBreach { reason } = &event.data {
                            warn!("[ENGINE] Risk breach ({}), cancelling all orders", reason);
                        }
                        inner.order_manager.cancel_all_orders().await;
                    }
                    Ok(())
                }
            });
        }

        {
            let weak = weak.clone();
            inner.bus.on(EventType::MarketGroupsUpdated, move |event| {
                let weak = weak.clone();
                async move {
                    if let (Some(inner), EventData::MarketGroups(groups)) =
                        (weak.upgrade(), &event.data)
                    {
                        inner.handle_market_groups(groups).await;
                    }
                    Ok(())
                }
            });
        }
    }

    pub fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        info!("[ENGINE] Registered strategy '{}'", strategy.name());
        self.inner
            .strategies
            .write()
            .expect("strategy lock poisoned")
            .push(strategy);
    }

    /// Remove a strategy by name, calling its `shutdown`. Returns false
    /// if no strategy carried the name.
    pub async fn unregister_strategy(&self, name: &str) -> bool {
        let removed = {
            let mut strategies = self
                .inner
                .strategies
                .write()
                .expect("strategy lock poisoned");
            match strategies.iter().position(|s| s.name() == name) {
                Some(i) => Some(strategies.remove(i)),
                None => None,
            }
        };
        match removed {
            Some(strategy) => {
                strategy.shutdown().await;
                info!("[ENGINE] Unregistered strategy '{}'", name);
                true
            }
            None => false,
        }
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.inner
            .strategy_snapshot()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Replace the market-data subscription set.
    pub fn set_tokens(&self, tokens: &[String]) {
        let current = self.inner.market_data.subscribed_tokens();
        self.inner.market_data.unsubscribe(&current);
        self.inner.market_data.subscribe(tokens);
    }

    /// Idempotent union with subscription fan-out to market data.
    pub fn add_tokens(&self, tokens: &[String]) {
        self.inner.market_data.subscribe(tokens);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Initialize strategies, start the feeds, reconcile open orders,
    /// then begin evaluating.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        for strategy in self.inner.strategy_snapshot() {
            strategy
                .initialize()
                .await
                .with_context(|| format!("initializing strategy '{}'", strategy.name()))?;
        }

        self.inner.market_data.start();
        if let Some(discovery) = &self.inner.discovery {
            discovery.start();
        }

        self.inner.order_manager.sync_orders().await;
        self.inner.running.store(true, Ordering::SeqCst);
        info!("[ENGINE] Running");
        Ok(())
    }

    /// Cooperative shutdown: stop evaluating, cancel everything live,
    /// stop the feeds, shut the strategies down.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.order_manager.cancel_all_orders().await;
        self.inner.market_data.stop().await;
        if let Some(discovery) = &self.inner.discovery {
            discovery.stop().await;
        }
        for strategy in self.inner.strategy_snapshot() {
            strategy.shutdown().await;
        }
        info!("[ENGINE] Stopped");
    }

    pub fn get_status(&self) -> EngineStatus {
        let strategies = self
            .inner
            .strategy_snapshot()
            .iter()
            .map(|s| StrategyStatus {
                name: s.name().to_string(),
                enabled: s.is_enabled(),
                metrics: s.metrics(),
            })
            .collect();

        EngineStatus {
            running: self.is_running(),
            strategies,
            positions: self.inner.store.get_all_active_positions().unwrap_or_default(),
            open_orders: self.inner.store.get_open_orders().unwrap_or_default(),
            risk_limits: self.inner.risk.limits().clone(),
            exposure: self.inner.risk.get_exposure().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use crate::market_data::DEFAULT_POLL_INTERVAL;
    use crate::strategies::StrategyCore;
    use crate::types::{PriceLevel, Side};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct StaticStrategy {
        core: StrategyCore,
        signals: Vec<TradeSignal>,
        fail: bool,
        evaluations: AtomicUsize,
    }

    impl StaticStrategy {
        fn new(name: &str, signals: Vec<TradeSignal>) -> Self {
            Self {
                core: StrategyCore::new(name),
                signals,
                fail: false,
                evaluations: AtomicUsize::new(0),
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                core: StrategyCore::new(name),
                signals: vec![],
                fail: true,
                evaluations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Strategy for StaticStrategy {
        fn core(&self) -> &StrategyCore {
            &self.core
        }

        async fn evaluate(&self, _token: &str, _book: &OrderBook) -> Result<Vec<TradeSignal>> {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("synthetic strategy failure");
            }
            Ok(self.signals.clone())
        }
    }

    fn signal(token: &str, confidence: f64) -> TradeSignal {
        TradeSignal {
            token_id: token.to_string(),
            side: Side::Buy,
            confidence,
            target_price: 0.40,
            size: 5.0,
            reason: "test".to_string(),
        }
    }

    struct Harness {
        engine: Engine,
        bus: Arc<EventBus>,
        store: Arc<Store>,
        client: Arc<MockExchangeClient>,
        market_data: Arc<MarketDataService>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let client = Arc::new(MockExchangeClient::new());
        let market_data = Arc::new(MarketDataService::new(
            client.clone(),
            bus.clone(),
            DEFAULT_POLL_INTERVAL,
        ));
        let risk = Arc::new(RiskManager::new(
            store.clone(),
            bus.clone(),
            RiskLimits::default(),
        ));
        let order_manager = Arc::new(OrderManager::new(
            client.clone(),
            store.clone(),
            risk.clone(),
            bus.clone(),
            false,
        ));
        let engine = Engine::new(
            bus.clone(),
            market_data.clone(),
            None,
            order_manager,
            risk,
            store.clone(),
        );
        Harness {
            engine,
            bus,
            store,
            client,
            market_data,
        }
    }

    fn book(token: &str) -> OrderBook {
        OrderBook::new(
            token,
            vec![PriceLevel::new(0.39, 100.0)],
            vec![PriceLevel::new(0.41, 100.0)],
        )
    }

    #[tokio::test]
    async fn test_high_confidence_signal_is_executed() {
        let h = harness();
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.9)])));
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        let orders = h.store.get_open_orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].token_id, "t1");

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_low_confidence_signal_is_discarded() {
        let h = harness();
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.5)])));
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        assert!(h.store.get_open_orders().unwrap().is_empty());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_strategy_failure_does_not_block_others() {
        let h = harness();
        h.engine.register_strategy(Arc::new(StaticStrategy::failing("bad")));
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("good", vec![signal("t1", 0.9)])));
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        assert_eq!(h.store.get_open_orders().unwrap().len(), 1);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_strategy_is_skipped() {
        let h = harness();
        let strategy = Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.9)]));
        strategy.set_enabled(false);
        h.engine.register_strategy(strategy.clone());
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        assert_eq!(strategy.evaluations.load(Ordering::SeqCst), 0);
        assert!(h.store.get_open_orders().unwrap().is_empty());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_no_evaluation_before_start_or_when_halted() {
        let h = harness();
        let strategy = Arc::new(StaticStrategy::new("s1", vec![]));
        h.engine.register_strategy(strategy.clone());

        // Not started yet
        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;
        assert_eq!(strategy.evaluations.load(Ordering::SeqCst), 0);

        h.engine.start().await.unwrap();
        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;
        assert_eq!(strategy.evaluations.load(Ordering::SeqCst), 1);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_risk_breach_cancels_all_orders() {
        let h = harness();
        h.client.set_fill_orders(false);
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.9)])));
        h.engine.start().await.unwrap();

        // Three resting orders on the books
        for _ in 0..3 {
            h.bus
                .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
                .await;
        }
        assert_eq!(h.store.get_open_orders().unwrap().len(), 3);

        h.bus
            .emit(
                EventType::RiskBreach,
                EventData::RiskBreach {
                    reason: "test breach".into(),
                },
            )
            .await;

        assert!(h.store.get_open_orders().unwrap().is_empty());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_add_tokens_idempotent_union() {
        let h = harness();
        let tokens = vec!["t1".to_string(), "t2".to_string()];
        h.engine.add_tokens(&tokens);
        h.engine.add_tokens(&tokens);

        let mut subscribed = h.market_data.subscribed_tokens();
        subscribed.sort();
        assert_eq!(subscribed, tokens);
    }

    #[tokio::test]
    async fn test_set_tokens_replaces_subscription() {
        let h = harness();
        h.engine.add_tokens(&["t1".to_string(), "t2".to_string()]);
        h.engine.set_tokens(&["t3".to_string()]);
        assert_eq!(h.market_data.subscribed_tokens(), vec!["t3".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_strategy_by_name() {
        let h = harness();
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("s1", vec![])));

        assert!(h.engine.unregister_strategy("s1").await);
        assert!(!h.engine.unregister_strategy("s1").await);
        assert!(h.engine.strategy_names().is_empty());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let h = harness();
        h.engine
            .register_strategy(Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.9)])));
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        let status = h.engine.get_status();
        assert!(status.running);
        assert_eq!(status.strategies.len(), 1);
        assert_eq!(status.strategies[0].name, "s1");
        assert!(status.strategies[0].enabled);
        assert_eq!(status.positions.len(), 1, "fill created a position");
        assert!(status.exposure.total > 0.0);

        h.engine.stop().await;
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_order_filled_fans_out_to_strategies() {
        let h = harness();
        let strategy = Arc::new(StaticStrategy::new("s1", vec![signal("t1", 0.9)]));
        h.engine.register_strategy(strategy.clone());
        h.engine.start().await.unwrap();

        h.bus
            .emit(EventType::OrderbookUpdate, EventData::OrderBook(book("t1")))
            .await;

        // The default on_order_filled increments total_trades
        assert_eq!(strategy.metrics().total_trades, 1);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_poll_drives_evaluation_end_to_end() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let client = Arc::new(MockExchangeClient::new());
        client.set_order_book(book("t1"));
        let market_data = Arc::new(MarketDataService::new(
            client.clone(),
            bus.clone(),
            Duration::from_millis(10),
        ));
        let risk = Arc::new(RiskManager::new(
            store.clone(),
            bus.clone(),
            RiskLimits::default(),
        ));
        let order_manager = Arc::new(OrderManager::new(
            client.clone(),
            store.clone(),
            risk.clone(),
            bus.clone(),
            false,
        ));
        let engine = Engine::new(
            bus.clone(),
            market_data.clone(),
            None,
            order_manager,
            risk,
            store.clone(),
        );

        let strategy = Arc::new(StaticStrategy::new("s1", vec![]));
        engine.register_strategy(strategy.clone());
        engine.set_tokens(&["t1".to_string()]);
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await;

        assert!(strategy.evaluations.load(Ordering::SeqCst) >= 1);
    }
}
