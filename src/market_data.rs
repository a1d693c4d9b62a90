//! Market data polling service.
//!
//! Maintains a subscription set and a last-seen order-book cache. Each
//! tick fetches every subscribed token concurrently, then publishes an
//! `orderbook_update` for each successful fetch in subscription order.
//! There is no change detection; consumers are expected to be idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventData, EventType};
use crate::exchange::ExchangeClient;
use crate::types::OrderBook;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct MarketDataService {
    client: Arc<dyn ExchangeClient>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    tokens: RwLock<HashSet<String>>,
    books: RwLock<HashMap<String, OrderBook>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataService {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        bus: Arc<EventBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            bus,
            poll_interval,
            tokens: RwLock::new(HashSet::new()),
            books: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Add tokens to the subscription set (union semantics).
    pub fn subscribe(&self, tokens: &[String]) {
        let mut set = self.tokens.write().expect("token set lock poisoned");
        let before = set.len();
        set.extend(tokens.iter().cloned());
        let added = set.len() - before;
        if added > 0 {
            info!("[MARKET_DATA] Subscribed {} new token(s), {} total", added, set.len());
        }
    }

    pub fn unsubscribe(&self, tokens: &[String]) {
        let mut set = self.tokens.write().expect("token set lock poisoned");
        for token in tokens {
            set.remove(token);
        }
    }

    pub fn subscribed_tokens(&self) -> Vec<String> {
        self.tokens
            .read()
            .expect("token set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Last cached book for a token, if any poll has succeeded.
    pub fn get_order_book(&self, token_id: &str) -> Option<OrderBook> {
        self.books
            .read()
            .expect("book cache lock poisoned")
            .get(token_id)
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll immediately, then at the configured interval until `stop`.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            "[MARKET_DATA] Started (interval {} ms)",
            self.poll_interval.as_millis()
        );

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                service.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(service.poll_interval) => {}
                    _ = service.shutdown.notified() => break,
                }
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("[MARKET_DATA] Poll loop exited");
        });

        *self.task.lock().expect("task lock poisoned") = Some(handle);
    }

    /// Cooperative stop: the in-flight poll completes, further ticks are
    /// suppressed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // notify_one stores a permit, so a stop issued mid-poll still
        // lands once the loop reaches its select
        self.shutdown.notify_one();
        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("[MARKET_DATA] Stopped");
    }

    /// One polling pass over the current subscription set. Fetches run
    /// concurrently; failures on individual tokens are logged and do not
    /// abort the rest. Emission happens in deterministic order after the
    /// batch completes.
    pub async fn poll_once(&self) {
        let tokens: Vec<String> = {
            let set = self.tokens.read().expect("token set lock poisoned");
            let mut tokens: Vec<String> = set.iter().cloned().collect();
            tokens.sort();
            tokens
        };

        if tokens.is_empty() {
            return;
        }

        let fetches = tokens.iter().map(|token| {
            let client = Arc::clone(&self.client);
            let token = token.clone();
            async move {
                let result = client.get_order_book(&token).await;
                (token, result)
            }
        });

        let results = join_all(fetches).await;

        for (token, result) in results {
            match result {
                Ok(book) => {
                    self.books
                        .write()
                        .expect("book cache lock poisoned")
                        .insert(token.clone(), book.clone());
                    self.bus
                        .emit(EventType::OrderbookUpdate, EventData::OrderBook(book))
                        .await;
                }
                Err(e) => {
                    warn!("[MARKET_DATA] Fetch failed for {}: {:#}", token, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use crate::types::PriceLevel;
    use std::sync::atomic::AtomicUsize;

    fn book(token: &str, bid: f64, ask: f64) -> OrderBook {
        OrderBook::new(
            token,
            vec![PriceLevel::new(bid, 100.0)],
            vec![PriceLevel::new(ask, 100.0)],
        )
    }

    fn service_with(client: Arc<MockExchangeClient>, bus: Arc<EventBus>) -> Arc<MarketDataService> {
        Arc::new(MarketDataService::new(client, bus, DEFAULT_POLL_INTERVAL))
    }

    #[tokio::test]
    async fn test_subscribe_and_tick() {
        let client = Arc::new(MockExchangeClient::new());
        client.set_order_book(book("t1", 0.49, 0.51));

        let bus = Arc::new(EventBus::new());
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        bus.on(EventType::OrderbookUpdate, move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let service = service_with(client, bus);
        service.subscribe(&["t1".to_string()]);
        service.poll_once().await;

        let cached = service.get_order_book("t1").expect("book cached after poll");
        assert!((cached.mid_price().unwrap() - 0.50).abs() < 1e-9);
        assert_eq!(updates.load(Ordering::SeqCst), 1, "exactly one update per poll");
    }

    #[tokio::test]
    async fn test_failed_token_does_not_abort_batch() {
        let client = Arc::new(MockExchangeClient::new());
        // Only t2 has a book; t1 will fail
        client.set_order_book(book("t2", 0.30, 0.32));

        let bus = Arc::new(EventBus::new());
        let service = service_with(client, bus);
        service.subscribe(&["t1".to_string(), "t2".to_string()]);
        service.poll_once().await;

        assert!(service.get_order_book("t1").is_none());
        assert!(service.get_order_book("t2").is_some());
    }

    #[tokio::test]
    async fn test_subscription_union_idempotent() {
        let client = Arc::new(MockExchangeClient::new());
        let bus = Arc::new(EventBus::new());
        let service = service_with(client, bus);

        let tokens = vec!["t1".to_string(), "t2".to_string()];
        service.subscribe(&tokens);
        service.subscribe(&tokens);

        let mut subscribed = service.subscribed_tokens();
        subscribed.sort();
        assert_eq!(subscribed, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_token() {
        let client = Arc::new(MockExchangeClient::new());
        let bus = Arc::new(EventBus::new());
        let service = service_with(client, bus);

        service.subscribe(&["t1".to_string(), "t2".to_string()]);
        service.unsubscribe(&["t1".to_string()]);

        assert_eq!(service.subscribed_tokens(), vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let client = Arc::new(MockExchangeClient::new());
        client.set_order_book(book("t1", 0.49, 0.51));

        let bus = Arc::new(EventBus::new());
        let service = Arc::new(MarketDataService::new(
            client,
            bus,
            Duration::from_millis(10),
        ));
        service.subscribe(&["t1".to_string()]);

        service.start();
        assert!(service.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        service.stop().await;
        assert!(!service.is_running());
        assert!(service.get_order_book("t1").is_some());
    }
}
