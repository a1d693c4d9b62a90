//! Typed in-process event bus.
//!
//! Delivery is synchronous: `emit` awaits every subscriber of the event
//! type in registration order before returning. A failing handler is
//! logged and does not prevent subsequent handlers from running. `once`
//! registrations are removed before their handler is invoked, so
//! re-entrant emits from inside a handler are safe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{error, trace};

use crate::types::{
    MarketGroup, OrderBook, OrderRequest, PlaceOrderResult, Position, Trade, TradeSignal,
};

/// The fixed set of event types flowing through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    OrderbookUpdate,
    TradeExecuted,
    OrderFilled,
    OrderCancelled,
    PositionChanged,
    StrategySignal,
    RiskBreach,
    MarketUpdate,
    MarketGroupsUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderbookUpdate => "orderbook_update",
            EventType::TradeExecuted => "trade_executed",
            EventType::OrderFilled => "order_filled",
            EventType::OrderCancelled => "order_cancelled",
            EventType::PositionChanged => "position_changed",
            EventType::StrategySignal => "strategy_signal",
            EventType::RiskBreach => "risk_breach",
            EventType::MarketUpdate => "market_update",
            EventType::MarketGroupsUpdated => "market_groups_updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of an order-placement event. Emitted for every successful
/// placement, including resting orders; `result.filled_size` may be zero.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: String,
    pub order: OrderRequest,
    pub result: PlaceOrderResult,
}

/// Typed event payloads.
#[derive(Debug, Clone)]
pub enum EventData {
    OrderBook(OrderBook),
    Fill(OrderFill),
    OrderCancelled { order_id: String },
    Trade(Trade),
    Position(Position),
    Signal { strategy: String, signal: TradeSignal },
    RiskBreach { reason: String },
    MarketGroups(Vec<MarketGroup>),
    /// Generic market metadata change.
    MarketUpdate { token_id: String },
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

/// Identifier returned by `on`/`once`, accepted by `off`.
pub type HandlerId = u64;

type StoredHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Registration {
    id: HandlerId,
    once: bool,
    handler: StoredHandler,
}

fn box_handler<F, Fut>(handler: F) -> StoredHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| {
        let fut: BoxFuture<'static, Result<()>> = Box::pin(handler(event));
        fut
    })
}

/// Publish/subscribe dispatcher keyed by [`EventType`].
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventType, Vec<Registration>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to an event type. Handlers run in registration order.
    pub fn on<F, Fut>(&self, kind: EventType, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(kind, box_handler(handler), false)
    }

    /// Subscribe for exactly one delivery. The registration is removed
    /// before the handler runs.
    pub fn once<F, Fut>(&self, kind: EventType, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(kind, box_handler(handler), true)
    }

    fn register(&self, kind: EventType, handler: StoredHandler, once: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        handlers.entry(kind).or_default().push(Registration { id, once, handler });
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn off(&self, kind: EventType, id: HandlerId) {
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        if let Some(regs) = handlers.get_mut(&kind) {
            regs.retain(|r| r.id != id);
        }
    }

    /// Number of live subscriptions for an event type.
    pub fn subscriber_count(&self, kind: EventType) -> usize {
        self.handlers
            .read()
            .expect("event bus lock poisoned")
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Dispatch an event to every subscriber of its type, in registration
    /// order. Handler failures are logged per handler and swallowed.
    pub async fn emit(&self, kind: EventType, data: EventData) {
        let event = Event {
            kind,
            timestamp: Utc::now(),
            data,
        };

        // Snapshot under the lock; drop once-registrations before any
        // handler runs so a re-entrant emit cannot double-deliver.
        let snapshot: Vec<StoredHandler> = {
            let mut handlers = self.handlers.write().expect("event bus lock poisoned");
            match handlers.get_mut(&kind) {
                Some(regs) => {
                    let snap: Vec<StoredHandler> =
                        regs.iter().map(|r| Arc::clone(&r.handler)).collect();
                    regs.retain(|r| !r.once);
                    snap
                }
                None => return,
            }
        };

        trace!("[BUS] {} -> {} handler(s)", kind, snapshot.len());

        for handler in snapshot {
            if let Err(e) = handler(event.clone()).await {
                error!("[BUS] handler for {} failed: {:#}", kind, e);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
