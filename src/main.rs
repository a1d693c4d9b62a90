//! Process entry point: load configuration, wire the engine, run until
//! SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use polybot::config::{Config, StrategyKind};
use polybot::discovery::DiscoveryService;
use polybot::engine::Engine;
use polybot::events::EventBus;
use polybot::exchange::MockExchangeClient;
use polybot::market_data::MarketDataService;
use polybot::orders::OrderManager;
use polybot::risk::RiskManager;
use polybot::storage::Store;
use polybot::strategies::{
    ArbConfig, BregmanArbStrategy, MarketMakerStrategy, MeanReversionStrategy, MomentumStrategy,
    Strategy,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("polybot=info".parse().unwrap()),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().context("configuration")?;

    info!("🚀 Polybot starting");
    info!("   Exchange: {} (chain {})", config.host, config.chain_id);
    info!(
        "   Strategies: {}",
        config
            .strategies
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if config.dry_run {
        info!("   Mode: DRY RUN (set DRY_RUN=0 and provide POLY_PRIVATE_KEY to go live)");
    } else {
        warn!("   Mode: LIVE EXECUTION");
    }

    let store = Arc::new(Store::open(&config.database_path).context("opening store")?);
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(MockExchangeClient::new());

    let market_data = Arc::new(MarketDataService::new(
        client.clone(),
        bus.clone(),
        config.poll_interval,
    ));
    let risk = Arc::new(RiskManager::new(
        store.clone(),
        bus.clone(),
        config.risk_limits.clone(),
    ));
    let order_manager = Arc::new(OrderManager::new(
        client,
        store.clone(),
        risk.clone(),
        bus.clone(),
        config.dry_run,
    ));

    // Discovery only runs when the arbitrage strategy can consume it
    let discovery = if config.wants(StrategyKind::BregmanArb) {
        Some(Arc::new(DiscoveryService::new(
            config.discovery.clone(),
            bus.clone(),
        )))
    } else {
        None
    };

    let engine = Engine::new(
        bus,
        market_data.clone(),
        discovery,
        order_manager,
        risk,
        store.clone(),
    );

    for kind in &config.strategies {
        let strategy: Arc<dyn Strategy> = match kind {
            StrategyKind::MarketMaker => Arc::new(MarketMakerStrategy::new()),
            StrategyKind::Momentum => Arc::new(MomentumStrategy::new()),
            StrategyKind::MeanReversion => Arc::new(MeanReversionStrategy::new()),
            StrategyKind::BregmanArb => Arc::new(BregmanArbStrategy::new(
                market_data.clone(),
                store.clone(),
                ArbConfig {
                    max_position_size: config.risk_limits.max_position_size,
                    ..Default::default()
                },
            )),
        };
        engine.register_strategy(strategy);
    }

    engine.set_tokens(&config.token_ids);
    engine.start().await.context("engine start")?;

    wait_for_shutdown().await;

    info!("Shutting down...");
    engine.stop().await;
    store.close();
    info!("✅ Clean shutdown");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
