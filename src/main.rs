use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gcb_bot_engine::modules::{
    config::EngineConfig,
    engine::Engine,
    exchange::HttpExchangeFactory,
    notifier::LogNotifier,
    store::MongoStore,
};

/// GCB Trading-Bot Execution Engine — High-Level Architecture
///
/// Components:
/// ┌──────────────────┐   tick interval   ┌──────────────────┐   signed REST   ┌─────────────────┐
/// │ Engine           │ ────────────────▶ │ BotRunner (x6)   │ ──────────────▶ │ ExchangeClient  │
/// │ (lifecycle owner)│                   │ (per bot kind)   │                 │ (CH / XT family)│
/// └──────────────────┘                   └──────────────────┘                 └─────────────────┘
///         │                                       │                                    │
///         ▼                                       ▼                                    ▼
/// ┌──────────────────┐   status + logs   ┌──────────────────┐   trades/logs   ┌─────────────────┐
/// │ HTTP API (extern)│ ◀──────────────── │ RingLog + Market │ ◀────────────── │ MongoStore      │
/// │                  │                   │ cache per runner │                 │ (document store)│
/// └──────────────────┘                   └──────────────────┘                 └─────────────────┘
///
/// Each runner ticks on its kind's interval, lists `isActive && isRunning`
/// bots, claims each bot in a process-local in-flight set and hands it to
/// its strategy with an exchange client bound to the owning user's
/// credentials. Strategies persist every placement attempt as an immutable
/// trade and stream structured activity into the kind's bounded ring.
///
/// Kill switch: Ctrl+C asks the engine to stop; runners drain in-flight
/// strategies for a bounded grace period before the process exits.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    info!(
        family = ?config.exchange_family,
        db = %config.mongo_db,
        "starting gcb-bot-engine"
    );

    let store = Arc::new(MongoStore::connect(&config.mongo_uri, &config.mongo_db).await?);
    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;
    let factory = Arc::new(HttpExchangeFactory {
        family: config.exchange_family,
        base_url: config.exchange_base_url.clone(),
        http,
        fallback_info: config.fallback_precision,
    });
    let notifier = Arc::new(LogNotifier);

    let engine = Arc::new(Engine::new(store, factory, notifier));
    engine.start();
    info!("engine running; press Ctrl+C to stop");

    // The external HTTP API receives `engine` here by Arc and serves
    // status/log/force-adjust requests; it is wired outside this binary.

    signal::ctrl_c().await?;
    info!("shutdown requested, draining runners");
    engine.stop().await;
    info!("engine stopped");
    Ok(())
}
