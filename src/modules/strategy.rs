use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::modules::bots::BotDocument;
use crate::modules::errors::EngineError;
use crate::modules::exchange::ExchangeClient;
use crate::modules::notifier::Notifier;
use crate::modules::ring_log::RingLog;
use crate::modules::store::Store;
use crate::modules::types::{Balances, BotKind};

// -------------------- Strategy Contract --------------------

/// Everything a strategy needs for one run: the user-bound exchange client,
/// the store, the kind's activity ring, the notification sink and the
/// process-local market cache feeding the status surface.
pub struct StrategyCtx<'a, S: Store> {
    pub exchange: Arc<dyn ExchangeClient>,
    pub store: &'a S,
    pub ring: &'a RingLog,
    pub notifier: &'a dyn Notifier,
    pub market: &'a MarketCache,
}

/// One bot kind's observe -> decide -> act loop. Implementations own their
/// cooldown discipline (re-reading the bot before acting) and never panic
/// across this boundary.
#[async_trait]
pub trait Strategy<S: Store>: Send + Sync + 'static {
    type Bot: BotDocument;

    fn kind(&self) -> BotKind {
        Self::Bot::KIND
    }

    /// Tick interval for this kind's runner.
    fn default_interval(&self) -> Duration;

    async fn run_once(&self, bot: Self::Bot, ctx: StrategyCtx<'_, S>) -> Result<(), EngineError>;
}

// -------------------- Shared Plumbing --------------------

/// Last observed market state per symbol, shared with `engine.status()`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MarketCache {
    inner: RwLock<HashMap<String, MarketSnapshot>>,
}

impl MarketCache {
    pub fn new() -> Self {
        MarketCache::default()
    }

    pub fn update(&self, symbol: &str, last: f64, best_ask: Option<f64>) {
        self.inner.write().insert(
            symbol.to_string(),
            MarketSnapshot {
                symbol: symbol.to_string(),
                last,
                best_ask,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<MarketSnapshot> {
        self.inner.read().values().cloned().collect()
    }
}

/// True when the last action is old enough (or absent) for another one.
pub fn cooldown_elapsed(last: Option<DateTime<Utc>>, cooldown_seconds: u64) -> bool {
    match last {
        None => true,
        Some(ts) => {
            Utc::now().signed_duration_since(ts).num_seconds() >= cooldown_seconds as i64
        }
    }
}

pub fn free_balance(balances: &Balances, asset: &str) -> f64 {
    balances.get(asset).map(|b| b.free).unwrap_or(0.0)
}
