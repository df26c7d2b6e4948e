use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::modules::bots::{BotDocument, LiquidityBot};
use crate::modules::buy_wall::BuyWallStrategy;
use crate::modules::conditional::ConditionalStrategy;
use crate::modules::errors::{EngineError, StoreError};
use crate::modules::exchange::ExchangeFactory;
use crate::modules::liquidity::LiquidityStrategy;
use crate::modules::market_maker::MarketMakerStrategy;
use crate::modules::notifier::Notifier;
use crate::modules::price_gap::PriceGapStrategy;
use crate::modules::ring_log::{RingEntry, RingLog};
use crate::modules::runner::{BotRunner, RunnerHandle};
use crate::modules::stabilizer::StabilizerStrategy;
use crate::modules::store::Store;
use crate::modules::strategy::{MarketCache, MarketSnapshot, StrategyCtx};
use crate::modules::types::BotKind;

// -------------------- Engine --------------------
// Lifecycle owner of one runner per strategy kind. The HTTP layer receives
// this by Arc and consumes the status/log surfaces; nothing here is global.

const RING_CAPACITY: usize = 500;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    pub kind: BotKind,
    pub is_running: bool,
    pub in_flight: usize,
    pub tick_seconds: u64,
    pub market: Vec<MarketSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_running: bool,
    pub runners: Vec<RunnerStatus>,
}

pub struct Engine<S: Store> {
    store: Arc<S>,
    factory: Arc<dyn ExchangeFactory>,
    notifier: Arc<dyn Notifier>,
    handles: Mutex<Vec<RunnerHandle>>,
}

impl<S: Store> Engine<S> {
    pub fn new(
        store: Arc<S>,
        factory: Arc<dyn ExchangeFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Engine {
            store,
            factory,
            notifier,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start one runner per bot kind. Idempotent: a started engine keeps its
    /// existing runners.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        info!(target: "engine", "starting runners for all bot kinds");
        handles.push(self.runner(ConditionalStrategy).start());
        handles.push(self.runner(StabilizerStrategy).start());
        handles.push(self.runner(MarketMakerStrategy).start());
        handles.push(self.runner(BuyWallStrategy).start());
        handles.push(self.runner(PriceGapStrategy).start());
        handles.push(self.runner(LiquidityStrategy).start());
    }

    fn runner<T: crate::modules::strategy::Strategy<S>>(&self, strategy: T) -> BotRunner<S, T> {
        BotRunner::new(
            strategy,
            Arc::clone(&self.store),
            Arc::clone(&self.factory),
            Arc::clone(&self.notifier),
            RING_CAPACITY,
        )
    }

    /// Stop every runner, waiting out the per-runner grace period.
    pub async fn stop(&self) {
        let handles: Vec<RunnerHandle> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.stop().await;
        }
        info!(target: "engine", "all runners stopped");
    }

    pub fn status(&self) -> EngineStatus {
        let handles = self.handles.lock();
        EngineStatus {
            is_running: handles.iter().any(|h| h.is_running()),
            runners: handles
                .iter()
                .map(|h| RunnerStatus {
                    kind: h.kind,
                    is_running: h.is_running(),
                    in_flight: h.in_flight_count(),
                    tick_seconds: h.tick_interval.as_secs(),
                    market: h.market.snapshot(),
                })
                .collect(),
        }
    }

    /// Latest ring entries for one kind, newest first.
    pub fn logs(&self, kind: BotKind, limit: usize) -> Vec<RingEntry> {
        self.handles
            .lock()
            .iter()
            .find(|h| h.kind == kind)
            .map(|h| h.ring.snapshot(limit))
            .unwrap_or_default()
    }

    /// Run one liquidity maintenance pass outside the schedule, with
    /// auto-manage forced on for this run only.
    pub async fn force_liquidity_adjust(&self, bot_id: &str) -> Result<(), EngineError> {
        let Some(bot) = self.store.get_bot::<LiquidityBot>(bot_id).await? else {
            return Err(EngineError::Store(StoreError::NotFound(bot_id.to_string())));
        };
        let Some(user) = self.store.get_user(bot.user_id()).await? else {
            return Err(EngineError::BadBot {
                bot_id: bot_id.to_string(),
                reason: "user not found".to_string(),
            });
        };
        if !user.is_eligible() {
            return Err(EngineError::BadBot {
                bot_id: bot_id.to_string(),
                reason: "user credentials missing or disabled".to_string(),
            });
        }

        // Reuse the liquidity runner's ring and market cache when running,
        // so the forced pass shows up on the same surfaces
        let (ring, market) = {
            let handles = self.handles.lock();
            handles
                .iter()
                .find(|h| h.kind == BotKind::Liquidity)
                .map(|h| (Arc::clone(&h.ring), Arc::clone(&h.market)))
                .unwrap_or_else(|| {
                    (
                        Arc::new(RingLog::new(RING_CAPACITY)),
                        Arc::new(MarketCache::new()),
                    )
                })
        };

        let exchange = self.factory.for_user(&user);
        let ctx = StrategyCtx {
            exchange,
            store: self.store.as_ref(),
            ring: ring.as_ref(),
            notifier: self.notifier.as_ref(),
            market: market.as_ref(),
        };
        LiquidityStrategy.force_adjust(bot_id, ctx).await
    }
}
