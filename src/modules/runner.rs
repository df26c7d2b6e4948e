use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::modules::bots::BotDocument;
use crate::modules::exchange::ExchangeFactory;
use crate::modules::notifier::Notifier;
use crate::modules::ring_log::RingLog;
use crate::modules::store::Store;
use crate::modules::strategy::{MarketCache, Strategy, StrategyCtx};
use crate::modules::types::BotKind;

// -------------------- Per-Kind Bot Runner --------------------
// One runner per strategy kind. Every tick lists the schedulable bots and
// dispatches each as its own task behind a non-blocking per-bot claim; the
// claim is guard-scoped so it releases on every exit path.

/// Grace period for in-flight strategy tasks during shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process-local set of bot ids currently being worked on.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(InFlight::default())
    }

    /// Non-blocking claim; `None` means another task owns the bot right now.
    pub fn try_claim(self: &Arc<Self>, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock();
        if ids.insert(id.to_string()) {
            Some(InFlightGuard {
                set: Arc::clone(self),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn count(&self) -> usize {
        self.ids.lock().len()
    }
}

pub struct InFlightGuard {
    set: Arc<InFlight>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.ids.lock().remove(&self.id);
    }
}

pub struct BotRunner<S: Store, T: Strategy<S>> {
    strategy: Arc<T>,
    store: Arc<S>,
    factory: Arc<dyn ExchangeFactory>,
    notifier: Arc<dyn Notifier>,
    ring: Arc<RingLog>,
    market: Arc<MarketCache>,
    tick_interval: Duration,
    in_flight: Arc<InFlight>,
}

/// Control surface the engine keeps after a runner is started.
pub struct RunnerHandle {
    pub kind: BotKind,
    pub tick_interval: Duration,
    pub ring: Arc<RingLog>,
    pub market: Arc<MarketCache>,
    in_flight: Arc<InFlight>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RunnerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count()
    }

    /// Signal the tick loop, then wait out the drain (grace period plus a
    /// small margin for the loop itself).
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if timeout(SHUTDOWN_GRACE + Duration::from_secs(1), self.task)
            .await
            .is_err()
        {
            warn!(target: "runner", kind = %self.kind, "runner did not stop within grace");
        }
    }
}

impl<S: Store, T: Strategy<S>> BotRunner<S, T> {
    pub fn new(
        strategy: T,
        store: Arc<S>,
        factory: Arc<dyn ExchangeFactory>,
        notifier: Arc<dyn Notifier>,
        ring_capacity: usize,
    ) -> Self {
        let tick_interval = strategy.default_interval();
        BotRunner {
            strategy: Arc::new(strategy),
            store,
            factory,
            notifier,
            ring: Arc::new(RingLog::new(ring_capacity)),
            market: Arc::new(MarketCache::new()),
            tick_interval,
            in_flight: InFlight::new(),
        }
    }

    pub fn with_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn start(self) -> RunnerHandle {
        let kind = self.strategy.kind();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let ring = Arc::clone(&self.ring);
        let market = Arc::clone(&self.market);
        let in_flight = Arc::clone(&self.in_flight);
        let tick_interval = self.tick_interval;

        let task = tokio::spawn(async move {
            info!(target: "runner", kind = %kind, interval = ?tick_interval, "runner started");
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tasks: JoinSet<()> = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(&mut tasks).await;
                        // Reap whatever finished since the last tick
                        while tasks.try_join_next().is_some() {}
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            // Drain in-flight strategies within the grace window, then abort
            if timeout(SHUTDOWN_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await
            .is_err()
            {
                warn!(target: "runner", kind = %kind, "grace expired, aborting in-flight strategies");
                tasks.abort_all();
            }
            info!(target: "runner", kind = %kind, "runner stopped");
        });

        RunnerHandle {
            kind,
            tick_interval,
            ring,
            market,
            in_flight,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn tick(&self, tasks: &mut JoinSet<()>) {
        let bots = match self.store.list_active_bots::<T::Bot>().await {
            Ok(bots) => bots,
            Err(err) => {
                error!(target: "runner", kind = %self.strategy.kind(), "active-bot query failed: {err}");
                self.ring.error(
                    format!("active-bot query failed: {err}"),
                    serde_json::Value::Null,
                );
                return;
            }
        };

        for bot in bots {
            let bot_id = bot.id().to_string();
            // Skip bots still being processed by an earlier tick
            let Some(guard) = self.in_flight.try_claim(&bot_id) else {
                continue;
            };

            let user = match self.store.get_user(bot.user_id()).await {
                Ok(Some(user)) if user.is_eligible() => user,
                Ok(_) => {
                    self.ring.warning(
                        format!("bot {bot_id}: user missing credentials or disabled"),
                        serde_json::json!({ "botId": bot_id }),
                    );
                    continue; // guard drops here
                }
                Err(err) => {
                    self.ring.error(
                        format!("bot {bot_id}: user lookup failed: {err}"),
                        serde_json::json!({ "botId": bot_id }),
                    );
                    continue;
                }
            };

            let exchange = self.factory.for_user(&user);
            let strategy = Arc::clone(&self.strategy);
            let store = Arc::clone(&self.store);
            let ring = Arc::clone(&self.ring);
            let notifier = Arc::clone(&self.notifier);
            let market = Arc::clone(&self.market);

            tasks.spawn(async move {
                let _guard = guard;
                let ctx = StrategyCtx {
                    exchange,
                    store: store.as_ref(),
                    ring: ring.as_ref(),
                    notifier: notifier.as_ref(),
                    market: market.as_ref(),
                };
                if let Err(err) = strategy.run_once(bot, ctx).await {
                    warn!(target: "runner", kind = %strategy.kind(), bot = %bot_id, "strategy failed: {err}");
                    ring.error(
                        format!("bot {bot_id}: {err}"),
                        serde_json::json!({ "botId": bot_id }),
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::bots::ConditionalBot;
    use crate::modules::errors::EngineError;
    use crate::modules::exchange::test_support::{ScriptedExchange, ScriptedFactory};
    use crate::modules::notifier::NullNotifier;
    use crate::modules::store::memory::MemoryStore;
    use crate::modules::types::User;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Slow no-op strategy that records overlap.
    struct SlowStrategy {
        running: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Strategy<MemoryStore> for SlowStrategy {
        type Bot = ConditionalBot;

        fn default_interval(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn run_once(
            &self,
            _bot: ConditionalBot,
            _ctx: StrategyCtx<'_, MemoryStore>,
        ) -> Result<(), EngineError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(180)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn conditional_bot(id: &str) -> ConditionalBot {
        use crate::modules::bots::{ActionField, ConditionAction, ConditionField, ConditionOperator};
        ConditionalBot {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: "bot".to_string(),
            symbol: "GCBUSDT".to_string(),
            is_active: true,
            is_running: true,
            condition_field: ConditionField::GcbPrice,
            condition_operator: ConditionOperator::Above,
            condition_value: 1.0,
            action_type: ConditionAction::MarketBuy,
            action_field: ActionField::UsdtValue,
            action_value: 1.0,
            limit_price: None,
            cooldown_seconds: 60,
            trigger_count: 0,
            last_triggered_at: None,
            last_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn eligible_user() -> User {
        User {
            id: "u1".to_string(),
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            bot_enabled: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_bot_exclusion_holds_across_overlapping_ticks() {
        let store = Arc::new(MemoryStore::new());
        store.put_bot(&conditional_bot("c1"));
        store.put_user(eligible_user());

        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let strategy = SlowStrategy {
            running: running.clone(),
            max_seen: max_seen.clone(),
            runs: runs.clone(),
        };

        let runner = BotRunner::new(
            strategy,
            store,
            Arc::new(ScriptedFactory(Arc::new(ScriptedExchange::new()))),
            Arc::new(NullNotifier),
            100,
        );
        let handle = runner.start();

        // Many 50ms ticks land while each 180ms run is still in flight
        tokio::time::sleep(Duration::from_millis(900)).await;
        handle.stop().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_user_skips_bot_and_releases_claim() {
        let store = Arc::new(MemoryStore::new());
        store.put_bot(&conditional_bot("c1"));
        store.put_user(User {
            bot_enabled: false,
            ..eligible_user()
        });

        let runs = Arc::new(AtomicUsize::new(0));
        let strategy = SlowStrategy {
            running: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::new(AtomicUsize::new(0)),
            runs: runs.clone(),
        };

        let runner = BotRunner::new(
            strategy,
            store,
            Arc::new(ScriptedFactory(Arc::new(ScriptedExchange::new()))),
            Arc::new(NullNotifier),
            100,
        );
        let handle = runner.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // The claim was released each tick, not leaked
        assert_eq!(handle.in_flight_count(), 0);
        assert!(!handle.ring.is_empty());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_strategy() {
        let store = Arc::new(MemoryStore::new());
        store.put_bot(&conditional_bot("c1"));
        store.put_user(eligible_user());

        let runs = Arc::new(AtomicUsize::new(0));
        let strategy = SlowStrategy {
            running: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::new(AtomicUsize::new(0)),
            runs: runs.clone(),
        };

        let runner = BotRunner::new(
            strategy,
            store,
            Arc::new(ScriptedFactory(Arc::new(ScriptedExchange::new()))),
            Arc::new(NullNotifier),
            100,
        );
        let handle = runner.start();
        // Let exactly one run begin, then stop mid-flight
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_flight_claim_is_exclusive_and_guard_scoped() {
        let set = InFlight::new();
        let guard = set.try_claim("b1").expect("first claim");
        assert!(set.try_claim("b1").is_none());
        assert_eq!(set.count(), 1);
        drop(guard);
        assert!(set.try_claim("b1").is_some());
    }
}
