use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::modules::bots::{BotDocument, StabilizerBot};
use crate::modules::errors::EngineError;
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{free_balance, Strategy, StrategyCtx};
use crate::modules::types::{
    ActivityLog, LogLevel, OrderType, Side, Trade, QUOTE_ASSET,
};

// -------------------- Price Stabilization Ladder --------------------
// When the market trades below the target, compute the USDT needed to lift
// every ask at or below the target and spend it in four spaced market buys,
// stopping as soon as a mid-run ticker shows the target reached.

const LADDER_ORDERS: u32 = 4;
const INTER_LADDER_GAP: Duration = Duration::from_secs(10);
const DEPTH_LEVELS: usize = 20;

pub struct StabilizerStrategy;

/// USDT required to consume every ask priced at or below the target
/// (inclusive: an ask exactly at the target still holds the price down).
fn required_budget(asks: &[crate::modules::types::PriceLevel], target: f64) -> f64 {
    asks.iter()
        .filter(|level| level.price <= target)
        .map(|level| level.notional())
        .sum()
}

#[async_trait]
impl<S: Store> Strategy<S> for StabilizerStrategy {
    type Bot = StabilizerBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run_once(
        &self,
        bot: StabilizerBot,
        ctx: StrategyCtx<'_, S>,
    ) -> Result<(), EngineError> {
        // -------------------- 1. Observe --------------------
        let ticker = match ctx.exchange.ticker(&bot.symbol).await {
            Ok(ticker) => ticker,
            Err(err) => {
                ctx.ring.warning(
                    format!("{}: ticker unavailable: {err}", bot.name),
                    json!({ "botId": bot.id }),
                );
                return Ok(());
            }
        };
        ctx.market.update(&bot.symbol, ticker.last, None);
        ctx.store
            .update_bot::<StabilizerBot>(&bot.id, BotPatch::new().set_now("lastCheckedAt"))
            .await?;

        if ticker.last >= bot.target_price {
            return Ok(());
        }

        // -------------------- 2. Compute Budget --------------------
        let depth = ctx.exchange.depth(&bot.symbol, DEPTH_LEVELS).await?;
        if depth.asks.is_empty() {
            ctx.ring.warning(
                format!("{}: empty ask book, nothing to lift", bot.name),
                json!({ "botId": bot.id }),
            );
            return Ok(());
        }
        let budget = required_budget(&depth.asks, bot.target_price);
        if budget <= 0.0 {
            // Asks exist but all sit above the target; the last trade is
            // just stale
            return Ok(());
        }
        let split = budget / LADDER_ORDERS as f64;
        ctx.store
            .insert_log(
                StabilizerBot::KIND,
                &ActivityLog::new(
                    &bot.id,
                    LogLevel::Calculate,
                    format!(
                        "{}: lifting to {} requires {budget:.4} USDT ({LADDER_ORDERS} x {split:.4})",
                        bot.name, bot.target_price
                    ),
                    json!({ "market": ticker.last, "budget": budget, "split": split }),
                ),
            )
            .await?;

        let balances = ctx.exchange.balances().await?;
        let free = free_balance(&balances, QUOTE_ASSET);
        if free < budget {
            ctx.ring.warning(
                format!(
                    "{}: insufficient {QUOTE_ASSET}: need {budget:.4}, have {free:.4}",
                    bot.name
                ),
                json!({ "botId": bot.id }),
            );
            ctx.store
                .insert_log(
                    StabilizerBot::KIND,
                    &ActivityLog::new(
                        &bot.id,
                        LogLevel::Warning,
                        format!("{}: insufficient balance for stabilization run", bot.name),
                        json!({ "required": budget, "free": free }),
                    ),
                )
                .await?;
            return Ok(());
        }

        // -------------------- 3. Ladder Execution --------------------
        let mut spent = 0.0;
        let mut placed = 0u32;
        for order_number in 1..=LADDER_ORDERS {
            let trade = Trade::new(
                &bot.id,
                &bot.user_id,
                &bot.symbol,
                Side::Buy,
                OrderType::Market,
                split,
            )
            .with_ladder_position(order_number, LADDER_ORDERS);

            match ctx.exchange.place_market_buy_quote(&bot.symbol, split).await {
                Ok(ack) => {
                    placed += 1;
                    spent += split;
                    let trade = trade.succeeded(ack.order_id, ack.raw);
                    ctx.store.insert_trade(StabilizerBot::KIND, &trade).await?;
                    ctx.store
                        .update_bot::<StabilizerBot>(
                            &bot.id,
                            BotPatch::new()
                                .inc("successfulOrders", 1i64)
                                .inc("totalUsdtSpent", split),
                        )
                        .await?;
                }
                Err(err) => {
                    // Abort the remaining ladder on the first failure
                    let trade = trade.failed(json!({ "error": err.to_string() }));
                    ctx.store.insert_trade(StabilizerBot::KIND, &trade).await?;
                    ctx.store
                        .update_bot::<StabilizerBot>(
                            &bot.id,
                            BotPatch::new().inc("failedOrders", 1i64),
                        )
                        .await?;
                    ctx.ring.error(
                        format!(
                            "{}: ladder order {order_number}/{LADDER_ORDERS} failed: {err}",
                            bot.name
                        ),
                        json!({ "botId": bot.id }),
                    );
                    break;
                }
            }

            if order_number < LADDER_ORDERS {
                // Early stop as soon as the market shows the target reached
                if let Ok(check) = ctx.exchange.ticker(&bot.symbol).await {
                    if check.last >= bot.target_price {
                        ctx.ring.info(
                            format!(
                                "{}: target {} reached after order {order_number}, stopping early",
                                bot.name, bot.target_price
                            ),
                            json!({ "botId": bot.id, "market": check.last }),
                        );
                        break;
                    }
                }
                sleep(INTER_LADDER_GAP).await;
            }
        }

        // -------------------- 4. Close Out the Run --------------------
        if placed > 0 {
            ctx.store
                .update_bot::<StabilizerBot>(
                    &bot.id,
                    BotPatch::new()
                        .inc("executionCount", 1i64)
                        .set_now("lastExecutedAt"),
                )
                .await?;
            ctx.store
                .insert_log(
                    StabilizerBot::KIND,
                    &ActivityLog::new(
                        &bot.id,
                        LogLevel::Success,
                        format!(
                            "{}: stabilization run placed {placed} orders, {spent:.4} USDT",
                            bot.name
                        ),
                        json!({ "placed": placed, "spent": spent }),
                    ),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::errors::ExchangeError;
    use crate::modules::exchange::test_support::ScriptedExchange;
    use crate::modules::notifier::test_support::RecordingNotifier;
    use crate::modules::ring_log::RingLog;
    use crate::modules::store::memory::MemoryStore;
    use crate::modules::strategy::MarketCache;
    use crate::modules::types::{PriceLevel, TradeStatus};
    use chrono::Utc;
    use std::sync::Arc;

    fn bot(target: f64) -> StabilizerBot {
        StabilizerBot {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: "hold 0.03".to_string(),
            symbol: "GCBUSDT".to_string(),
            is_active: true,
            is_running: true,
            target_price: target,
            execution_count: 0,
            total_usdt_spent: 0.0,
            successful_orders: 0,
            failed_orders: 0,
            last_executed_at: None,
            last_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Harness {
        store: MemoryStore,
        exchange: Arc<ScriptedExchange>,
        ring: RingLog,
        notifier: RecordingNotifier,
        market: MarketCache,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                store: MemoryStore::new(),
                exchange: Arc::new(ScriptedExchange::new()),
                ring: RingLog::new(100),
                notifier: RecordingNotifier::default(),
                market: MarketCache::new(),
            }
        }

        fn ctx(&self) -> StrategyCtx<'_, MemoryStore> {
            StrategyCtx {
                exchange: self.exchange.clone(),
                store: &self.store,
                ring: &self.ring,
                notifier: &self.notifier,
                market: &self.market,
            }
        }
    }

    #[test]
    fn budget_includes_asks_exactly_at_target() {
        let asks = vec![
            PriceLevel { price: 0.029, qty: 10.0 },
            PriceLevel { price: 0.030, qty: 10.0 },
            PriceLevel { price: 0.031, qty: 5.0 },
        ];
        let budget = required_budget(&asks, 0.030);
        assert!((budget - 0.59).abs() < 1e-12);

        // Single ask sitting exactly at the target must still be consumed
        let single = vec![PriceLevel { price: 0.030, qty: 10.0 }];
        assert!((required_budget(&single, 0.030) - 0.30).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn four_split_run_stops_early_when_target_reached() {
        let h = Harness::new();
        let bot = bot(0.030);
        h.store.put_bot(&bot);
        // Initial read below target, then 0.029 after order 1, then 0.030
        // after order 2 which stops the run
        h.exchange.script_tickers(&[0.028, 0.029, 0.030]);
        h.exchange.set_depth(
            &[],
            &[(0.029, 10.0), (0.030, 10.0), (0.031, 5.0)],
        );
        h.exchange.set_balance(QUOTE_ASSET, 100.0);

        StabilizerStrategy.run_once(bot, h.ctx()).await.unwrap();

        let placements = h.exchange.placements();
        assert_eq!(placements.len(), 2);
        // Budget 0.59 split four ways
        assert!((placements[0].quantity - 0.1475).abs() < 1e-12);

        let trades = h.store.trades_for("s1");
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.status == TradeStatus::Success));
        assert_eq!(trades[0].order_number, Some(1));
        assert_eq!(trades[1].order_number, Some(2));
        assert_eq!(trades[0].total_orders, Some(LADDER_ORDERS));

        let stored: StabilizerBot = h.store.get_bot("s1").await.unwrap().unwrap();
        assert_eq!(stored.successful_orders, 2);
        assert_eq!(stored.execution_count, 1);
        assert!((stored.total_usdt_spent - 0.295).abs() < 1e-9);
        // Total spent can never exceed the full four-way budget
        assert!(stored.total_usdt_spent <= 0.59 + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn run_aborts_on_first_failure() {
        let h = Harness::new();
        let bot = bot(0.030);
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        h.exchange.set_depth(&[], &[(0.029, 10.0)]);
        h.exchange.set_balance(QUOTE_ASSET, 100.0);
        h.exchange
            .fail_next_placement(ExchangeError::Rejected("min notional".into()));

        StabilizerStrategy.run_once(bot, h.ctx()).await.unwrap();

        assert!(h.exchange.placements().is_empty());
        let trades = h.store.trades_for("s1");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Failed);
        let stored: StabilizerBot = h.store.get_bot("s1").await.unwrap().unwrap();
        assert_eq!(stored.failed_orders, 1);
        assert_eq!(stored.execution_count, 0);
    }

    #[tokio::test]
    async fn insufficient_balance_logs_and_exits() {
        let h = Harness::new();
        let bot = bot(0.030);
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        h.exchange.set_depth(&[], &[(0.029, 1000.0)]);
        h.exchange.set_balance(QUOTE_ASSET, 1.0);

        StabilizerStrategy.run_once(bot, h.ctx()).await.unwrap();

        assert!(h.exchange.placements().is_empty());
        let logs = h.store.logs.lock();
        assert!(logs
            .iter()
            .any(|(_, log)| log.level == LogLevel::Warning));
    }

    #[tokio::test]
    async fn at_target_market_does_nothing() {
        let h = Harness::new();
        let bot = bot(0.030);
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.030]);

        StabilizerStrategy.run_once(bot, h.ctx()).await.unwrap();
        assert!(h.exchange.placements().is_empty());
        assert!(h.store.trades_for("s1").is_empty());
    }
}
