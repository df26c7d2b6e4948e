use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::modules::bots::{BotDocument, PriceGapBot};
use crate::modules::errors::EngineError;
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{cooldown_elapsed, free_balance, Strategy, StrategyCtx};
use crate::modules::types::{LogLevel, OrderType, Side, Trade, QUOTE_ASSET};

// -------------------- Price-Gap Market Buy --------------------
// When the best ask has drifted away from the last trade by more than the
// configured threshold, spend a fixed USDT amount into the gap.

pub struct PriceGapStrategy;

#[async_trait]
impl<S: Store> Strategy<S> for PriceGapStrategy {
    type Bot = PriceGapBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn run_once(&self, bot: PriceGapBot, ctx: StrategyCtx<'_, S>) -> Result<(), EngineError> {
        // -------------------- 1. Cooldown Guard --------------------
        // Re-read the bot so lastExecutedAt is not stale under concurrent
        // ticks
        let fresh = match ctx.store.get_bot::<PriceGapBot>(&bot.id).await? {
            Some(fresh) => fresh,
            None => return Ok(()),
        };
        if !cooldown_elapsed(fresh.last_executed_at, fresh.cooldown_seconds) {
            return Ok(());
        }

        // -------------------- 2. Measure the Gap --------------------
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
        let market = ticker.last;
        let best_ask = match ctx.exchange.best_ask(&bot.symbol).await {
            Ok(ask) => ask,
            Err(err) => {
                ctx.ring.warning(
                    format!("{}: no ask book: {err}", bot.name),
                    json!({ "botId": bot.id }),
                );
                return Ok(());
            }
        };
        let gap = (best_ask - market) / market * 100.0;
        ctx.market.update(&bot.symbol, market, Some(best_ask));

        ctx.store
            .update_bot::<PriceGapBot>(
                &bot.id,
                BotPatch::new()
                    .set("lastMarketPrice", market)
                    .set("lastBestAskPrice", best_ask)
                    .set("lastPriceGap", gap)
                    .set_now("lastCheckedAt"),
            )
            .await?;

        if gap < fresh.gap_threshold {
            return Ok(());
        }
        ctx.ring.push(
            LogLevel::Monitor,
            format!(
                "{}: gap {gap:.2}% >= {:.2}% (market {market}, ask {best_ask})",
                bot.name, fresh.gap_threshold
            ),
            json!({ "botId": bot.id }),
        );

        // -------------------- 3. Funded? --------------------
        let balances = ctx.exchange.balances().await?;
        let free = free_balance(&balances, QUOTE_ASSET);
        if free < fresh.order_amount {
            ctx.ring.warning(
                format!(
                    "{}: gap open but only {free:.2} {QUOTE_ASSET} free (need {:.2})",
                    bot.name, fresh.order_amount
                ),
                json!({ "botId": bot.id }),
            );
            return Ok(());
        }

        // -------------------- 4. Buy Into the Gap --------------------
        let trade = Trade::new(
            &bot.id,
            &bot.user_id,
            &bot.symbol,
            Side::Buy,
            OrderType::Market,
            fresh.order_amount,
        );
        match ctx
            .exchange
            .place_market_buy_quote(&bot.symbol, fresh.order_amount)
            .await
        {
            Ok(placed) => {
                let order_id = placed.order_id.clone();
                ctx.store
                    .insert_trade(PriceGapBot::KIND, &trade.succeeded(placed.order_id, placed.raw))
                    .await?;
                ctx.store
                    .update_bot::<PriceGapBot>(
                        &bot.id,
                        BotPatch::new()
                            .inc("executionCount", 1i64)
                            .inc("totalUsdtSpent", fresh.order_amount)
                            .set_now("lastExecutedAt"),
                    )
                    .await?;
                ctx.ring.push(
                    LogLevel::Success,
                    format!(
                        "{}: bought {:.2} {QUOTE_ASSET} into a {gap:.2}% gap (order {order_id})",
                        bot.name, fresh.order_amount
                    ),
                    json!({ "botId": bot.id }),
                );
                ctx.notifier
                    .notify(&format!(
                        "<b>Price-gap bot {}</b>: {gap:.2}% gap, market buy of {:.2} {QUOTE_ASSET}",
                        bot.name, fresh.order_amount
                    ))
                    .await;
            }
            Err(err) => {
                ctx.store
                    .insert_trade(
                        PriceGapBot::KIND,
                        &trade.failed(json!({ "error": err.to_string() })),
                    )
                    .await?;
                ctx.ring.error(
                    format!("{}: gap buy failed: {err}", bot.name),
                    json!({ "botId": bot.id }),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::exchange::test_support::ScriptedExchange;
    use crate::modules::notifier::test_support::RecordingNotifier;
    use crate::modules::ring_log::RingLog;
    use crate::modules::store::memory::MemoryStore;
    use crate::modules::strategy::MarketCache;
    use crate::modules::types::TradeStatus;
    use chrono::Utc;
    use std::sync::Arc;

    fn bot() -> PriceGapBot {
        PriceGapBot {
            id: "g1".to_string(),
            user_id: "u1".to_string(),
            name: "gap sweeper".to_string(),
            symbol: "GCBUSDT".to_string(),
            is_active: true,
            is_running: true,
            order_amount: 10.0,
            cooldown_seconds: 300,
            gap_threshold: 3.0,
            execution_count: 0,
            total_usdt_spent: 0.0,
            last_executed_at: None,
            last_market_price: None,
            last_best_ask_price: None,
            last_price_gap: None,
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

    #[tokio::test]
    async fn wide_gap_triggers_quote_buy_and_persists_metrics() {
        let h = Harness::new();
        let bot = bot();
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        h.exchange.set_depth(&[(0.0275, 50.0)], &[(0.029, 50.0)]);
        h.exchange.set_balance(QUOTE_ASSET, 100.0);

        PriceGapStrategy.run_once(bot.clone(), h.ctx()).await.unwrap();

        let placements = h.exchange.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].quantity, 10.0);

        let trades = h.store.trades_for("g1");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Success);

        let stored: PriceGapBot = h.store.get_bot("g1").await.unwrap().unwrap();
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.total_usdt_spent, 10.0);
        assert_eq!(stored.last_market_price, Some(0.028));
        assert_eq!(stored.last_best_ask_price, Some(0.029));
        let gap = stored.last_price_gap.unwrap();
        assert!((gap - 3.5714285714).abs() < 1e-6);
        assert!(stored.last_executed_at.is_some());

        // Immediate second tick is inside the cooldown window
        let again: PriceGapBot = h.store.get_bot("g1").await.unwrap().unwrap();
        PriceGapStrategy.run_once(again, h.ctx()).await.unwrap();
        assert_eq!(h.exchange.placements().len(), 1);
    }

    #[tokio::test]
    async fn narrow_gap_only_updates_metrics() {
        let h = Harness::new();
        let bot = bot();
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        h.exchange.set_depth(&[], &[(0.0282, 50.0)]);
        h.exchange.set_balance(QUOTE_ASSET, 100.0);

        PriceGapStrategy.run_once(bot, h.ctx()).await.unwrap();

        assert!(h.exchange.placements().is_empty());
        let stored: PriceGapBot = h.store.get_bot("g1").await.unwrap().unwrap();
        assert!(stored.last_price_gap.unwrap() < 3.0);
        assert!(stored.last_checked_at.is_some());
        assert_eq!(stored.execution_count, 0);
    }

    #[tokio::test]
    async fn unfunded_gap_places_nothing() {
        let h = Harness::new();
        let bot = bot();
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        h.exchange.set_depth(&[], &[(0.030, 50.0)]);
        h.exchange.set_balance(QUOTE_ASSET, 5.0);

        PriceGapStrategy.run_once(bot, h.ctx()).await.unwrap();
        assert!(h.exchange.placements().is_empty());
        assert!(h.store.trades_for("g1").is_empty());
    }

    #[tokio::test]
    async fn empty_book_aborts_quietly() {
        let h = Harness::new();
        let bot = bot();
        h.store.put_bot(&bot);
        h.exchange.script_tickers(&[0.028]);
        // No depth scripted: best_ask fails

        PriceGapStrategy.run_once(bot, h.ctx()).await.unwrap();
        assert!(h.exchange.placements().is_empty());
    }
}
