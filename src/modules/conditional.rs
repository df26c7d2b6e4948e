use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::modules::bots::{
    ActionField, BotDocument, ConditionAction, ConditionField, ConditionOperator, ConditionalBot,
};
use crate::modules::errors::EngineError;
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{cooldown_elapsed, Strategy, StrategyCtx};
use crate::modules::types::{LogLevel, OrderType, Side, TimeInForce, Trade};

// -------------------- Conditional Trigger Strategy --------------------
// Watches one ticker-derived value against a configured threshold and fires
// a single order when the condition holds and the cooldown has elapsed.

/// Relative tolerance for EQUAL (0.1% of the configured value)
const EQUAL_RELATIVE_TOLERANCE: f64 = 0.001;
/// Absolute tolerance for NOT_EQUAL
const NOT_EQUAL_TOLERANCE: f64 = 1e-4;

pub struct ConditionalStrategy;

fn condition_met(op: ConditionOperator, current: f64, value: f64) -> bool {
    match op {
        ConditionOperator::Above => current > value,
        ConditionOperator::Below => current < value,
        // A zero threshold degrades the tolerance to exact equality
        ConditionOperator::Equal => (current - value).abs() <= EQUAL_RELATIVE_TOLERANCE * value.abs(),
        ConditionOperator::NotEqual => (current - value).abs() > NOT_EQUAL_TOLERANCE,
    }
}

#[async_trait]
impl<S: Store> Strategy<S> for ConditionalStrategy {
    type Bot = ConditionalBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(100)
    }

    async fn run_once(
        &self,
        bot: ConditionalBot,
        ctx: StrategyCtx<'_, S>,
    ) -> Result<(), EngineError> {
        // -------------------- 1. Observe --------------------
        let ticker = match ctx.exchange.ticker(&bot.symbol).await {
            Ok(ticker) => ticker,
            Err(err) => {
                // No market data: stay silent until the next tick
                ctx.ring.warning(
                    format!("{}: ticker unavailable: {err}", bot.name),
                    json!({ "botId": bot.id }),
                );
                return Ok(());
            }
        };
        ctx.market.update(&bot.symbol, ticker.last, None);
        ctx.store
            .update_bot::<ConditionalBot>(&bot.id, BotPatch::new().set_now("lastCheckedAt"))
            .await?;

        let current = match bot.condition_field {
            ConditionField::GcbPrice => ticker.last,
        };

        // -------------------- 2. Decide --------------------
        if !condition_met(bot.condition_operator, current, bot.condition_value) {
            return Ok(());
        }

        // Re-read the bot so a concurrent tick's trigger timestamp is seen
        let fresh = match ctx.store.get_bot::<ConditionalBot>(&bot.id).await? {
            Some(fresh) => fresh,
            None => return Ok(()), // deleted since listing
        };
        if !cooldown_elapsed(fresh.last_triggered_at, fresh.cooldown_seconds) {
            ctx.ring.info(
                format!("{}: condition met but cooling down", bot.name),
                json!({ "botId": bot.id, "current": current }),
            );
            return Ok(());
        }

        // -------------------- 3. Act --------------------
        let (side, order_type, price, quantity, result) = match bot.action_type {
            ConditionAction::MarketBuy => {
                // Market buys are quoted in USDT
                let quote = match bot.action_field {
                    ActionField::UsdtValue => bot.action_value,
                    ActionField::GcbQuantity => bot.action_value * ticker.last,
                };
                let result = ctx.exchange.place_market_buy_quote(&bot.symbol, quote).await;
                (Side::Buy, OrderType::Market, None, quote, result)
            }
            ConditionAction::MarketSell => {
                let qty = match bot.action_field {
                    ActionField::GcbQuantity => bot.action_value,
                    ActionField::UsdtValue => bot.action_value / ticker.last,
                };
                let result = ctx.exchange.place_market_sell(&bot.symbol, qty).await;
                (Side::Sell, OrderType::Market, None, qty, result)
            }
            ConditionAction::LimitBuy | ConditionAction::LimitSell => {
                let side = if bot.action_type == ConditionAction::LimitBuy {
                    Side::Buy
                } else {
                    Side::Sell
                };
                let Some(price) = bot.limit_price else {
                    ctx.ring.error(
                        format!("{}: limit action without limitPrice", bot.name),
                        json!({ "botId": bot.id }),
                    );
                    return Err(EngineError::BadBot {
                        bot_id: bot.id.clone(),
                        reason: "limit action without limitPrice".to_string(),
                    });
                };
                let qty = match bot.action_field {
                    ActionField::GcbQuantity => bot.action_value,
                    ActionField::UsdtValue => bot.action_value / ticker.last,
                };
                let result = ctx
                    .exchange
                    .place_limit(&bot.symbol, side, price, qty, TimeInForce::Gtc)
                    .await;
                (side, OrderType::Limit, Some(price), qty, result)
            }
        };

        // -------------------- 4. Persist Outcome --------------------
        let mut trade = Trade::new(&bot.id, &bot.user_id, &bot.symbol, side, order_type, quantity);
        if let Some(price) = price {
            trade = trade.with_price(price);
        }
        match result {
            Ok(placed) => {
                let trade = trade.succeeded(placed.order_id.clone(), placed.raw);
                ctx.store.insert_trade(ConditionalBot::KIND, &trade).await?;
                ctx.store
                    .update_bot::<ConditionalBot>(
                        &bot.id,
                        BotPatch::new()
                            .set_now("lastTriggeredAt")
                            .inc("triggerCount", 1i64),
                    )
                    .await?;
                ctx.ring.push(
                    LogLevel::Success,
                    format!(
                        "{}: triggered {} at {current} (order {})",
                        bot.name,
                        side,
                        placed.order_id
                    ),
                    json!({ "botId": bot.id, "quantity": quantity }),
                );
                ctx.notifier
                    .notify(&format!(
                        "<b>Conditional bot {}</b> triggered: {side} {quantity} @ market {current}",
                        bot.name
                    ))
                    .await;
            }
            Err(err) => {
                // A failed placement records the attempt but leaves the
                // cooldown untouched so the next tick can retry
                let trade = trade.failed(json!({ "error": err.to_string() }));
                ctx.store.insert_trade(ConditionalBot::KIND, &trade).await?;
                ctx.ring.error(
                    format!("{}: placement failed: {err}", bot.name),
                    json!({ "botId": bot.id }),
                );
            }
        }
        Ok(())
    }
}
