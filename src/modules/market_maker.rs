use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::modules::bots::{BotDocument, MarketMakerBot};
use crate::modules::errors::EngineError;
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{free_balance, Strategy, StrategyCtx};
use crate::modules::types::{
    format_decimals, LogLevel, OrderType, Side, TimeInForce, Trade, BASE_ASSET, QUOTE_ASSET,
};

// -------------------- Oscillating-Ladder Market Maker --------------------
// Requotes a symmetric bid/ask pair around the market every cycle, walking
// the order size between 40% and 90% of the configured initial size so the
// book never shows a constant clip.

const SIZE_DECAY: f64 = 0.97;
const SIZE_GROWTH: f64 = 1.03;
const SIZE_FLOOR_RATIO: f64 = 0.40;
const SIZE_CEIL_RATIO: f64 = 0.90;

/// Wait after cancel-all before verifying the book is clear
const CANCEL_SETTLE: Duration = Duration::from_secs(4);
/// Gap between the sell and buy placements of one cycle
const PLACEMENT_GAP: Duration = Duration::from_secs(2);

pub struct MarketMakerStrategy;

/// Next clip size with clamping to [40%, 90%] of the initial size; the
/// direction flips exactly on a boundary touch. Sizes are compared at the
/// symbol's quantity precision so a near-miss like 40.0028 still lands on
/// the floor.
fn oscillate(
    current: f64,
    initial: f64,
    is_decreasing: bool,
    quantity_precision: u32,
) -> (f64, bool) {
    let floor = initial * SIZE_FLOOR_RATIO;
    let ceil = initial * SIZE_CEIL_RATIO;
    let factor = if is_decreasing { SIZE_DECAY } else { SIZE_GROWTH };
    let next = format_decimals(current * factor, quantity_precision);
    if next <= floor {
        (floor, false)
    } else if next >= ceil {
        (ceil, true)
    } else {
        (next, is_decreasing)
    }
}

#[async_trait]
impl<S: Store> Strategy<S> for MarketMakerStrategy {
    type Bot = MarketMakerBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn run_once(
        &self,
        bot: MarketMakerBot,
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
        let market = ticker.last;
        ctx.market.update(&bot.symbol, market, None);
        ctx.store
            .update_bot::<MarketMakerBot>(&bot.id, BotPatch::new().set_now("lastCheckedAt"))
            .await?;

        // -------------------- 2. Target Check --------------------
        if market >= bot.target_price && !bot.target_reached {
            let cancelled = ctx.exchange.cancel_all(&bot.symbol, None).await?;
            ctx.store
                .update_bot::<MarketMakerBot>(
                    &bot.id,
                    BotPatch::new()
                        .set("targetReached", true)
                        .set("isRunning", false),
                )
                .await?;
            ctx.ring.push(
                LogLevel::Success,
                format!(
                    "{}: target {} reached at {market}, retiring ({cancelled} orders cancelled)",
                    bot.name, bot.target_price
                ),
                json!({ "botId": bot.id }),
            );
            ctx.notifier
                .notify(&format!(
                    "<b>Market maker {}</b> reached target {} (market {market}) and stopped",
                    bot.name, bot.target_price
                ))
                .await;
            return Ok(());
        }

        // -------------------- 3. Clear the Previous Ladder --------------------
        ctx.exchange.cancel_all(&bot.symbol, None).await?;
        sleep(CANCEL_SETTLE).await;
        let remaining = ctx.exchange.open_orders(&bot.symbol, None).await?;
        if !remaining.is_empty() {
            // Exchange has not settled the cancels yet; try again next tick
            ctx.ring.warning(
                format!(
                    "{}: {} orders still open after cancel, skipping cycle",
                    bot.name,
                    remaining.len()
                ),
                json!({ "botId": bot.id }),
            );
            return Ok(());
        }

        // -------------------- 4. Requote Both Sides --------------------
        let bid = market * (1.0 - bot.spread_percent);
        let ask = market * (1.0 + bot.spread_percent);
        let size = bot.current_order_size;
        let balances = ctx.exchange.balances().await?;

        if free_balance(&balances, BASE_ASSET) >= size {
            let trade = Trade::new(&bot.id, &bot.user_id, &bot.symbol, Side::Sell, OrderType::Limit, size)
                .with_price(ask);
            match ctx
                .exchange
                .place_limit(&bot.symbol, Side::Sell, ask, size, TimeInForce::Gtc)
                .await
            {
                Ok(placed) => {
                    ctx.store
                        .insert_trade(
                            MarketMakerBot::KIND,
                            &trade.succeeded(placed.order_id, placed.raw),
                        )
                        .await?;
                }
                Err(err) => {
                    ctx.store
                        .insert_trade(
                            MarketMakerBot::KIND,
                            &trade.failed(json!({ "error": err.to_string() })),
                        )
                        .await?;
                }
            }
            sleep(PLACEMENT_GAP).await;
        }

        if free_balance(&balances, QUOTE_ASSET) >= bid * size {
            let trade = Trade::new(&bot.id, &bot.user_id, &bot.symbol, Side::Buy, OrderType::Limit, size)
                .with_price(bid);
            match ctx
                .exchange
                .place_limit(&bot.symbol, Side::Buy, bid, size, TimeInForce::Gtc)
                .await
            {
                Ok(placed) => {
                    ctx.store
                        .insert_trade(
                            MarketMakerBot::KIND,
                            &trade.succeeded(placed.order_id, placed.raw),
                        )
                        .await?;
                }
                Err(err) => {
                    ctx.store
                        .insert_trade(
                            MarketMakerBot::KIND,
                            &trade.failed(json!({ "error": err.to_string() })),
                        )
                        .await?;
                }
            }
        }

        // -------------------- 5. Walk the Clip Size --------------------
        let info = ctx
            .exchange
            .symbol_info(&bot.symbol)
            .await
            .unwrap_or_default();
        let (next_size, next_decreasing) = oscillate(
            bot.current_order_size,
            bot.initial_order_size,
            bot.is_decreasing,
            info.quantity_precision,
        );
        ctx.store
            .update_bot::<MarketMakerBot>(
                &bot.id,
                BotPatch::new()
                    .set("currentOrderSize", next_size)
                    .set("isDecreasing", next_decreasing)
                    .inc("executionCount", 1i64)
                    .set_now("lastExecutedAt"),
            )
            .await?;
        ctx.ring.info(
            format!(
                "{}: requoted {bid:.6}/{ask:.6}, next size {next_size}",
                bot.name
            ),
            json!({ "botId": bot.id, "size": size }),
        );
        Ok(())
    }
}
