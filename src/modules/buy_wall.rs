use async_trait::async_trait;
use mongodb::bson;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::modules::bots::{BotDocument, BuyWallBot, PlacedWallOrder, WallOrderStatus};
use crate::modules::errors::{EngineError, StoreError};
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{Strategy, StrategyCtx};
use crate::modules::types::{
    format_decimals, LogLevel, OrderType, Side, TimeInForce, Trade, ACTION_INITIAL_PLACE,
    ACTION_REFILL, ACTION_TOPUP_PARTIAL,
};

// -------------------- Buy Wall Placer / Refiller --------------------
// Phase one lays the configured wall once the market trades at or below the
// target; a store-level compare-and-set makes that transition single-winner
// even across processes. Phase two keeps the wall whole by re-placing filled
// levels and topping up partial fills.

const PLACEMENT_PACING: Duration = Duration::from_millis(500);

pub struct BuyWallStrategy;

fn tracked_patch(tracked: &[PlacedWallOrder]) -> Result<BotPatch, StoreError> {
    let levels = bson::to_bson(tracked)?;
    Ok(BotPatch::new()
        .set("placedOrders", levels)
        .set_now("lastCheckedAt"))
}

#[async_trait]
impl<S: Store> Strategy<S> for BuyWallStrategy {
    type Bot = BuyWallBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn run_once(&self, bot: BuyWallBot, ctx: StrategyCtx<'_, S>) -> Result<(), EngineError> {
        if !bot.orders_placed {
            self.place_wall(bot, ctx).await
        } else {
            self.refill_wall(bot, ctx).await
        }
    }
}

impl BuyWallStrategy {
    async fn place_wall<S: Store>(
        &self,
        bot: BuyWallBot,
        ctx: StrategyCtx<'_, S>,
    ) -> Result<(), EngineError> {
        // -------------------- 1. Entry Condition --------------------
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
        if ticker.last > bot.target_price {
            return Ok(());
        }

        // -------------------- 2. Single-Winner Claim --------------------
        // The CAS must land before any order leaves the process; a losing
        // tick sees ordersPlaced=true and walks away.
        if !ctx
            .store
            .claim_flag::<BuyWallBot>(&bot.id, "ordersPlaced")
            .await?
        {
            ctx.ring.info(
                format!("{}: wall already being placed elsewhere", bot.name),
                json!({ "botId": bot.id }),
            );
            return Ok(());
        }

        // -------------------- 3. Lay the Wall --------------------
        let info = ctx
            .exchange
            .symbol_info(&bot.symbol)
            .await
            .unwrap_or_default();
        let mut tracked: Vec<PlacedWallOrder> = Vec::with_capacity(bot.buy_orders.len());
        for (i, level) in bot.buy_orders.iter().enumerate() {
            if i > 0 {
                sleep(PLACEMENT_PACING).await;
            }
            let qty = format_decimals(level.usdt_amount / level.price, info.quantity_precision);
            let trade = Trade::new(&bot.id, &bot.user_id, &bot.symbol, Side::Buy, OrderType::Limit, qty)
                .with_price(level.price)
                .with_action(ACTION_INITIAL_PLACE);
            match ctx
                .exchange
                .place_limit(&bot.symbol, Side::Buy, level.price, qty, TimeInForce::Gtc)
                .await
            {
                Ok(placed) => {
                    tracked.push(PlacedWallOrder {
                        price: level.price,
                        usdt_amount: level.usdt_amount,
                        order_id: placed.order_id.clone(),
                        gcb_quantity: qty,
                        status: WallOrderStatus::Open,
                    });
                    ctx.store
                        .insert_trade(
                            BuyWallBot::KIND,
                            &trade.succeeded(placed.order_id, placed.raw),
                        )
                        .await?;
                }
                Err(err) => {
                    ctx.store
                        .insert_trade(
                            BuyWallBot::KIND,
                            &trade.failed(json!({ "error": err.to_string() })),
                        )
                        .await?;
                    ctx.ring.error(
                        format!("{}: wall level {} failed: {err}", bot.name, level.price),
                        json!({ "botId": bot.id }),
                    );
                }
            }
        }

        ctx.store
            .update_bot::<BuyWallBot>(&bot.id, tracked_patch(&tracked)?)
            .await?;
        ctx.ring.push(
            LogLevel::Success,
            format!(
                "{}: wall placed, {}/{} levels live",
                bot.name,
                tracked.len(),
                bot.buy_orders.len()
            ),
            json!({ "botId": bot.id }),
        );
        ctx.notifier
            .notify(&format!(
                "<b>Buy wall {}</b> placed {} levels below {}",
                bot.name,
                tracked.len(),
                bot.target_price
            ))
            .await;
        Ok(())
    }

    async fn refill_wall<S: Store>(
        &self,
        bot: BuyWallBot,
        ctx: StrategyCtx<'_, S>,
    ) -> Result<(), EngineError> {
        // -------------------- 1. Compare Book Against Tracked Wall ------
        let open = ctx.exchange.open_orders(&bot.symbol, Some(Side::Buy)).await?;
        let info = ctx
            .exchange
            .symbol_info(&bot.symbol)
            .await
            .unwrap_or_default();

        let mut tracked = bot.placed_orders.clone();
        let mut refills = 0u64;
        let mut topups: Vec<PlacedWallOrder> = Vec::new();

        for entry in tracked.iter_mut() {
            let live = open.iter().find(|o| o.order_id == entry.order_id);
            match live {
                None => {
                    // Fully filled (or gone): re-place the configured level
                    if refills > 0 || !topups.is_empty() {
                        sleep(PLACEMENT_PACING).await;
                    }
                    let qty =
                        format_decimals(entry.usdt_amount / entry.price, info.quantity_precision);
                    let trade = Trade::new(
                        &bot.id,
                        &bot.user_id,
                        &bot.symbol,
                        Side::Buy,
                        OrderType::Limit,
                        qty,
                    )
                    .with_price(entry.price)
                    .with_action(ACTION_REFILL);
                    match ctx
                        .exchange
                        .place_limit(&bot.symbol, Side::Buy, entry.price, qty, TimeInForce::Gtc)
                        .await
                    {
                        Ok(placed) => {
                            entry.order_id = placed.order_id.clone();
                            entry.gcb_quantity = qty;
                            entry.status = WallOrderStatus::Refilled;
                            refills += 1;
                            ctx.store
                                .insert_trade(
                                    BuyWallBot::KIND,
                                    &trade.succeeded(placed.order_id, placed.raw),
                                )
                                .await?;
                        }
                        Err(err) => {
                            ctx.store
                                .insert_trade(
                                    BuyWallBot::KIND,
                                    &trade.failed(json!({ "error": err.to_string() })),
                                )
                                .await?;
                        }
                    }
                }
                Some(order) if order.executed_qty > 0.0 && order.executed_qty < order.orig_qty => {
                    // Partial fill: top up the executed notional at the same
                    // price so the configured depth is restored
                    if refills > 0 || !topups.is_empty() {
                        sleep(PLACEMENT_PACING).await;
                    }
                    let executed_usdt = order.executed_qty * entry.price;
                    let qty = format_decimals(order.executed_qty, info.quantity_precision);
                    if qty <= 0.0 {
                        continue;
                    }
                    let trade = Trade::new(
                        &bot.id,
                        &bot.user_id,
                        &bot.symbol,
                        Side::Buy,
                        OrderType::Limit,
                        qty,
                    )
                    .with_price(entry.price)
                    .with_action(ACTION_TOPUP_PARTIAL);
                    match ctx
                        .exchange
                        .place_limit(&bot.symbol, Side::Buy, entry.price, qty, TimeInForce::Gtc)
                        .await
                    {
                        Ok(placed) => {
                            topups.push(PlacedWallOrder {
                                price: entry.price,
                                usdt_amount: executed_usdt,
                                order_id: placed.order_id.clone(),
                                gcb_quantity: qty,
                                status: WallOrderStatus::Open,
                            });
                            refills += 1;
                            ctx.store
                                .insert_trade(
                                    BuyWallBot::KIND,
                                    &trade.succeeded(placed.order_id, placed.raw),
                                )
                                .await?;
                        }
                        Err(err) => {
                            ctx.store
                                .insert_trade(
                                    BuyWallBot::KIND,
                                    &trade.failed(json!({ "error": err.to_string() })),
                                )
                                .await?;
                        }
                    }
                }
                Some(_) => {} // untouched, leave it
            }
        }

        // -------------------- 2. Persist the Updated Wall --------------------
        tracked.extend(topups);
        let mut patch = tracked_patch(&tracked)?;
        if refills > 0 {
            patch = patch.inc("totalRefills", refills as i64);
            ctx.ring.info(
                format!("{}: {refills} wall orders restored", bot.name),
                json!({ "botId": bot.id }),
            );
        }
        ctx.store.update_bot::<BuyWallBot>(&bot.id, patch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::bots::BuyWallLevel;
    use crate::modules::exchange::test_support::ScriptedExchange;
    use crate::modules::notifier::test_support::RecordingNotifier;
    use crate::modules::ring_log::RingLog;
    use crate::modules::store::memory::MemoryStore;
    use crate::modules::strategy::MarketCache;
    use crate::modules::types::{OpenOrder, TradeStatus};
    use chrono::Utc;
    use std::sync::Arc;

    fn bot() -> BuyWallBot {
        BuyWallBot {
            id: "w1".to_string(),
            user_id: "u1".to_string(),
            name: "wall".to_string(),
            symbol: "GCBUSDT".to_string(),
            is_active: true,
            is_running: true,
            target_price: 0.03,
            buy_orders: vec![
                BuyWallLevel { price: 0.020, usdt_amount: 50.0 },
                BuyWallLevel { price: 0.019, usdt_amount: 47.5 },
            ],
            orders_placed: false,
            placed_orders: Vec::new(),
            total_refills: 0,
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

    #[tokio::test(start_paused = true)]
    async fn placement_is_single_winner_under_race() {
        let h = Harness::new();
        let stale = bot();
        h.store.put_bot(&stale);
        h.exchange.script_tickers(&[0.028]);

        // Two ticks observed the same stale document; only the CAS winner
        // may place the wall
        BuyWallStrategy.run_once(stale.clone(), h.ctx()).await.unwrap();
        BuyWallStrategy.run_once(stale, h.ctx()).await.unwrap();

        let placements = h.exchange.placements();
        assert_eq!(placements.len(), 2); // one per configured level, once
        // 50 USDT at 0.020 -> 2500 GCB
        assert_eq!(placements[0].quantity, 2500.0);
        assert_eq!(placements[1].quantity, 2500.0);

        let initial_places: Vec<_> = h
            .store
            .trades_for("w1")
            .into_iter()
            .filter(|t| t.action.as_deref() == Some(ACTION_INITIAL_PLACE))
            .collect();
        assert_eq!(initial_places.len(), 2);

        let stored: BuyWallBot = h.store.get_bot("w1").await.unwrap().unwrap();
        assert!(stored.orders_placed);
        assert_eq!(stored.placed_orders.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn above_target_market_places_nothing() {
        let h = Harness::new();
        let stale = bot();
        h.store.put_bot(&stale);
        h.exchange.script_tickers(&[0.035]);

        BuyWallStrategy.run_once(stale, h.ctx()).await.unwrap();
        assert!(h.exchange.placements().is_empty());
        let stored: BuyWallBot = h.store.get_bot("w1").await.unwrap().unwrap();
        assert!(!stored.orders_placed);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_replaces_filled_and_tops_up_partials() {
        let h = Harness::new();
        let mut placed = bot();
        placed.orders_placed = true;
        placed.placed_orders = vec![
            PlacedWallOrder {
                price: 0.020,
                usdt_amount: 50.0,
                order_id: "101".to_string(),
                gcb_quantity: 2500.0,
                status: WallOrderStatus::Open,
            },
            PlacedWallOrder {
                price: 0.019,
                usdt_amount: 47.5,
                order_id: "102".to_string(),
                gcb_quantity: 2500.0,
                status: WallOrderStatus::Open,
            },
        ];
        h.store.put_bot(&placed);
        // Order 101 is gone (fully filled); 102 is partially filled
        h.exchange.set_open_orders(vec![OpenOrder {
            order_id: "102".to_string(),
            symbol: "GCBUSDT".to_string(),
            side: Side::Buy,
            price: 0.019,
            orig_qty: 2500.0,
            executed_qty: 1000.0,
        }]);

        BuyWallStrategy.run_once(placed, h.ctx()).await.unwrap();

        let placements = h.exchange.placements();
        assert_eq!(placements.len(), 2);
        // Refill restores the configured 50 USDT level
        assert_eq!(placements[0].price, Some(0.020));
        assert_eq!(placements[0].quantity, 2500.0);
        // Top-up restores the executed 1000 GCB at the same price
        assert_eq!(placements[1].price, Some(0.019));
        assert_eq!(placements[1].quantity, 1000.0);

        let trades = h.store.trades_for("w1");
        let actions: Vec<_> = trades.iter().filter_map(|t| t.action.clone()).collect();
        assert!(actions.contains(&ACTION_REFILL.to_string()));
        assert!(actions.contains(&ACTION_TOPUP_PARTIAL.to_string()));
        assert!(trades.iter().all(|t| t.status == TradeStatus::Success));

        let stored: BuyWallBot = h.store.get_bot("w1").await.unwrap().unwrap();
        assert_eq!(stored.total_refills, 2);
        // Original two tracked levels plus the top-up entry
        assert_eq!(stored.placed_orders.len(), 3);
        assert!(stored
            .placed_orders
            .iter()
            .any(|o| o.status == WallOrderStatus::Refilled));
    }

    #[tokio::test(start_paused = true)]
    async fn untouched_wall_is_left_alone() {
        let h = Harness::new();
        let mut placed = bot();
        placed.orders_placed = true;
        placed.placed_orders = vec![PlacedWallOrder {
            price: 0.020,
            usdt_amount: 50.0,
            order_id: "101".to_string(),
            gcb_quantity: 2500.0,
            status: WallOrderStatus::Open,
        }];
        h.store.put_bot(&placed);
        h.exchange.set_open_orders(vec![OpenOrder {
            order_id: "101".to_string(),
            symbol: "GCBUSDT".to_string(),
            side: Side::Buy,
            price: 0.020,
            orig_qty: 2500.0,
            executed_qty: 0.0,
        }]);

        BuyWallStrategy.run_once(placed, h.ctx()).await.unwrap();
        assert!(h.exchange.placements().is_empty());
        let stored: BuyWallBot = h.store.get_bot("w1").await.unwrap().unwrap();
        assert_eq!(stored.total_refills, 0);
    }
}
