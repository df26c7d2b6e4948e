use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;

use crate::modules::bots::{BotDocument, LiquidityBot, LiquiditySnapshot};
use crate::modules::errors::{EngineError, StoreError};
use crate::modules::store::{BotPatch, Store};
use crate::modules::strategy::{cooldown_elapsed, free_balance, Strategy, StrategyCtx};
use crate::modules::types::{
    format_decimals, ActivityLog, LogLevel, OpenOrder, OrderSpec, OrderType, PriceLevel, Side,
    SymbolInfo, Trade, BASE_ASSET, QUOTE_ASSET,
};

// -------------------- Liquidity Requirement Provider --------------------
// Measures the book against depth/spread/count/gap requirements, prunes and
// tightens its own orders, then fills the deficits with weighted-random
// ladders in two price zones.

/// Inner zone half-width (2% around mid)
const ZONE1_EDGE: f64 = 0.02;
/// Offset of the innermost generated order from mid
const ZONE1_INNER_OFFSET: f64 = 0.004;
/// Outer zone boundary (10% from mid)
const ZONE2_EDGE: f64 = 0.10;
/// Geometric step between outer-zone levels
const ZONE2_STEP: f64 = 0.005;
/// Per-zone order cap
const ZONE_MAX_ORDERS: usize = 10;
/// Book levels fetched for analysis
const ANALYSIS_DEPTH: usize = 100;
/// Levels participating in depth/gap checks
const TOP_LEVELS: usize = 20;
/// Relaxed per-side target when the market already carries orders
const RELAXED_ORDER_COUNT: usize = 20;
/// Market order count at which the relaxed target applies
const RELAXATION_THRESHOLD: usize = 10;
/// Maximum spread-tightening cancels per side per run
const MAX_TIGHTEN_CANCELS: usize = 3;
/// Stale-order bounds relative to mid
const BID_PRUNE_LOW: f64 = 0.75;
const BID_PRUNE_HIGH: f64 = 1.02;
const ASK_PRUNE_LOW: f64 = 0.98;
const ASK_PRUNE_HIGH: f64 = 1.25;
/// Minimum notional for a residual-sized buy order
const MIN_RESIDUAL_BUY_VALUE: f64 = 0.50;
/// Minimum quantity for a residual-sized sell order
const MIN_RESIDUAL_SELL_QTY: f64 = 0.5;
/// Orders per submission batch
const BATCH_SIZE: usize = 10;
const INTER_BATCH_PACING: Duration = Duration::from_millis(500);

pub struct LiquidityStrategy;

// -------------------- Book Analysis --------------------

#[derive(Clone, Copy, Debug, Default)]
struct SideMetrics {
    depth_2pct: f64,
    depth_top20: f64,
    count: usize,
    worst_gap: f64,
}

fn depth_within(levels: &[PriceLevel], low: f64, high: f64) -> f64 {
    levels
        .iter()
        .filter(|l| l.price >= low && l.price <= high)
        .map(|l| l.notional())
        .sum()
}

fn top_n_depth(levels: &[PriceLevel], n: usize) -> f64 {
    levels.iter().take(n).map(|l| l.notional()).sum()
}

/// Worst relative gap (percent) between adjacent levels of the top 20.
/// Levels must already be sorted away from mid (bids descending, asks
/// ascending).
fn worst_adjacent_gap(levels: &[PriceLevel], side: Side) -> f64 {
    let mut worst: f64 = 0.0;
    for pair in levels.iter().take(TOP_LEVELS).collect::<Vec<_>>().windows(2) {
        let gap = match side {
            Side::Buy => (pair[0].price - pair[1].price) / pair[0].price,
            Side::Sell => (pair[1].price - pair[0].price) / pair[0].price,
        };
        worst = worst.max(gap * 100.0);
    }
    worst
}

fn side_metrics(levels: &[PriceLevel], mid: f64, side: Side) -> SideMetrics {
    let (low, high) = match side {
        Side::Buy => (mid * (1.0 - ZONE1_EDGE), mid),
        Side::Sell => (mid, mid * (1.0 + ZONE1_EDGE)),
    };
    SideMetrics {
        depth_2pct: depth_within(levels, low, high),
        depth_top20: top_n_depth(levels, TOP_LEVELS),
        count: levels.len(),
        worst_gap: worst_adjacent_gap(levels, side),
    }
}

fn top_of_book_spread(best_bid: f64, best_ask: f64) -> f64 {
    let mid = (best_bid + best_ask) / 2.0;
    (best_ask - best_bid) / mid * 100.0
}

// -------------------- Order Generation --------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Zone {
    Inner,
    Outer,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    price: f64,
    quote_amount: f64,
}

fn zone_prices(side: Side, mid: f64, zone: Zone, n: usize) -> Vec<f64> {
    let mut prices = Vec::with_capacity(n);
    match zone {
        Zone::Inner => {
            // Linear walk from just off mid to the 2% edge
            let (start, end) = match side {
                Side::Buy => (mid * (1.0 - ZONE1_INNER_OFFSET), mid * (1.0 - ZONE1_EDGE)),
                Side::Sell => (mid * (1.0 + ZONE1_INNER_OFFSET), mid * (1.0 + ZONE1_EDGE)),
            };
            for i in 0..n {
                let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
                prices.push(start + (end - start) * t);
            }
        }
        Zone::Outer => {
            // Geometric walk outward from the 2% edge to the 10% boundary
            let (mut price, factor, boundary) = match side {
                Side::Buy => (
                    mid * (1.0 - ZONE1_EDGE),
                    1.0 - ZONE2_STEP,
                    mid * (1.0 - ZONE2_EDGE),
                ),
                Side::Sell => (
                    mid * (1.0 + ZONE1_EDGE),
                    1.0 + ZONE2_STEP,
                    mid * (1.0 + ZONE2_EDGE),
                ),
            };
            for _ in 0..n {
                price *= factor;
                let inside = match side {
                    Side::Buy => price >= boundary,
                    Side::Sell => price <= boundary,
                };
                if !inside {
                    break;
                }
                prices.push(price);
            }
        }
    }
    prices
}

/// Split a zone budget over its price levels with a random weight in
/// [0.5, 1.5) per order, skipping prices the user already quotes.
fn generate_zone<R: Rng>(
    side: Side,
    mid: f64,
    zone: Zone,
    budget: f64,
    held: &HashSet<String>,
    info: &SymbolInfo,
    rng: &mut R,
) -> Vec<Candidate> {
    if budget <= 0.0 {
        return Vec::new();
    }
    let prices: Vec<f64> = zone_prices(side, mid, zone, ZONE_MAX_ORDERS)
        .into_iter()
        .map(|p| format_decimals(p, info.price_precision))
        .filter(|p| *p > 0.0 && !held.contains(&price_key(*p, info)))
        .collect();
    if prices.is_empty() {
        return Vec::new();
    }
    let weights: Vec<f64> = prices.iter().map(|_| rng.random_range(0.5..1.5)).collect();
    let total: f64 = weights.iter().sum();
    prices
        .iter()
        .zip(weights)
        .map(|(price, w)| Candidate {
            price: *price,
            quote_amount: budget * w / total,
        })
        .collect()
}

fn price_key(price: f64, info: &SymbolInfo) -> String {
    format!("{:.*}", info.price_precision as usize, price)
}

/// Greedy budget trim: candidates arrive closest-to-mid first; the last
/// order shrinks to the residual budget when it stays above the side's
/// minimum, everything past it is dropped.
fn trim_to_budget(
    candidates: Vec<Candidate>,
    side: Side,
    available: f64,
    info: &SymbolInfo,
) -> Vec<OrderSpec> {
    let mut out = Vec::new();
    let mut remaining = available;
    for candidate in candidates {
        let qty = format_decimals(candidate.quote_amount / candidate.price, info.quantity_precision);
        if qty < info.min_quantity {
            continue;
        }
        // Cost of this order in the side's spend currency
        let cost = match side {
            Side::Buy => candidate.quote_amount,
            Side::Sell => qty,
        };
        if cost <= remaining {
            remaining -= cost;
            out.push(spec(side, candidate.price, qty));
            continue;
        }
        // Residual-size the final order if it is still worth placing
        match side {
            Side::Buy => {
                if remaining >= MIN_RESIDUAL_BUY_VALUE {
                    let qty = format_decimals(remaining / candidate.price, info.quantity_precision);
                    if qty >= info.min_quantity {
                        out.push(spec(side, candidate.price, qty));
                    }
                }
            }
            Side::Sell => {
                let qty = format_decimals(remaining, info.quantity_precision);
                if qty >= MIN_RESIDUAL_SELL_QTY && qty >= info.min_quantity {
                    out.push(spec(side, candidate.price, qty));
                }
            }
        }
        break;
    }
    out
}

fn spec(side: Side, price: f64, qty: f64) -> OrderSpec {
    OrderSpec {
        symbol: String::new(), // filled in at submission
        side,
        order_type: OrderType::Limit,
        price: Some(price),
        quantity: qty,
    }
}

#[async_trait]
impl<S: Store> Strategy<S> for LiquidityStrategy {
    type Bot = LiquidityBot;

    fn default_interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run_once(&self, bot: LiquidityBot, ctx: StrategyCtx<'_, S>) -> Result<(), EngineError> {
        // Per-bot cadence rides on top of the runner tick
        if !cooldown_elapsed(bot.last_checked_at, bot.check_interval_seconds) {
            return Ok(());
        }
        self.maintain(bot, ctx, false).await
    }
}

impl LiquidityStrategy {
    /// Bypass the cadence and run one maintenance pass with auto-manage
    /// forced on.
    pub async fn force_adjust<S: Store>(
        &self,
        bot_id: &str,
        ctx: StrategyCtx<'_, S>,
    ) -> Result<(), EngineError> {
        let Some(bot) = ctx.store.get_bot::<LiquidityBot>(bot_id).await? else {
            return Err(EngineError::Store(StoreError::NotFound(bot_id.to_string())));
        };
        self.maintain(bot, ctx, true).await
    }

    async fn maintain<S: Store>(
        &self,
        bot: LiquidityBot,
        ctx: StrategyCtx<'_, S>,
        force: bool,
    ) -> Result<(), EngineError> {
        let auto_manage = bot.auto_manage || force;
        let scale = bot.scale_factor.max(0.0);

        // -------------------- 1. Observe --------------------
        let depth = ctx.exchange.depth(&bot.symbol, ANALYSIS_DEPTH).await?;
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
        let mid = ticker.last;
        if mid <= 0.0 || (depth.bids.is_empty() && depth.asks.is_empty()) {
            ctx.ring.warning(
                format!("{}: book is empty, skipping analysis", bot.name),
                json!({ "botId": bot.id }),
            );
            return Ok(());
        }
        ctx.market.update(&bot.symbol, mid, depth.best_ask());
        let info = ctx
            .exchange
            .symbol_info(&bot.symbol)
            .await
            .unwrap_or_default();
        let open = ctx.exchange.open_orders(&bot.symbol, None).await?;
        let (own_bids, own_asks): (Vec<OpenOrder>, Vec<OpenOrder>) =
            open.into_iter().partition(|o| o.side == Side::Buy);

        // -------------------- 2. Analyze the Market --------------------
        let bid_metrics = side_metrics(&depth.bids, mid, Side::Buy);
        let ask_metrics = side_metrics(&depth.asks, mid, Side::Sell);
        let spread = match (depth.best_bid(), depth.best_ask()) {
            (Some(bid), Some(ask)) => top_of_book_spread(bid, ask),
            _ => f64::MAX,
        };
        let spread_ok = spread < bot.max_spread;

        let min_depth_2 = bot.min_depth_2_percent * scale;
        let min_top20 = bot.min_depth_top20 * scale;

        let mut warnings = Vec::new();
        if !spread_ok {
            warnings.push(format!("spread {spread:.3}% above {:.3}%", bot.max_spread));
        }
        if bid_metrics.depth_2pct < min_depth_2 {
            warnings.push(format!(
                "bid depth +-2% {:.2} below {min_depth_2:.2}",
                bid_metrics.depth_2pct
            ));
        }
        if ask_metrics.depth_2pct < min_depth_2 {
            warnings.push(format!(
                "ask depth +-2% {:.2} below {min_depth_2:.2}",
                ask_metrics.depth_2pct
            ));
        }
        if bid_metrics.depth_top20 < min_top20 {
            warnings.push(format!(
                "bid top-20 depth {:.2} below {min_top20:.2}",
                bid_metrics.depth_top20
            ));
        }
        if ask_metrics.depth_top20 < min_top20 {
            warnings.push(format!(
                "ask top-20 depth {:.2} below {min_top20:.2}",
                ask_metrics.depth_top20
            ));
        }
        if bid_metrics.count < bot.min_order_count {
            warnings.push(format!(
                "bid count {} below {}",
                bid_metrics.count, bot.min_order_count
            ));
        }
        if ask_metrics.count < bot.min_order_count {
            warnings.push(format!(
                "ask count {} below {}",
                ask_metrics.count, bot.min_order_count
            ));
        }
        if bid_metrics.worst_gap > bot.max_order_gap {
            warnings.push(format!(
                "bid gap {:.3}% above {:.3}%",
                bid_metrics.worst_gap, bot.max_order_gap
            ));
        }
        if ask_metrics.worst_gap > bot.max_order_gap {
            warnings.push(format!(
                "ask gap {:.3}% above {:.3}%",
                ask_metrics.worst_gap, bot.max_order_gap
            ));
        }

        // -------------------- 3. Analyze Our Contribution --------------------
        let own_bid_levels: Vec<PriceLevel> = sorted_levels(&own_bids, Side::Buy);
        let own_ask_levels: Vec<PriceLevel> = sorted_levels(&own_asks, Side::Sell);
        let own_bid_metrics = side_metrics(&own_bid_levels, mid, Side::Buy);
        let own_ask_metrics = side_metrics(&own_ask_levels, mid, Side::Sell);
        if own_bid_metrics.worst_gap > bot.max_order_gap {
            warnings.push(format!(
                "own bid ladder gap {:.3}% above {:.3}%",
                own_bid_metrics.worst_gap, bot.max_order_gap
            ));
        }
        if own_ask_metrics.worst_gap > bot.max_order_gap {
            warnings.push(format!(
                "own ask ladder gap {:.3}% above {:.3}%",
                own_ask_metrics.worst_gap, bot.max_order_gap
            ));
        }

        let snapshot = LiquiditySnapshot {
            mid_price: mid,
            spread_percent: if spread == f64::MAX { 0.0 } else { spread },
            spread_ok,
            bid_depth_2pct: bid_metrics.depth_2pct,
            ask_depth_2pct: ask_metrics.depth_2pct,
            bid_depth_top20: bid_metrics.depth_top20,
            ask_depth_top20: ask_metrics.depth_top20,
            bid_order_count: bid_metrics.count,
            ask_order_count: ask_metrics.count,
            own_bid_depth_2pct: own_bid_metrics.depth_2pct,
            own_ask_depth_2pct: own_ask_metrics.depth_2pct,
            own_bid_count: own_bids.len(),
            own_ask_count: own_asks.len(),
            warnings: warnings.clone(),
        };
        let snapshot_bson =
            mongodb::bson::to_bson(&snapshot).map_err(StoreError::from)?;
        ctx.store
            .update_bot::<LiquidityBot>(
                &bot.id,
                BotPatch::new()
                    .set("lastSnapshot", snapshot_bson)
                    .set_now("lastCheckedAt"),
            )
            .await?;

        // -------------------- 4. Monitor-Only Exit --------------------
        if !auto_manage {
            ctx.store
                .insert_log(
                    LiquidityBot::KIND,
                    &ActivityLog::new(
                        &bot.id,
                        LogLevel::Monitor,
                        format!(
                            "{}: monitored, {} warning(s), autoManage off",
                            bot.name,
                            warnings.len()
                        ),
                        json!({ "warnings": warnings }),
                    ),
                )
                .await?;
            return Ok(());
        }

        // -------------------- 5. Prune Stale Own Orders --------------------
        for order in own_bids
            .iter()
            .filter(|o| o.price < mid * BID_PRUNE_LOW || o.price > mid * BID_PRUNE_HIGH)
            .chain(
                own_asks
                    .iter()
                    .filter(|o| o.price < mid * ASK_PRUNE_LOW || o.price > mid * ASK_PRUNE_HIGH),
            )
        {
            if let Err(err) = ctx.exchange.cancel_order(&bot.symbol, &order.order_id).await {
                ctx.ring.warning(
                    format!("{}: stale cancel {} failed: {err}", bot.name, order.order_id),
                    json!({ "botId": bot.id }),
                );
            }
        }

        // -------------------- 6. Per-Side Order Targets --------------------
        let bid_target = if bid_metrics.count >= RELAXATION_THRESHOLD {
            bot.min_order_count.min(RELAXED_ORDER_COUNT)
        } else {
            bot.min_order_count
        };
        let ask_target = if ask_metrics.count >= RELAXATION_THRESHOLD {
            bot.min_order_count.min(RELAXED_ORDER_COUNT)
        } else {
            bot.min_order_count
        };

        // -------------------- 7. Tighten a Violated Spread --------------------
        if !spread_ok {
            if own_bids.len() >= bid_target {
                let boundary = mid * (1.0 - bot.max_spread / 200.0) * 0.99;
                let mut far: Vec<&OpenOrder> =
                    own_bids.iter().filter(|o| o.price < boundary).collect();
                far.sort_by(|a, b| a.price.total_cmp(&b.price));
                for order in far.into_iter().take(MAX_TIGHTEN_CANCELS) {
                    let _ = ctx.exchange.cancel_order(&bot.symbol, &order.order_id).await;
                }
            }
            if own_asks.len() >= ask_target {
                let boundary = mid * (1.0 + bot.max_spread / 200.0) * 1.01;
                let mut far: Vec<&OpenOrder> =
                    own_asks.iter().filter(|o| o.price > boundary).collect();
                far.sort_by(|a, b| b.price.total_cmp(&a.price));
                for order in far.into_iter().take(MAX_TIGHTEN_CANCELS) {
                    let _ = ctx.exchange.cancel_order(&bot.symbol, &order.order_id).await;
                }
            }
        }

        // -------------------- 8. Generate the Deficit --------------------
        let held_bids: HashSet<String> =
            own_bids.iter().map(|o| price_key(o.price, &info)).collect();
        let held_asks: HashSet<String> =
            own_asks.iter().map(|o| price_key(o.price, &info)).collect();
        // StdRng rather than the thread-local handle: this future is held
        // across awaits inside a spawned task
        let mut rng = StdRng::from_os_rng();

        let balances = ctx.exchange.balances().await?;
        let quote_free = free_balance(&balances, QUOTE_ASSET);
        let base_free = free_balance(&balances, BASE_ASSET);

        let mut placed = 0u64;
        for (side, metrics, held, available, target) in [
            (Side::Buy, bid_metrics, &held_bids, quote_free, bid_target),
            (Side::Sell, ask_metrics, &held_asks, base_free, ask_target),
        ] {
            let needs_depth = metrics.depth_2pct < min_depth_2
                || metrics.depth_top20 < min_top20;
            let needs_count = metrics.count < target;
            if !needs_depth && !needs_count {
                continue;
            }

            let inner_budget = (min_depth_2 - metrics.depth_2pct).max(0.0);
            let outer_existing = (metrics.depth_top20 - metrics.depth_2pct).max(0.0);
            let outer_budget = ((min_top20 - min_depth_2) - outer_existing).max(0.0);

            let mut candidates =
                generate_zone(side, mid, Zone::Inner, inner_budget, held, &info, &mut rng);
            candidates.extend(generate_zone(
                side,
                mid,
                Zone::Outer,
                outer_budget,
                held,
                &info,
                &mut rng,
            ));
            let mut specs = trim_to_budget(candidates, side, available, &info);
            for spec in specs.iter_mut() {
                spec.symbol = bot.symbol.clone();
            }
            if specs.is_empty() {
                continue;
            }

            // -------------------- 9. Submit in Paced Batches --------------------
            for (i, batch) in specs.chunks(BATCH_SIZE).enumerate() {
                if i > 0 {
                    sleep(INTER_BATCH_PACING).await;
                }
                let results = ctx.exchange.place_batch(batch).await;
                for (spec, result) in batch.iter().zip(results) {
                    let trade = Trade::new(
                        &bot.id,
                        &bot.user_id,
                        &bot.symbol,
                        spec.side,
                        spec.order_type,
                        spec.quantity,
                    )
                    .with_price(spec.price.unwrap_or_default());
                    match result {
                        Ok(ack) => {
                            placed += 1;
                            ctx.store
                                .insert_trade(
                                    LiquidityBot::KIND,
                                    &trade.succeeded(ack.order_id, ack.raw),
                                )
                                .await?;
                        }
                        Err(err) => {
                            ctx.store
                                .insert_trade(
                                    LiquidityBot::KIND,
                                    &trade.failed(json!({ "error": err.to_string() })),
                                )
                                .await?;
                        }
                    }
                }
            }
        }

        // -------------------- 10. Close Out --------------------
        ctx.store
            .insert_log(
                LiquidityBot::KIND,
                &ActivityLog::new(
                    &bot.id,
                    LogLevel::Liquidity,
                    format!(
                        "{}: maintenance placed {placed} orders, {} warning(s)",
                        bot.name,
                        warnings.len()
                    ),
                    json!({ "placed": placed, "warnings": warnings, "mid": mid }),
                ),
            )
            .await?;
        ctx.store
            .update_bot::<LiquidityBot>(
                &bot.id,
                BotPatch::new()
                    .inc("totalOrdersPlaced", placed as i64)
                    .inc("totalMaintenance", 1i64)
                    .set_now("lastMaintenanceAt"),
            )
            .await?;
        if placed > 0 {
            ctx.notifier
                .notify(&format!(
                    "<b>Liquidity bot {}</b> placed {placed} orders around {mid}",
                    bot.name
                ))
                .await;
        }
        Ok(())
    }
}

/// Own open orders as book levels sorted away from mid.
fn sorted_levels(orders: &[OpenOrder], side: Side) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = orders
        .iter()
        .map(|o| PriceLevel {
            price: o.price,
            qty: o.remaining_qty(),
        })
        .collect();
    match side {
        Side::Buy => levels.sort_by(|a, b| b.price.total_cmp(&a.price)),
        Side::Sell => levels.sort_by(|a, b| a.price.total_cmp(&b.price)),
    }
    levels
}
