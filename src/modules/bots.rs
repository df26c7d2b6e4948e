use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::modules::types::BotKind;

// -------------------- Bot Documents --------------------
// One document shape per strategy kind, stored in its own `{kind}_bots`
// collection. Shared scheduling fields are repeated per struct so each
// collection stays self-describing.

/// Contract every persisted bot satisfies so the store and the runner can
/// treat kinds uniformly.
pub trait BotDocument:
    Serialize + DeserializeOwned + Clone + Send + Sync + Unpin + 'static
{
    const KIND: BotKind;

    fn id(&self) -> &str;
    fn user_id(&self) -> &str;
    fn symbol(&self) -> &str;
    fn is_active(&self) -> bool;
    fn is_running(&self) -> bool;

    /// A bot is schedulable only when both switches are on.
    fn is_schedulable(&self) -> bool {
        self.is_active() && self.is_running()
    }
}

macro_rules! impl_bot_document {
    ($ty:ident, $kind:expr) => {
        impl BotDocument for $ty {
            const KIND: BotKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }
            fn user_id(&self) -> &str {
                &self.user_id
            }
            fn symbol(&self) -> &str {
                &self.symbol
            }
            fn is_active(&self) -> bool {
                self.is_active
            }
            fn is_running(&self) -> bool {
                self.is_running
            }
        }
    };
}

// -------------------- Conditional --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionField {
    #[serde(rename = "GCB_PRICE")]
    GcbPrice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    Above,
    Below,
    Equal,
    NotEqual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionAction {
    MarketBuy,
    MarketSell,
    LimitBuy,
    LimitSell,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionField {
    /// `actionValue` is a base-asset quantity
    GcbQuantity,
    /// `actionValue` is a quote (USDT) amount
    UsdtValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    pub condition_field: ConditionField,
    pub condition_operator: ConditionOperator,
    pub condition_value: f64,
    pub action_type: ConditionAction,
    pub action_field: ActionField,
    pub action_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default = "default_conditional_cooldown")]
    pub cooldown_seconds: u64,

    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_conditional_cooldown() -> u64 {
    60
}

impl_bot_document!(ConditionalBot, BotKind::Conditional);

// -------------------- Stabilizer --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizerBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    pub target_price: f64,

    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub total_usdt_spent: f64,
    #[serde(default)]
    pub successful_orders: u64,
    #[serde(default)]
    pub failed_orders: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_bot_document!(StabilizerBot, BotKind::Stabilizer);

// -------------------- Market Maker --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMakerBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    pub target_price: f64,
    /// Half-spread applied on both sides, as a fraction (0.02 = 2%)
    pub spread_percent: f64,
    pub initial_order_size: f64,
    pub current_order_size: f64,
    #[serde(default = "default_true")]
    pub is_decreasing: bool,
    #[serde(default)]
    pub target_reached: bool,

    #[serde(default)]
    pub execution_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl_bot_document!(MarketMakerBot, BotKind::MarketMaker);

// -------------------- Buy Wall --------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyWallLevel {
    pub price: f64,
    pub usdt_amount: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WallOrderStatus {
    Open,
    Refilled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedWallOrder {
    pub price: f64,
    pub usdt_amount: f64,
    pub order_id: String,
    pub gcb_quantity: f64,
    pub status: WallOrderStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyWallBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    pub target_price: f64,
    /// Configured wall: each level is re-placed whenever it fills
    pub buy_orders: Vec<BuyWallLevel>,
    #[serde(default)]
    pub orders_placed: bool,
    #[serde(default)]
    pub placed_orders: Vec<PlacedWallOrder>,
    #[serde(default)]
    pub total_refills: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_bot_document!(BuyWallBot, BotKind::BuyWall);

// -------------------- Price Gap --------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceGapBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    /// USDT spent per triggered buy
    pub order_amount: f64,
    #[serde(default = "default_gap_cooldown")]
    pub cooldown_seconds: u64,
    /// Minimum (bestAsk - last) / last, in percent, to act on
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: f64,

    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub total_usdt_spent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_market_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_best_ask_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price_gap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_gap_cooldown() -> u64 {
    300
}

fn default_gap_threshold() -> f64 {
    3.0
}

impl_bot_document!(PriceGapBot, BotKind::PriceGap);

// -------------------- Liquidity --------------------

/// Result of one market-health analysis, persisted on the bot so the status
/// surface can show the latest picture without replaying the book.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquiditySnapshot {
    pub mid_price: f64,
    pub spread_percent: f64,
    pub spread_ok: bool,
    pub bid_depth_2pct: f64,
    pub ask_depth_2pct: f64,
    pub bid_depth_top20: f64,
    pub ask_depth_top20: f64,
    pub bid_order_count: usize,
    pub ask_order_count: usize,
    pub own_bid_depth_2pct: f64,
    pub own_ask_depth_2pct: f64,
    pub own_bid_count: usize,
    pub own_ask_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityBot {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub is_active: bool,
    pub is_running: bool,

    /// Required depth (USDT) within +-2% of mid, per side, before scaling
    #[serde(default = "default_min_depth_2pct")]
    pub min_depth_2_percent: f64,
    /// Required cumulative top-20 depth (USDT) per side, before scaling
    #[serde(default = "default_min_depth_top20")]
    pub min_depth_top20: f64,
    #[serde(default = "default_min_order_count")]
    pub min_order_count: usize,
    /// Maximum relative gap between adjacent top-20 levels, in percent
    #[serde(default = "default_max_order_gap")]
    pub max_order_gap: f64,
    /// Maximum top-of-book spread, in percent
    #[serde(default = "default_max_spread")]
    pub max_spread: f64,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_liq_interval")]
    pub check_interval_seconds: u64,
    #[serde(default)]
    pub auto_manage: bool,

    #[serde(default)]
    pub total_orders_placed: u64,
    #[serde(default)]
    pub total_maintenance: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<LiquiditySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_maintenance_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_min_depth_2pct() -> f64 {
    500.0
}

fn default_min_depth_top20() -> f64 {
    1000.0
}

fn default_min_order_count() -> usize {
    30
}

fn default_max_order_gap() -> f64 {
    1.0
}

fn default_max_spread() -> f64 {
    1.0
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_liq_interval() -> u64 {
    30
}

impl_bot_document!(LiquidityBot, BotKind::Liquidity);
