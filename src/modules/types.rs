use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

// -------------------- Domain Types --------------------
// String constants to avoid typos in comparisons/assignments
pub const ACTION_INITIAL_PLACE: &str = "INITIAL_PLACE";
pub const ACTION_REFILL: &str = "REFILL";
pub const ACTION_TOPUP_PARTIAL: &str = "TOPUP_PARTIAL";

pub const QUOTE_ASSET: &str = "USDT";
pub const BASE_ASSET: &str = "GCB";

pub type OrderId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        }
    }
}

// -------------------- Market Data Types --------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub high24h: f64,
    pub low24h: f64,
    pub volume24h: f64,
    pub change24h: f64,
    pub ts: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

impl PriceLevel {
    /// Quote value of the level (price * qty).
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}

/// Order book snapshot: bids descending, asks ascending.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Depth {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl Depth {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_quantity: f64,
}

impl Default for SymbolInfo {
    fn default() -> Self {
        // Fallback when exchange metadata is unavailable
        SymbolInfo {
            price_precision: 6,
            quantity_precision: 2,
            min_quantity: 0.01,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

pub type Balances = HashMap<String, Balance>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
}

impl OpenOrder {
    pub fn remaining_qty(&self) -> f64 {
        (self.orig_qty - self.executed_qty).max(0.0)
    }
}

/// Successful placement acknowledgment from the exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub raw: Value,
}

/// One order of a batch submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub quantity: f64,
}

// -------------------- Persisted Records --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Success,
    Failed,
    Error,
}

/// Immutable record of one placement attempt. Created by strategies, never
/// mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub bot_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    pub status: TradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Buy-wall phase marker (INITIAL_PLACE / REFILL / TOPUP_PARTIAL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Position of this order in a stabilizer ladder (1-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_orders: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        bot_id: &str,
        user_id: &str,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
    ) -> Self {
        Trade {
            bot_id: bot_id.to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            price: None,
            quantity,
            order_id: None,
            status: TradeStatus::Error,
            response: None,
            action: None,
            order_number: None,
            total_orders: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn with_ladder_position(mut self, order_number: u32, total_orders: u32) -> Self {
        self.order_number = Some(order_number);
        self.total_orders = Some(total_orders);
        self
    }

    pub fn succeeded(mut self, order_id: OrderId, response: Value) -> Self {
        self.order_id = Some(order_id);
        self.status = TradeStatus::Success;
        self.response = Some(response);
        self
    }

    pub fn failed(mut self, response: Value) -> Self {
        self.status = TradeStatus::Failed;
        self.response = Some(response);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Trade,
    Liquidity,
    Monitor,
    Calculate,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Trade => "trade",
            LogLevel::Liquidity => "liquidity",
            LogLevel::Monitor => "monitor",
            LogLevel::Calculate => "calculate",
        }
    }
}

/// Structured activity entry. Held in the per-strategy ring; persisted only
/// for strategies that require auditability (stabilizer, liquidity).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub bot_id: String,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityLog {
    pub fn new(bot_id: &str, level: LogLevel, message: impl Into<String>, data: Value) -> Self {
        ActivityLog {
            bot_id: bot_id.to_string(),
            level,
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

// -------------------- Users --------------------

/// Identity plus API credentials for the target exchange. Read-only to the
/// engine; rotation happens externally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub bot_enabled: bool,
}

impl User {
    /// A user is schedulable only with full credentials and the global kill
    /// switch off.
    pub fn is_eligible(&self) -> bool {
        self.bot_enabled && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

// -------------------- Bot Kinds --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Conditional,
    Stabilizer,
    MarketMaker,
    BuyWall,
    PriceGap,
    Liquidity,
}

impl BotKind {
    pub const ALL: [BotKind; 6] = [
        BotKind::Conditional,
        BotKind::Stabilizer,
        BotKind::MarketMaker,
        BotKind::BuyWall,
        BotKind::PriceGap,
        BotKind::Liquidity,
    ];

    /// Collection prefix: `{kind}_bots`, `{kind}_bot_trades`, `{kind}_bot_logs`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BotKind::Conditional => "conditional",
            BotKind::Stabilizer => "stabilizer",
            BotKind::MarketMaker => "market_maker",
            BotKind::BuyWall => "buy_wall",
            BotKind::PriceGap => "price_gap",
            BotKind::Liquidity => "liquidity",
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Helper Functions --------------------

/// Format a value to a fixed number of decimals, truncating the excess so a
/// formatted quantity never exceeds the available balance.
pub fn format_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn side_and_order_type_serialize_uppercase() {
        assert_eq!(serde_json::to_value(Side::Buy).unwrap(), json!("BUY"));
        assert_eq!(
            serde_json::to_value(OrderType::Market).unwrap(),
            json!("MARKET")
        );
        assert_eq!(serde_json::from_value::<Side>(json!("SELL")).unwrap(), Side::Sell);
    }

    #[test]
    fn trade_builder_marks_success() {
        let trade = Trade::new("b1", "u1", "GCBUSDT", Side::Buy, OrderType::Limit, 5.0)
            .with_price(0.02)
            .succeeded("123".to_string(), json!({"orderId": "123"}));
        assert_eq!(trade.status, TradeStatus::Success);
        assert_eq!(trade.order_id.as_deref(), Some("123"));
        assert_eq!(trade.price, Some(0.02));
    }

    #[test]
    fn user_eligibility_requires_credentials_and_switch() {
        let mut user = User {
            id: "u1".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            bot_enabled: true,
        };
        assert!(user.is_eligible());
        user.bot_enabled = false;
        assert!(!user.is_eligible());
        user.bot_enabled = true;
        user.api_secret.clear();
        assert!(!user.is_eligible());
    }

    #[test]
    fn format_decimals_truncates() {
        assert_eq!(format_decimals(1.23456789, 4), 1.2345);
        assert_eq!(format_decimals(0.019999, 2), 0.01);
        assert_eq!(format_decimals(100.0, 2), 100.0);
    }

    #[test]
    fn depth_best_levels() {
        let depth = Depth {
            bids: vec![PriceLevel { price: 0.028, qty: 10.0 }],
            asks: vec![PriceLevel { price: 0.029, qty: 5.0 }],
        };
        assert_eq!(depth.best_bid(), Some(0.028));
        assert_eq!(depth.best_ask(), Some(0.029));
        assert!(Depth::default().best_ask().is_none());
    }
}
