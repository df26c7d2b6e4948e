use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::warn;

use crate::modules::errors::ExchangeError;
use crate::modules::types::{
    format_decimals, Balances, Depth, OpenOrder, OrderSpec, PlacedOrder, Side, SymbolInfo, Ticker,
    TimeInForce, User,
};

// -------------------- Exchange Client Contract --------------------

/// Bounded number of signed attempts per logical call; clock resync and
/// transient failures both consume from this budget.
pub const MAX_SIGNED_ATTEMPTS: usize = 3;

/// Pause between decomposed batch/cancel items so the exchange rate limiter
/// is never tripped by maintenance sweeps.
pub const INTER_ORDER_PACING: Duration = Duration::from_millis(200);

/// One exchange family bound to one user's credentials. All methods return a
/// value or a typed error; nothing panics across this boundary.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn depth(&self, symbol: &str, limit: usize) -> Result<Depth, ExchangeError>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;

    async fn server_time(&self) -> Result<i64, ExchangeError>;

    async fn balances(&self) -> Result<Balances, ExchangeError>;

    async fn open_orders(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        qty: f64,
        tif: TimeInForce,
    ) -> Result<PlacedOrder, ExchangeError>;

    /// Market buy spending `quote_amount` USDT. Families encode this
    /// differently (CH: `volume` carries the quote amount; XT: explicit
    /// quote-quantity field); callers only ever think in quote terms.
    async fn place_market_buy_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<PlacedOrder, ExchangeError>;

    /// Market sell of a base-asset quantity.
    async fn place_market_sell(
        &self,
        symbol: &str,
        base_qty: f64,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Cancel every open order for the symbol (optionally one side).
    /// Returns the number of cancellations issued.
    async fn cancel_all(&self, symbol: &str, side: Option<Side>) -> Result<usize, ExchangeError>;

    async fn best_ask(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.depth(symbol, 5)
            .await?
            .best_ask()
            .ok_or_else(|| ExchangeError::Malformed(format!("{symbol}: empty ask book")))
    }

    /// Submit a batch. Families without a native batch endpoint decompose
    /// into serial placements with inter-order pacing.
    async fn place_batch(
        &self,
        orders: &[OrderSpec],
    ) -> Vec<Result<PlacedOrder, ExchangeError>> {
        let mut results = Vec::with_capacity(orders.len());
        for (i, spec) in orders.iter().enumerate() {
            if i > 0 {
                sleep(INTER_ORDER_PACING).await;
            }
            let result = match (spec.price, spec.side) {
                (Some(price), side) => {
                    self.place_limit(&spec.symbol, side, price, spec.quantity, TimeInForce::Gtc)
                        .await
                }
                (None, Side::Buy) => {
                    self.place_market_buy_quote(&spec.symbol, spec.quantity).await
                }
                (None, Side::Sell) => Err(ExchangeError::Rejected(
                    "market sell requires explicit price ladder".to_string(),
                )),
            };
            results.push(result);
        }
        results
    }
}

/// Builds a client bound to one user's credentials. The engine holds exactly
/// one factory; tests substitute scripted clients through this seam.
pub trait ExchangeFactory: Send + Sync {
    fn for_user(&self, user: &User) -> Arc<dyn ExchangeClient>;
}

// -------------------- Factory --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeFamily {
    /// `X-CH-*` header signing, `/sapi` endpoints
    Ch,
    /// `validate-*` header signing, `/v4` endpoints
    Xt,
}

impl std::str::FromStr for ExchangeFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ch" => Ok(ExchangeFamily::Ch),
            "xt" => Ok(ExchangeFamily::Xt),
            other => Err(format!("unknown exchange family: {other}")),
        }
    }
}

/// Production factory: one shared HTTP connection pool, one client instance
/// per (user, call-site) bound to that user's credentials.
pub struct HttpExchangeFactory {
    pub family: ExchangeFamily,
    pub base_url: url::Url,
    pub http: reqwest::Client,
    pub fallback_info: SymbolInfo,
}

impl ExchangeFactory for HttpExchangeFactory {
    fn for_user(&self, user: &User) -> Arc<dyn ExchangeClient> {
        match self.family {
            ExchangeFamily::Ch => Arc::new(crate::modules::exchange_ch::ChExchangeClient::new(
                self.http.clone(),
                self.base_url.clone(),
                user.api_key.clone(),
                user.api_secret.clone(),
                self.fallback_info,
            )),
            ExchangeFamily::Xt => Arc::new(crate::modules::exchange_xt::XtExchangeClient::new(
                self.http.clone(),
                self.base_url.clone(),
                user.api_key.clone(),
                user.api_secret.clone(),
                self.fallback_info,
            )),
        }
    }
}

// -------------------- Clock Discipline --------------------

/// Exchange/local clock offset with a short TTL. Authenticated requests
/// timestamp against this; an auth-time rejection invalidates it so the next
/// attempt resynchronizes.
#[derive(Debug)]
pub struct TimeSync {
    ttl: Duration,
    cached: Mutex<Option<CachedOffset>>,
}

#[derive(Debug, Clone, Copy)]
struct CachedOffset {
    offset_ms: i64,
    fetched: Instant,
}

impl TimeSync {
    pub fn new(ttl: Duration) -> Self {
        TimeSync {
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn local_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Exchange-time timestamp, if the cached offset is still fresh.
    pub fn timestamp(&self) -> Option<i64> {
        let cached = self.cached.lock();
        cached
            .filter(|c| c.fetched.elapsed() < self.ttl)
            .map(|c| Self::local_ms() + c.offset_ms)
    }

    pub fn store(&self, server_ms: i64) {
        *self.cached.lock() = Some(CachedOffset {
            offset_ms: server_ms - Self::local_ms(),
            fetched: Instant::now(),
        });
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

// -------------------- Retry Classification --------------------

/// Response codes both families use to signal timestamp drift.
pub fn is_clock_skew_code(code: &str) -> bool {
    code.contains("AUTH_104") || code.contains("AUTH_105")
}

/// Whether a failed attempt is worth another signed try. Clock-skew auth
/// errors retry after resync; transient failures retry as-is; everything
/// else surfaces immediately.
pub fn should_retry(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::Transient(_) => true,
        ExchangeError::Auth(msg) => is_clock_skew_code(msg),
        _ => false,
    }
}

/// Drive `op` up to `MAX_SIGNED_ATTEMPTS` times, invoking `resync` before
/// every retry that follows a clock-skew rejection.
pub async fn retry_signed<T, Op, Fut, Re, ReFut>(
    label: &str,
    op: Op,
    resync: Re,
) -> Result<T, ExchangeError>
where
    Op: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    Re: Fn() -> ReFut,
    ReFut: std::future::Future<Output = ()>,
{
    let mut last_err = None;
    for attempt in 1..=MAX_SIGNED_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) && attempt < MAX_SIGNED_ATTEMPTS => {
                if matches!(&err, ExchangeError::Auth(_)) {
                    warn!(target: "exchange", "{label}: clock skew on attempt {attempt}, resyncing server time");
                    resync().await;
                } else {
                    warn!(target: "exchange", "{label}: transient failure on attempt {attempt}: {err}");
                }
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| ExchangeError::Transient(format!("{label}: retry budget exhausted"))))
}

// -------------------- Formatting & Parsing Helpers --------------------

pub fn format_price(value: f64, info: &SymbolInfo) -> f64 {
    format_decimals(value, info.price_precision)
}

pub fn format_qty(value: f64, info: &SymbolInfo) -> f64 {
    format_decimals(value, info.quantity_precision)
}

/// Wire representation of a price/quantity: truncated to the symbol's
/// precision, then fixed-point formatted.
pub fn decimal_string(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, format_decimals(value, decimals))
}

/// Exchange payloads mix numeric strings and numbers for the same field
/// across endpoints; normalize both.
pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `[["price","qty"], ...]` or `[{"price":..,"qty":..}, ...]` level
/// arrays into (price, qty) pairs, dropping malformed rows.
pub fn parse_levels(raw: Option<&Value>) -> Vec<crate::modules::types::PriceLevel> {
    let Some(Value::Array(rows)) = raw else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match row {
            Value::Array(pair) if pair.len() >= 2 => Some(crate::modules::types::PriceLevel {
                price: value_f64(&pair[0])?,
                qty: value_f64(&pair[1])?,
            }),
            Value::Object(map) => Some(crate::modules::types::PriceLevel {
                price: value_f64(map.get("price")?)?,
                qty: value_f64(map.get("qty").or_else(|| map.get("quantity"))?)?,
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::modules::types::{Balance, OpenOrder, OrderType, PriceLevel};
    use serde_json::json;
    use std::collections::VecDeque;

    /// Factory binding every user to the same scripted client.
    pub struct ScriptedFactory(pub Arc<ScriptedExchange>);

    impl ExchangeFactory for ScriptedFactory {
        fn for_user(&self, _user: &User) -> Arc<dyn ExchangeClient> {
            self.0.clone()
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct PlacementRecord {
        pub symbol: String,
        pub side: Side,
        pub order_type: OrderType,
        pub price: Option<f64>,
        pub quantity: f64,
    }

    /// Scripted client for strategy tests: queued ticker prices, fixed depth
    /// and balances, recorded placements/cancels, optional scripted
    /// placement failures.
    #[derive(Default)]
    pub struct ScriptedExchange {
        tickers: Mutex<VecDeque<f64>>,
        depth: Mutex<Depth>,
        balances: Mutex<Balances>,
        open: Mutex<Vec<OpenOrder>>,
        placement_failures: Mutex<VecDeque<ExchangeError>>,
        placements: Mutex<Vec<PlacementRecord>>,
        cancels: Mutex<Vec<String>>,
        next_order_id: Mutex<u64>,
    }

    impl ScriptedExchange {
        pub fn new() -> Self {
            ScriptedExchange::default()
        }

        /// Prices consumed in order; the final one repeats forever.
        pub fn script_tickers(&self, prices: &[f64]) {
            *self.tickers.lock() = prices.iter().copied().collect();
        }

        pub fn set_depth(&self, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
            *self.depth.lock() = Depth {
                bids: bids
                    .iter()
                    .map(|&(price, qty)| PriceLevel { price, qty })
                    .collect(),
                asks: asks
                    .iter()
                    .map(|&(price, qty)| PriceLevel { price, qty })
                    .collect(),
            };
        }

        pub fn set_balance(&self, asset: &str, free: f64) {
            self.balances.lock().insert(
                asset.to_string(),
                Balance { free, locked: 0.0 },
            );
        }

        pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
            *self.open.lock() = orders;
        }

        pub fn fail_next_placement(&self, err: ExchangeError) {
            self.placement_failures.lock().push_back(err);
        }

        pub fn placements(&self) -> Vec<PlacementRecord> {
            self.placements.lock().clone()
        }

        pub fn cancelled(&self) -> Vec<String> {
            self.cancels.lock().clone()
        }

        fn current_price(&self) -> f64 {
            let mut tickers = self.tickers.lock();
            if tickers.len() > 1 {
                tickers.pop_front().unwrap_or(0.0)
            } else {
                tickers.front().copied().unwrap_or(0.0)
            }
        }

        fn record_placement(
            &self,
            record: PlacementRecord,
        ) -> Result<PlacedOrder, ExchangeError> {
            if let Some(err) = self.placement_failures.lock().pop_front() {
                return Err(err);
            }
            self.placements.lock().push(record);
            let mut next = self.next_order_id.lock();
            *next += 1;
            Ok(PlacedOrder {
                order_id: next.to_string(),
                raw: json!({ "orderId": *next }),
            })
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
            let last = self.current_price();
            if last == 0.0 {
                return Err(ExchangeError::Transient("no ticker scripted".into()));
            }
            Ok(Ticker {
                symbol: symbol.to_string(),
                last,
                ..Ticker::default()
            })
        }

        async fn depth(&self, _symbol: &str, limit: usize) -> Result<Depth, ExchangeError> {
            let depth = self.depth.lock().clone();
            Ok(Depth {
                bids: depth.bids.into_iter().take(limit).collect(),
                asks: depth.asks.into_iter().take(limit).collect(),
            })
        }

        async fn symbol_info(&self, _symbol: &str) -> Result<SymbolInfo, ExchangeError> {
            Ok(SymbolInfo::default())
        }

        async fn server_time(&self) -> Result<i64, ExchangeError> {
            Ok(TimeSync::local_ms())
        }

        async fn balances(&self) -> Result<Balances, ExchangeError> {
            Ok(self.balances.lock().clone())
        }

        async fn open_orders(
            &self,
            _symbol: &str,
            side: Option<Side>,
        ) -> Result<Vec<OpenOrder>, ExchangeError> {
            Ok(self
                .open
                .lock()
                .iter()
                .filter(|o| side.map(|s| o.side == s).unwrap_or(true))
                .cloned()
                .collect())
        }

        async fn place_limit(
            &self,
            symbol: &str,
            side: Side,
            price: f64,
            qty: f64,
            _tif: TimeInForce,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.record_placement(PlacementRecord {
                symbol: symbol.to_string(),
                side,
                order_type: OrderType::Limit,
                price: Some(price),
                quantity: qty,
            })
        }

        async fn place_market_buy_quote(
            &self,
            symbol: &str,
            quote_amount: f64,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.record_placement(PlacementRecord {
                symbol: symbol.to_string(),
                side: Side::Buy,
                order_type: OrderType::Market,
                price: None,
                quantity: quote_amount,
            })
        }

        async fn place_market_sell(
            &self,
            symbol: &str,
            base_qty: f64,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.record_placement(PlacementRecord {
                symbol: symbol.to_string(),
                side: Side::Sell,
                order_type: OrderType::Market,
                price: None,
                quantity: base_qty,
            })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
            self.cancels.lock().push(order_id.to_string());
            self.open.lock().retain(|o| o.order_id != order_id);
            Ok(())
        }

        async fn cancel_all(
            &self,
            _symbol: &str,
            side: Option<Side>,
        ) -> Result<usize, ExchangeError> {
            let mut open = self.open.lock();
            let before = open.len();
            let mut cancels = self.cancels.lock();
            open.retain(|o| {
                let matches = side.map(|s| o.side == s).unwrap_or(true);
                if matches {
                    cancels.push(o.order_id.clone());
                }
                !matches
            });
            Ok(before - open.len())
        }
    }
}
