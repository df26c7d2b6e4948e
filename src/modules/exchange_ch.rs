use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::modules::errors::ExchangeError;
use crate::modules::exchange::{
    decimal_string, is_clock_skew_code, parse_levels, retry_signed, value_f64, value_str,
    ExchangeClient, TimeSync, INTER_ORDER_PACING,
};
use crate::modules::types::{
    Balance, Balances, Depth, OpenOrder, OrderId, PlacedOrder, Side, SymbolInfo, Ticker,
    TimeInForce,
};

// -------------------- Family A: CH-header signed REST --------------------
// Signature = HMAC_SHA256(secret, ts + METHOD + path + bodyOrQuery), carried
// in X-CH-SIGN alongside X-CH-APIKEY / X-CH-TS.

const HEADER_API_KEY: &str = "X-CH-APIKEY";
const HEADER_TS: &str = "X-CH-TS";
const HEADER_SIGN: &str = "X-CH-SIGN";

const CANCEL_CONCURRENCY: usize = 3;

pub struct ChExchangeClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
    time_sync: TimeSync,
    fallback_info: SymbolInfo,
    info_cache: Mutex<HashMap<String, SymbolInfo>>,
}

impl ChExchangeClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        api_key: String,
        api_secret: String,
        fallback_info: SymbolInfo,
    ) -> Self {
        ChExchangeClient {
            http,
            base_url,
            api_key,
            api_secret,
            time_sync: TimeSync::new(Duration::from_secs(30)),
            fallback_info,
            info_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical string: `{ts}{METHOD}{path}{query-or-body}`.
    fn sign(&self, ts: i64, method: &str, path: &str, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(ts.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn join(&self, path: &str) -> Result<Url, ExchangeError> {
        self.base_url
            .join(path)
            .map_err(|e| ExchangeError::Malformed(format!("bad endpoint {path}: {e}")))
    }

    async fn public_get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let response = self
            .http
            .get(self.join(path)?)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_http_error(status, &body))
        }
    }

    async fn synced_ts(&self) -> Result<i64, ExchangeError> {
        if let Some(ts) = self.time_sync.timestamp() {
            return Ok(ts);
        }
        let server_ms = self.server_time().await?;
        self.time_sync.store(server_ms);
        Ok(self.time_sync.timestamp().unwrap_or(server_ms))
    }

    /// One signed attempt. `retry_signed` drives the resync/retry policy.
    async fn signed_attempt(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let ts = self.synced_ts().await?;
        let payload = match body {
            Some(value) => value.to_string(),
            None => query
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&"),
        };
        let signature = self.sign(ts, method.as_str(), path, &payload);

        let mut request = self
            .http
            .request(method.clone(), self.join(path)?)
            .header(HEADER_API_KEY, &self.api_key)
            .header(HEADER_TS, ts.to_string())
            .header(HEADER_SIGN, signature);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(value) = body {
            request = request.json(value);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        if status.is_success() && !is_error_body(&body) {
            Ok(body)
        } else {
            Err(classify_http_error(status, &body))
        }
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        query: Vec<(&str, String)>,
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        retry_signed(
            path,
            || self.signed_attempt(&method, path, &query, body.as_ref()),
            || async { self.time_sync.invalidate() },
        )
        .await
    }
}

/// Non-zero `code` marks a business error even under HTTP 200.
fn is_error_body(body: &Value) -> bool {
    match body.get("code") {
        Some(code) => value_str(code).map(|c| c != "0" && c != "200").unwrap_or(false),
        None => false,
    }
}

fn classify_http_error(status: StatusCode, body: &Value) -> ExchangeError {
    let code = body.get("code").and_then(value_str).unwrap_or_default();
    let msg = body
        .get("msg")
        .or_else(|| body.get("message"))
        .and_then(value_str)
        .unwrap_or_else(|| status.to_string());
    let detail = format!("{code} {msg}").trim().to_string();

    if is_clock_skew_code(&detail) {
        ExchangeError::Auth(detail)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExchangeError::Auth(detail)
    } else if status.is_server_error() {
        ExchangeError::Transient(detail)
    } else {
        ExchangeError::Rejected(detail)
    }
}

fn parse_open_order(symbol: &str, row: &Value) -> Option<OpenOrder> {
    let side = match row.get("side").and_then(value_str)?.to_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };
    Some(OpenOrder {
        order_id: value_str(row.get("orderId")?)?,
        symbol: symbol.to_string(),
        side,
        price: row.get("price").and_then(value_f64)?,
        orig_qty: row
            .get("origQty")
            .or_else(|| row.get("volume"))
            .and_then(value_f64)?,
        executed_qty: row
            .get("executedQty")
            .or_else(|| row.get("dealVolume"))
            .and_then(value_f64)
            .unwrap_or(0.0),
    })
}

fn extract_order_id(body: &Value) -> Result<OrderId, ExchangeError> {
    body.get("orderId")
        .or_else(|| body.pointer("/data/orderId"))
        .and_then(value_str)
        .ok_or_else(|| ExchangeError::Malformed(format!("placement ack without orderId: {body}")))
}

#[async_trait]
impl ExchangeClient for ChExchangeClient {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let body = self
            .public_get("/sapi/v2/ticker", &[("symbol", symbol.to_string())])
            .await?;
        let last = body
            .get("last")
            .and_then(value_f64)
            .ok_or_else(|| ExchangeError::Malformed(format!("ticker without last: {body}")))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            high24h: body.get("high").and_then(value_f64).unwrap_or(last),
            low24h: body.get("low").and_then(value_f64).unwrap_or(last),
            volume24h: body.get("vol").and_then(value_f64).unwrap_or(0.0),
            change24h: body.get("rose").and_then(value_f64).unwrap_or(0.0),
            ts: body
                .get("time")
                .and_then(value_f64)
                .map(|t| t as i64)
                .unwrap_or_else(TimeSync::local_ms),
        })
    }

    async fn depth(&self, symbol: &str, limit: usize) -> Result<Depth, ExchangeError> {
        let body = self
            .public_get(
                "/sapi/v2/depth",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let mut depth = Depth {
            bids: parse_levels(body.get("bids")),
            asks: parse_levels(body.get("asks")),
        };
        // Normalize ordering regardless of what the venue returned
        depth.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        depth.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Ok(depth)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        if let Some(info) = self.info_cache.lock().get(symbol) {
            return Ok(*info);
        }
        let body = self.public_get("/sapi/v2/symbols", &[]).await?;
        let rows = body
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let info = rows
            .iter()
            .find(|row| {
                row.get("symbol")
                    .and_then(value_str)
                    .map(|s| s.eq_ignore_ascii_case(symbol))
                    .unwrap_or(false)
            })
            .map(|row| SymbolInfo {
                price_precision: row
                    .get("pricePrecision")
                    .and_then(Value::as_u64)
                    .unwrap_or(self.fallback_info.price_precision as u64)
                    as u32,
                quantity_precision: row
                    .get("quantityPrecision")
                    .and_then(Value::as_u64)
                    .unwrap_or(self.fallback_info.quantity_precision as u64)
                    as u32,
                min_quantity: row
                    .get("limitVolumeMin")
                    .and_then(value_f64)
                    .unwrap_or(self.fallback_info.min_quantity),
            })
            .unwrap_or(self.fallback_info);
        self.info_cache.lock().insert(symbol.to_string(), info);
        Ok(info)
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        let body = self.public_get("/sapi/v1/time", &[]).await?;
        body.get("serverTime")
            .and_then(value_f64)
            .map(|t| t as i64)
            .ok_or_else(|| ExchangeError::Malformed(format!("time response: {body}")))
    }

    async fn balances(&self) -> Result<Balances, ExchangeError> {
        let body = self
            .signed_request(Method::GET, "/sapi/v1/account", vec![], None)
            .await?;
        let rows = body
            .get("balances")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut balances = Balances::new();
        for row in rows {
            let Some(asset) = row.get("asset").and_then(value_str) else {
                continue;
            };
            balances.insert(
                asset.to_uppercase(),
                Balance {
                    free: row.get("free").and_then(value_f64).unwrap_or(0.0),
                    locked: row.get("locked").and_then(value_f64).unwrap_or(0.0),
                },
            );
        }
        Ok(balances)
    }

    async fn open_orders(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let body = self
            .signed_request(
                Method::GET,
                "/sapi/v2/openOrders",
                vec![("symbol", symbol.to_string())],
                None,
            )
            .await?;
        let rows = body
            .get("list")
            .or_else(|| body.get("data"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| body.as_array().cloned().unwrap_or_default());
        Ok(rows
            .iter()
            .filter_map(|row| parse_open_order(symbol, row))
            .filter(|order| side.map(|s| order.side == s).unwrap_or(true))
            .collect())
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        qty: f64,
        tif: TimeInForce,
    ) -> Result<PlacedOrder, ExchangeError> {
        let info = self.symbol_info(symbol).await?;
        let body = json!({
            "symbol": symbol,
            "side": side.as_str(),
            "type": "LIMIT",
            "volume": decimal_string(qty, info.quantity_precision),
            "price": decimal_string(price, info.price_precision),
            "timeInForce": tif.as_str(),
        });
        let ack = self
            .signed_request(Method::POST, "/sapi/v2/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&ack)?,
            raw: ack,
        })
    }

    async fn place_market_buy_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<PlacedOrder, ExchangeError> {
        // Market-buy convention on this family: `volume` is the quote (USDT)
        // amount, not a base quantity.
        let body = json!({
            "symbol": symbol,
            "side": "BUY",
            "type": "MARKET",
            "volume": decimal_string(quote_amount, 2),
        });
        let ack = self
            .signed_request(Method::POST, "/sapi/v2/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&ack)?,
            raw: ack,
        })
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        base_qty: f64,
    ) -> Result<PlacedOrder, ExchangeError> {
        let info = self.symbol_info(symbol).await?;
        let body = json!({
            "symbol": symbol,
            "side": "SELL",
            "type": "MARKET",
            "volume": decimal_string(base_qty, info.quantity_precision),
        });
        let ack = self
            .signed_request(Method::POST, "/sapi/v2/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&ack)?,
            raw: ack,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({ "symbol": symbol, "orderId": order_id });
        let ack = self
            .signed_request(Method::POST, "/sapi/v2/cancel", vec![], Some(body))
            .await?;
        if cancel_accepted(&ack, order_id) {
            Ok(())
        } else {
            Err(ExchangeError::Rejected(format!("cancel not accepted: {ack}")))
        }
    }

    async fn cancel_all(&self, symbol: &str, side: Option<Side>) -> Result<usize, ExchangeError> {
        // No batch-cancel endpoint on this family: loop with bounded
        // concurrency and inter-cancel pacing.
        let orders = self.open_orders(symbol, side).await?;
        let cancelled = stream::iter(orders)
            .map(|order| async move {
                let result = self.cancel_order(symbol, &order.order_id).await;
                sleep(INTER_ORDER_PACING).await;
                result.is_ok()
            })
            .buffer_unordered(CANCEL_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(cancelled.into_iter().filter(|ok| *ok).count())
    }
}

/// Family-dependent cancel acknowledgments: explicit status, zero code, or
/// the orderId echoed back.
fn cancel_accepted(ack: &Value, order_id: &str) -> bool {
    if let Some(status) = ack.get("status").and_then(value_str) {
        if status == "CANCELED" || status == "PENDING_CANCEL" {
            return true;
        }
    }
    if let Some(code) = ack.get("code").and_then(value_str) {
        if code == "0" {
            return true;
        }
    }
    ack.get("orderId")
        .and_then(value_str)
        .map(|echoed| echoed == order_id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ChExchangeClient {
        ChExchangeClient::new(
            reqwest::Client::new(),
            Url::parse("https://api.example.test").unwrap(),
            "key".to_string(),
            "secret".to_string(),
            SymbolInfo::default(),
        )
    }

    #[test]
    fn signing_is_deterministic() {
        let c = client();
        let a = c.sign(1700000000000, "POST", "/sapi/v2/order", r#"{"symbol":"gcbusdt"}"#);
        let b = c.sign(1700000000000, "POST", "/sapi/v2/order", r#"{"symbol":"gcbusdt"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256
        let other = c.sign(1700000000001, "POST", "/sapi/v2/order", r#"{"symbol":"gcbusdt"}"#);
        assert_ne!(a, other);
    }

    #[test]
    fn error_body_detection() {
        assert!(!is_error_body(&json!({"orderId": 1})));
        assert!(!is_error_body(&json!({"code": 0, "orderId": 1})));
        assert!(is_error_body(&json!({"code": "-1121", "msg": "Invalid symbol"})));
    }

    #[test]
    fn classification_maps_families() {
        let err = classify_http_error(StatusCode::OK, &json!({"code": "AUTH_104", "msg": "ts"}));
        assert!(matches!(err, ExchangeError::Auth(_)));
        let err = classify_http_error(StatusCode::BAD_GATEWAY, &json!({}));
        assert!(matches!(err, ExchangeError::Transient(_)));
        let err = classify_http_error(
            StatusCode::BAD_REQUEST,
            &json!({"code": "-2010", "msg": "insufficient balance"}),
        );
        assert!(matches!(err, ExchangeError::Rejected(_)));
        let err = classify_http_error(StatusCode::UNAUTHORIZED, &json!({}));
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn cancel_acknowledgment_variants() {
        assert!(cancel_accepted(&json!({"status": "CANCELED"}), "1"));
        assert!(cancel_accepted(&json!({"status": "PENDING_CANCEL"}), "1"));
        assert!(cancel_accepted(&json!({"code": 0}), "1"));
        assert!(cancel_accepted(&json!({"orderId": 42}), "42"));
        assert!(!cancel_accepted(&json!({"status": "NEW"}), "1"));
    }

    #[test]
    fn open_order_row_parsing() {
        let row = json!({
            "orderId": 981723,
            "side": "buy",
            "price": "0.0281",
            "origQty": "120",
            "executedQty": "20"
        });
        let order = parse_open_order("GCBUSDT", &row).unwrap();
        assert_eq!(order.order_id, "981723");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.remaining_qty(), 100.0);
    }

    #[test]
    fn placement_ack_probing() {
        assert_eq!(extract_order_id(&json!({"orderId": 7})).unwrap(), "7");
        assert_eq!(
            extract_order_id(&json!({"data": {"orderId": "abc"}})).unwrap(),
            "abc"
        );
        assert!(extract_order_id(&json!({"ok": true})).is_err());
    }
}
