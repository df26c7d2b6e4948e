use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::modules::errors::ExchangeError;
use crate::modules::exchange::{
    decimal_string, is_clock_skew_code, parse_levels, retry_signed, value_f64, value_str,
    ExchangeClient, TimeSync,
};
use crate::modules::types::{
    Balance, Balances, Depth, OpenOrder, OrderId, OrderSpec, PlacedOrder, Side, SymbolInfo,
    Ticker, TimeInForce,
};

// -------------------- Family B: XT-header signed REST --------------------
// Signature base = canonical header prefix + #METHOD#path[#query][#body],
// HMAC-SHA256 hex in validate-signature.

const HEADER_ALGORITHMS: &str = "validate-algorithms";
const HEADER_APPKEY: &str = "validate-appkey";
const HEADER_RECVWINDOW: &str = "validate-recvwindow";
const HEADER_TIMESTAMP: &str = "validate-timestamp";
const HEADER_SIGNATURE: &str = "validate-signature";

const ALGORITHM: &str = "HmacSHA256";
const RECV_WINDOW: &str = "5000";
const BIZ_TYPE: &str = "SPOT";

pub struct XtExchangeClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
    time_sync: TimeSync,
    fallback_info: SymbolInfo,
    info_cache: Mutex<HashMap<String, SymbolInfo>>,
}

impl XtExchangeClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        api_key: String,
        api_secret: String,
        fallback_info: SymbolInfo,
    ) -> Self {
        XtExchangeClient {
            http,
            base_url,
            api_key,
            api_secret,
            time_sync: TimeSync::new(Duration::from_secs(30)),
            fallback_info,
            info_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Signature base: `validate-algorithms=...&validate-appkey=...&
    /// validate-recvwindow=...&validate-timestamp=...#METHOD#path[#query][#body]`.
    fn sign(&self, ts: i64, method: &str, path: &str, query: &str, body: &str) -> String {
        let mut base = format!(
            "{HEADER_ALGORITHMS}={ALGORITHM}&{HEADER_APPKEY}={}&{HEADER_RECVWINDOW}={RECV_WINDOW}&{HEADER_TIMESTAMP}={ts}",
            self.api_key
        );
        base.push('#');
        base.push_str(method);
        base.push('#');
        base.push_str(path);
        if !query.is_empty() {
            base.push('#');
            base.push_str(query);
        }
        if !body.is_empty() {
            base.push('#');
            base.push_str(body);
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(base.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn join(&self, path: &str) -> Result<Url, ExchangeError> {
        self.base_url
            .join(path)
            .map_err(|e| ExchangeError::Malformed(format!("bad endpoint {path}: {e}")))
    }

    async fn synced_ts(&self) -> Result<i64, ExchangeError> {
        if let Some(ts) = self.time_sync.timestamp() {
            return Ok(ts);
        }
        let server_ms = self.server_time().await?;
        self.time_sync.store(server_ms);
        Ok(self.time_sync.timestamp().unwrap_or(server_ms))
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
        unwrap_envelope(response.status(), response.json().await.map_err(|e| {
            ExchangeError::Malformed(e.to_string())
        })?)
    }

    async fn signed_attempt(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let ts = self.synced_ts().await?;
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let body_string = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(ts, method.as_str(), path, &query_string, &body_string);

        let mut request = self
            .http
            .request(method.clone(), self.join(path)?)
            .header(HEADER_ALGORITHMS, ALGORITHM)
            .header(HEADER_APPKEY, &self.api_key)
            .header(HEADER_RECVWINDOW, RECV_WINDOW)
            .header(HEADER_TIMESTAMP, ts.to_string())
            .header(HEADER_SIGNATURE, signature);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(value) = body {
            request = request.json(value);
        }

        let response = request.send().await?;
        unwrap_envelope(response.status(), response.json().await.map_err(|e| {
            ExchangeError::Malformed(e.to_string())
        })?)
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

/// Every response is wrapped in `{rc, mc, result}`; `rc != 0` is an error
/// keyed by the `mc` message code.
fn unwrap_envelope(status: StatusCode, body: Value) -> Result<Value, ExchangeError> {
    let rc = body.get("rc").and_then(Value::as_i64);
    let mc = body.get("mc").and_then(value_str).unwrap_or_default();
    let ok = rc == Some(0) || (rc.is_none() && status.is_success());
    if ok {
        return Ok(body.get("result").cloned().unwrap_or(body));
    }
    if is_clock_skew_code(&mc) {
        Err(ExchangeError::Auth(mc))
    } else if mc.starts_with("AUTH_") || status == StatusCode::UNAUTHORIZED {
        Err(ExchangeError::Auth(mc))
    } else if status.is_server_error() {
        Err(ExchangeError::Transient(format!("{status} {mc}")))
    } else {
        Err(ExchangeError::Rejected(mc))
    }
}

fn parse_open_order(row: &Value) -> Option<OpenOrder> {
    let side = match row.get("side").and_then(value_str)?.to_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };
    Some(OpenOrder {
        order_id: value_str(row.get("orderId")?)?,
        symbol: row.get("symbol").and_then(value_str).unwrap_or_default(),
        side,
        price: row.get("price").and_then(value_f64)?,
        orig_qty: row.get("origQty").and_then(value_f64)?,
        executed_qty: row
            .get("executedQty")
            .and_then(value_f64)
            .unwrap_or(0.0),
    })
}

fn extract_order_id(result: &Value) -> Result<OrderId, ExchangeError> {
    result
        .get("orderId")
        .and_then(value_str)
        .ok_or_else(|| ExchangeError::Malformed(format!("placement ack without orderId: {result}")))
}

#[async_trait]
impl ExchangeClient for XtExchangeClient {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let result = self
            .public_get("/v4/public/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        // Result is a one-element array of {s, p, t}
        let row = result
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .unwrap_or(result);
        let last = row
            .get("p")
            .or_else(|| row.get("price"))
            .and_then(value_f64)
            .ok_or_else(|| ExchangeError::Malformed(format!("ticker without price: {row}")))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            high24h: last,
            low24h: last,
            volume24h: 0.0,
            change24h: 0.0,
            ts: row
                .get("t")
                .and_then(value_f64)
                .map(|t| t as i64)
                .unwrap_or_else(TimeSync::local_ms),
        })
    }

    async fn depth(&self, symbol: &str, limit: usize) -> Result<Depth, ExchangeError> {
        let result = self
            .public_get(
                "/v4/public/depth",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let mut depth = Depth {
            bids: parse_levels(result.get("bids")),
            asks: parse_levels(result.get("asks")),
        };
        depth.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        depth.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Ok(depth)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        if let Some(info) = self.info_cache.lock().get(symbol) {
            return Ok(*info);
        }
        let result = self
            .public_get("/v4/public/symbol", &[("symbol", symbol.to_string())])
            .await?;
        let rows = result
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
                    .get("minQty")
                    .and_then(value_f64)
                    .unwrap_or(self.fallback_info.min_quantity),
            })
            .unwrap_or(self.fallback_info);
        self.info_cache.lock().insert(symbol.to_string(), info);
        Ok(info)
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        let result = self.public_get("/v4/public/time", &[]).await?;
        result
            .get("serverTime")
            .or_else(|| result.get("time"))
            .and_then(value_f64)
            .map(|t| t as i64)
            .ok_or_else(|| ExchangeError::Malformed(format!("time response: {result}")))
    }

    async fn balances(&self) -> Result<Balances, ExchangeError> {
        let result = self
            .signed_request(Method::GET, "/v4/balances", vec![], None)
            .await?;
        let rows = result
            .get("assets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut balances = Balances::new();
        for row in rows {
            let Some(currency) = row.get("currency").and_then(value_str) else {
                continue;
            };
            balances.insert(
                currency.to_uppercase(),
                Balance {
                    free: row
                        .get("availableAmount")
                        .and_then(value_f64)
                        .unwrap_or(0.0),
                    locked: row.get("frozenAmount").and_then(value_f64).unwrap_or(0.0),
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
        let result = self
            .signed_request(
                Method::GET,
                "/v4/open-order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("bizType", BIZ_TYPE.to_string()),
                ],
                None,
            )
            .await?;
        let rows = result.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(parse_open_order)
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
            "bizType": BIZ_TYPE,
            "timeInForce": tif.as_str(),
            "price": decimal_string(price, info.price_precision),
            "quantity": decimal_string(qty, info.quantity_precision),
        });
        let result = self
            .signed_request(Method::POST, "/v4/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&result)?,
            raw: result,
        })
    }

    async fn place_market_buy_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<PlacedOrder, ExchangeError> {
        // This family takes the quote amount as an explicit field instead of
        // overloading the volume.
        let body = json!({
            "symbol": symbol,
            "side": "BUY",
            "type": "MARKET",
            "bizType": BIZ_TYPE,
            "quoteQty": decimal_string(quote_amount, 2),
        });
        let result = self
            .signed_request(Method::POST, "/v4/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&result)?,
            raw: result,
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
            "bizType": BIZ_TYPE,
            "quantity": decimal_string(base_qty, info.quantity_precision),
        });
        let result = self
            .signed_request(Method::POST, "/v4/order", vec![], Some(body))
            .await?;
        Ok(PlacedOrder {
            order_id: extract_order_id(&result)?,
            raw: result,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let path = format!("/v4/order/{order_id}");
        self.signed_request(Method::DELETE, &path, vec![], None)
            .await?;
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str, side: Option<Side>) -> Result<usize, ExchangeError> {
        let open = self.open_orders(symbol, side).await?;
        if open.is_empty() {
            return Ok(0);
        }
        let mut body = json!({ "symbol": symbol, "bizType": BIZ_TYPE });
        if let Some(side) = side {
            body["side"] = Value::String(side.as_str().to_string());
        }
        self.signed_request(Method::DELETE, "/v4/open-order", vec![], Some(body))
            .await?;
        Ok(open.len())
    }

    /// Native batch endpoint; per-item acknowledgments are surfaced
    /// individually so a partial acceptance is visible to the caller.
    async fn place_batch(
        &self,
        orders: &[OrderSpec],
    ) -> Vec<Result<PlacedOrder, ExchangeError>> {
        let items: Vec<Value> = orders
            .iter()
            .map(|spec| match spec.price {
                Some(price) => json!({
                    "symbol": spec.symbol,
                    "side": spec.side.as_str(),
                    "type": "LIMIT",
                    "bizType": BIZ_TYPE,
                    "timeInForce": TimeInForce::Gtc.as_str(),
                    "price": decimal_string(price, self.fallback_info.price_precision),
                    "quantity": decimal_string(spec.quantity, self.fallback_info.quantity_precision),
                }),
                None => json!({
                    "symbol": spec.symbol,
                    "side": spec.side.as_str(),
                    "type": "MARKET",
                    "bizType": BIZ_TYPE,
                    "quoteQty": decimal_string(spec.quantity, 2),
                }),
            })
            .collect();

        let result = self
            .signed_request(
                Method::POST,
                "/v4/batch-order",
                vec![],
                Some(json!({ "items": Value::Array(items) })),
            )
            .await;

        match result {
            Ok(ack) => {
                let rows = ack.as_array().cloned().unwrap_or_default();
                orders
                    .iter()
                    .enumerate()
                    .map(|(i, _)| match rows.get(i) {
                        Some(row) => extract_order_id(row).map(|order_id| PlacedOrder {
                            order_id,
                            raw: row.clone(),
                        }),
                        None => Err(ExchangeError::Malformed(
                            "batch ack missing item".to_string(),
                        )),
                    })
                    .collect()
            }
            Err(err) => {
                let msg = err.to_string();
                orders
                    .iter()
                    .map(|_| Err(ExchangeError::Rejected(msg.clone())))
                    .collect()
            }
        }
    }
}
