// =============================================================================
// Live Broker Adapter — HMAC-SHA256 signed REST + order-feed WebSocket
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized.  Signed requests
// carry the app id and access token as headers plus an HMAC signature of
// `{timestamp}.{method}.{path}` computed with the app secret.
//
// Broker status strings and error codes are translated to the core's
// enumerations here and nowhere else.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::broker::rate_limit::{RateLimitTracker, RateLimits};
use crate::broker::{
    BrokerError, BrokerOrder, BrokerOrderStatus, BrokerPort, BrokerPosition, Depth, DepthLevel,
    FundsSnapshot, Holding, MarginRequirement, OptionChain, OptionStrike, OrderChanges,
    OrderIntent, OrderUpdate, Profile, Quote, Tick, TradebookEntry,
};
use crate::types::{Candle, EntryType, ProductType, Resolution, Side};

type HmacSha256 = Hmac<Sha256>;

/// Per-request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Window inside which a repeated `client_tag` returns the original order id.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(30);

/// Shared cell holding the current access token.  The token lifecycle module
/// writes it; the adapter reads it on every request.
#[derive(Default)]
pub struct TokenCell {
    access: RwLock<Option<String>>,
}

impl TokenCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.access.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.access.write() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.access.read().clone()
    }
}

/// Live brokerage adapter.
pub struct HttpBroker {
    app_id: String,
    secret: String,
    base_url: String,
    ws_url: String,
    token: Arc<TokenCell>,
    client: reqwest::Client,
    limiter: RateLimitTracker,
    recent_tags: Mutex<HashMap<String, (String, Instant)>>,
    order_subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderUpdate>>>,
    market_subscribers: Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<Tick>)>>,
}

impl HttpBroker {
    /// Create a new adapter.
    ///
    /// # Arguments
    /// * `app_id`   — broker application id (sent as a header).
    /// * `secret`   — app secret used exclusively for HMAC signing.
    /// * `base_url` — REST base, e.g. `https://api.broker.example`.
    /// * `token`    — shared access-token cell written by the auth ladder.
    pub fn new(
        app_id: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        token: Arc<TokenCell>,
    ) -> Self {
        let base_url = base_url.into();
        let ws_url = base_url.replacen("https://", "wss://", 1) + "/feed/orders";

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "HttpBroker initialised");

        Self {
            app_id: app_id.into(),
            secret: secret.into(),
            base_url,
            ws_url,
            token,
            client,
            limiter: RateLimitTracker::new(RateLimits::default()),
            recent_tags: Mutex::new(HashMap::new()),
            order_subscribers: Mutex::new(Vec::new()),
            market_subscribers: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing and transport helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self, method: &str, path: &str) -> Result<Vec<(String, String)>, BrokerError> {
        let token = self.token.get().ok_or(BrokerError::AuthExpired)?;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let signature = self.sign(&format!("{ts}.{method}.{path}"));
        Ok(vec![
            ("X-App-Id".to_string(), self.app_id.clone()),
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("X-Timestamp".to_string(), ts.to_string()),
            ("X-Signature".to_string(), signature),
        ])
    }

    fn check_rate_limit(&self) -> Result<(), BrokerError> {
        self.limiter
            .try_acquire()
            .map_err(|wait| BrokerError::RateLimit {
                retry_after_ms: wait.as_millis() as u64,
            })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError> {
        self.check_rate_limit()?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        for (k, v) in self.auth_headers(method.as_str(), path)? {
            req = req.header(k, v);
        }
        if let Some(b) = &body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("request to {path} failed: {e}")))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Upstream(format!("bad JSON from {path}: {e}")))?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(path, "broker rejected token");
                Err(BrokerError::AuthExpired)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_ms = payload
                    .get("retry_after_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(1_000);
                Err(BrokerError::RateLimit { retry_after_ms })
            }
            s if s.is_server_error() => Err(BrokerError::Upstream(format!(
                "{path} returned {status}: {payload}"
            ))),
            _ => {
                // Application-level errors ride in the body with HTTP 200.
                if payload.get("s").and_then(Value::as_str) == Some("error") {
                    return Err(Self::translate_error(&payload));
                }
                Ok(payload)
            }
        }
    }

    /// Map the broker's error envelope to the port taxonomy.
    fn translate_error(payload: &Value) -> BrokerError {
        let code = payload.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown broker error")
            .to_string();

        // The -50 class covers symbol resolution failures.
        if (-99..=-50).contains(&code) {
            BrokerError::InvalidSymbol(message)
        } else {
            BrokerError::Rejected { code, message }
        }
    }

    // -------------------------------------------------------------------------
    // Decoding helpers (broker strings -> core enums)
    // -------------------------------------------------------------------------

    fn decode_side(raw: &str) -> Side {
        if raw.eq_ignore_ascii_case("sell") {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    fn decode_status(raw: &str) -> BrokerOrderStatus {
        match raw.to_ascii_uppercase().as_str() {
            "FILLED" | "TRADED" => BrokerOrderStatus::Filled,
            "PARTIALLY_FILLED" | "PARTIAL" => BrokerOrderStatus::PartiallyFilled,
            "CANCELLED" | "CANCELED" => BrokerOrderStatus::Cancelled,
            "REJECTED" => BrokerOrderStatus::Rejected,
            _ => BrokerOrderStatus::Accepted,
        }
    }

    fn decode_order(v: &Value) -> BrokerOrder {
        BrokerOrder {
            order_id: v["order_id"].as_str().unwrap_or_default().to_string(),
            client_tag: v["client_tag"].as_str().unwrap_or_default().to_string(),
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            side: Self::decode_side(v["side"].as_str().unwrap_or("buy")),
            order_type: if v["type"].as_str() == Some("MARKET") {
                EntryType::Market
            } else {
                EntryType::Limit
            },
            price: v["price"].as_f64(),
            trigger_price: v["trigger_price"].as_f64(),
            quantity: v["quantity"].as_u64().unwrap_or(0) as u32,
            filled_qty: v["filled_qty"].as_u64().unwrap_or(0) as u32,
            avg_fill_price: v["avg_fill_price"].as_f64().unwrap_or(0.0),
            status: Self::decode_status(v["status"].as_str().unwrap_or("")),
            parent_id: v["parent_id"].as_str().map(str::to_string),
            message: v["message"].as_str().map(str::to_string),
        }
    }

    fn decode_order_update(v: &Value) -> Option<OrderUpdate> {
        Some(OrderUpdate {
            order_id: v["order_id"].as_str()?.to_string(),
            client_tag: v["client_tag"].as_str().unwrap_or_default().to_string(),
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            status: Self::decode_status(v["status"].as_str()?),
            filled_qty: v["filled_qty"].as_u64().unwrap_or(0) as u32,
            avg_fill_price: v["avg_fill_price"].as_f64().unwrap_or(0.0),
            at: Utc::now(),
        })
    }

    fn encode_intent(intent: &OrderIntent) -> Value {
        json!({
            "client_tag": intent.client_tag,
            "symbol": intent.symbol,
            "side": intent.side.to_string(),
            "type": intent.order_type.to_string(),
            "quantity": intent.quantity,
            "price": intent.limit_price,
            "trigger_price": intent.trigger_price,
            "product": match intent.product_type {
                ProductType::Intraday => "INTRADAY",
                ProductType::Margin => "MARGIN",
                ProductType::Delivery => "DELIVERY",
            },
            "parent_id": intent.parent_id,
        })
    }

    // -------------------------------------------------------------------------
    // Order feed pump
    // -------------------------------------------------------------------------

    /// Spawn the order-feed WebSocket pump.  Reconnects with a fixed sleep on
    /// any error; runs until the process exits.
    pub fn spawn_order_feed(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match connect_async(this.ws_url.as_str()).await {
                    Ok((mut stream, _)) => {
                        info!(url = %this.ws_url, "order feed connected");
                        while let Some(msg) = stream.next().await {
                            match msg {
                                Ok(frame) if frame.is_text() => {
                                    let text = frame.into_text().unwrap_or_default();
                                    if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                        if let Some(update) = Self::decode_order_update(&v) {
                                            this.fan_out_order_update(update);
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(error = %e, "order feed read error");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "order feed connect failed — retrying in 5s");
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    fn fan_out_order_update(&self, update: OrderUpdate) {
        let mut subs = self.order_subscribers.lock();
        subs.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[async_trait::async_trait]
impl BrokerPort for HttpBroker {
    async fn get_profile(&self) -> Result<Profile, BrokerError> {
        let v = self.request(reqwest::Method::GET, "/api/profile", None).await?;
        Ok(Profile {
            user_id: v["data"]["user_id"].as_str().unwrap_or_default().to_string(),
            name: v["data"]["name"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<Quote>, BrokerError> {
        let body = json!({ "symbols": symbols });
        let v = self
            .request(reqwest::Method::POST, "/api/quotes", Some(body))
            .await?;
        let rows = v["data"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|r| Quote {
                symbol: r["symbol"].as_str().unwrap_or_default().to_string(),
                last_price: r["ltp"].as_f64().unwrap_or(0.0),
                change_pct: r["change_pct"].as_f64().unwrap_or(0.0),
                volume: r["volume"].as_f64().unwrap_or(0.0),
                bid: r["bid"].as_f64().unwrap_or(0.0),
                ask: r["ask"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_depth(&self, symbol: &str) -> Result<Depth, BrokerError> {
        let v = self
            .request(
                reqwest::Method::GET,
                &format!("/api/depth?symbol={symbol}"),
                None,
            )
            .await?;
        let decode_levels = |key: &str| -> Vec<DepthLevel> {
            v["data"][key]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .map(|l| DepthLevel {
                    price: l["price"].as_f64().unwrap_or(0.0),
                    quantity: l["quantity"].as_u64().unwrap_or(0),
                    orders: l["orders"].as_u64().unwrap_or(0) as u32,
                })
                .collect()
        };
        Ok(Depth {
            symbol: symbol.to_string(),
            bids: decode_levels("bids"),
            asks: decode_levels("asks"),
            open: v["data"]["open"].as_f64().unwrap_or(0.0),
            high: v["data"]["high"].as_f64().unwrap_or(0.0),
            low: v["data"]["low"].as_f64().unwrap_or(0.0),
            close: v["data"]["close"].as_f64().unwrap_or(0.0),
            upper_circuit: v["data"]["upper_circuit"].as_f64().unwrap_or(0.0),
            lower_circuit: v["data"]["lower_circuit"].as_f64().unwrap_or(0.0),
        })
    }

    async fn get_history(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BrokerError> {
        let path = format!(
            "/api/history?symbol={symbol}&resolution={resolution}&from={}&to={}",
            from.timestamp(),
            to.timestamp()
        );
        let v = self.request(reqwest::Method::GET, &path, None).await?;
        let rows = v["data"]["candles"].as_array().cloned().unwrap_or_default();

        let mut candles = Vec::with_capacity(rows.len());
        for r in &rows {
            // Candles arrive as [ts, o, h, l, c, v] arrays.
            let a = r.as_array().cloned().unwrap_or_default();
            if a.len() < 6 {
                continue;
            }
            candles.push(Candle {
                ts: a[0].as_i64().unwrap_or(0),
                open: a[1].as_f64().unwrap_or(0.0),
                high: a[2].as_f64().unwrap_or(0.0),
                low: a[3].as_f64().unwrap_or(0.0),
                close: a[4].as_f64().unwrap_or(0.0),
                volume: a[5].as_f64().unwrap_or(0.0),
            });
        }
        candles.sort_by_key(|c| c.ts);
        Ok(candles)
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        strike_count: u32,
    ) -> Result<OptionChain, BrokerError> {
        let path = format!("/api/optionchain?symbol={symbol}&strikecount={strike_count}");
        let v = self.request(reqwest::Method::GET, &path, None).await?;
        let rows = v["data"]["strikes"].as_array().cloned().unwrap_or_default();
        Ok(OptionChain {
            symbol: symbol.to_string(),
            spot: v["data"]["spot"].as_f64().unwrap_or(0.0),
            strikes: rows
                .iter()
                .map(|r| OptionStrike {
                    strike: r["strike"].as_f64().unwrap_or(0.0),
                    call_oi: r["call_oi"].as_f64().unwrap_or(0.0),
                    put_oi: r["put_oi"].as_f64().unwrap_or(0.0),
                    call_iv: r["call_iv"].as_f64().unwrap_or(0.0),
                    put_iv: r["put_iv"].as_f64().unwrap_or(0.0),
                    call_delta: r["call_delta"].as_f64().unwrap_or(0.0),
                    put_delta: r["put_delta"].as_f64().unwrap_or(0.0),
                })
                .collect(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let v = self
            .request(reqwest::Method::GET, "/api/positions", None)
            .await?;
        let rows = v["data"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|r| BrokerPosition {
                symbol: r["symbol"].as_str().unwrap_or_default().to_string(),
                net_qty: r["net_qty"].as_i64().unwrap_or(0),
                avg_price: r["avg_price"].as_f64().unwrap_or(0.0),
                realized_pnl: r["realized_pnl"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let v = self
            .request(reqwest::Method::GET, "/api/holdings", None)
            .await?;
        let rows = v["data"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|r| Holding {
                symbol: r["symbol"].as_str().unwrap_or_default().to_string(),
                quantity: r["quantity"].as_u64().unwrap_or(0) as u32,
                avg_cost: r["avg_cost"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let v = self
            .request(reqwest::Method::GET, "/api/orders", None)
            .await?;
        let rows = v["data"].as_array().cloned().unwrap_or_default();
        Ok(rows.iter().map(Self::decode_order).collect())
    }

    async fn get_tradebook(&self) -> Result<Vec<TradebookEntry>, BrokerError> {
        let v = self
            .request(reqwest::Method::GET, "/api/tradebook", None)
            .await?;
        let rows = v["data"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|r| TradebookEntry {
                order_id: r["order_id"].as_str().unwrap_or_default().to_string(),
                symbol: r["symbol"].as_str().unwrap_or_default().to_string(),
                side: Self::decode_side(r["side"].as_str().unwrap_or("buy")),
                quantity: r["quantity"].as_u64().unwrap_or(0) as u32,
                price: r["price"].as_f64().unwrap_or(0.0),
                traded_at: r["traded_at"]
                    .as_i64()
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn get_funds(&self) -> Result<FundsSnapshot, BrokerError> {
        let v = self.request(reqwest::Method::GET, "/api/funds", None).await?;
        Ok(FundsSnapshot {
            available: v["data"]["available"].as_f64().unwrap_or(0.0),
            utilized: v["data"]["utilized"].as_f64().unwrap_or(0.0),
        })
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        // Idempotency: a repeated tag within the window returns the original
        // id without touching the wire.
        {
            let mut tags = self.recent_tags.lock();
            tags.retain(|_, (_, at)| at.elapsed() < IDEMPOTENCY_WINDOW);
            if let Some((order_id, _)) = tags.get(&intent.client_tag) {
                debug!(client_tag = %intent.client_tag, order_id = %order_id, "duplicate tag — returning original order id");
                return Ok(order_id.clone());
            }
        }

        let v = self
            .request(
                reqwest::Method::POST,
                "/api/orders",
                Some(Self::encode_intent(intent)),
            )
            .await?;
        let order_id = v["data"]["order_id"]
            .as_str()
            .ok_or_else(|| BrokerError::Upstream("place_order response missing order_id".into()))?
            .to_string();

        self.recent_tags
            .lock()
            .insert(intent.client_tag.clone(), (order_id.clone(), Instant::now()));

        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = intent.quantity,
            order_id = %order_id,
            "order placed"
        );
        Ok(order_id)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        let body = json!({
            "quantity": changes.quantity,
            "price": changes.limit_price,
            "trigger_price": changes.trigger_price,
        });
        self.request(
            reqwest::Method::PATCH,
            &format!("/api/orders/{order_id}"),
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/api/orders/{order_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn place_bracket_child(
        &self,
        parent_id: &str,
        side: Side,
        order_type: EntryType,
        price: f64,
        quantity: u32,
        client_tag: &str,
    ) -> Result<String, BrokerError> {
        let intent = OrderIntent {
            client_tag: client_tag.to_string(),
            symbol: String::new(), // inherited from the parent on the broker side
            side,
            order_type,
            quantity,
            limit_price: (order_type == EntryType::Limit).then_some(price),
            trigger_price: (order_type == EntryType::Market).then_some(price),
            product_type: ProductType::Intraday,
            parent_id: Some(parent_id.to_string()),
        };
        self.place_order(&intent).await
    }

    async fn calc_margin(&self, intents: &[OrderIntent]) -> Result<MarginRequirement, BrokerError> {
        let body = json!({
            "orders": intents.iter().map(Self::encode_intent).collect::<Vec<_>>()
        });
        let v = self
            .request(reqwest::Method::POST, "/api/margin", Some(body))
            .await?;
        Ok(MarginRequirement {
            required: v["data"]["required"].as_f64().unwrap_or(0.0),
            available: v["data"]["available"].as_f64().unwrap_or(0.0),
        })
    }

    fn subscribe_orders(&self) -> mpsc::UnboundedReceiver<OrderUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.order_subscribers.lock().push(tx);
        rx
    }

    fn subscribe_market(&self, symbols: &[String]) -> mpsc::UnboundedReceiver<Tick> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.market_subscribers
            .lock()
            .push((symbols.to_vec(), tx));
        rx
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let broker = HttpBroker::new(
            "APP123",
            "secret",
            "https://api.broker.invalid",
            Arc::new(TokenCell::new()),
        );
        let a = broker.sign("1700000000.GET./api/profile");
        let b = broker.sign("1700000000.GET./api/profile");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn error_translation_symbol_class() {
        let payload = json!({"s": "error", "code": -50, "message": "unknown symbol"});
        assert!(matches!(
            HttpBroker::translate_error(&payload),
            BrokerError::InvalidSymbol(_)
        ));

        let payload = json!({"s": "error", "code": -10, "message": "margin shortfall"});
        assert!(matches!(
            HttpBroker::translate_error(&payload),
            BrokerError::Rejected { code: -10, .. }
        ));
    }

    #[test]
    fn status_decoding() {
        assert_eq!(
            HttpBroker::decode_status("TRADED"),
            BrokerOrderStatus::Filled
        );
        assert_eq!(
            HttpBroker::decode_status("partial"),
            BrokerOrderStatus::PartiallyFilled
        );
        assert_eq!(
            HttpBroker::decode_status("CANCELED"),
            BrokerOrderStatus::Cancelled
        );
        assert_eq!(
            HttpBroker::decode_status("pending"),
            BrokerOrderStatus::Accepted
        );
    }

    #[test]
    fn missing_token_fails_auth() {
        let broker = HttpBroker::new(
            "APP123",
            "secret",
            "https://api.broker.invalid",
            Arc::new(TokenCell::new()),
        );
        assert_eq!(
            broker.auth_headers("GET", "/api/profile").unwrap_err(),
            BrokerError::AuthExpired
        );
    }
}
