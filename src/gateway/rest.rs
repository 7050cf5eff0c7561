//! Exchange REST client
//!
//! Typed wrapper over the exchange's REST API with:
//! - Automatic retry with jittered exponential backoff
//! - Per-endpoint-class request budgets (public / private)
//! - Error classification into the gateway taxonomy

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::Credentials;
use super::limits::{EndpointClass, RateBudget};
use super::types::*;
use crate::common::Backoff;
use crate::types::{Candle, ProductId};

/// Base URL for the exchange REST API
pub const API_BASE_URL: &str = "https://api.exchange.example.com";

const API_PREFIX: &str = "/api/v3/brokerage";

/// Retry policy caps: attempts and cumulative wait
const MAX_ATTEMPTS: u32 = 5;
const MAX_RETRY_BUDGET: Duration = Duration::from_secs(30);

/// Class-wide hold after the exchange answers 429
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(2);

/// REST client configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub public_rate_limit: usize,
    pub private_rate_limit: usize,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            public_rate_limit: 10,
            private_rate_limit: 10,
        }
    }
}

#[derive(Clone)]
pub struct RestClient {
    credentials: Credentials,
    http_client: Client,
    base_url: String,
    budget: Arc<RateBudget>,
}

impl RestClient {
    pub fn new(credentials: Credentials, config: RestConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            credentials,
            http_client,
            base_url: config.base_url,
            budget: Arc::new(RateBudget::new(
                config.public_rate_limit,
                config.private_rate_limit,
            )),
        }
    }

    /// Execute a request with rate limiting and bounded retries.
    ///
    /// Transient and rate-limit errors retry with jittered backoff until
    /// either the attempt cap or the cumulative 30 s budget is reached;
    /// every other error surfaces immediately.
    async fn execute<T: DeserializeOwned>(
        &self,
        class: EndpointClass,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T, GatewayError> {
        let mut backoff = Backoff::for_rest();
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff.next_delay();
                if started.elapsed() + delay > MAX_RETRY_BUDGET {
                    break;
                }
                debug!(path, attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                sleep(delay).await;
            }

            match self.send_once(class, method.clone(), path, body.clone()).await {
                Ok(text) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        GatewayError::Transient(format!("failed to parse response from {path}: {e}"))
                    });
                }
                Err(e) if e.is_retryable() => {
                    // A 429 means the whole class is over budget, not just
                    // this call: cool the class down before any retry.
                    if matches!(e, GatewayError::RateLimited(_)) {
                        self.budget.penalize(class, RATE_LIMIT_COOLDOWN).await;
                    }
                    warn!(path, attempt, error = %e, "Retryable request failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| GatewayError::Transient(format!("request to {path} failed"))))
    }

    async fn send_once(
        &self,
        class: EndpointClass,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String, GatewayError> {
        self.budget.acquire(class).await;

        let timestamp = Utc::now().timestamp().to_string();
        let body_str = body.as_deref().unwrap_or("");
        let signature = self
            .credentials
            .sign(&timestamp, method.as_str(), path, body_str);

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http_client
            .request(method, &url)
            .header("CB-ACCESS-KEY", self.credentials.api_key())
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp);

        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::Transient(format!("network error calling {path}: {e}"))
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("failed to read response: {e}")))?;

        classify_status(status, path, text)
    }

    // ==================== ACCOUNTS & PRODUCTS ====================

    pub async fn get_accounts(&self) -> Result<Vec<Account>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            accounts: Vec<Account>,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::GET,
                &format!("{API_PREFIX}/accounts"),
                None,
            )
            .await?;
        Ok(env.accounts)
    }

    pub async fn list_products(&self) -> Result<Vec<ProductWire>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            products: Vec<ProductWire>,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Public,
                Method::GET,
                &format!("{API_PREFIX}/products"),
                None,
            )
            .await?;
        Ok(env.products)
    }

    /// Fetch candles for a product, returned in ascending start-time order.
    pub async fn get_candles(
        &self,
        product: &ProductId,
        granularity: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            candles: Vec<CandleWire>,
        }

        let mut path = format!(
            "{API_PREFIX}/products/{}/candles?granularity={}&limit={}",
            product, granularity, limit
        );
        if let Some(start) = start {
            path.push_str(&format!("&start={}", start.timestamp()));
        }
        if let Some(end) = end {
            path.push_str(&format!("&end={}", end.timestamp()));
        }

        let env: Envelope = self
            .execute(EndpointClass::Public, Method::GET, &path, None)
            .await?;

        let mut candles: Vec<Candle> = env
            .candles
            .into_iter()
            .filter_map(|c| {
                let ts: i64 = c.start.parse().ok()?;
                Some(Candle {
                    start_time: DateTime::from_timestamp(ts, 0)?,
                    open: c.open.parse().ok()?,
                    high: c.high.parse().ok()?,
                    low: c.low.parse().ok()?,
                    close: c.close.parse().ok()?,
                    volume: c.volume.parse().ok()?,
                })
            })
            .collect();
        candles.sort_by_key(|c| c.start_time);
        Ok(candles)
    }

    pub async fn get_best_bid_ask(
        &self,
        products: &[ProductId],
    ) -> Result<Vec<BidAsk>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            pricebooks: Vec<BidAsk>,
        }
        let ids = products
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let env: Envelope = self
            .execute(
                EndpointClass::Public,
                Method::GET,
                &format!("{API_PREFIX}/best_bid_ask?product_ids={ids}"),
                None,
            )
            .await?;
        Ok(env.pricebooks)
    }

    pub async fn get_recent_trades(
        &self,
        product: &ProductId,
        limit: usize,
    ) -> Result<Vec<MarketTrade>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            trades: Vec<MarketTrade>,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Public,
                Method::GET,
                &format!("{API_PREFIX}/products/{product}/ticker?limit={limit}"),
                None,
            )
            .await?;
        Ok(env.trades)
    }

    // ==================== ORDERS ====================

    pub async fn preview_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderPreview, GatewayError> {
        let body = serde_json::to_string(request)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        self.execute(
            EndpointClass::Private,
            Method::POST,
            &format!("{API_PREFIX}/orders/preview"),
            Some(body),
        )
        .await
    }

    pub async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            success_response: OrderAck,
        }
        let body = serde_json::to_string(request)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::POST,
                &format!("{API_PREFIX}/orders"),
                Some(body),
            )
            .await?;
        Ok(env.success_response)
    }

    pub async fn cancel_order(&self, exchange_id: &str) -> Result<(), GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            #[allow(dead_code)]
            results: Vec<serde_json::Value>,
        }
        let body = serde_json::json!({ "order_ids": [exchange_id] }).to_string();
        let _: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::POST,
                &format!("{API_PREFIX}/orders/batch_cancel"),
                Some(body),
            )
            .await?;
        Ok(())
    }

    pub async fn get_order(&self, exchange_id: &str) -> Result<OrderStatusWire, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            order: OrderStatusWire,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::GET,
                &format!("{API_PREFIX}/orders/historical/{exchange_id}"),
                None,
            )
            .await?;
        Ok(env.order)
    }

    pub async fn get_fills(
        &self,
        exchange_order_id: Option<&str>,
        product: Option<&ProductId>,
    ) -> Result<Vec<FillWire>, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            fills: Vec<FillWire>,
        }
        let mut path = format!("{API_PREFIX}/orders/historical/fills?limit=100");
        if let Some(id) = exchange_order_id {
            path.push_str(&format!("&order_id={id}"));
        }
        if let Some(product) = product {
            path.push_str(&format!("&product_id={product}"));
        }
        let env: Envelope = self
            .execute(EndpointClass::Private, Method::GET, &path, None)
            .await?;
        Ok(env.fills)
    }

    // ==================== ACCOUNT META ====================

    pub async fn get_transaction_summary(&self) -> Result<TransactionSummary, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            fee_tier: TransactionSummary,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::GET,
                &format!("{API_PREFIX}/transaction_summary"),
                None,
            )
            .await?;
        Ok(env.fee_tier)
    }

    pub async fn check_permissions(&self) -> Result<KeyPermissions, GatewayError> {
        self.execute(
            EndpointClass::Private,
            Method::GET,
            &format!("{API_PREFIX}/key_permissions"),
            None,
        )
        .await
    }

    // ==================== CONVERT ====================

    pub async fn create_convert_quote(
        &self,
        from: &str,
        to: &str,
        amount: &str,
    ) -> Result<ConvertQuote, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            trade: ConvertQuote,
        }
        let body = serde_json::json!({
            "from_account": from,
            "to_account": to,
            "amount": amount,
        })
        .to_string();
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::POST,
                &format!("{API_PREFIX}/convert/quote"),
                Some(body),
            )
            .await?;
        Ok(env.trade)
    }

    pub async fn commit_convert_trade(
        &self,
        quote_id: &str,
    ) -> Result<ConvertTrade, GatewayError> {
        #[derive(Deserialize)]
        struct Envelope {
            trade: ConvertTrade,
        }
        let env: Envelope = self
            .execute(
                EndpointClass::Private,
                Method::POST,
                &format!("{API_PREFIX}/convert/trade/{quote_id}"),
                Some("{}".to_string()),
            )
            .await?;
        Ok(env.trade)
    }
}

/// Map an HTTP status to the gateway error taxonomy.
fn classify_status(
    status: StatusCode,
    path: &str,
    text: String,
) -> Result<String, GatewayError> {
    if status.is_success() {
        return Ok(text);
    }

    let detail = format!("{path}: {status} {text}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GatewayError::Auth(detail)),
        StatusCode::NOT_FOUND => Err(GatewayError::NotFound(detail)),
        StatusCode::TOO_MANY_REQUESTS => Err(GatewayError::RateLimited(detail)),
        s if s.is_server_error() => Err(GatewayError::Transient(detail)),
        _ => Err(GatewayError::InvalidRequest(detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let ok = classify_status(StatusCode::OK, "/p", "body".to_string());
        assert_eq!(ok.unwrap(), "body");

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "/p", String::new()),
            Err(GatewayError::Auth(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "/p", String::new()),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "/p", String::new()),
            Err(GatewayError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "/p", String::new()),
            Err(GatewayError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "/p", String::new()),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(GatewayError::Transient(String::new()).is_retryable());
        assert!(GatewayError::RateLimited(String::new()).is_retryable());
        assert!(!GatewayError::Auth(String::new()).is_retryable());
        assert!(!GatewayError::InvalidRequest(String::new()).is_retryable());
        assert!(!GatewayError::NotFound(String::new()).is_retryable());
    }
}
