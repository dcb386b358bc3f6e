//! Signed REST client for the venue
//!
//! HMAC-SHA256 request signing over the JSON payload, with venue status
//! codes mapped onto the gateway error taxonomy.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::config::ExchangeConfig;
use crate::ledger::{ExchangeOrder, OrderState};
use crate::{Candle, Side, Symbol, Timeframe};

use super::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

pub struct RestClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()
            .expect("Failed to create HTTP client");

        RestClient {
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            api_secret: config.api_secret.clone().unwrap_or_default(),
            client,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Parse(format!("request encode: {}", e)))?;
        let signature = self.sign(&payload);

        let response = self
            .client
            .post(&url)
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        decode_response(response).await
    }

    async fn public_get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        decode_response(response).await
    }

    pub async fn ping(&self) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.public_get("/v1/time", &[]).await?;
        Ok(())
    }

    pub async fn create_order(
        &self,
        symbol: &Symbol,
        side: Side,
        limit_price: Option<f64>,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let request = CreateOrderRequest {
            market: symbol.as_str().to_string(),
            side: side.as_str().to_string(),
            order_type: match limit_price {
                Some(_) => "limit_order".to_string(),
                None => "market_order".to_string(),
            },
            price_per_unit: limit_price,
            total_quantity: quantity,
            timestamp: Utc::now().timestamp_millis(),
        };

        let response: CreateOrderResponse = self.signed_post("/v1/orders/create", &request).await?;
        Ok(response.id)
    }

    pub async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<(), ExchangeError> {
        let request = CancelOrderRequest {
            id: order_id.to_string(),
            market: symbol.as_str().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let _: serde_json::Value = self.signed_post("/v1/orders/cancel", &request).await?;
        Ok(())
    }

    pub async fn cancel_all(
        &self,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Vec<String>, ExchangeError> {
        let request = CancelAllRequest {
            market: symbol.as_str().to_string(),
            side: side.as_str().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let response: CancelAllResponse = self
            .signed_post("/v1/orders/cancel_all", &request)
            .await?;
        Ok(response.ids)
    }

    pub async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let request = OrdersQueryRequest {
            market: symbol.as_str().to_string(),
            from_timestamp: None,
            timestamp: Utc::now().timestamp_millis(),
        };
        let response: Vec<WireOrder> = self.signed_post("/v1/orders/active", &request).await?;
        Ok(response.into_iter().map(WireOrder::into_order).collect())
    }

    pub async fn orders_since(
        &self,
        symbol: &Symbol,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let request = OrdersQueryRequest {
            market: symbol.as_str().to_string(),
            from_timestamp: Some(since_ms),
            timestamp: Utc::now().timestamp_millis(),
        };
        let response: Vec<WireOrder> = self.signed_post("/v1/orders/history", &request).await?;
        Ok(response.into_iter().map(WireOrder::into_order).collect())
    }

    pub async fn balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let request = BalanceRequest {
            timestamp: Utc::now().timestamp_millis(),
        };
        let balances: Vec<WireBalance> = self.signed_post("/v1/users/balances", &request).await?;
        Ok(balances
            .into_iter()
            .find(|b| b.currency.eq_ignore_ascii_case(asset))
            .map(|b| b.balance)
            .unwrap_or(0.0))
    }

    /// Fetch the most recent closed candles, oldest first
    pub async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<WireCandle> = self
            .public_get(
                "/v1/market/candles",
                &[
                    ("symbol", symbol.as_str().to_string()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| Candle::from_millis(row.t, row.o, row.h, row.l, row.c, row.v))
            .collect();
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ExchangeError {
    ExchangeError::Transport(err.to_string())
}

async fn decode_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> ExchangeError {
    let lower = body.to_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExchangeError::RateLimited(body.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExchangeError::Authentication(body.to_string())
        }
        StatusCode::NOT_FOUND if lower.contains("order") => {
            ExchangeError::UnknownOrder(body.to_string())
        }
        status if status.is_server_error() => ExchangeError::Transport(body.to_string()),
        _ if lower.contains("insufficient") => ExchangeError::InsufficientFunds(body.to_string()),
        _ if lower.contains("not found") => ExchangeError::UnknownOrder(body.to_string()),
        _ => ExchangeError::Rejected(body.to_string()),
    }
}

// ----------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CreateOrderRequest {
    market: String,
    side: String,
    order_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_per_unit: Option<f64>,
    total_quantity: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CancelOrderRequest {
    id: String,
    market: String,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct CancelAllRequest {
    market: String,
    side: String,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct CancelAllResponse {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OrdersQueryRequest {
    market: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_timestamp: Option<i64>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct BalanceRequest {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    side: String,
    price_per_unit: f64,
    total_quantity: f64,
    status: String,
}

impl WireOrder {
    fn into_order(self) -> ExchangeOrder {
        ExchangeOrder {
            id: self.id,
            side: if self.side == "sell" {
                Side::Sell
            } else {
                Side::Buy
            },
            price: self.price_per_unit,
            quantity: self.total_quantity,
            state: map_status(&self.status),
        }
    }
}

fn map_status(status: &str) -> OrderState {
    match status {
        "init" | "open" | "partially_filled" => OrderState::Open,
        "filled" => OrderState::Filled,
        "cancelled" | "canceled" => OrderState::Cancelled,
        "rejected" => OrderState::Rejected,
        _ => OrderState::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct WireBalance {
    currency: String,
    balance: f64,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}
