use crate::auth::sign_request;
use crate::error::ApiError;
use crate::responses::{ApiErrorResponse, OrderResponse};
use crate::ExchangeClient;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use configuration::ApiConfig;
use core_types::{Candle, Market, OrderRequest, OrderResult, OrderSide};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

const EXCHANGE_NAME: &str = "binance";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Binance error code shared by every "new order rejected" reason; the message tells
/// them apart.
const NEW_ORDER_REJECTED_CODE: i64 = -2010;
const DUPLICATE_ORDER_MSG: &str = "Duplicate order sent";
const INSUFFICIENT_BALANCE_MSG: &str = "insufficient balance";

/// A concrete implementation of the `ExchangeClient` for the Binance spot API.
#[derive(Clone)]
pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
    api_secret: String,
}

impl BinanceClient {
    pub fn new(live_mode: bool, api_config: &ApiConfig) -> Result<Self, ApiError> {
        let (base_url, keys) = if live_mode {
            ("https://api.binance.com".to_string(), &api_config.production)
        } else {
            ("https://testnet.binance.vision".to_string(), &api_config.testnet)
        };

        let mut headers = HeaderMap::new();
        if !keys.key.is_empty() {
            let value = HeaderValue::from_str(&keys.key)
                .map_err(|e| ApiError::InvalidData(format!("invalid API key header: {}", e)))?;
            headers.insert("X-MBX-APIKEY", value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_secret: keys.secret.clone(),
        })
    }

    /// Public market data only; signed calls fail with `MissingCredentials`.
    pub fn public(live_mode: bool) -> Result<Self, ApiError> {
        Self::new(live_mode, &ApiConfig::default())
    }

    fn ensure_market(market: &Market) -> Result<(), ApiError> {
        if market.exchange() != EXCHANGE_NAME {
            return Err(ApiError::UnsupportedMarket(market.to_string()));
        }
        Ok(())
    }

    fn signed_url(&self, path: &str, params: &mut BTreeMap<&str, String>) -> Result<String, ApiError> {
        if self.api_secret.is_empty() {
            return Err(ApiError::MissingCredentials(path.to_string()));
        }
        params.insert("timestamp", Utc::now().timestamp_millis().to_string());
        params.insert("recvWindow", "5000".to_string());

        let query_string =
            serde_qs::to_string(params).map_err(|e| ApiError::InvalidData(e.to_string()))?;
        let signature = sign_request(&self.api_secret, &query_string)?;

        Ok(format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        ))
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        let url = self.signed_url(path, params)?;
        let response = self.client.post(&url).send().await?;
        Self::read_body(response).await
    }

    async fn get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        let url = self.signed_url(path, params)?;
        let response = self.client.get(&url).send().await?;
        Self::read_body(response).await
    }

    /// Looks up an order by the client id it was submitted with.
    async fn query_order(&self, request: &OrderRequest) -> Result<OrderResponse, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", request.market.symbol().to_string());
        params.insert("origClientOrderId", client_order_id(request));
        self.get_signed("/api/v3/order", &mut params).await
    }

    async fn read_body<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else {
            Err(classify_failure(status, &text))
        }
    }
}

/// Maps a non-success HTTP response onto the retryable / non-retryable taxonomy.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> ApiError {
    // 429 is throttling and 418 an IP ban that lifts by itself; both are worth waiting out.
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
    {
        return ApiError::Unavailable {
            status: status.as_u16(),
            message: body.to_string(),
        };
    }

    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(err) if err.code == NEW_ORDER_REJECTED_CODE && err.msg.contains(DUPLICATE_ORDER_MSG) => {
            ApiError::DuplicateOrder(err.msg)
        }
        Ok(err)
            if err.code == NEW_ORDER_REJECTED_CODE
                && err.msg.to_lowercase().contains(INSUFFICIENT_BALANCE_MSG) =>
        {
            ApiError::InsufficientBalance(err.msg)
        }
        Ok(err) => ApiError::Rejected {
            code: err.code,
            message: err.msg,
        },
        Err(_) => ApiError::Rejected {
            code: i64::from(status.as_u16()),
            message: body.to_string(),
        },
    }
}

/// One row of `GET /api/v3/klines`, which Binance sends as a positional array.
#[derive(Deserialize)]
struct RawKline {
    open_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    close_time: i64,
    _quote_volume: IgnoredAny,
    _trades: IgnoredAny,
    _taker_buy_base_volume: IgnoredAny,
    _taker_buy_quote_volume: IgnoredAny,
    _unused: IgnoredAny,
}

fn client_order_id(request: &OrderRequest) -> String {
    request.client_order_id.simple().to_string()
}

/// Average fill price from the quote total; the request price for empty fills.
fn to_order_result(request: &OrderRequest, response: &OrderResponse) -> OrderResult {
    let filled_price = if response.executed_qty.is_zero() {
        request.price
    } else {
        response.cummulative_quote_qty / response.executed_qty
    };
    OrderResult {
        exchange_order_id: response.order_id.to_string(),
        filled_price,
        filled_quantity: response.executed_qty,
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ApiError> {
    Decimal::from_str(raw).map_err(|e| ApiError::Deserialization(format!("{}: {}", field, e)))
}

fn to_candle(raw: RawKline, interval: &str) -> Result<Candle, ApiError> {
    Ok(Candle {
        open_time: Utc
            .timestamp_millis_opt(raw.open_time)
            .single()
            .ok_or_else(|| ApiError::InvalidData(format!("Invalid open_time: {}", raw.open_time)))?,
        open: parse_decimal("open", &raw.open)?,
        high: parse_decimal("high", &raw.high)?,
        low: parse_decimal("low", &raw.low)?,
        close: parse_decimal("close", &raw.close)?,
        volume: parse_decimal("volume", &raw.volume)?,
        close_time: Utc
            .timestamp_millis_opt(raw.close_time)
            .single()
            .ok_or_else(|| ApiError::InvalidData(format!("Invalid close_time: {}", raw.close_time)))?,
        interval: interval.to_string(),
    })
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn fetch_candles(
        &self,
        market: &Market,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ApiError> {
        Self::ensure_market(market)?;
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = count.clamp(1, 1000).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", market.symbol()),
                ("interval", interval),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        let raw: Vec<RawKline> = Self::read_body(response).await?;

        raw.into_iter().map(|k| to_candle(k, interval)).collect()
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, ApiError> {
        Self::ensure_market(&request.market)?;

        let mut params = BTreeMap::new();
        params.insert("symbol", request.market.symbol().to_string());
        params.insert(
            "side",
            match request.side {
                OrderSide::Buy => "BUY".to_string(),
                OrderSide::Sell => "SELL".to_string(),
            },
        );
        params.insert("type", "MARKET".to_string());
        params.insert("quantity", request.quantity.normalize().to_string());
        params.insert("newClientOrderId", client_order_id(request));
        params.insert("newOrderRespType", "FULL".to_string());

        let response: OrderResponse = match self.post_signed("/api/v3/order", &mut params).await {
            Ok(response) => response,
            // An earlier attempt reached the exchange even though its response did not
            // reach us; report that order instead of placing another.
            Err(ApiError::DuplicateOrder(msg)) => {
                tracing::warn!(
                    market = %request.market,
                    client_order_id = %client_order_id(request),
                    message = %msg,
                    "Order already placed, fetching it"
                );
                self.query_order(request).await?
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(
            market = %request.market,
            order_id = response.order_id,
            status = %response.status,
            fills = response.fills.len(),
            "Binance accepted order"
        );

        Ok(to_order_result(request, &response))
    }
}
