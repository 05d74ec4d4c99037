//! Bybit v5 REST gateway (USDT linear perpetuals).
//!
//! Handles:
//! - Request signing (HMAC-SHA256 over timestamp, key, recv window and payload)
//! - Wallet balance, klines and instrument lot-size filters
//! - Market order placement, status queries and cancellation
//!
//! Market-data endpoints are public; a gateway built with
//! [`BybitGateway::public`] can serve them without credentials.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::error::GatewayError;
use crate::models::{Bar, ExchangeLimits, FillStatus, OrderRequest, Timeframe};

use super::ExecutionGateway;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";
const MAX_KLINE_LIMIT: usize = 1000;

/// retCodes that mean the key itself is unusable.
const FATAL_RET_CODES: [i64; 6] = [10003, 10004, 10005, 10007, 10009, 33004];
/// orderLinkId already used: the original submission reached the book.
const DUPLICATE_ORDER_LINK_ID: i64 = 110072;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

pub struct BybitGateway {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

// ==================== Wire Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    #[serde(default)]
    total_equity: String,
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default)]
    equity: String,
    #[serde(default)]
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    #[serde(default)]
    status: String,
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(default)]
    min_order_qty: String,
    #[serde(default)]
    qty_step: String,
    #[serde(default)]
    min_notional_value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrder<'a> {
    category: &'a str,
    symbol: &'a str,
    side: &'a str,
    order_type: &'a str,
    qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    reduce_only: bool,
    order_link_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRecord {
    #[serde(default)]
    order_id: String,
    order_status: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    reject_reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrder<'a> {
    category: &'a str,
    symbol: &'a str,
    order_id: &'a str,
}

impl BybitGateway {
    /// Create a signed client.
    pub fn new(api_key: &str, api_secret: &str, testnet: bool) -> Result<Self, GatewayError> {
        Self::build(
            Some(Credentials {
                api_key: api_key.to_string(),
                api_secret: api_secret.to_string(),
            }),
            testnet,
        )
    }

    /// Create a client limited to public market data.
    pub fn public(testnet: bool) -> Result<Self, GatewayError> {
        Self::build(None, testnet)
    }

    fn build(credentials: Option<Credentials>, testnet: bool) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: if testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            credentials,
        })
    }

    /// Create from environment variables:
    /// - BYBIT_API_KEY
    /// - BYBIT_API_SECRET
    /// - BYBIT_TESTNET (forces testnet when set)
    pub fn from_env(testnet: bool) -> anyhow::Result<Self> {
        use anyhow::Context;

        let api_key = std::env::var("BYBIT_API_KEY").context("BYBIT_API_KEY not set")?;
        let api_secret = std::env::var("BYBIT_API_SECRET").context("BYBIT_API_SECRET not set")?;
        let testnet = testnet || testnet_from_env();

        Ok(Self::new(&api_key, &api_secret, testnet)?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ==================== Transport ====================

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        debug!(url = %url, "GET");
        let resp = self.http.get(&url).send().await.map_err(transport_error)?;
        read_envelope(resp).await
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let headers = self.auth_headers(query)?;
        debug!(url = %url, "GET (signed)");
        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(transport_error)?;
        read_envelope(resp).await
    }

    async fn post_signed<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_string(body)
            .map_err(|e| GatewayError::Fatal(format!("failed to encode request: {}", e)))?;
        let mut headers = self.auth_headers(&payload)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        debug!(url = %url, body = %payload, "POST (signed)");

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(transport_error)?;
        read_envelope(resp).await
    }

    fn auth_headers(&self, payload: &str) -> Result<HeaderMap, GatewayError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Fatal("BYBIT_API_KEY/BYBIT_API_SECRET missing".into()))?;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign(&creds.api_secret, &timestamp, &creds.api_key, RECV_WINDOW, payload)?;

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-bapi-api-key", creds.api_key.as_str()),
            ("x-bapi-timestamp", timestamp.as_str()),
            ("x-bapi-sign", signature.as_str()),
            ("x-bapi-recv-window", RECV_WINDOW),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::Fatal(format!("invalid header {}: {}", name, e)))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(headers)
    }

    /// Look an order up by `orderId` or `orderLinkId`.
    async fn query_order(
        &self,
        symbol: &str,
        id_field: &str,
        id: &str,
    ) -> Result<Option<OrderRecord>, GatewayError> {
        let query = format!("category={}&symbol={}&{}={}", CATEGORY, symbol, id_field, id);

        // open and recently closed orders
        let live: ListResult<OrderRecord> = self.get_signed("/v5/order/realtime", &query).await?;
        if let Some(record) = live.list.into_iter().next() {
            return Ok(Some(record));
        }

        let history: ListResult<OrderRecord> = self.get_signed("/v5/order/history", &query).await?;
        Ok(history.list.into_iter().next())
    }
}

pub(crate) fn testnet_from_env() -> bool {
    std::env::var("BYBIT_TESTNET")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Hex HMAC-SHA256 of `timestamp + api_key + recv_window + payload`.
fn sign(
    secret: &str,
    timestamp: &str,
    api_key: &str,
    recv_window: &str,
    payload: &str,
) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Fatal(format!("invalid api secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(api_key.as_bytes());
    mac.update(recv_window.as_bytes());
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transient(format!("request timed out: {}", err))
    } else {
        GatewayError::Transient(format!("request failed: {}", err))
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let msg = format!("HTTP {}: {}", status, body);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Fatal(msg)
    } else {
        GatewayError::Transient(msg)
    }
}

fn classify_ret_code(code: i64, msg: &str) -> GatewayError {
    let text = format!("retCode {}: {}", code, msg);
    if FATAL_RET_CODES.contains(&code) {
        GatewayError::Fatal(text)
    } else if code == DUPLICATE_ORDER_LINK_ID {
        GatewayError::Duplicate(text)
    } else {
        GatewayError::Transient(text)
    }
}

async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, GatewayError> {
    let status = resp.status();
    let text = resp.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }
    parse_envelope(&text)
}

fn parse_envelope<T: DeserializeOwned>(text: &str) -> Result<T, GatewayError> {
    let envelope: Envelope<T> = serde_json::from_str(text)
        .map_err(|e| GatewayError::Transient(format!("unparseable response: {} ({})", e, text)))?;

    if envelope.ret_code != 0 {
        return Err(classify_ret_code(envelope.ret_code, &envelope.ret_msg));
    }
    envelope
        .result
        .ok_or_else(|| GatewayError::Transient("response without result".into()))
}

fn decimal(field: &str, value: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(value)
        .map_err(|e| GatewayError::Transient(format!("bad decimal in {}: {:?} ({})", field, value, e)))
}

/// Empty and zero strings mean "absent" in Bybit payloads.
fn optional_decimal(value: &str) -> Option<Decimal> {
    Decimal::from_str(value).ok().filter(|d| !d.is_zero())
}

/// Kline rows come newest first as `[start, open, high, low, close, volume, turnover]`.
fn parse_klines(rows: &[Vec<String>]) -> Result<Vec<Bar>, GatewayError> {
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 6 {
            return Err(GatewayError::Transient(format!("short kline row: {:?}", row)));
        }
        let start: i64 = row[0]
            .parse()
            .map_err(|_| GatewayError::Transient(format!("bad kline start: {}", row[0])))?;
        let timestamp = Utc
            .timestamp_millis_opt(start)
            .single()
            .ok_or_else(|| GatewayError::Transient(format!("kline start out of range: {}", start)))?;

        bars.push(Bar {
            timestamp,
            open: decimal("open", &row[1])?,
            high: decimal("high", &row[2])?,
            low: decimal("low", &row[3])?,
            close: decimal("close", &row[4])?,
            volume: decimal("volume", &row[5])?,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

fn fill_status(record: &OrderRecord) -> FillStatus {
    let filled = optional_decimal(&record.cum_exec_qty).unwrap_or(Decimal::ZERO);
    let avg_price = optional_decimal(&record.avg_price);

    match record.order_status.as_str() {
        "Filled" => FillStatus::Filled {
            qty: filled,
            avg_price,
        },
        // terminal with a partial fill: what filled is final
        "PartiallyFilledCanceled" => FillStatus::Filled {
            qty: filled,
            avg_price,
        },
        "PartiallyFilled" => FillStatus::PartiallyFilled {
            filled_qty: filled,
            avg_price,
        },
        "Cancelled" | "Rejected" | "Deactivated" if filled > Decimal::ZERO => FillStatus::Filled {
            qty: filled,
            avg_price,
        },
        "Cancelled" | "Rejected" | "Deactivated" => FillStatus::Rejected {
            reason: if record.reject_reason.is_empty() {
                record.order_status.clone()
            } else {
                format!("{} ({})", record.order_status, record.reject_reason)
            },
        },
        _ => FillStatus::Pending,
    }
}

fn limits_from(filter: &LotSizeFilter) -> ExchangeLimits {
    let defaults = ExchangeLimits::default();
    ExchangeLimits {
        min_qty: optional_decimal(&filter.min_order_qty),
        min_notional: optional_decimal(&filter.min_notional_value),
        qty_step: optional_decimal(&filter.qty_step).unwrap_or(defaults.qty_step),
    }
}

/// Limits of a listed, trading instrument. An empty list means the symbol
/// does not exist in this category.
fn instrument_limits(symbol: &str, list: &[Instrument]) -> Result<ExchangeLimits, GatewayError> {
    match list.first() {
        Some(i) if i.status.is_empty() || i.status == "Trading" => Ok(limits_from(&i.lot_size_filter)),
        Some(i) => Err(GatewayError::UnknownSymbol(format!("{} is {}", symbol, i.status))),
        None => Err(GatewayError::UnknownSymbol(symbol.to_string())),
    }
}

#[async_trait]
impl ExecutionGateway for BybitGateway {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn fetch_balance(&self, account_type: &str) -> Result<Decimal, GatewayError> {
        let query = format!("accountType={}&coin=USDT", account_type);
        let result: ListResult<WalletAccount> =
            self.get_signed("/v5/account/wallet-balance", &query).await?;

        let account = result
            .list
            .first()
            .ok_or_else(|| GatewayError::Transient("wallet-balance returned no account".into()))?;

        let usdt = account
            .coin
            .iter()
            .find(|c| c.coin == "USDT")
            .and_then(|c| optional_decimal(&c.equity).or_else(|| optional_decimal(&c.wallet_balance)));

        Ok(usdt
            .or_else(|| optional_decimal(&account.total_equity))
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError> {
        let query = format!(
            "category={}&symbol={}&interval={}&limit={}",
            CATEGORY,
            symbol,
            timeframe.bybit_interval(),
            limit.clamp(1, MAX_KLINE_LIMIT)
        );
        let result: ListResult<Vec<String>> = self.get_public("/v5/market/kline", &query).await?;
        parse_klines(&result.list)
    }

    async fn exchange_limits(&self, symbol: &str) -> Result<ExchangeLimits, GatewayError> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<Instrument> =
            self.get_public("/v5/market/instruments-info", &query).await?;

        instrument_limits(symbol, &result.list)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError> {
        let body = CreateOrder {
            category: CATEGORY,
            symbol: &order.symbol,
            side: order.side.as_str(),
            order_type: order.order_type(),
            qty: order.qty.normalize().to_string(),
            price: order.price.map(|p| p.normalize().to_string()),
            reduce_only: order.reduce_only,
            order_link_id: &order.client_order_id,
        };
        let ack: OrderAck = self.post_signed("/v5/order/create", &body).await?;
        Ok(ack.order_id)
    }

    async fn order_fill(&self, symbol: &str, order_id: &str) -> Result<FillStatus, GatewayError> {
        match self.query_order(symbol, "orderId", order_id).await? {
            Some(record) => Ok(fill_status(&record)),
            // not yet visible to the query endpoints
            None => Ok(FillStatus::Pending),
        }
    }

    async fn find_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<String>, GatewayError> {
        let record = self.query_order(symbol, "orderLinkId", client_order_id).await?;
        Ok(record.map(|r| r.order_id).filter(|id| !id.is_empty()))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let body = CancelOrder {
            category: CATEGORY,
            symbol,
            order_id,
        };
        let _: Value = self.post_signed("/v5/order/cancel", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signature_shape() {
        let a = sign("secret", "1700000000000", "key", RECV_WINDOW, "category=linear").unwrap();
        let b = sign("secret", "1700000000000", "key", RECV_WINDOW, "category=linear").unwrap();
        let c = sign("secret", "1700000000001", "key", RECV_WINDOW, "category=linear").unwrap();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_auth_errors_are_fatal() {
        assert!(classify_ret_code(10003, "invalid api key").is_fatal());
        assert!(classify_ret_code(10004, "sign error").is_fatal());
        assert!(!classify_ret_code(10006, "too many visits").is_fatal());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(!classify_status(StatusCode::BAD_GATEWAY, "").is_fatal());
    }

    #[test]
    fn test_duplicate_order_link_id() {
        let err = classify_ret_code(110072, "OrderLinkedID is duplicate");
        assert!(matches!(err, GatewayError::Duplicate(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_order_lookup_by_link_id() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[
            {"orderId":"1321003749386327552","orderLinkId":"6f1c","orderStatus":"Filled",
             "cumExecQty":"0.5","avgPrice":"42000","rejectReason":"EC_NoError"}
        ]}}"#;
        let result: ListResult<OrderRecord> = parse_envelope(body).unwrap();
        let record = result.list.into_iter().next().unwrap();

        assert_eq!(record.order_id, "1321003749386327552");
        assert!(matches!(fill_status(&record), FillStatus::Filled { .. }));
    }

    #[test]
    fn test_envelope_error_code() {
        let body = r#"{"retCode":10004,"retMsg":"error sign!","result":{}}"#;
        let err = parse_envelope::<Value>(body).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_klines_are_returned_oldest_first() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","symbol":"BTCUSDT","list":[
            ["1700000060000","101","103","100","102","12.5","1275"],
            ["1700000000000","100","102","99","101","10","1010"]
        ]}}"#;
        let result: ListResult<Vec<String>> = parse_envelope(body).unwrap();
        let bars = parse_klines(&result.list).unwrap();

        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[0].close, dec!(101));
        assert_eq!(bars[1].high, dec!(103));
    }

    #[test]
    fn test_fill_status_mapping() {
        let record = |status: &str, cum: &str, avg: &str| OrderRecord {
            order_id: String::new(),
            order_status: status.into(),
            cum_exec_qty: cum.into(),
            avg_price: avg.into(),
            reject_reason: String::new(),
        };

        assert_eq!(
            fill_status(&record("Filled", "0.5", "42000.5")),
            FillStatus::Filled {
                qty: dec!(0.5),
                avg_price: Some(dec!(42000.5))
            }
        );
        assert_eq!(fill_status(&record("New", "0", "")), FillStatus::Pending);
        assert!(matches!(
            fill_status(&record("PartiallyFilled", "0.2", "42000")),
            FillStatus::PartiallyFilled { .. }
        ));
        assert!(matches!(
            fill_status(&record("Cancelled", "0", "0")),
            FillStatus::Rejected { .. }
        ));
        assert_eq!(
            fill_status(&record("PartiallyFilledCanceled", "0.2", "42000")),
            FillStatus::Filled {
                qty: dec!(0.2),
                avg_price: Some(dec!(42000))
            }
        );
    }

    #[test]
    fn test_lot_size_filter() {
        let limits = limits_from(&LotSizeFilter {
            min_order_qty: "0.001".into(),
            qty_step: "0.001".into(),
            min_notional_value: "5".into(),
        });
        assert_eq!(limits.min_qty, Some(dec!(0.001)));
        assert_eq!(limits.min_notional, Some(dec!(5)));
        assert_eq!(limits.qty_step, dec!(0.001));

        let empty = limits_from(&LotSizeFilter {
            min_order_qty: String::new(),
            qty_step: String::new(),
            min_notional_value: String::new(),
        });
        assert_eq!(empty.qty_step, ExchangeLimits::default().qty_step);
        assert!(empty.min_qty.is_none());
    }

    #[test]
    fn test_unlisted_symbol_is_unknown() {
        let list: ListResult<Instrument> = serde_json::from_str(
            r#"{"list":[{"symbol":"OLDUSDT","status":"Closed","lotSizeFilter":{"qtyStep":"0.1"}}]}"#,
        )
        .unwrap();
        assert!(matches!(
            instrument_limits("OLDUSDT", &list.list),
            Err(GatewayError::UnknownSymbol(_))
        ));
        assert_eq!(
            instrument_limits("NOPEUSDT", &[]),
            Err(GatewayError::UnknownSymbol("NOPEUSDT".into()))
        );

        let live: ListResult<Instrument> = serde_json::from_str(
            r#"{"list":[{"status":"Trading","lotSizeFilter":{"qtyStep":"0.01","minOrderQty":"0.01"}}]}"#,
        )
        .unwrap();
        let limits = instrument_limits("SOLUSDT", &live.list).unwrap();
        assert_eq!(limits.qty_step, dec!(0.01));
    }
}
