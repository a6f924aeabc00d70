// src/connectors/binance.rs
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectors::traits::{ExecutionHandler, MarketData};
use crate::error::BotError;
use crate::types::{Candle, CandleSeries, OrderResponse, Side};
use crate::utils::precision::{normalize_price, normalize_quantity};

type HmacSha256 = Hmac<Sha256>;

const KLINE_BATCH_LIMIT: u32 = 1000;
const FILTER_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Exchange trading filters for the configured symbol.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub tick_size: Decimal,
}

/// TTL-bounded cache of the symbol filters, owned by the client. Expired
/// entries are refetched on the next order, not in the background.
struct FilterCache {
    entry: std::sync::Mutex<Option<(SymbolFilters, std::time::Instant)>>,
}

impl FilterCache {
    fn new() -> Self {
        Self {
            entry: std::sync::Mutex::new(None),
        }
    }

    fn get(&self) -> Option<SymbolFilters> {
        let entry = self.entry.lock().expect("filter cache lock");
        entry
            .filter(|(_, fetched_at)| fetched_at.elapsed() < FILTER_CACHE_TTL)
            .map(|(filters, _)| filters)
    }

    fn put(&self, filters: SymbolFilters) {
        let mut entry = self.entry.lock().expect("filter cache lock");
        *entry = Some((filters, std::time::Instant::now()));
    }
}

pub struct BinanceClient {
    api_key: String,
    secret_key: String,
    symbol: String,
    http_client: Client,
    base_rest_url: String,
    filter_cache: FilterCache,
    fallback_filters: SymbolFilters,
}

impl BinanceClient {
    pub fn new(cfg: &AppConfig) -> Result<Self, BotError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| BotError::Config(format!("http client: {e}")))?;
        Ok(Self {
            api_key: cfg.api_key.clone(),
            secret_key: cfg.secret_key.clone(),
            symbol: cfg.symbol.clone(),
            http_client,
            base_rest_url: "https://api.binance.com".to_string(),
            filter_cache: FilterCache::new(),
            fallback_filters: SymbolFilters {
                step_size: cfg.symbol_step_size,
                tick_size: cfg.symbol_tick_size,
            },
        })
    }

    /// Filters from the cache, refetched from the exchange once the TTL
    /// lapses. The configured step/tick sizes back a failed fetch.
    async fn symbol_filters(&self) -> SymbolFilters {
        if let Some(filters) = self.filter_cache.get() {
            return filters;
        }
        let url = format!(
            "{}/api/v3/exchangeInfo?symbol={}",
            self.base_rest_url, self.symbol
        );
        let fetched = async {
            let info = self
                .http_client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<serde_json::Value>()
                .await?;
            Ok::<_, reqwest::Error>(parse_symbol_filters(&info))
        }
        .await;

        match fetched {
            Ok(Some(filters)) => {
                self.filter_cache.put(filters);
                filters
            }
            Ok(None) => {
                warn!(symbol = %self.symbol, "exchange info had no usable filters, using configured sizes");
                self.fallback_filters
            }
            Err(e) => {
                warn!(error = %e, "exchange info fetch failed, using configured sizes");
                self.fallback_filters
            }
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, url: &str) -> Self {
        self.base_rest_url = url.to_string();
        self
    }

    fn sign_and_build_query(&self, params: Vec<(&str, String)>) -> Result<String, BotError> {
        let mut params = params;
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("timestamp", timestamp));

        let query_string = serde_urlencoded::to_string(&params)
            .map_err(|e| BotError::Gateway(format!("query encode: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| BotError::Config("invalid secret key length".into()))?;
        mac.update(query_string.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{query_string}&signature={signature}"))
    }

    async fn send_signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, BotError> {
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, full_query);

        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<T>().await?)
    }

    /// One klines page ending at `end_time` (inclusive), newest page first.
    async fn fetch_kline_batch(
        &self,
        interval: &str,
        end_time: i64,
    ) -> Result<Vec<Candle>, BotError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&endTime={}&limit={}",
            self.base_rest_url, self.symbol, interval, end_time, KLINE_BATCH_LIMIT
        );
        let rows = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<serde_json::Value>>()
            .await?;

        Ok(rows.iter().filter_map(parse_kline).collect())
    }
}

/// Pulls LOT_SIZE step and PRICE_FILTER tick out of an exchangeInfo
/// payload for a single symbol.
fn parse_symbol_filters(info: &serde_json::Value) -> Option<SymbolFilters> {
    let filters = info.get("symbols")?.get(0)?.get("filters")?.as_array()?;
    let value_of = |filter_type: &str, key: &str| -> Option<Decimal> {
        filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))?
            .get(key)?
            .as_str()?
            .parse::<Decimal>()
            .ok()
    };
    Some(SymbolFilters {
        step_size: value_of("LOT_SIZE", "stepSize")?,
        tick_size: value_of("PRICE_FILTER", "tickSize")?,
    })
}

/// Decodes one raw kline row. Binance sends prices and volume as strings
/// inside a positional array.
fn parse_kline(row: &serde_json::Value) -> Option<Candle> {
    let row = row.as_array()?;
    let field = |i: usize| row.get(i)?.as_str()?.parse::<f64>().ok();
    Some(Candle {
        open_time: row.first()?.as_i64()?,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
        close_time: row.get(6)?.as_i64()?,
    })
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn fetch_candles(&self, interval: &str, days: u32) -> Result<CandleSeries, BotError> {
        let now = Utc::now().timestamp_millis();
        let start_time = now - i64::from(days) * 86_400_000;
        let mut end_time = now;
        let mut collected: Vec<Candle> = Vec::new();

        // Page backwards in 1000-bar chunks until the window start.
        loop {
            let batch = self.fetch_kline_batch(interval, end_time).await?;
            let Some(first) = batch.first() else {
                break;
            };
            let oldest_open = first.open_time;
            collected.extend(batch);
            if oldest_open <= start_time {
                break;
            }
            end_time = oldest_open - 1;
        }

        collected.retain(|c| c.open_time >= start_time);
        let series = CandleSeries::from_unordered(&self.symbol, interval, collected);
        debug!(
            symbol = %self.symbol,
            interval,
            bars = series.len(),
            "fetched candle history"
        );
        if series.is_empty() {
            return Err(BotError::TransientFetch(format!(
                "no candles returned for {} {}",
                self.symbol, interval
            )));
        }
        Ok(series)
    }

    async fn fetch_live_price(&self) -> Result<f64, BotError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_rest_url, self.symbol
        );
        let resp = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        resp.get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| {
                BotError::TransientFetch(format!("unparseable price for {}", self.symbol))
            })
    }

    async fn fetch_current_high_low(&self, interval: &str) -> Result<(f64, f64), BotError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit=1",
            self.base_rest_url, self.symbol, interval
        );
        let rows = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<serde_json::Value>>()
            .await?;

        rows.last()
            .and_then(parse_kline)
            .map(|c| (c.high, c.low))
            .ok_or_else(|| {
                BotError::TransientFetch(format!(
                    "no current bar for {} {}",
                    self.symbol, interval
                ))
            })
    }
}

#[async_trait]
impl ExecutionHandler for BinanceClient {
    async fn get_balance(&self, asset: &str) -> Result<f64, BotError> {
        #[derive(Deserialize)]
        struct Balance {
            asset: String,
            free: String,
        }
        #[derive(Deserialize)]
        struct AccountInfo {
            balances: Vec<Balance>,
        }

        let resp: AccountInfo = self
            .send_signed_request(Method::GET, "/api/v3/account", vec![])
            .await?;

        let balance = resp
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .ok_or_else(|| BotError::Gateway(format!("asset {asset} not found in account")))?;

        balance
            .free
            .parse::<f64>()
            .map_err(|e| BotError::Gateway(format!("balance parse for {asset}: {e}")))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, BotError> {
        let filters = self.symbol_filters().await;
        let quantity = normalize_quantity(quantity, filters.step_size);
        if quantity.is_zero() {
            return Err(BotError::Gateway(
                "quantity is zero after step-size normalization".into(),
            ));
        }

        let client_order_id = Uuid::new_v4().to_string();
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("quantity", quantity.to_string()),
            ("newClientOrderId", client_order_id.clone()),
        ];

        // Limit GTC at the normalized target price; a priced order never
        // crosses the book blindly. Market only when no price is given.
        match price {
            Some(p) => {
                let p = normalize_price(p, filters.tick_size);
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", p.to_string()));
            }
            None => {
                warn!(%symbol, "placing MARKET order without a price bound");
                params.push(("type", "MARKET".to_string()));
            }
        }

        #[derive(Deserialize)]
        struct BinanceOrderResponse {
            #[serde(rename = "orderId")]
            order_id: u64,
            symbol: String,
            status: String,
            #[serde(default)]
            price: Option<String>,
        }

        info!(%symbol, %side, %quantity, ?price, "sending order");

        let resp: BinanceOrderResponse = self
            .send_signed_request(Method::POST, "/api/v3/order", params)
            .await?;

        Ok(OrderResponse {
            id: resp.order_id.to_string(),
            symbol: resp.symbol,
            status: resp.status,
            filled_price: resp
                .price
                .as_deref()
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline_row() -> serde_json::Value {
        serde_json::json!([
            1_700_000_000_000i64,
            "90.10",
            "91.50",
            "89.75",
            "91.00",
            "1234.5",
            1_700_000_899_999i64,
            "112000.0",
            42,
            "600.0",
            "54000.0",
            "0"
        ])
    }

    #[test]
    fn parses_kline_row() {
        let candle = parse_kline(&kline_row()).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.close_time, 1_700_000_899_999);
        assert!((candle.high - 91.5).abs() < 1e-12);
        assert!((candle.volume - 1234.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_malformed_kline_row() {
        assert!(parse_kline(&serde_json::json!(["not", "a", "kline"])).is_none());
        assert!(parse_kline(&serde_json::json!(42)).is_none());
    }

    #[test]
    fn parses_exchange_info_filters() {
        let info = serde_json::json!({
            "symbols": [{
                "symbol": "LTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.001", "stepSize": "0.001"},
                    {"filterType": "NOTIONAL", "minNotional": "5.0"}
                ]
            }]
        });
        let filters = parse_symbol_filters(&info).unwrap();
        assert_eq!(filters.step_size.to_string(), "0.001");
        assert_eq!(filters.tick_size.to_string(), "0.01");
    }

    #[test]
    fn exchange_info_without_filters_is_none() {
        assert!(parse_symbol_filters(&serde_json::json!({})).is_none());
        let missing_lot = serde_json::json!({
            "symbols": [{"filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01"}
            ]}]
        });
        assert!(parse_symbol_filters(&missing_lot).is_none());
    }

    #[test]
    fn filter_cache_serves_until_ttl() {
        let cache = FilterCache::new();
        assert!(cache.get().is_none());
        let filters = SymbolFilters {
            step_size: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
        };
        cache.put(filters);
        let cached = cache.get().unwrap();
        assert_eq!(cached.step_size, filters.step_size);
    }

    #[test]
    fn signed_query_carries_signature_and_timestamp() {
        let mut cfg = crate::config::test_config();
        cfg.secret_key = "test-secret".into();
        let client = BinanceClient::new(&cfg)
            .unwrap()
            .with_base_url("http://localhost:0");
        let query = client
            .sign_and_build_query(vec![("symbol", "LTCUSDT".into())])
            .unwrap();
        assert!(query.starts_with("symbol=LTCUSDT&timestamp="));
        let signature = query.split("&signature=").nth(1).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
