// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// The screener never trades, so only unsigned endpoints are used: kline
// history for cache seeding and the 24h ticker sweep for the symbol universe.
// Transient failures retry with exponential backoff up to MAX_RETRIES; the
// weight tracker is updated from every response so the seeder can pace itself.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::market_data::{Kline, TickerInfo};
use crate::types::Timeframe;

/// Upper bound Binance accepts for one kline request.
pub const MAX_KLINE_LIMIT: usize = 1000;

/// Bounded retry count for transient upstream failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
const BACKOFF_BASE_MS: u64 = 500;

/// Binance REST client for public market-data endpoints.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limit(&self) -> Arc<RateLimitTracker> {
        self.rate_limit.clone()
    }

    /// GET with bounded exponential-backoff retry. Returns the parsed JSON
    /// body after recording rate-limit headers.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            let result = self.client.get(url).send().await;
            match result {
                Ok(resp) => {
                    self.rate_limit.update_from_headers(resp.headers());
                    let status = resp.status();
                    let body: serde_json::Value = resp
                        .json()
                        .await
                        .with_context(|| format!("failed to parse response from {url}"))?;
                    if status.is_success() {
                        return Ok(body);
                    }
                    if !(status.is_server_error() || status.as_u16() == 429) || attempt >= MAX_RETRIES {
                        anyhow::bail!("Binance GET {url} returned {status}: {body}");
                    }
                    warn!(url, %status, attempt, "retryable upstream status");
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(e).with_context(|| format!("GET {url} failed after {attempt} retries"));
                    }
                    warn!(url, error = %e, attempt, "upstream request failed -- retrying");
                }
            }
            attempt += 1;
            let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines — historical bars for cache seeding, oldest first.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let limit = limit.min(MAX_KLINE_LIMIT);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );

        let body = self.get_json(&url).await?;
        let rows = body
            .as_array()
            .context("klines response is not an array")?;

        let mut klines = Vec::with_capacity(rows.len());
        for row in rows {
            klines.push(parse_kline_row(row)?);
        }
        debug!(symbol, timeframe = %timeframe, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // 24h tickers
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/24hr — full-exchange sweep used by the universe
    /// refresher. Heavy (weight 80), so it runs once per screening interval.
    #[instrument(skip(self), name = "binance::get_24h_tickers")]
    pub async fn get_24h_tickers(&self) -> Result<Vec<(String, TickerInfo)>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let body = self.get_json(&url).await?;
        let rows = body
            .as_array()
            .context("ticker response is not an array")?;

        let mut tickers = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol = match row["symbol"].as_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            tickers.push((
                symbol,
                TickerInfo {
                    last_price: field_f64(row, "lastPrice"),
                    price_change_pct: field_f64(row, "priceChangePercent"),
                    quote_volume: field_f64(row, "quoteVolume"),
                },
            ));
        }
        debug!(count = tickers.len(), "24h tickers fetched");
        Ok(tickers)
    }
}

/// Binance encodes numbers as strings in most payloads.
fn field_f64(row: &serde_json::Value, name: &str) -> f64 {
    row[name]
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| row[name].as_f64())
        .unwrap_or(0.0)
}

/// Parse one row of the /api/v3/klines array-of-arrays payload:
///
/// ```json
/// [openTime, "open", "high", "low", "close", "volume",
///  closeTime, "quoteVolume", trades, "takerBuyBase", "takerBuyQuote", "ignore"]
/// ```
///
/// The inclusive exchange close time is normalized to an exclusive end (+1 ms).
fn parse_kline_row(row: &serde_json::Value) -> Result<Kline> {
    let cols = row.as_array().context("kline row is not an array")?;
    if cols.len() < 11 {
        anyhow::bail!("kline row has {} columns, expected >= 11", cols.len());
    }

    let num = |i: usize, name: &str| -> Result<f64> {
        cols[i]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| cols[i].as_f64())
            .with_context(|| format!("kline column {name} is not numeric"))
    };

    Ok(Kline {
        open_time: cols[0].as_i64().context("openTime is not an integer")?,
        open: num(1, "open")?,
        high: num(2, "high")?,
        low: num(3, "low")?,
        close: num(4, "close")?,
        volume: num(5, "volume")?,
        close_time: cols[6].as_i64().context("closeTime is not an integer")? + 1,
        quote_volume: num(7, "quoteVolume")?,
        trades: cols[8].as_u64().context("trades is not an integer")?,
        taker_buy_base: num(9, "takerBuyBase")?,
        taker_buy_quote: num(10, "takerBuyQuote")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
