// =============================================================================
// Repository — the engine's only doorway to durable storage
// =============================================================================
//
// The engine is the sole writer of `signals` and `execution_history`; the UI
// reads them through the realtime projection. Traders and users are written
// by the admin surface and only read here.
//
// `SupabaseRepository` talks PostgREST (`/rest/v1/...`) with the service key.
// Signal count increments go through the `increment_signal_count` RPC, which
// takes a per-(trader, symbol) advisory lock server-side so concurrent
// deduplication is atomic even across engine instances.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::types::SubscriptionTier;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

fn default_dedupe_bars() -> u32 {
    50
}

/// One row of the `traders` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderRecord {
    pub id: String,
    /// Empty for built-in (system-owned) traders.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub filter_source: String,
    /// Raw timeframe strings; validated when the filter is compiled.
    pub filter_timeframes: Vec<String>,
    /// The primary timeframe whose candle closes drive evaluation.
    pub schedule: String,
    #[serde(default = "default_dedupe_bars")]
    pub dedupe_bars: u32,
    #[serde(default)]
    pub matched_conditions: Vec<String>,
}

impl TraderRecord {
    pub fn is_builtin(&self) -> bool {
        self.user_id.is_empty()
    }
}

/// One row of the `signals` table. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub timestamp: i64,
    /// `open_time` of the bar whose close triggered the match.
    pub kline_timestamp: i64,
    pub price_at_signal: f64,
    pub volume_at_signal: f64,
    #[serde(default)]
    pub matched_conditions: Vec<String>,
    pub count: u32,
}

/// One row of the `execution_history` table (one per evaluation batch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub trader_id: String,
    pub started_at: i64,
    pub completed_at: i64,
    pub symbols_checked: u32,
    pub symbols_matched: u32,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Minimal projection of the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_enabled_traders(&self) -> Result<Vec<TraderRecord>>;
    async fn load_trader_by_id(&self, id: &str) -> Result<Option<TraderRecord>>;
    /// Traders owned by `owner`; `None` lists the built-in (system) traders.
    async fn list_traders(&self, owner: Option<&str>) -> Result<Vec<TraderRecord>>;
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>>;

    /// Most recent signal for (trader, symbol), by `kline_timestamp`.
    async fn latest_signal(&self, trader_id: &str, symbol: &str)
        -> Result<Option<SignalRecord>>;
    async fn insert_signal(&self, signal: &SignalRecord) -> Result<()>;
    /// Atomically bump `count` on an existing signal; returns the new count.
    async fn increment_signal_count(&self, signal_id: &str) -> Result<u32>;

    async fn insert_execution_history(&self, record: &ExecutionRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Supabase implementation
// ---------------------------------------------------------------------------

/// Bounded retry count for transient repository failures.
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;

pub struct SupabaseRepository {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl SupabaseRepository {
    pub fn new(supabase_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: supabase_url.into(),
            service_key: service_key.into(),
            client,
        }
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", &self.service_key))
    }

    /// Issue a request with bounded exponential backoff on transient failures.
    async fn send_with_backoff(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            match self.authed(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body: serde_json::Value = if status == reqwest::StatusCode::NO_CONTENT {
                        serde_json::Value::Null
                    } else {
                        resp.json().await.unwrap_or(serde_json::Value::Null)
                    };
                    if status.is_success() {
                        return Ok(body);
                    }
                    if !status.is_server_error() || attempt >= MAX_RETRIES {
                        anyhow::bail!("repository request failed with {status}: {body}");
                    }
                    warn!(%status, attempt, "transient repository failure -- retrying");
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(e).context("repository request failed after retries");
                    }
                    warn!(error = %e, attempt, "repository request failed -- retrying");
                }
            }
            attempt += 1;
            let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    async fn get_rows<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let url = self.rest_url(path);
        let body = self
            .send_with_backoff(|| self.client.get(&url))
            .await
            .with_context(|| format!("GET {path}"))?;
        serde_json::from_value(body).with_context(|| format!("unexpected shape from {path}"))
    }
}

#[async_trait]
impl Repository for SupabaseRepository {
    #[instrument(skip(self), name = "repo::load_enabled_traders")]
    async fn load_enabled_traders(&self) -> Result<Vec<TraderRecord>> {
        let traders: Vec<TraderRecord> =
            self.get_rows("traders?select=*&enabled=eq.true").await?;
        debug!(count = traders.len(), "enabled traders loaded");
        Ok(traders)
    }

    #[instrument(skip(self), name = "repo::load_trader_by_id")]
    async fn load_trader_by_id(&self, id: &str) -> Result<Option<TraderRecord>> {
        let mut rows: Vec<TraderRecord> = self
            .get_rows(&format!("traders?select=*&id=eq.{id}&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    #[instrument(skip(self), name = "repo::list_traders")]
    async fn list_traders(&self, owner: Option<&str>) -> Result<Vec<TraderRecord>> {
        let path = match owner {
            Some(user_id) => format!("traders?select=*&user_id=eq.{user_id}"),
            None => "traders?select=*&user_id=eq.".to_string(),
        };
        self.get_rows(&path).await
    }

    #[instrument(skip(self), name = "repo::get_user")]
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let mut rows: Vec<UserRecord> = self
            .get_rows(&format!(
                "users?select=id,subscription_tier&id=eq.{id}&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    #[instrument(skip(self), name = "repo::latest_signal")]
    async fn latest_signal(
        &self,
        trader_id: &str,
        symbol: &str,
    ) -> Result<Option<SignalRecord>> {
        let mut rows: Vec<SignalRecord> = self
            .get_rows(&format!(
                "signals?select=*&trader_id=eq.{trader_id}&symbol=eq.{symbol}&order=kline_timestamp.desc&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    #[instrument(skip(self, signal), name = "repo::insert_signal")]
    async fn insert_signal(&self, signal: &SignalRecord) -> Result<()> {
        let url = self.rest_url("signals");
        let body = serde_json::to_value(signal)?;
        self.send_with_backoff(|| {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&body)
        })
        .await
        .context("insert signal")?;
        Ok(())
    }

    #[instrument(skip(self), name = "repo::increment_signal_count")]
    async fn increment_signal_count(&self, signal_id: &str) -> Result<u32> {
        let url = self.rest_url("rpc/increment_signal_count");
        let payload = serde_json::json!({ "p_signal_id": signal_id });
        let body = self
            .send_with_backoff(|| self.client.post(&url).json(&payload))
            .await
            .context("increment signal count")?;
        body.as_u64()
            .map(|v| v as u32)
            .context("increment_signal_count RPC did not return a count")
    }

    #[instrument(skip(self, record), name = "repo::insert_execution_history")]
    async fn insert_execution_history(&self, record: &ExecutionRecord) -> Result<()> {
        let url = self.rest_url("execution_history");
        let body = serde_json::to_value(record)?;
        self.send_with_backoff(|| {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&body)
        })
        .await
        .context("insert execution history")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory mock (tests only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory repository used by manager and scheduler tests.
    #[derive(Default)]
    pub struct MockRepository {
        pub traders: Mutex<HashMap<String, TraderRecord>>,
        pub users: Mutex<HashMap<String, UserRecord>>,
        pub signals: Mutex<Vec<SignalRecord>>,
        pub history: Mutex<Vec<ExecutionRecord>>,
    }

    impl MockRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_trader(&self, record: TraderRecord) {
            self.traders.lock().insert(record.id.clone(), record);
        }

        pub fn add_user(&self, id: &str, tier: SubscriptionTier) {
            self.users.lock().insert(
                id.to_string(),
                UserRecord {
                    id: id.to_string(),
                    subscription_tier: tier,
                },
            );
        }

        pub fn signal_count(&self) -> usize {
            self.signals.lock().len()
        }
    }

    #[async_trait]
    impl Repository for MockRepository {
        async fn load_enabled_traders(&self) -> Result<Vec<TraderRecord>> {
            Ok(self
                .traders
                .lock()
                .values()
                .filter(|t| t.enabled)
                .cloned()
                .collect())
        }

        async fn load_trader_by_id(&self, id: &str) -> Result<Option<TraderRecord>> {
            Ok(self.traders.lock().get(id).cloned())
        }

        async fn list_traders(&self, owner: Option<&str>) -> Result<Vec<TraderRecord>> {
            let owner = owner.unwrap_or("");
            Ok(self
                .traders
                .lock()
                .values()
                .filter(|t| t.user_id == owner)
                .cloned()
                .collect())
        }

        async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
            Ok(self.users.lock().get(id).cloned())
        }

        async fn latest_signal(
            &self,
            trader_id: &str,
            symbol: &str,
        ) -> Result<Option<SignalRecord>> {
            Ok(self
                .signals
                .lock()
                .iter()
                .filter(|s| s.trader_id == trader_id && s.symbol == symbol)
                .max_by_key(|s| s.kline_timestamp)
                .cloned())
        }

        async fn insert_signal(&self, signal: &SignalRecord) -> Result<()> {
            self.signals.lock().push(signal.clone());
            Ok(())
        }

        async fn increment_signal_count(&self, signal_id: &str) -> Result<u32> {
            let mut signals = self.signals.lock();
            let signal = signals
                .iter_mut()
                .find(|s| s.id == signal_id)
                .context("unknown signal id")?;
            signal.count += 1;
            Ok(signal.count)
        }

        async fn insert_execution_history(&self, record: &ExecutionRecord) -> Result<()> {
            self.history.lock().push(record.clone());
            Ok(())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trader_record_defaults() {
        let json = serde_json::json!({
            "id": "t1",
            "filter_source": "true",
            "filter_timeframes": ["15m"],
            "schedule": "15m"
        });
        let record: TraderRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.dedupe_bars, 50);
        assert!(record.user_id.is_empty());
        assert!(record.is_builtin());
        assert!(!record.enabled);
    }

    #[test]
    fn user_record_tier_defaults_to_free() {
        let record: UserRecord = serde_json::from_value(serde_json::json!({ "id": "u1" })).unwrap();
        assert_eq!(record.subscription_tier, SubscriptionTier::Free);
    }

    #[test]
    fn signal_record_roundtrip() {
        let signal = SignalRecord {
            id: "s1".into(),
            trader_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            timestamp: 1_700_000_000_000,
            kline_timestamp: 1_700_000_000_000,
            price_at_signal: 37000.0,
            volume_at_signal: 120.5,
            matched_conditions: vec!["rsi < 30".into()],
            count: 1,
        };
        let json = serde_json::to_string(&signal).unwrap();
        let back: SignalRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.count, 1);
        assert_eq!(back.matched_conditions.len(), 1);
    }

    #[test]
    fn rest_url_joins_cleanly() {
        let repo = SupabaseRepository::new("https://x.supabase.co/", "key");
        assert_eq!(
            repo.rest_url("traders?select=*"),
            "https://x.supabase.co/rest/v1/traders?select=*"
        );
    }

    #[tokio::test]
    async fn mock_latest_signal_picks_newest() {
        let repo = mock::MockRepository::new();
        for (i, ts) in [100, 300, 200].iter().enumerate() {
            repo.insert_signal(&SignalRecord {
                id: format!("s{i}"),
                trader_id: "t1".into(),
                symbol: "BTCUSDT".into(),
                timestamp: *ts,
                kline_timestamp: *ts,
                price_at_signal: 1.0,
                volume_at_signal: 1.0,
                matched_conditions: vec![],
                count: 1,
            })
            .await
            .unwrap();
        }
        let latest = repo.latest_signal("t1", "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(latest.kline_timestamp, 300);
        assert!(repo.latest_signal("t1", "ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_increment_bumps_count() {
        let repo = mock::MockRepository::new();
        repo.insert_signal(&SignalRecord {
            id: "s1".into(),
            trader_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            timestamp: 1,
            kline_timestamp: 1,
            price_at_signal: 1.0,
            volume_at_signal: 1.0,
            matched_conditions: vec![],
            count: 1,
        })
        .await
        .unwrap();
        assert_eq!(repo.increment_signal_count("s1").await.unwrap(), 2);
        assert_eq!(repo.increment_signal_count("s1").await.unwrap(), 3);
        assert!(repo.increment_signal_count("nope").await.is_err());
    }
}
