// =============================================================================
// Trader Manager — registry, lifecycle, quotas, persistence
// =============================================================================
//
// The manager exclusively owns the set of active traders. It is the only
// component that mutates trader state, and the engine's sole writer of
// `signals` and `execution_history`.
//
// Registry lookups that miss hydrate lazily from the repository, so a trader
// created moments ago can be started before the engine has re-scanned.
//
// Deduplication uses bar-window semantics: a match within `dedupe_bars` bars
// of the latest persisted signal for (trader, symbol) increments that row's
// `count` instead of inserting a new row.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::error::ApiError;
use crate::indicators::MIN_SERIES_LEN;
use crate::market_data::{KlineCache, KlineKey, MarketData, SymbolUniverse};
use crate::repository::{ExecutionRecord, Repository, SignalRecord};
use crate::sandbox::FilterRuntime;
use crate::scheduler::{PairClaims, TaskQueue};
use crate::trader::{Trader, TraderHandle, TraderMetrics, MAX_CONSECUTIVE_ERRORS};
use crate::types::{SubscriptionTier, Timeframe, TraderState};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Status / batch types
// ---------------------------------------------------------------------------

/// Snapshot returned by the status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderStatus {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub state: TraderState,
    pub enabled: bool,
    pub schedule: Timeframe,
    pub filter_timeframes: Vec<Timeframe>,
    pub dedupe_bars: u32,
    pub metrics: TraderMetrics,
}

/// Result of one evaluation batch (execute-immediate or a scheduled cycle).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub trader_id: String,
    pub symbols_checked: u32,
    pub symbols_matched: u32,
    pub execution_time_ms: u64,
}

/// Outcome of evaluating one (trader, symbol) pair.
#[derive(Debug)]
pub enum EvalOutcome {
    /// Required kline series too short; not an error.
    Skipped,
    NoMatch,
    Matched,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Dedup decision
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum DedupDecision {
    /// Persist a fresh row with count = 1.
    Insert,
    /// Bump `count` on the existing row with this id.
    Increment(String),
}

/// Pure dedup rule: bar-distance between the candidate and the latest
/// persisted signal, measured in schedule-timeframe bars. `dedupe_bars == 0`
/// disables dedup entirely.
pub fn dedup_decision(
    latest: Option<&SignalRecord>,
    candidate_kline_ts: i64,
    bar_duration_ms: i64,
    dedupe_bars: u32,
) -> DedupDecision {
    if dedupe_bars == 0 || bar_duration_ms <= 0 {
        return DedupDecision::Insert;
    }
    match latest {
        Some(prev) => {
            let distance = (candidate_kline_ts - prev.kline_timestamp) / bar_duration_ms;
            if (0..=dedupe_bars as i64).contains(&distance) {
                DedupDecision::Increment(prev.id.clone())
            } else {
                DedupDecision::Insert
            }
        }
        None => DedupDecision::Insert,
    }
}

// ---------------------------------------------------------------------------
// TraderManager
// ---------------------------------------------------------------------------

pub struct TraderManager {
    registry: RwLock<HashMap<String, Arc<TraderHandle>>>,
    repo: Arc<dyn Repository>,
    runtime: Arc<FilterRuntime>,
    cache: Arc<KlineCache>,
    universe: Arc<SymbolUniverse>,
    queue: Arc<TaskQueue>,
    /// Per-(trader, symbol) fairness token, shared with the scheduler's
    /// worker pool so immediate and scheduled evaluations never race a pair.
    claims: Arc<PairClaims>,

    kline_window: usize,
    eval_timeout: Duration,
    drain_timeout: Duration,
}

impl TraderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        runtime: Arc<FilterRuntime>,
        cache: Arc<KlineCache>,
        universe: Arc<SymbolUniverse>,
        queue: Arc<TaskQueue>,
        claims: Arc<PairClaims>,
        kline_window: usize,
        eval_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            repo,
            runtime,
            cache,
            universe,
            queue,
            claims,
            kline_window,
            eval_timeout,
            drain_timeout,
        }
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Look up a trader, lazily hydrating from the repository on a miss.
    pub async fn get_or_hydrate(&self, trader_id: &str) -> Result<Arc<TraderHandle>, ApiError> {
        if let Some(handle) = self.registry.read().get(trader_id) {
            return Ok(handle.clone());
        }

        let record = self
            .repo
            .load_trader_by_id(trader_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("trader {trader_id} not found")))?;

        let trader = Trader::from_record(record)
            .map_err(|e| ApiError::Compile(format!("trader {trader_id}: {e}")))?;

        let mut registry = self.registry.write();
        // Another request may have hydrated it while we were loading.
        let handle = registry
            .entry(trader_id.to_string())
            .or_insert_with(|| Arc::new(TraderHandle::new(trader)))
            .clone();
        Ok(handle)
    }

    /// Load every enabled trader into the registry and start the built-in
    /// (system-owned) ones. Called once at boot.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let records = self.repo.load_enabled_traders().await?;
        let mut loaded = 0usize;
        let mut builtins = Vec::new();

        for record in records {
            let id = record.id.clone();
            match Trader::from_record(record) {
                Ok(trader) => {
                    let builtin = trader.is_builtin();
                    self.registry
                        .write()
                        .entry(id.clone())
                        .or_insert_with(|| Arc::new(TraderHandle::new(trader)));
                    loaded += 1;
                    if builtin {
                        builtins.push(id);
                    }
                }
                Err(e) => {
                    warn!(trader_id = %id, error = %e, "skipping invalid trader row");
                }
            }
        }

        for id in &builtins {
            if let Err(e) = self.start_internal(id, SubscriptionTier::Elite).await {
                warn!(trader_id = %id, error = %e, "failed to start built-in trader");
            }
        }

        info!(loaded, builtins = builtins.len(), "trader registry bootstrapped");
        Ok(())
    }

    fn running_trader_count(&self, user_id: &str) -> usize {
        self.registry
            .read()
            .values()
            .filter(|h| {
                h.user_id() == user_id
                    && matches!(h.state(), TraderState::Starting | TraderState::Running)
            })
            .count()
    }

    /// Ownership rule shared by all state-changing endpoints: the caller must
    /// own the trader, or the trader is built-in and the caller is an admin.
    fn authorize(&self, trader: &Trader, auth: &AuthUser) -> Result<(), ApiError> {
        if trader.user_id == auth.user_id {
            return Ok(());
        }
        if trader.is_builtin() && auth.is_admin {
            return Ok(());
        }
        Err(ApiError::Forbidden(format!(
            "user {} does not own trader {}",
            auth.user_id, trader.id
        )))
    }

    async fn user_tier(&self, user_id: &str) -> Result<SubscriptionTier, ApiError> {
        Ok(self
            .repo
            .get_user(user_id)
            .await
            .map_err(ApiError::from)?
            .map(|u| u.subscription_tier)
            .unwrap_or(SubscriptionTier::Anonymous))
    }

    // ── Lifecycle: start ────────────────────────────────────────────────

    pub async fn start(&self, trader_id: &str, auth: &AuthUser) -> Result<TraderStatus, ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        let spec = handle.spec();
        self.authorize(&spec, auth)?;

        // Tier gate and quota, checked before any state changes so a denied
        // start leaves nothing behind.
        let tier = if spec.is_builtin() && auth.is_admin {
            SubscriptionTier::Elite
        } else {
            let tier = self.user_tier(&auth.user_id).await?;
            if !tier.can_start() {
                return Err(ApiError::Quota(format!(
                    "tier {tier} does not permit starting traders"
                )));
            }
            if self.running_trader_count(&auth.user_id) >= tier.max_running_traders() {
                return Err(ApiError::Quota(format!(
                    "tier {tier} allows at most {} running traders",
                    tier.max_running_traders()
                )));
            }
            tier
        };

        self.start_internal(trader_id, tier).await?;
        Ok(self.status_of(&handle))
    }

    /// Start without tier/ownership checks (bootstrap path, and the tail end
    /// of a user start after gates have passed).
    async fn start_internal(&self, trader_id: &str, tier: SubscriptionTier) -> Result<(), ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        let spec = handle.spec();

        match handle.state() {
            TraderState::Running | TraderState::Starting => return Ok(()),
            TraderState::Errored => {
                return Err(ApiError::Validation(format!(
                    "trader {trader_id} is errored; reload it first"
                )))
            }
            _ => {}
        }

        handle
            .transition(TraderState::Starting)
            .map_err(ApiError::Validation)?;

        let filter = match self.runtime.compile(&spec.filter_source) {
            Ok(filter) => filter,
            Err(e) => {
                let _ = handle.transition(TraderState::Errored);
                handle.record_error(e.to_string());
                return Err(ApiError::Compile(e.to_string()));
            }
        };

        // Subscribe: make sure every declared series is tracked so the
        // backfill sweep seeds it.
        for symbol in self.universe.symbols() {
            for tf in &spec.filter_timeframes {
                self.cache.track(&KlineKey::new(symbol.clone(), *tf));
            }
        }

        handle.set_filter(Some(filter));
        handle.reset_analysis_permits(tier);
        handle.clear_stop_request();
        handle
            .transition(TraderState::Running)
            .map_err(ApiError::Validation)?;

        info!(trader_id, schedule = %spec.schedule, "trader running");
        Ok(())
    }

    // ── Lifecycle: stop ─────────────────────────────────────────────────

    pub async fn stop(&self, trader_id: &str, auth: &AuthUser) -> Result<TraderStatus, ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        self.authorize(&handle.spec(), auth)?;

        match handle.state() {
            TraderState::Running => {}
            // Stopping a trader that is not running is a no-op.
            _ => return Ok(self.status_of(&handle)),
        }

        handle
            .transition(TraderState::Stopping)
            .map_err(ApiError::Validation)?;
        handle.request_stop();

        let purged = self.queue.purge_trader(trader_id);
        if purged > 0 {
            info!(trader_id, purged, "purged queued tasks on stop");
        }

        let drained = handle.wait_drained(self.drain_timeout).await;
        if !drained {
            // Uncancellable tasks are abandoned; their results are discarded
            // because stop_requested stays set until the next start.
            warn!(
                trader_id,
                in_flight = handle.in_flight(),
                "drain timed out -- abandoning in-flight evaluations"
            );
        }

        handle
            .transition(TraderState::Stopped)
            .map_err(ApiError::Validation)?;
        info!(trader_id, drained, "trader stopped");
        Ok(self.status_of(&handle))
    }

    // ── Lifecycle: reload ───────────────────────────────────────────────

    /// Re-read the trader row and recompile its filter. Clears the error
    /// streak; an errored trader returns to `loaded`. Idempotent.
    pub async fn reload(&self, trader_id: &str, auth: &AuthUser) -> Result<TraderStatus, ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        self.authorize(&handle.spec(), auth)?;

        let record = self
            .repo
            .load_trader_by_id(trader_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("trader {trader_id} not found")))?;

        let trader = Trader::from_record(record)
            .map_err(|e| ApiError::Compile(format!("trader {trader_id}: {e}")))?;

        let filter = self
            .runtime
            .compile(&trader.filter_source)
            .map_err(|e| ApiError::Compile(e.to_string()))?;

        handle.replace_spec(trader);
        handle.set_filter(Some(filter));
        handle.reset_errors();

        if handle.state() == TraderState::Errored {
            handle
                .transition(TraderState::Loaded)
                .map_err(ApiError::Validation)?;
        }

        info!(trader_id, "trader reloaded");
        Ok(self.status_of(&handle))
    }

    // ── Status / listings ───────────────────────────────────────────────

    fn status_of(&self, handle: &TraderHandle) -> TraderStatus {
        let spec = handle.spec();
        TraderStatus {
            id: spec.id,
            name: spec.name,
            user_id: spec.user_id,
            state: handle.state(),
            enabled: spec.enabled,
            schedule: spec.schedule,
            filter_timeframes: spec.filter_timeframes,
            dedupe_bars: spec.dedupe_bars,
            metrics: handle.metrics(),
        }
    }

    pub async fn get_status(
        &self,
        trader_id: &str,
        auth: &AuthUser,
    ) -> Result<TraderStatus, ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        let spec = handle.spec();
        // Built-in traders are visible to everyone; user traders only to
        // their owner (or an admin).
        if !spec.is_builtin() && spec.user_id != auth.user_id && !auth.is_admin {
            return Err(ApiError::Forbidden(format!(
                "user {} does not own trader {trader_id}",
                auth.user_id
            )));
        }
        Ok(self.status_of(&handle))
    }

    /// Running traders owned by the calling user (all of them for an admin).
    pub fn active_traders(&self, auth: &AuthUser) -> Vec<TraderStatus> {
        self.registry
            .read()
            .values()
            .filter(|h| h.state() == TraderState::Running)
            .filter(|h| auth.is_admin || h.user_id() == auth.user_id)
            .map(|h| self.status_of(h))
            .collect()
    }

    /// Every running trader scheduled on the given timeframe (dispatch path).
    pub fn running_on_schedule(&self, timeframe: Timeframe) -> Vec<Arc<TraderHandle>> {
        self.registry
            .read()
            .values()
            .filter(|h| h.state() == TraderState::Running && h.schedule() == timeframe)
            .cloned()
            .collect()
    }

    // ── Evaluation core ─────────────────────────────────────────────────

    /// Build the MarketData bundle for one symbol from the cache, or `None`
    /// when any declared series is too short to evaluate.
    fn build_market_data(&self, spec: &Trader, symbol: &str) -> Option<MarketData> {
        let mut klines = HashMap::new();
        for tf in &spec.filter_timeframes {
            let series = self
                .cache
                .snapshot(&KlineKey::new(symbol.to_string(), *tf), self.kline_window);
            if series.len() < MIN_SERIES_LEN {
                return None;
            }
            klines.insert(*tf, series);
        }
        Some(MarketData {
            symbol: symbol.to_string(),
            ticker: self.universe.ticker(symbol),
            klines,
        })
    }

    /// Evaluate one (trader, symbol) pair and persist a signal on a match.
    ///
    /// `kline_open_time` pins the triggering bar for scheduled evaluations;
    /// execute-immediate passes `None` and uses the latest closed bar.
    pub async fn evaluate_symbol(
        &self,
        handle: &Arc<TraderHandle>,
        symbol: &str,
        kline_open_time: Option<i64>,
    ) -> EvalOutcome {
        let spec = handle.spec();

        let Some(data) = self.build_market_data(&spec, symbol) else {
            return EvalOutcome::Skipped;
        };

        let Some(filter) = handle.filter() else {
            return EvalOutcome::Failed("trader has no compiled filter".to_string());
        };

        let schedule_series = data.series(spec.schedule);
        let trigger_bar = match kline_open_time {
            Some(open_time) => schedule_series
                .iter()
                .rev()
                .find(|k| k.open_time == open_time)
                .cloned(),
            None => schedule_series.last().cloned(),
        };

        match self.runtime.execute(&filter, data, self.eval_timeout).await {
            Ok(true) => {
                handle.record_clean_run();
                let Some(bar) = trigger_bar else {
                    // Matched against a bar the cache no longer holds.
                    return EvalOutcome::Skipped;
                };
                match self.persist_signal(handle, &spec, symbol, &bar).await {
                    Ok(()) => EvalOutcome::Matched,
                    Err(e) => {
                        warn!(trader_id = %spec.id, symbol, error = %e, "failed to persist signal");
                        EvalOutcome::Failed(format!("persist failed: {e:#}"))
                    }
                }
            }
            Ok(false) => {
                handle.record_clean_run();
                EvalOutcome::NoMatch
            }
            Err(e) => {
                let streak = handle.record_error(e.to_string());
                if streak >= MAX_CONSECUTIVE_ERRORS {
                    if handle.transition(TraderState::Errored).is_ok() {
                        error!(
                            trader_id = %spec.id,
                            streak,
                            error = %e,
                            "trader escalated to errored after repeated failures"
                        );
                    }
                }
                EvalOutcome::Failed(e.to_string())
            }
        }
    }

    async fn persist_signal(
        &self,
        handle: &Arc<TraderHandle>,
        spec: &Trader,
        symbol: &str,
        bar: &crate::market_data::Kline,
    ) -> anyhow::Result<()> {
        let latest = if spec.dedupe_bars > 0 {
            self.repo.latest_signal(&spec.id, symbol).await?
        } else {
            None
        };

        match dedup_decision(
            latest.as_ref(),
            bar.open_time,
            spec.schedule.duration_ms(),
            spec.dedupe_bars,
        ) {
            DedupDecision::Increment(signal_id) => {
                let count = self.repo.increment_signal_count(&signal_id).await?;
                info!(trader_id = %spec.id, symbol, count, "signal deduplicated");
            }
            DedupDecision::Insert => {
                let signal = SignalRecord {
                    id: Uuid::new_v4().to_string(),
                    trader_id: spec.id.clone(),
                    symbol: symbol.to_string(),
                    timestamp: now_ms(),
                    kline_timestamp: bar.open_time,
                    price_at_signal: bar.close,
                    volume_at_signal: bar.volume,
                    matched_conditions: spec.matched_conditions.clone(),
                    count: 1,
                };
                self.repo.insert_signal(&signal).await?;
                info!(trader_id = %spec.id, symbol, price = bar.close, "signal persisted");
            }
        }

        handle.record_signal(now_ms());
        Ok(())
    }

    // ── Batches ─────────────────────────────────────────────────────────

    /// Run one batch over `symbols` for this trader, bounded by its analysis
    /// semaphore, and write the execution-history row. Used by both
    /// execute-immediate and scheduled dispatch (per-symbol via the queue).
    pub async fn run_batch(
        &self,
        handle: &Arc<TraderHandle>,
        symbols: &[String],
        kline_open_time: Option<i64>,
    ) -> BatchSummary {
        let spec = handle.spec();
        let started_at = now_ms();
        let started = std::time::Instant::now();

        let checked = AtomicU32::new(0);
        let matched = AtomicU32::new(0);
        let first_error: parking_lot::Mutex<Option<String>> = parking_lot::Mutex::new(None);

        let permits = handle.analysis_permits();
        let concurrency = permits.available_permits().max(1);
        let trader_id = spec.id.clone();

        futures_util::StreamExt::for_each_concurrent(
            futures_util::stream::iter(symbols.iter().cloned()),
            concurrency,
            |symbol| {
                let checked = &checked;
                let matched = &matched;
                let first_error = &first_error;
                let trader_id = &trader_id;
                let permits = permits.clone();
                let handle = handle.clone();
                async move {
                    if handle.stop_requested() {
                        return;
                    }
                    // Claim the pair before the permit, in the same order as
                    // the scheduler workers, so a scheduled batch for the
                    // same trader cannot deadlock or race dedup with us.
                    self.claims.claim(trader_id, &symbol).await;
                    let Ok(_permit) = permits.acquire_owned().await else {
                        self.claims.release(trader_id, &symbol);
                        return;
                    };
                    handle.begin_task();
                    let outcome = self
                        .evaluate_symbol(&handle, &symbol, kline_open_time)
                        .await;
                    handle.end_task();
                    self.claims.release(trader_id, &symbol);

                    match outcome {
                        EvalOutcome::Skipped => {}
                        EvalOutcome::NoMatch => {
                            checked.fetch_add(1, Ordering::Relaxed);
                        }
                        EvalOutcome::Matched => {
                            checked.fetch_add(1, Ordering::Relaxed);
                            matched.fetch_add(1, Ordering::Relaxed);
                        }
                        EvalOutcome::Failed(msg) => {
                            checked.fetch_add(1, Ordering::Relaxed);
                            first_error.lock().get_or_insert(msg);
                        }
                    }
                }
            },
        )
        .await;

        let summary = BatchSummary {
            trader_id: spec.id.clone(),
            symbols_checked: checked.load(Ordering::Relaxed),
            symbols_matched: matched.load(Ordering::Relaxed),
            execution_time_ms: started.elapsed().as_millis() as u64,
        };

        let record = ExecutionRecord {
            trader_id: spec.id.clone(),
            started_at,
            completed_at: now_ms(),
            symbols_checked: summary.symbols_checked,
            symbols_matched: summary.symbols_matched,
            execution_time_ms: summary.execution_time_ms,
            error: first_error.lock().take(),
        };
        if let Err(e) = self.repo.insert_execution_history(&record).await {
            warn!(trader_id = %spec.id, error = %e, "failed to record execution history");
        }
        handle.record_batch();

        summary
    }

    /// One immediate batch across all active symbols, ignoring the schedule
    /// cadence. Gated like start: free and anonymous tiers may not run it.
    pub async fn execute_immediate(
        &self,
        trader_id: &str,
        auth: &AuthUser,
    ) -> Result<BatchSummary, ApiError> {
        let handle = self.get_or_hydrate(trader_id).await?;
        let spec = handle.spec();
        self.authorize(&spec, auth)?;

        let tier = if spec.is_builtin() && auth.is_admin {
            SubscriptionTier::Elite
        } else {
            let tier = self.user_tier(&auth.user_id).await?;
            if !tier.can_start() {
                return Err(ApiError::Quota(format!(
                    "tier {tier} does not permit running analyses"
                )));
            }
            tier
        };

        // A never-started trader gets its filter compiled on the fly.
        if handle.filter().is_none() {
            let filter = self
                .runtime
                .compile(&spec.filter_source)
                .map_err(|e| ApiError::Compile(e.to_string()))?;
            handle.set_filter(Some(filter));
            handle.reset_analysis_permits(tier);
        }

        let symbols = self.universe.symbols();
        Ok(self.run_batch(&handle, &symbols, None).await)
    }

    /// Persist the execution-history row for a completed scheduled batch.
    pub async fn write_batch_history(&self, handle: &Arc<TraderHandle>, record: ExecutionRecord) {
        if let Err(e) = self.repo.insert_execution_history(&record).await {
            warn!(trader_id = %record.trader_id, error = %e, "failed to record execution history");
        }
        handle.record_batch();
    }

    /// Admin-only direct signal insert (the POST /signals endpoint).
    pub async fn insert_signal_direct(&self, signal: &SignalRecord) -> Result<(), ApiError> {
        self.repo.insert_signal(signal).await.map_err(ApiError::from)
    }
}

// =============================================================================
// Tests
// =============================================================================
