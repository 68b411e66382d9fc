// =============================================================================
// Trader — the unit of ownership and execution
// =============================================================================
//
// A Trader is the validated, in-memory form of a `traders` row. Its
// TraderHandle adds everything the engine needs at runtime: the state
// machine, the compiled filter, metrics, the per-trader analysis semaphore,
// and in-flight task accounting for drain-on-stop.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

use crate::repository::TraderRecord;
use crate::sandbox::CompiledFilter;
use crate::types::{SubscriptionTier, Timeframe, TraderState};

/// Consecutive execution failures at which a trader escalates to `errored`.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

// ---------------------------------------------------------------------------
// Trader (validated row)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Trader {
    pub id: String,
    /// Empty for built-in (system-owned) traders.
    pub user_id: String,
    pub name: String,
    pub enabled: bool,
    pub filter_source: String,
    pub filter_timeframes: Vec<Timeframe>,
    pub schedule: Timeframe,
    pub dedupe_bars: u32,
    pub matched_conditions: Vec<String>,
}

impl Trader {
    /// Validate a raw repository row.
    ///
    /// Rejects unknown timeframes, an empty timeframe set, and a schedule
    /// outside the declared set; these are compile-time failures for the
    /// trader, not runtime ones.
    pub fn from_record(record: TraderRecord) -> Result<Self, String> {
        if record.filter_timeframes.is_empty() {
            return Err("filter_timeframes must not be empty".to_string());
        }

        let mut filter_timeframes = Vec::with_capacity(record.filter_timeframes.len());
        for raw in &record.filter_timeframes {
            match Timeframe::parse(raw) {
                Some(tf) => {
                    if !filter_timeframes.contains(&tf) {
                        filter_timeframes.push(tf);
                    }
                }
                None => return Err(format!("unknown timeframe in filter_timeframes: {raw}")),
            }
        }

        let schedule = Timeframe::parse(&record.schedule)
            .ok_or_else(|| format!("unknown schedule timeframe: {}", record.schedule))?;

        if !filter_timeframes.contains(&schedule) {
            return Err(format!(
                "schedule timeframe {schedule} must be one of filter_timeframes"
            ));
        }

        Ok(Self {
            id: record.id,
            user_id: record.user_id,
            name: record.name,
            enabled: record.enabled,
            filter_source: record.filter_source,
            filter_timeframes,
            schedule,
            dedupe_bars: record.dedupe_bars,
            matched_conditions: record.matched_conditions,
        })
    }

    pub fn is_builtin(&self) -> bool {
        self.user_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderMetrics {
    pub last_signal_at: Option<i64>,
    pub total_signals: u64,
    pub total_batches: u64,
    pub dropped_tasks: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Legal lifecycle transitions. `Errored` is reachable from anywhere; the
/// only way out of it is an explicit reload back to `Loaded`.
pub fn can_transition(from: TraderState, to: TraderState) -> bool {
    use TraderState::*;
    if to == Errored {
        return true;
    }
    matches!(
        (from, to),
        (Loaded, Starting)
            | (Starting, Running)
            | (Starting, Loaded)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Starting)
            | (Stopped, Loaded)
            | (Errored, Loaded)
    )
}

// ---------------------------------------------------------------------------
// TraderHandle
// ---------------------------------------------------------------------------

/// Runtime wrapper around a Trader, shared between the manager, the
/// scheduler, and in-flight evaluation tasks.
#[derive(Debug)]
pub struct TraderHandle {
    spec: RwLock<Trader>,
    state: RwLock<TraderState>,
    filter: RwLock<Option<CompiledFilter>>,
    metrics: RwLock<TraderMetrics>,
    analysis_permits: RwLock<Arc<Semaphore>>,

    in_flight: AtomicUsize,
    stop_requested: AtomicBool,
    drained: Notify,
}

impl TraderHandle {
    pub fn new(trader: Trader) -> Self {
        Self {
            spec: RwLock::new(trader),
            state: RwLock::new(TraderState::Loaded),
            filter: RwLock::new(None),
            metrics: RwLock::new(TraderMetrics::default()),
            analysis_permits: RwLock::new(Arc::new(Semaphore::new(1))),
            in_flight: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    // ── Spec access ─────────────────────────────────────────────────────

    pub fn spec(&self) -> Trader {
        self.spec.read().clone()
    }

    pub fn id(&self) -> String {
        self.spec.read().id.clone()
    }

    pub fn user_id(&self) -> String {
        self.spec.read().user_id.clone()
    }

    pub fn schedule(&self) -> Timeframe {
        self.spec.read().schedule
    }

    pub fn replace_spec(&self, trader: Trader) {
        *self.spec.write() = trader;
    }

    // ── State machine ───────────────────────────────────────────────────

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    /// Attempt a guarded transition; returns the previous state on success.
    pub fn transition(&self, to: TraderState) -> Result<TraderState, String> {
        let mut state = self.state.write();
        let from = *state;
        if !can_transition(from, to) {
            return Err(format!("illegal trader transition: {from} -> {to}"));
        }
        *state = to;
        Ok(from)
    }

    // ── Compiled filter ─────────────────────────────────────────────────

    pub fn filter(&self) -> Option<CompiledFilter> {
        self.filter.read().clone()
    }

    pub fn set_filter(&self, filter: Option<CompiledFilter>) {
        *self.filter.write() = filter;
    }

    // ── Analysis concurrency ────────────────────────────────────────────

    /// Reset the per-trader analysis semaphore to the tier's width. Called
    /// on every start so tier changes take effect.
    pub fn reset_analysis_permits(&self, tier: SubscriptionTier) {
        *self.analysis_permits.write() =
            Arc::new(Semaphore::new(tier.max_concurrent_analysis().max(1)));
    }

    pub fn analysis_permits(&self) -> Arc<Semaphore> {
        self.analysis_permits.read().clone()
    }

    // ── In-flight accounting / drain ────────────────────────────────────

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.drained.notify_waiters();
        }
    }

    pub fn clear_stop_request(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn begin_task(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_task(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no evaluation tasks remain in flight, bounded by `timeout`.
    /// Returns `true` when fully drained.
    pub async fn wait_drained(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    pub fn metrics(&self) -> TraderMetrics {
        self.metrics.read().clone()
    }

    pub fn record_signal(&self, at_ms: i64) {
        let mut m = self.metrics.write();
        m.last_signal_at = Some(at_ms);
        m.total_signals += 1;
    }

    pub fn record_batch(&self) {
        self.metrics.write().total_batches += 1;
    }

    pub fn record_dropped_task(&self) {
        self.metrics.write().dropped_tasks += 1;
    }

    /// Record an evaluation failure; returns the new consecutive-error count.
    pub fn record_error(&self, message: String) -> u32 {
        let mut m = self.metrics.write();
        m.consecutive_errors += 1;
        m.last_error = Some(message);
        m.consecutive_errors
    }

    /// A clean evaluation resets the consecutive-error streak.
    pub fn record_clean_run(&self) {
        self.metrics.write().consecutive_errors = 0;
    }

    pub fn reset_errors(&self) {
        let mut m = self.metrics.write();
        m.consecutive_errors = 0;
        m.last_error = None;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timeframes: &[&str], schedule: &str) -> TraderRecord {
        TraderRecord {
            id: "t1".into(),
            user_id: "u1".into(),
            name: "rsi oversold".into(),
            enabled: true,
            filter_source: "true".into(),
            filter_timeframes: timeframes.iter().map(|s| s.to_string()).collect(),
            schedule: schedule.into(),
            dedupe_bars: 50,
            matched_conditions: vec![],
        }
    }

    #[test]
    fn valid_record_converts() {
        let trader = Trader::from_record(record(&["15m", "1h"], "15m")).unwrap();
        assert_eq!(trader.schedule, Timeframe::M15);
        assert_eq!(trader.filter_timeframes, vec![Timeframe::M15, Timeframe::H1]);
        assert!(!trader.is_builtin());
    }

    #[test]
    fn unknown_timeframe_rejected() {
        assert!(Trader::from_record(record(&["15m", "7m"], "15m")).is_err());
    }

    #[test]
    fn empty_timeframes_rejected() {
        assert!(Trader::from_record(record(&[], "15m")).is_err());
    }

    #[test]
    fn schedule_outside_set_rejected() {
        assert!(Trader::from_record(record(&["15m"], "1h")).is_err());
    }

    #[test]
    fn duplicate_timeframes_deduplicated() {
        let trader = Trader::from_record(record(&["15m", "15m", "1h"], "15m")).unwrap();
        assert_eq!(trader.filter_timeframes.len(), 2);
    }

    #[test]
    fn lifecycle_transitions() {
        use TraderState::*;
        assert!(can_transition(Loaded, Starting));
        assert!(can_transition(Starting, Running));
        assert!(can_transition(Running, Stopping));
        assert!(can_transition(Stopping, Stopped));
        assert!(can_transition(Stopped, Starting));
        assert!(can_transition(Errored, Loaded));
        // Errored is reachable from anywhere.
        assert!(can_transition(Running, Errored));
        assert!(can_transition(Loaded, Errored));

        assert!(!can_transition(Loaded, Running));
        assert!(!can_transition(Running, Stopped));
        assert!(!can_transition(Errored, Running));
        assert!(!can_transition(Stopped, Running));
    }

    #[test]
    fn handle_transition_guards() {
        let handle =
            TraderHandle::new(Trader::from_record(record(&["15m"], "15m")).unwrap());
        assert_eq!(handle.state(), TraderState::Loaded);
        handle.transition(TraderState::Starting).unwrap();
        handle.transition(TraderState::Running).unwrap();
        assert!(handle.transition(TraderState::Stopped).is_err());
        assert_eq!(handle.state(), TraderState::Running);
        handle.transition(TraderState::Stopping).unwrap();
        handle.transition(TraderState::Stopped).unwrap();
    }

    #[test]
    fn error_streak_tracking() {
        let handle =
            TraderHandle::new(Trader::from_record(record(&["15m"], "15m")).unwrap());
        assert_eq!(handle.record_error("boom".into()), 1);
        assert_eq!(handle.record_error("boom".into()), 2);
        handle.record_clean_run();
        assert_eq!(handle.record_error("boom".into()), 1);
        assert_eq!(handle.metrics().last_error.as_deref(), Some("boom"));
        handle.reset_errors();
        assert_eq!(handle.metrics().consecutive_errors, 0);
        assert!(handle.metrics().last_error.is_none());
    }

    #[tokio::test]
    async fn drain_completes_when_tasks_end() {
        let handle = Arc::new(TraderHandle::new(
            Trader::from_record(record(&["15m"], "15m")).unwrap(),
        ));
        handle.begin_task();
        handle.begin_task();

        let waiter = handle.clone();
        let join = tokio::spawn(async move {
            waiter.wait_drained(std::time::Duration::from_secs(2)).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.end_task();
        handle.end_task();

        assert!(join.await.unwrap());
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_task() {
        let handle =
            TraderHandle::new(Trader::from_record(record(&["15m"], "15m")).unwrap());
        handle.begin_task();
        let drained = handle
            .wait_drained(std::time::Duration::from_millis(50))
            .await;
        assert!(!drained);
        assert_eq!(handle.in_flight(), 1);
    }

    #[tokio::test]
    async fn analysis_permits_follow_tier() {
        let handle =
            TraderHandle::new(Trader::from_record(record(&["15m"], "15m")).unwrap());
        handle.reset_analysis_permits(SubscriptionTier::Pro);
        assert_eq!(handle.analysis_permits().available_permits(), 3);
        handle.reset_analysis_permits(SubscriptionTier::Elite);
        assert_eq!(handle.analysis_permits().available_permits(), 5);
    }
}
