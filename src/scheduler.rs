// =============================================================================
// Scheduler — bar-close dispatch and the evaluation worker pool
// =============================================================================
//
// The cache publishes a BarClose per (symbol, timeframe). For every running
// trader scheduled on that timeframe the dispatcher enqueues one task onto a
// shared bounded queue; a fixed worker pool drains it.
//
// Backpressure sheds staleness: when the queue is full, the oldest pending
// task of the same trader is dropped first (a fresher evaluation of a trader
// invalidates a stale one), and the drop lands on that trader's metrics.
//
// A shared (trader, symbol) claims set serializes same-pair evaluations so
// no two evaluations -- worker-pool or execute-immediate -- can race dedup
// for one pair. Tasks for the same bar form a
// batch; the batch rotates when the next bar's events arrive, and whichever
// side finishes last (dispatcher or worker) writes the execution-history row.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::manager::{EvalOutcome, TraderManager};
use crate::market_data::{BarClose, KlineCache};
use crate::repository::ExecutionRecord;
use crate::trader::TraderHandle;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Batch tracking
// ---------------------------------------------------------------------------

/// Accounting for one (trader, bar) evaluation batch. Tasks are added as
/// close events arrive; the batch is closed when the next bar rotates in.
/// Whoever observes `closed && completed == total` first finalizes it.
pub struct BatchTracker {
    pub trader_id: String,
    pub kline_open_time: i64,
    pub started_at: i64,
    started: std::time::Instant,

    total: AtomicU32,
    completed: AtomicU32,
    checked: AtomicU32,
    matched: AtomicU32,
    closed: AtomicBool,
    finalized: AtomicBool,
    error: Mutex<Option<String>>,
}

impl BatchTracker {
    pub fn new(trader_id: String, kline_open_time: i64) -> Self {
        Self {
            trader_id,
            kline_open_time,
            started_at: now_ms(),
            started: std::time::Instant::now(),
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            checked: AtomicU32::new(0),
            matched: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn add_task(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an evaluation outcome.
    pub fn complete(&self, outcome: &EvalOutcome) {
        match outcome {
            EvalOutcome::Skipped => {}
            EvalOutcome::NoMatch => {
                self.checked.fetch_add(1, Ordering::Relaxed);
            }
            EvalOutcome::Matched => {
                self.checked.fetch_add(1, Ordering::Relaxed);
                self.matched.fetch_add(1, Ordering::Relaxed);
            }
            EvalOutcome::Failed(msg) => {
                self.checked.fetch_add(1, Ordering::Relaxed);
                self.error.lock().get_or_insert_with(|| msg.clone());
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a task that was shed or purged without being evaluated.
    pub fn complete_dropped(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// No further tasks will be added.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True exactly once: when the batch is closed, fully drained, and has
    /// not been claimed by another finalizer.
    pub fn try_finalize(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            && self.completed.load(Ordering::SeqCst) >= self.total.load(Ordering::SeqCst)
            && !self.finalized.swap(true, Ordering::SeqCst)
    }

    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            trader_id: self.trader_id.clone(),
            started_at: self.started_at,
            completed_at: now_ms(),
            symbols_checked: self.checked.load(Ordering::Relaxed),
            symbols_matched: self.matched.load(Ordering::Relaxed),
            execution_time_ms: self.started.elapsed().as_millis() as u64,
            error: self.error.lock().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pair claims (fairness token)
// ---------------------------------------------------------------------------

/// At most one evaluation in flight per (trader, symbol). Shared by the
/// scheduler workers and the manager's execute-immediate batches, so the two
/// paths can never race dedup for the same pair.
pub struct PairClaims {
    busy: Mutex<HashSet<(String, String)>>,
}

impl PairClaims {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Non-blocking claim; workers requeue the task on contention.
    pub fn try_claim(&self, trader_id: &str, symbol: &str) -> bool {
        self.busy
            .lock()
            .insert((trader_id.to_string(), symbol.to_string()))
    }

    /// Wait until the pair can be claimed. Contention is rare and short
    /// (one evaluation), so a simple backoff poll suffices.
    pub async fn claim(&self, trader_id: &str, symbol: &str) {
        while !self.try_claim(trader_id, symbol) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn release(&self, trader_id: &str, symbol: &str) {
        self.busy
            .lock()
            .remove(&(trader_id.to_string(), symbol.to_string()));
    }
}

impl Default for PairClaims {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

/// One queued evaluation: (trader, symbol) at a specific bar.
pub struct EvalTask {
    pub trader: Arc<TraderHandle>,
    pub symbol: String,
    pub kline_open_time: i64,
    pub batch: Arc<BatchTracker>,
}

/// Bounded FIFO work queue with same-trader shedding on overflow.
pub struct TaskQueue {
    inner: Mutex<VecDeque<EvalTask>>,
    capacity: usize,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Enqueue a task. On overflow, shed the oldest pending task of the same
    /// trader (else the oldest overall) and record the drop on its metrics.
    pub fn push(&self, task: EvalTask) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            let trader_id = task.trader.id();
            let victim_idx = queue
                .iter()
                .position(|t| t.trader.id() == trader_id)
                .unwrap_or(0);
            if let Some(victim) = queue.remove(victim_idx) {
                victim.trader.record_dropped_task();
                victim.batch.complete_dropped();
                debug!(
                    trader_id = %victim.trader.id(),
                    symbol = %victim.symbol,
                    "queue full -- shed stale task"
                );
            }
        }
        queue.push_back(task);
        drop(queue);
        self.notify.notify_one();
    }

    /// Re-enqueue a task whose (trader, symbol) pair is currently busy.
    pub fn requeue(&self, task: EvalTask) {
        self.inner.lock().push_back(task);
        self.notify.notify_one();
    }

    /// Wait for the next task.
    pub async fn pop(&self) -> EvalTask {
        loop {
            let (task, more) = {
                let mut queue = self.inner.lock();
                let task = queue.pop_front();
                (task, !queue.is_empty())
            };
            if let Some(task) = task {
                if more {
                    // Wake another worker for the remaining backlog.
                    self.notify.notify_one();
                }
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Remove every queued task belonging to a trader (stop path). Returns
    /// the number of tasks removed.
    pub fn purge_trader(&self, trader_id: &str) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|task| {
            if task.trader.id() == trader_id {
                task.batch.complete_dropped();
                false
            } else {
                true
            }
        });
        before - queue.len()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    manager: Arc<TraderManager>,
    cache: Arc<KlineCache>,
    worker_count: usize,

    /// Serializes same-pair work across the pool; shared with the manager so
    /// execute-immediate batches respect the same token.
    claims: Arc<PairClaims>,

    /// Current batch per trader; rotated when the next bar's events arrive.
    batches: Mutex<HashMap<String, Arc<BatchTracker>>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        manager: Arc<TraderManager>,
        cache: Arc<KlineCache>,
        claims: Arc<PairClaims>,
        worker_count: usize,
    ) -> Self {
        Self {
            queue,
            manager,
            cache,
            worker_count: worker_count.max(1),
            claims,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the dispatch loop and the worker pool.
    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.worker_count + 1);

        let dispatcher = self.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run_dispatch().await;
        }));

        for worker_id in 0..self.worker_count {
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                worker.run_worker(worker_id).await;
            }));
        }

        info!(workers = self.worker_count, "scheduler running");
        handles
    }

    /// Current-or-new batch for (trader, bar). Rotating to a new bar closes
    /// the previous batch and finalizes it if its tasks already drained.
    async fn batch_for(&self, handle: &Arc<TraderHandle>, open_time: i64) -> Arc<BatchTracker> {
        let trader_id = handle.id();
        let (tracker, retired) = {
            let mut batches = self.batches.lock();
            let current = batches.get(&trader_id).cloned();
            match current {
                Some(current) if current.kline_open_time == open_time => (current, None),
                previous => {
                    let fresh = Arc::new(BatchTracker::new(trader_id.clone(), open_time));
                    batches.insert(trader_id, fresh.clone());
                    (fresh, previous)
                }
            }
        };

        if let Some(old) = retired {
            old.close();
            if old.try_finalize() {
                self.manager.write_batch_history(handle, old.to_record()).await;
            }
        }

        tracker
    }

    /// Dispatch loop: translate bar-close events into evaluation tasks.
    pub async fn run_dispatch(self: Arc<Self>) {
        let mut closes = self.cache.subscribe_closes();
        loop {
            let event: BarClose = match closes.recv().await {
                Ok(ev) => ev,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "dispatcher lagged behind bar-close events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    warn!("bar-close channel closed -- dispatcher exiting");
                    return;
                }
            };

            for handle in self.manager.running_on_schedule(event.timeframe) {
                if handle.stop_requested() {
                    continue;
                }
                let batch = self.batch_for(&handle, event.open_time).await;
                batch.add_task();
                self.queue.push(EvalTask {
                    trader: handle,
                    symbol: event.symbol.clone(),
                    kline_open_time: event.open_time,
                    batch,
                });
            }
        }
    }

    /// Worker loop: drain the queue, serializing per (trader, symbol).
    pub async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "evaluation worker started");
        loop {
            let task = self.queue.pop().await;
            let trader_id = task.trader.id();

            if task.trader.stop_requested() {
                task.batch.complete_dropped();
                continue;
            }

            if !self.claims.try_claim(&trader_id, &task.symbol) {
                // Same pair already in flight elsewhere; retry later.
                self.queue.requeue(task);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }

            let permits = task.trader.analysis_permits();
            let Ok(_permit) = permits.acquire_owned().await else {
                self.claims.release(&trader_id, &task.symbol);
                task.batch.complete_dropped();
                continue;
            };

            task.trader.begin_task();
            let outcome = self
                .manager
                .evaluate_symbol(&task.trader, &task.symbol, Some(task.kline_open_time))
                .await;
            task.trader.end_task();
            self.claims.release(&trader_id, &task.symbol);

            task.batch.complete(&outcome);
            if task.batch.try_finalize() {
                self.manager
                    .write_batch_history(&task.trader, task.batch.to_record())
                    .await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TraderManager;
    use crate::market_data::{Kline, KlineKey, SymbolUniverse, TickerInfo};
    use crate::repository::mock::MockRepository;
    use crate::repository::TraderRecord;
    use crate::sandbox::FilterRuntime;
    use crate::trader::Trader;
    use crate::types::{SubscriptionTier, Timeframe};
    use std::time::Duration;

    fn handle(id: &str) -> Arc<TraderHandle> {
        Arc::new(TraderHandle::new(
            Trader::from_record(TraderRecord {
                id: id.into(),
                user_id: "u1".into(),
                name: id.into(),
                enabled: true,
                filter_source: "true".into(),
                filter_timeframes: vec!["15m".into()],
                schedule: "15m".into(),
                dedupe_bars: 50,
                matched_conditions: vec![],
            })
            .unwrap(),
        ))
    }

    fn task(trader: &Arc<TraderHandle>, symbol: &str, batch: &Arc<BatchTracker>) -> EvalTask {
        batch.add_task();
        EvalTask {
            trader: trader.clone(),
            symbol: symbol.into(),
            kline_open_time: 0,
            batch: batch.clone(),
        }
    }

    #[test]
    fn queue_sheds_same_trader_first() {
        let queue = TaskQueue::new(2);
        let a = handle("a");
        let b = handle("b");
        let batch_a = Arc::new(BatchTracker::new("a".into(), 0));
        let batch_b = Arc::new(BatchTracker::new("b".into(), 0));

        queue.push(task(&a, "BTCUSDT", &batch_a));
        queue.push(task(&b, "BTCUSDT", &batch_b));
        // Queue full; pushing another task for `a` sheds a's oldest.
        queue.push(task(&a, "ETHUSDT", &batch_a));

        assert_eq!(queue.len(), 2);
        assert_eq!(a.metrics().dropped_tasks, 1);
        assert_eq!(b.metrics().dropped_tasks, 0);
    }

    #[test]
    fn queue_sheds_oldest_overall_when_no_same_trader() {
        let queue = TaskQueue::new(1);
        let a = handle("a");
        let b = handle("b");
        let batch_a = Arc::new(BatchTracker::new("a".into(), 0));
        let batch_b = Arc::new(BatchTracker::new("b".into(), 0));

        queue.push(task(&a, "BTCUSDT", &batch_a));
        queue.push(task(&b, "BTCUSDT", &batch_b));

        assert_eq!(queue.len(), 1);
        assert_eq!(a.metrics().dropped_tasks, 1);
    }

    #[test]
    fn purge_removes_only_that_trader() {
        let queue = TaskQueue::new(16);
        let a = handle("a");
        let b = handle("b");
        let batch_a = Arc::new(BatchTracker::new("a".into(), 0));
        let batch_b = Arc::new(BatchTracker::new("b".into(), 0));

        queue.push(task(&a, "BTCUSDT", &batch_a));
        queue.push(task(&a, "ETHUSDT", &batch_a));
        queue.push(task(&b, "BTCUSDT", &batch_b));

        assert_eq!(queue.purge_trader("a"), 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(TaskQueue::new(4));
        let a = handle("a");
        let batch = Arc::new(BatchTracker::new("a".into(), 0));

        let popper = queue.clone();
        let join = tokio::spawn(async move { popper.pop().await.symbol });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task(&a, "SOLUSDT", &batch));

        assert_eq!(join.await.unwrap(), "SOLUSDT");
    }

    #[test]
    fn pair_claims_are_exclusive_per_pair() {
        let claims = PairClaims::new();
        assert!(claims.try_claim("t1", "BTCUSDT"));
        assert!(!claims.try_claim("t1", "BTCUSDT"));
        // Other pairs are independent.
        assert!(claims.try_claim("t1", "ETHUSDT"));
        assert!(claims.try_claim("t2", "BTCUSDT"));

        claims.release("t1", "BTCUSDT");
        assert!(claims.try_claim("t1", "BTCUSDT"));
    }

    #[tokio::test]
    async fn claim_waits_for_release() {
        let claims = Arc::new(PairClaims::new());
        assert!(claims.try_claim("t1", "BTCUSDT"));

        let waiter = claims.clone();
        let join = tokio::spawn(async move {
            waiter.claim("t1", "BTCUSDT").await;
            waiter.release("t1", "BTCUSDT");
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!join.is_finished());

        claims.release("t1", "BTCUSDT");
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("claim should resolve after release")
            .unwrap();
    }

    #[test]
    fn batch_finalizes_exactly_once_when_closed_and_drained() {
        let batch = BatchTracker::new("t".into(), 0);
        batch.add_task();
        batch.add_task();

        batch.complete(&EvalOutcome::Matched);
        assert!(!batch.try_finalize(), "still open");

        batch.close();
        assert!(!batch.try_finalize(), "one task outstanding");

        batch.complete(&EvalOutcome::Failed("boom".into()));
        assert!(batch.try_finalize());
        assert!(!batch.try_finalize(), "second finalize must lose");

        let record = batch.to_record();
        assert_eq!(record.symbols_checked, 2);
        assert_eq!(record.symbols_matched, 1);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn batch_skips_do_not_count_as_checked() {
        let batch = BatchTracker::new("t".into(), 0);
        batch.add_task();
        batch.complete(&EvalOutcome::Skipped);
        batch.close();
        assert!(batch.try_finalize());
        let record = batch.to_record();
        assert_eq!(record.symbols_checked, 0);
        assert!(record.error.is_none());
    }

    // ── End-to-end: bar close drives evaluation through the pool ───────

    #[tokio::test]
    async fn bar_close_triggers_evaluation_and_signal() {
        let repo = Arc::new(MockRepository::new());
        let cache = Arc::new(KlineCache::new(500));
        let universe = Arc::new(SymbolUniverse::new());
        let queue = Arc::new(TaskQueue::new(64));
        let claims = Arc::new(PairClaims::new());
        let manager = Arc::new(TraderManager::new(
            repo.clone(),
            Arc::new(FilterRuntime::new()),
            cache.clone(),
            universe.clone(),
            queue.clone(),
            claims.clone(),
            250,
            Duration::from_secs(2),
            Duration::from_secs(4),
        ));

        repo.add_user("u1", SubscriptionTier::Pro);
        repo.add_trader(TraderRecord {
            id: "t1".into(),
            user_id: "u1".into(),
            name: "always".into(),
            enabled: true,
            filter_source: "indicators::latest_close(data.klines(\"15m\")) != ()".into(),
            filter_timeframes: vec!["15m".into()],
            schedule: "15m".into(),
            dedupe_bars: 50,
            matched_conditions: vec![],
        });

        universe.apply(
            vec![(
                "BTCUSDT".to_string(),
                TickerInfo {
                    last_price: 100.0,
                    price_change_pct: 0.0,
                    quote_volume: 1_000_000.0,
                },
            )],
            10,
            0.0,
        );

        // Seed history, then start the trader.
        let dur = Timeframe::M15.duration_ms();
        let key = KlineKey::new("BTCUSDT", Timeframe::M15);
        let seed: Vec<Kline> = (0..50)
            .map(|i| Kline {
                open_time: i * dur,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 10.0,
                close_time: (i + 1) * dur,
                quote_volume: 1000.0,
                trades: 5,
                taker_buy_base: 5.0,
                taker_buy_quote: 500.0,
            })
            .collect();
        cache.seed(&key, seed);

        let auth = crate::api::auth::AuthUser {
            user_id: "u1".into(),
            is_admin: false,
        };
        manager.start("t1", &auth).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(queue, manager.clone(), cache.clone(), claims, 2));
        let tasks = scheduler.spawn();

        // Let the dispatcher reach its subscription point before closing a
        // bar, or the broadcast event is lost.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A live bar closes at open_time = 50 * dur.
        cache.push_closed(
            &key,
            Kline {
                open_time: 50 * dur,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 12.0,
                close_time: 51 * dur,
                quote_volume: 1200.0,
                trades: 6,
                taker_buy_base: 6.0,
                taker_buy_quote: 600.0,
            },
        );

        // Give the pipeline a moment to dispatch and evaluate.
        for _ in 0..50 {
            if repo.signal_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(repo.signal_count(), 1);
        let signals = repo.signals.lock();
        assert_eq!(signals[0].kline_timestamp, 50 * dur);
        assert_eq!(signals[0].symbol, "BTCUSDT");
        drop(signals);

        for t in tasks {
            t.abort();
        }
    }
}
