// =============================================================================
// Sandbox Executor — compiles and runs filter snippets safely
// =============================================================================
//
// Filter snippets are small rhai programs whose final expression must be a
// boolean. A snippet sees exactly two things: the `data` constant
// (MarketData) and the `indicators` module. No I/O, no filesystem, no
// network, no time, no imports.
//
// The function symbol tables (standard package, bindings, indicators) are
// built once at boot and shared; each evaluation gets a throwaway Engine
// referencing them plus a fresh Scope, so per-call state never leaks.
// Evaluations run on the blocking thread pool with both an operation budget
// and a wall-clock deadline; a divergent snippet is terminated at the next
// interpreter step and surfaces as a timeout.
// =============================================================================

pub mod bindings;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{Package, StandardPackage};
use rhai::{Engine, EvalAltResult, Module, Scope, AST};
use thiserror::Error;
use tracing::debug;

use crate::market_data::MarketData;
use crate::sandbox::bindings::{KlineSeries, ScriptMarketData};

/// Extra wall-clock slack given to the blocking task beyond the script
/// deadline before the result is abandoned outright.
const ABANDON_GRACE: Duration = Duration::from_millis(500);

/// Hard ceiling on interpreter operations per evaluation.
const MAX_OPERATIONS: u64 = 5_000_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum FilterError {
    /// The snippet was rejected before execution.
    #[error("compile error: {0}")]
    Compile(String),

    /// The snippet exceeded its wall-clock or operation budget.
    #[error("evaluation timed out after {0} ms")]
    Timeout(u64),

    /// The snippet failed at runtime (bad types, unknown function, ...).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The snippet (or a native binding) panicked; confined to its task.
    #[error("evaluation panicked: {0}")]
    Panicked(String),
}

impl FilterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// CompiledFilter
// ---------------------------------------------------------------------------

/// A parsed filter program. Opaque outside this module; cheap to clone and
/// safe to evaluate from many tasks at once.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    ast: Arc<AST>,
}

// ---------------------------------------------------------------------------
// FilterRuntime
// ---------------------------------------------------------------------------

/// Shared factory for evaluation engines. Construct once at boot.
#[derive(Clone)]
pub struct FilterRuntime {
    std_pkg: rhai::Shared<Module>,
    bindings: rhai::Shared<Module>,
    indicators: rhai::Shared<Module>,
}

impl FilterRuntime {
    pub fn new() -> Self {
        Self {
            std_pkg: StandardPackage::new().as_shared_module(),
            bindings: bindings::bindings_module().into(),
            indicators: bindings::indicators_module().into(),
        }
    }

    /// Build a throwaway engine wired to the shared symbol tables.
    fn build_engine(&self, deadline: Option<Instant>) -> Engine {
        let mut engine = Engine::new_raw();

        engine.register_global_module(self.std_pkg.clone());
        // Registered after the standard package so the sandbox surface (and
        // its `timestamp` override) shadows anything the package exports.
        engine.register_global_module(self.bindings.clone());
        engine.register_static_module("indicators", self.indicators.clone());

        engine.register_type_with_name::<ScriptMarketData>("MarketData");
        engine.register_type_with_name::<KlineSeries>("KlineSeries");

        // Every `import` fails; the indicator library needs none.
        engine.set_module_resolver(DummyModuleResolver::new());

        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(1_000);
        engine.set_max_string_size(10_000);

        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});

        if let Some(deadline) = deadline {
            engine.on_progress(move |_ops| {
                if Instant::now() >= deadline {
                    Some("wall-clock deadline exceeded".into())
                } else {
                    None
                }
            });
        }

        engine
    }

    /// Parse-only check, used by the editor-facing endpoint for fast
    /// feedback. Never executes anything.
    pub fn validate(&self, source: &str) -> Result<(), FilterError> {
        self.compile(source).map(|_| ())
    }

    /// Parse a snippet into a reusable [`CompiledFilter`]. Syntax errors and
    /// forbidden constructs surface here.
    pub fn compile(&self, source: &str) -> Result<CompiledFilter, FilterError> {
        if source.trim().is_empty() {
            return Err(FilterError::Compile("filter source is empty".into()));
        }
        if contains_import(source) {
            return Err(FilterError::Compile(
                "filters may not import modules; only the indicators library is available".into(),
            ));
        }

        let engine = self.build_engine(None);
        let ast = engine
            .compile(source)
            .map_err(|e| FilterError::Compile(e.to_string()))?;

        Ok(CompiledFilter { ast: Arc::new(ast) })
    }

    /// Evaluate a compiled filter against one symbol's market data.
    ///
    /// The snippet's final expression must be a boolean. Runs on the blocking
    /// pool with a wall-clock deadline; panics inside the evaluation are
    /// caught and surfaced as [`FilterError::Panicked`].
    pub async fn execute(
        &self,
        filter: &CompiledFilter,
        data: MarketData,
        timeout: Duration,
    ) -> Result<bool, FilterError> {
        let runtime = self.clone();
        let ast = filter.ast.clone();
        let timeout_ms = timeout.as_millis() as u64;

        let handle = tokio::task::spawn_blocking(move || {
            let engine = runtime.build_engine(Some(Instant::now() + timeout));
            let mut scope = Scope::new();
            scope.push_constant("data", ScriptMarketData(Arc::new(data)));
            engine.eval_ast_with_scope::<bool>(&mut scope, &ast)
        });

        match tokio::time::timeout(timeout + ABANDON_GRACE, handle).await {
            Err(_) => {
                // The blocking task is stuck past its own deadline (e.g.
                // inside a native call). Abandon it; its result is discarded.
                debug!(timeout_ms, "abandoning overdue filter evaluation");
                Err(FilterError::Timeout(timeout_ms))
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    Err(FilterError::Panicked(join_err.to_string()))
                } else {
                    Err(FilterError::Runtime(join_err.to_string()))
                }
            }
            Ok(Ok(Ok(matched))) => Ok(matched),
            Ok(Ok(Err(eval_err))) => Err(map_eval_error(eval_err, timeout_ms)),
        }
    }
}

impl Default for FilterRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-level scan for the `import` keyword (identifier boundaries, so a
/// variable called `important` is fine).
fn contains_import(source: &str) -> bool {
    let bytes = source.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut start = 0;
    while let Some(pos) = source[start..].find("import") {
        let at = start + pos;
        let before_ok = at == 0 || !is_ident(bytes[at - 1]);
        let after = at + "import".len();
        let after_ok = after >= bytes.len() || !is_ident(bytes[after]);
        if before_ok && after_ok {
            return true;
        }
        start = at + 1;
    }
    false
}

fn map_eval_error(err: Box<EvalAltResult>, timeout_ms: u64) -> FilterError {
    match *err {
        EvalAltResult::ErrorTerminated(_, _) => FilterError::Timeout(timeout_ms),
        EvalAltResult::ErrorTooManyOperations(_) => FilterError::Timeout(timeout_ms),
        EvalAltResult::ErrorMismatchOutputType(requested, actual, _) => FilterError::Runtime(
            format!("filter must return {requested}, got {actual}"),
        ),
        other => FilterError::Runtime(other.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{Kline, TickerInfo};
    use crate::types::Timeframe;
    use std::collections::HashMap;

    fn bars_from_closes(closes: &[f64], tf: Timeframe) -> Vec<Kline> {
        let dur = tf.duration_ms();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Kline {
                open_time: i as i64 * dur,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 100.0,
                close_time: (i as i64 + 1) * dur,
                quote_volume: c * 100.0,
                trades: 10,
                taker_buy_base: 50.0,
                taker_buy_quote: c * 50.0,
            })
            .collect()
    }

    fn market_data(closes: &[f64]) -> MarketData {
        let mut klines = HashMap::new();
        klines.insert(
            Timeframe::M15,
            std::sync::Arc::new(bars_from_closes(closes, Timeframe::M15)),
        );
        MarketData {
            symbol: "BTCUSDT".to_string(),
            ticker: TickerInfo {
                last_price: *closes.last().unwrap_or(&0.0),
                price_change_pct: -2.5,
                quote_volume: 1_000_000.0,
            },
            klines,
        }
    }

    fn falling_closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 500.0 - i as f64 * 2.0).collect()
    }

    fn rising_closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * 2.0).collect()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn validate_accepts_well_formed_snippet() {
        let rt = FilterRuntime::new();
        assert!(rt
            .validate(r#"indicators::rsi(data.klines("15m"), 14) != ()"#)
            .is_ok());
    }

    #[test]
    fn validate_rejects_syntax_error() {
        let rt = FilterRuntime::new();
        let err = rt.validate("let x = ;").unwrap_err();
        assert!(matches!(err, FilterError::Compile(_)));
    }

    #[test]
    fn validate_then_compile_is_consistent() {
        let rt = FilterRuntime::new();
        let src = r#"indicators::latest_close(data.klines("15m")) != ()"#;
        assert!(rt.validate(src).is_ok());
        assert!(rt.compile(src).is_ok());
    }

    #[test]
    fn empty_source_rejected() {
        let rt = FilterRuntime::new();
        assert!(matches!(rt.compile("  \n "), Err(FilterError::Compile(_))));
    }

    #[test]
    fn import_rejected_at_compile_time() {
        let rt = FilterRuntime::new();
        let err = rt.compile(r#"import "fs"; true"#).unwrap_err();
        assert!(matches!(err, FilterError::Compile(_)));
        // Identifiers containing the word are untouched.
        assert!(rt.compile("let important = 1; important > 0").is_ok());
    }

    #[tokio::test]
    async fn rsi_oversold_filter_matches() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(
                r#"
                let rsi = indicators::rsi(data.klines("15m"), 14);
                rsi != () && rsi < 30.0
                "#,
            )
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&falling_closes(200)), TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn rsi_overbought_does_not_match_oversold_filter() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(
                r#"
                let rsi = indicators::rsi(data.klines("15m"), 14);
                rsi != () && rsi < 30.0
                "#,
            )
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&rising_closes(200)), TIMEOUT)
            .await
            .unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn short_series_yields_no_value_not_error() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(r#"indicators::rsi(data.klines("15m"), 14) == ()"#)
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&[100.0, 101.0]), TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn undeclared_timeframe_reads_as_empty_series() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(r#"data.klines("4h").len() == 0 && data.klines("15m").len() > 0"#)
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn market_data_accessors_work() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(r#"data.symbol == "BTCUSDT" && data.change_pct < 0.0 && data.price > 0.0"#)
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn non_boolean_result_is_runtime_error() {
        let rt = FilterRuntime::new();
        let filter = rt.compile("1 + 1").unwrap();
        let err = rt
            .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Runtime(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unknown_function_is_runtime_error() {
        let rt = FilterRuntime::new();
        // Compiles fine (rhai resolves functions at call time), fails at run.
        let filter = rt.compile("read_file(\"/etc/passwd\") == ()").unwrap();
        let err = rt
            .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Runtime(_)));
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let rt = FilterRuntime::new();
        let filter = rt.compile("loop { }").unwrap();
        let started = Instant::now();
        let err = rt
            .execute(
                &filter,
                market_data(&falling_closes(50)),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn compiled_filter_is_reusable() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(r#"indicators::latest_close(data.klines("15m")) != ()"#)
            .unwrap();
        for _ in 0..3 {
            let matched = rt
                .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
                .await
                .unwrap();
            assert!(matched);
        }
    }

    #[tokio::test]
    async fn macd_map_fields_accessible() {
        let rt = FilterRuntime::new();
        let filter = rt
            .compile(
                r#"
                let m = indicators::macd(data.klines("15m"), 12, 26, 9);
                m != () && m.histogram == m.macd - m.signal
                "#,
            )
            .unwrap();
        let matched = rt
            .execute(&filter, market_data(&rising_closes(200)), TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn timestamp_is_unavailable() {
        let rt = FilterRuntime::new();
        let filter = rt.compile("timestamp(); true").unwrap();
        let err = rt
            .execute(&filter, market_data(&falling_closes(50)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Runtime(_)));
    }

    #[test]
    fn contains_import_token_boundaries() {
        assert!(contains_import("import \"x\";"));
        assert!(contains_import("  import\t\"x\""));
        assert!(!contains_import("let important = 1;"));
        assert!(!contains_import("reimport"));
        assert!(!contains_import(""));
    }
}
