// =============================================================================
// Pulsar Signal Screener — Main Entry Point
// =============================================================================
//
// Startup order matters: configuration is fatal-checked first, market data
// plumbing comes up next so the cache starts filling, then the trader
// registry is bootstrapped and the scheduler and API server go live.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod config;
mod error;
mod indicators;
mod manager;
mod market_data;
mod repository;
mod sandbox;
mod scheduler;
mod trader;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::config::Config;
use crate::manager::TraderManager;
use crate::market_data::{stream, universe, KlineCache};
use crate::repository::SupabaseRepository;
use crate::sandbox::FilterRuntime;
use crate::scheduler::{PairClaims, Scheduler, TaskQueue};

/// How often the backfill sweep looks for series needing a REST refill.
const BACKFILL_SWEEP_SECS: u64 = 30;

/// Request weight of one kline fetch (Binance charges 2 below limit 1000).
const KLINE_FETCH_WEIGHT: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "configuration error -- refusing to start");
        e
    })?;

    info!(
        version = %config.version,
        environment = %config.environment,
        symbols = config.symbol_count,
        schedule = %config.kline_interval,
        "Pulsar Signal Screener starting"
    );
    if let Some(machine_id) = &config.machine.machine_id {
        info!(
            machine_id = %machine_id,
            region = config.machine.region.as_deref().unwrap_or("unknown"),
            "machine identity configured"
        );
    }

    // ── 2. Core subsystems ───────────────────────────────────────────────
    let cache = Arc::new(KlineCache::new(config.kline_window.max(500)));
    let universe_state = Arc::new(market_data::SymbolUniverse::new());
    let binance = Arc::new(BinanceClient::new(config.binance_api_url.clone()));
    let runtime = Arc::new(FilterRuntime::new());
    let repo: Arc<dyn repository::Repository> = Arc::new(SupabaseRepository::new(
        config.supabase_url.clone(),
        config.supabase_service_key.clone(),
    ));

    let queue = Arc::new(TaskQueue::new(config.queue_capacity));
    let claims = Arc::new(PairClaims::new());
    let manager = Arc::new(TraderManager::new(
        repo.clone(),
        runtime.clone(),
        cache.clone(),
        universe_state.clone(),
        queue.clone(),
        claims.clone(),
        config.kline_window,
        config.eval_timeout(),
        config.drain_timeout(),
    ));

    // ── 3. Symbol universe refresh ───────────────────────────────────────
    {
        let universe_task = universe_state.clone();
        let client = binance.clone();
        let symbol_count = config.symbol_count;
        let min_volume = config.min_volume;
        let interval_ms = config.screening_interval_ms;
        tokio::spawn(async move {
            // Prime immediately so streams and seeding can begin.
            match client.get_24h_tickers().await {
                Ok(tickers) => universe_task.apply(tickers, symbol_count, min_volume),
                Err(e) => warn!(error = %e, "initial ticker sweep failed"),
            }
            universe::run_universe_refresh(
                universe_task,
                client,
                symbol_count,
                min_volume,
                interval_ms,
            )
            .await;
        });
    }

    // ── 4. Kline streams + history backfill ──────────────────────────────
    {
        let stream_cache = cache.clone();
        let stream_universe = universe_state.clone();
        tokio::spawn(async move {
            stream::run_stream_supervisor(stream_cache, stream_universe).await;
        });
    }
    {
        let seed_cache = cache.clone();
        let seed_universe = universe_state.clone();
        let client = binance.clone();
        let window = config.kline_window;
        tokio::spawn(async move {
            let mut sweep =
                tokio::time::interval(std::time::Duration::from_secs(BACKFILL_SWEEP_SECS));
            loop {
                sweep.tick().await;
                for key in seed_cache.backfill_queue() {
                    if !seed_universe.contains(&key.symbol) {
                        continue;
                    }
                    if !client.rate_limit().can_send_request(KLINE_FETCH_WEIGHT) {
                        break; // weight budget exhausted; resume next sweep
                    }
                    match client.get_klines(&key.symbol, key.timeframe, window).await {
                        Ok(klines) => seed_cache.seed(&key, klines),
                        Err(e) => {
                            warn!(key = %key, error = %e, "kline backfill failed");
                        }
                    }
                }
            }
        });
    }
    {
        // The weight header is authoritative, but decay the counter anyway in
        // case no responses arrive for a while.
        let limiter = binance.rate_limit();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                limiter.reset_1m_weight();
            }
        });
    }

    // ── 5. Trader registry bootstrap ─────────────────────────────────────
    if let Err(e) = manager.bootstrap().await {
        // The engine stays up: traders hydrate lazily on first reference.
        warn!(error = %e, "trader bootstrap failed -- relying on lazy hydration");
    }

    // ── 6. Scheduler ─────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        manager.clone(),
        cache.clone(),
        claims,
        config.worker_count,
    ));
    let _scheduler_tasks = scheduler.spawn();

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState::new(
        config,
        cache,
        universe_state,
        manager,
        runtime,
        repo,
    ));

    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received -- stopping");
    info!("Pulsar Signal Screener shut down complete.");
    Ok(())
}
