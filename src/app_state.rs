// =============================================================================
// Central Application State — Pulsar Screening Engine
// =============================================================================
//
// All long-lived subsystems are constructed once in main and threaded through
// the API handlers via `Arc<AppState>`. There is no process-global mutable
// state; the sandbox runtime's symbol tables are the only boot-time
// constants, and they live inside `FilterRuntime`.
// =============================================================================

use std::sync::Arc;

use crate::config::Config;
use crate::manager::TraderManager;
use crate::market_data::{KlineCache, SymbolUniverse};
use crate::repository::Repository;
use crate::sandbox::FilterRuntime;

/// Shared handles for the API layer and background tasks.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<KlineCache>,
    pub universe: Arc<SymbolUniverse>,
    pub manager: Arc<TraderManager>,
    pub runtime: Arc<FilterRuntime>,
    pub repo: Arc<dyn Repository>,

    /// Instant the engine was started; drives the /health uptime field.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: Arc<KlineCache>,
        universe: Arc<SymbolUniverse>,
        manager: Arc<TraderManager>,
        runtime: Arc<FilterRuntime>,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            config,
            cache,
            universe,
            manager,
            runtime,
            repo,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
