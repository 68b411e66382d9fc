// =============================================================================
// Engine Configuration — environment-driven, resolved once at boot
// =============================================================================
//
// Every tunable the engine recognises is read from the environment (after an
// optional .env file). Missing Supabase credentials are fatal: the engine
// cannot persist signals without them, so startup aborts with a ConfigError.
// =============================================================================

use anyhow::{bail, Context, Result};

use crate::types::Timeframe;

/// Optional identity of the machine running this engine instance. Used to tag
/// multi-tenant deployments; has no effect on screening behaviour.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MachineIdentity {
    pub machine_id: Option<String>,
    pub user_id: Option<String>,
    pub region: Option<String>,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub version: String,

    // ── Exchange / market data ──────────────────────────────────────────
    pub binance_api_url: String,
    pub symbol_count: usize,
    pub min_volume: f64,
    pub kline_interval: Timeframe,
    pub screening_interval_ms: u64,
    pub kline_window: usize,

    // ── Repository ──────────────────────────────────────────────────────
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub supabase_anon_key: String,

    // ── Evaluation plane ────────────────────────────────────────────────
    pub eval_timeout_ms: u64,
    pub worker_count: usize,
    pub queue_capacity: usize,

    // ── Deployment identity ─────────────────────────────────────────────
    pub machine: MachineIdentity,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key} ({raw}): {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Resolve the full configuration from the process environment.
    ///
    /// Fatal when any of the three Supabase values is missing or empty.
    pub fn from_env() -> Result<Self> {
        let supabase_url = env_opt("SUPABASE_URL")
            .context("SUPABASE_URL is required but not set")?;
        let supabase_service_key = env_opt("SUPABASE_SERVICE_KEY")
            .context("SUPABASE_SERVICE_KEY is required but not set")?;
        let supabase_anon_key = env_opt("SUPABASE_ANON_KEY")
            .context("SUPABASE_ANON_KEY is required but not set")?;

        let kline_interval_raw = env_string("KLINE_INTERVAL", "5m");
        let kline_interval = match Timeframe::parse(&kline_interval_raw) {
            Some(tf) => tf,
            None => bail!("KLINE_INTERVAL has unknown timeframe: {kline_interval_raw}"),
        };

        let config = Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080u16)?,
            environment: env_string("ENVIRONMENT", "development"),
            version: env_string("VERSION", env!("CARGO_PKG_VERSION")),

            binance_api_url: env_string("BINANCE_API_URL", "https://api.binance.com"),
            symbol_count: env_parse("SYMBOL_COUNT", 100usize)?,
            min_volume: env_parse("MIN_VOLUME", 100_000.0f64)?,
            kline_interval,
            screening_interval_ms: env_parse("SCREENING_INTERVAL_MS", 60_000u64)?,
            kline_window: env_parse("KLINE_WINDOW", 250usize)?,

            supabase_url,
            supabase_service_key,
            supabase_anon_key,

            eval_timeout_ms: env_parse("EVAL_TIMEOUT_MS", 5_000u64)?,
            worker_count: env_parse("WORKER_COUNT", 8usize)?,
            queue_capacity: env_parse("QUEUE_CAPACITY", 1024usize)?,

            machine: MachineIdentity {
                machine_id: env_opt("MACHINE_ID"),
                user_id: env_opt("USER_ID"),
                region: env_opt("MACHINE_REGION"),
                cpus: env_opt("MACHINE_CPUS").and_then(|v| v.parse().ok()),
                memory_mb: env_opt("MACHINE_MEMORY").and_then(|v| v.parse().ok()),
            },
        };

        if config.worker_count == 0 {
            bail!("WORKER_COUNT must be at least 1");
        }
        if config.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be at least 1");
        }

        Ok(config)
    }

    /// Socket address the API server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn eval_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.eval_timeout_ms)
    }

    /// Grace period for draining a stopping trader's in-flight tasks.
    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.eval_timeout_ms * 2)
    }
}

// =============================================================================
// Tests
// =============================================================================
//
// Environment mutation is process-global, so these tests run under a lock to
// avoid interfering with each other when the harness runs them in parallel.

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_supabase_env<F: FnOnce()>(f: F) {
        let _guard = ENV_LOCK.lock();
        std::env::set_var("SUPABASE_URL", "https://example.supabase.co");
        std::env::set_var("SUPABASE_SERVICE_KEY", "service-key");
        std::env::set_var("SUPABASE_ANON_KEY", "anon-key");
        f();
        for key in [
            "SUPABASE_URL",
            "SUPABASE_SERVICE_KEY",
            "SUPABASE_ANON_KEY",
            "PORT",
            "KLINE_INTERVAL",
            "SYMBOL_COUNT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_resolve() {
        with_supabase_env(|| {
            let cfg = Config::from_env().unwrap();
            assert_eq!(cfg.port, 8080);
            assert_eq!(cfg.host, "0.0.0.0");
            assert_eq!(cfg.symbol_count, 100);
            assert!((cfg.min_volume - 100_000.0).abs() < f64::EPSILON);
            assert_eq!(cfg.kline_interval, Timeframe::M5);
            assert_eq!(cfg.screening_interval_ms, 60_000);
            assert_eq!(cfg.eval_timeout_ms, 5_000);
            assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        });
    }

    #[test]
    fn missing_supabase_is_fatal() {
        let _guard = ENV_LOCK.lock();
        std::env::remove_var("SUPABASE_URL");
        std::env::remove_var("SUPABASE_SERVICE_KEY");
        std::env::remove_var("SUPABASE_ANON_KEY");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn overrides_apply() {
        with_supabase_env(|| {
            std::env::set_var("PORT", "9999");
            std::env::set_var("KLINE_INTERVAL", "15m");
            std::env::set_var("SYMBOL_COUNT", "25");
            let cfg = Config::from_env().unwrap();
            assert_eq!(cfg.port, 9999);
            assert_eq!(cfg.kline_interval, Timeframe::M15);
            assert_eq!(cfg.symbol_count, 25);
        });
    }

    #[test]
    fn bad_timeframe_is_fatal() {
        with_supabase_env(|| {
            std::env::set_var("KLINE_INTERVAL", "7m");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn drain_timeout_is_twice_eval_timeout() {
        with_supabase_env(|| {
            let cfg = Config::from_env().unwrap();
            assert_eq!(cfg.drain_timeout(), cfg.eval_timeout() * 2);
        });
    }
}
