//! Configuration surface (spec.md §6).
//!
//! Loaded from environment variables with literal defaults, following
//! `models.rs::Config::from_env` in the teacher: every field has a
//! parse-or-default fallback rather than a hard failure on a missing var.

use crate::errors::CoreError;

/// The full configuration surface enumerated in spec.md §6.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub database_path: String,

    pub max_workers: usize,
    pub loop_sleep_seconds: f64,
    pub max_task_deadline_seconds: u64,

    pub scan_min_delay_seconds: f64,
    pub scan_max_delay_seconds: f64,

    pub proxy_quarantine_seconds: u64,
    pub proxy_transient_quarantine_seconds: u64,
    pub host_quarantine_seconds: u64,
    pub rate_limited_quarantine_seconds: u64,

    pub price_change_threshold: f64,

    pub dedup_window_seconds: u64,
    pub dedup_capacity: usize,

    pub suspicious_min_bytes: usize,

    pub verification_refetch_delay_seconds: f64,

    /// Hard per-request timeout applied to the shared HTTP client (spec.md
    /// §5, "each network call has a hard timeout, default 30 s").
    pub network_timeout_seconds: u64,

    pub proxy_urls: Vec<String>,

    /// Bounded connection pool size for storage (spec.md §4.1).
    pub db_pool_size: usize,
    /// Per-acquire timeout for a pooled DB connection (spec.md §5).
    pub db_acquire_timeout_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            database_path: "./stockwatch.db".to_string(),
            max_workers: 4,
            loop_sleep_seconds: 1.0,
            max_task_deadline_seconds: 60,
            scan_min_delay_seconds: 1.0,
            scan_max_delay_seconds: 3.0,
            proxy_quarantine_seconds: 30 * 60,
            proxy_transient_quarantine_seconds: 5 * 60,
            host_quarantine_seconds: 60 * 60,
            rate_limited_quarantine_seconds: 10 * 60,
            price_change_threshold: 0.05,
            dedup_window_seconds: 30 * 60,
            dedup_capacity: 10_000,
            suspicious_min_bytes: 500,
            verification_refetch_delay_seconds: 2.0,
            network_timeout_seconds: 30,
            proxy_urls: Vec::new(),
            db_pool_size: 4,
            db_acquire_timeout_seconds: 10,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        config.database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| config.database_path);

        config.max_workers = env_parse_or("MAX_WORKERS", config.max_workers)?;
        config.loop_sleep_seconds = env_parse_or("LOOP_SLEEP_SECONDS", config.loop_sleep_seconds)?;
        config.max_task_deadline_seconds =
            env_parse_or("MAX_TASK_DEADLINE_SECONDS", config.max_task_deadline_seconds)?;

        config.scan_min_delay_seconds =
            env_parse_or("SCAN_MIN_DELAY_SECONDS", config.scan_min_delay_seconds)?;
        config.scan_max_delay_seconds =
            env_parse_or("SCAN_MAX_DELAY_SECONDS", config.scan_max_delay_seconds)?;

        config.proxy_quarantine_seconds =
            env_parse_or("PROXY_QUARANTINE_SECONDS", config.proxy_quarantine_seconds)?;
        config.proxy_transient_quarantine_seconds = env_parse_or(
            "PROXY_TRANSIENT_QUARANTINE_SECONDS",
            config.proxy_transient_quarantine_seconds,
        )?;
        config.host_quarantine_seconds =
            env_parse_or("HOST_QUARANTINE_SECONDS", config.host_quarantine_seconds)?;
        config.rate_limited_quarantine_seconds = env_parse_or(
            "RATE_LIMITED_QUARANTINE_SECONDS",
            config.rate_limited_quarantine_seconds,
        )?;

        config.price_change_threshold =
            env_parse_or("PRICE_CHANGE_THRESHOLD", config.price_change_threshold)?;

        config.dedup_window_seconds =
            env_parse_or("DEDUP_WINDOW_SECONDS", config.dedup_window_seconds)?;
        config.dedup_capacity = env_parse_or("DEDUP_CAPACITY", config.dedup_capacity)?;

        config.suspicious_min_bytes =
            env_parse_or("SUSPICIOUS_MIN_BYTES", config.suspicious_min_bytes)?;

        config.verification_refetch_delay_seconds = env_parse_or(
            "VERIFICATION_REFETCH_DELAY_SECONDS",
            config.verification_refetch_delay_seconds,
        )?;

        config.network_timeout_seconds =
            env_parse_or("NETWORK_TIMEOUT_SECONDS", config.network_timeout_seconds)?;

        config.db_pool_size = env_parse_or("DB_POOL_SIZE", config.db_pool_size)?;
        config.db_acquire_timeout_seconds =
            env_parse_or("DB_ACQUIRE_TIMEOUT_SECONDS", config.db_acquire_timeout_seconds)?;

        if let Ok(raw) = std::env::var("PROXY_URLS") {
            config.proxy_urls = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if config.scan_min_delay_seconds > config.scan_max_delay_seconds {
            return Err(CoreError::ConfigurationError(
                "SCAN_MIN_DELAY_SECONDS must be <= SCAN_MAX_DELAY_SECONDS".to_string(),
            ));
        }
        if config.max_workers == 0 {
            return Err(CoreError::ConfigurationError(
                "MAX_WORKERS must be >= 1".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Parse an env var, falling back to `default` when unset. Unlike the
/// teacher's `unwrap_or(default)` pattern, a *present but unparseable* value
/// is a `ConfigurationError` (spec.md §7: fail fast at startup).
fn env_parse_or<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| CoreError::ConfigurationError(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}
