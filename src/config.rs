use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::models::{parse_tracked_routes, TrackedRoute};
use crate::services::deal_evaluator::{DealThresholds, EvaluatorConfig};
use crate::services::price_history_store::HistoryConfig;
use crate::services::request_scheduler::SchedulerConfig;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub evaluator: EvaluatorConfig,
    pub history: HistoryConfig,
    pub scheduler: SchedulerConfig,
    pub cache_ttl: chrono::Duration,
    pub batch_concurrency: usize,
    /// Days ahead covered by the scheduled scan.
    pub scan_horizon_days: u32,
    pub free_signal_limit: u32,
    /// `None` keeps the free-signal cap for the lifetime of an identity.
    pub quota_reset: Option<chrono::Duration>,
    pub tracked_routes: Vec<TrackedRoute>,
    pub search_provider: String,
    pub currency: String,
    pub job_scheduler_test_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            evaluator: EvaluatorConfig::default(),
            history: HistoryConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache_ttl: chrono::Duration::minutes(30),
            batch_concurrency: 5,
            scan_horizon_days: 60,
            free_signal_limit: 3,
            quota_reset: None,
            tracked_routes: Vec::new(),
            search_provider: "mock".to_string(),
            currency: "GBP".to_string(),
            job_scheduler_test_mode: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let interactive = DealThresholds {
            min_discount_percent: parse_or(&read, "DEAL_MIN_DISCOUNT", defaults.evaluator.interactive.min_discount_percent),
            last_minute_days: parse_or(&read, "DEAL_LAST_MINUTE_DAYS", defaults.evaluator.interactive.last_minute_days),
            last_minute_min_discount_percent: parse_or(
                &read,
                "DEAL_LAST_MINUTE_DISCOUNT",
                defaults.evaluator.interactive.last_minute_min_discount_percent,
            ),
        };
        let batch = DealThresholds {
            min_discount_percent: parse_or(&read, "BATCH_MIN_DISCOUNT", defaults.evaluator.batch.min_discount_percent),
            last_minute_days: parse_or(&read, "BATCH_LAST_MINUTE_DAYS", defaults.evaluator.batch.last_minute_days),
            last_minute_min_discount_percent: parse_or(
                &read,
                "BATCH_LAST_MINUTE_DISCOUNT",
                defaults.evaluator.batch.last_minute_min_discount_percent,
            ),
        };

        let scheduler = SchedulerConfig {
            requests_per_second: parse_or(&read, "SEARCH_REQUESTS_PER_SECOND", defaults.scheduler.requests_per_second).max(1),
            max_retries: parse_or(&read, "SEARCH_MAX_RETRIES", defaults.scheduler.max_retries),
            base_delay: Duration::from_millis(parse_or(
                &read,
                "SEARCH_BASE_DELAY_MS",
                defaults.scheduler.base_delay.as_millis() as u64,
            )),
        };

        let tracked_routes = match read("TRACKED_ROUTES") {
            Some(raw) => parse_tracked_routes(&raw).unwrap_or_else(|e| {
                warn!("Ignoring TRACKED_ROUTES: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let quota_reset_days: i64 = parse_or(&read, "QUOTA_RESET_DAYS", 0);

        Self {
            port: parse_or(&read, "PORT", defaults.port),
            database_url: read("DATABASE_URL"),
            evaluator: EvaluatorConfig {
                interactive,
                batch,
                min_history_entries: parse_or(
                    &read,
                    "PRICE_HISTORY_MIN_ENTRIES",
                    defaults.evaluator.min_history_entries,
                )
                .max(1),
                ..defaults.evaluator
            },
            history: HistoryConfig {
                window_days: parse_or(&read, "PRICE_HISTORY_WINDOW_DAYS", defaults.history.window_days).max(1),
                max_samples: parse_or(&read, "PRICE_HISTORY_MAX_SAMPLES", defaults.history.max_samples).max(1),
            },
            scheduler,
            cache_ttl: chrono::Duration::seconds(parse_or(
                &read,
                "DEAL_CACHE_TTL_SECS",
                defaults.cache_ttl.num_seconds(),
            )),
            batch_concurrency: parse_or(&read, "BATCH_CONCURRENCY", defaults.batch_concurrency).max(1),
            scan_horizon_days: parse_or(&read, "SCAN_HORIZON_DAYS", defaults.scan_horizon_days).max(1),
            free_signal_limit: parse_or(&read, "FREE_SIGNAL_LIMIT", defaults.free_signal_limit),
            quota_reset: (quota_reset_days > 0).then(|| chrono::Duration::days(quota_reset_days)),
            tracked_routes,
            search_provider: read("SEARCH_PROVIDER")
                .map(|p| p.trim().to_lowercase())
                .unwrap_or(defaults.search_provider),
            currency: read("SEARCH_CURRENCY")
                .map(|c| c.trim().to_uppercase())
                .unwrap_or(defaults.currency),
            job_scheduler_test_mode: parse_or(&read, "JOB_SCHEDULER_TEST_MODE", false),
        }
    }
}

fn parse_or<T, F>(read: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match read(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: '{}', using default", key, raw);
            default
        }),
        None => default,
    }
}
