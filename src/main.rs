use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;

use flight_deals_backend::app;
use flight_deals_backend::config::AppConfig;
use flight_deals_backend::external::flight_search::FlightSearchProvider;
use flight_deals_backend::external::live_pricing::{HttpLivePricingApi, LivePricingProvider};
use flight_deals_backend::external::mock_provider::MockFlightProvider;
use flight_deals_backend::logging::{init_logging, LoggingConfig};
use flight_deals_backend::services::deal_cache::DealCache;
use flight_deals_backend::services::deal_evaluator::DealEvaluator;
use flight_deals_backend::services::deal_service::{DealService, DealServiceConfig, DealServiceParts};
use flight_deals_backend::services::deal_store::{DealStore, InMemoryDealStore, PgDealStore};
use flight_deals_backend::services::job_scheduler_service::{JobContext, JobSchedulerService};
use flight_deals_backend::services::price_history_store::PriceHistoryStore;
use flight_deals_backend::services::quota_tracker::{InMemoryQuotaStore, PgQuotaStore, QuotaStore, QuotaTracker};
use flight_deals_backend::services::request_scheduler::RequestScheduler;
use flight_deals_backend::services::sample_store::{InMemorySampleStore, PgSampleStore, SampleStore};
use flight_deals_backend::state::AppState;

type Stores = (Arc<dyn DealStore>, Arc<dyn QuotaStore>, Arc<dyn SampleStore>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    init_logging(LoggingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = AppConfig::from_env();

    let provider: Arc<dyn FlightSearchProvider> = match config.search_provider.as_str() {
        "live" => {
            info!("✈️  Using search provider: live pricing API");
            let api = HttpLivePricingApi::from_env().context("Failed to create live pricing client")?;
            Arc::new(LivePricingProvider::new(Box::new(api), &config.currency))
        }
        "mock" => {
            info!("✈️  Using search provider: mock");
            Arc::new(MockFlightProvider::new(&config.currency))
        }
        other => anyhow::bail!("Invalid SEARCH_PROVIDER: {}. Must be 'live' or 'mock'", other),
    };

    let (deals, quotas, samples): Stores = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to Postgres")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            info!("🗄️  Using Postgres stores");
            (
                Arc::new(PgDealStore::new(pool.clone())) as Arc<dyn DealStore>,
                Arc::new(PgQuotaStore::new(pool.clone())) as Arc<dyn QuotaStore>,
                Arc::new(PgSampleStore::new(pool)) as Arc<dyn SampleStore>,
            )
        }
        None => {
            info!("🗄️  DATABASE_URL not set, using in-memory stores");
            (
                Arc::new(InMemoryDealStore::new()) as Arc<dyn DealStore>,
                Arc::new(InMemoryQuotaStore::new()) as Arc<dyn QuotaStore>,
                Arc::new(InMemorySampleStore::new()) as Arc<dyn SampleStore>,
            )
        }
    };

    let scheduler = RequestScheduler::start(provider, config.scheduler.clone());

    let deal_service = DealService::new(DealServiceParts {
        history: PriceHistoryStore::new(config.history.clone()),
        evaluator: DealEvaluator::new(config.evaluator.clone()),
        scheduler,
        cache: DealCache::new(config.cache_ttl),
        quota: QuotaTracker::new(quotas, config.free_signal_limit, config.quota_reset),
        deals,
        samples,
        config: DealServiceConfig::default(),
    });

    let mut jobs = JobSchedulerService::new(
        JobContext::new(deal_service.clone(), &config),
        config.job_scheduler_test_mode,
    )
    .await?;
    jobs.start().await?;

    let state = AppState {
        deal_service,
        search_window_days: config.scan_horizon_days,
    };
    let app = app::create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("🚀 Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    jobs.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
