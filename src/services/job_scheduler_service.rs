use crate::config::AppConfig;
use crate::errors::AppError;
use crate::jobs::{cleanup_job, deal_scan_job};
use crate::models::TrackedRoute;
use crate::services::deal_service::DealService;
use tokio_cron_scheduler::{JobScheduler, Job};
use tracing::{info, error};
use chrono::Utc;
use std::sync::Arc;

// Context passed to job functions
#[derive(Clone)]
pub struct JobContext {
    pub deal_service: DealService,
    pub tracked_routes: Arc<Vec<TrackedRoute>>,
    pub batch_concurrency: usize,
    pub scan_horizon_days: u32,
}

impl JobContext {
    pub fn new(deal_service: DealService, config: &AppConfig) -> Self {
        Self {
            deal_service,
            tracked_routes: Arc::new(config.tracked_routes.clone()),
            batch_concurrency: config.batch_concurrency,
            scan_horizon_days: config.scan_horizon_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub items_processed: i32,
    pub items_failed: i32,
}

pub struct JobSchedulerService {
    scheduler: JobScheduler,
    context: JobContext,
    test_mode: bool,
}

impl JobSchedulerService {
    pub async fn new(context: JobContext, test_mode: bool) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::External(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            context,
            test_mode,
        })
    }

    /// Start all scheduled jobs
    pub async fn start(&mut self) -> Result<(), AppError> {
        info!("🚀 Starting job scheduler...");

        if self.test_mode {
            info!("⚠️  JOB SCHEDULER IN TEST MODE - Jobs will run every minute!");
        }

        // format: sec min hour day month weekday
        let scan_schedule = if self.test_mode { "0 */1 * * * *" } else { "0 0 */4 * * *" };
        let scan_desc = if self.test_mode { "Every minute (TEST MODE)" } else { "Every 4 hours" };

        if self.context.tracked_routes.is_empty() {
            info!("No tracked routes configured, skipping deal scan job");
        } else {
            self.schedule_job(
                scan_schedule,
                "scan_tracked_routes",
                scan_desc,
                deal_scan_job::scan_tracked_routes
            ).await?;
        }

        let cleanup_schedule = if self.test_mode { "0 */3 * * * *" } else { "0 30 3 * * *" };
        let cleanup_desc = if self.test_mode { "Every 3 minutes (TEST MODE)" } else { "Daily at 3:30 AM" };

        self.schedule_job(
            cleanup_schedule,
            "cleanup_expired",
            cleanup_desc,
            cleanup_job::cleanup_expired
        ).await?;

        self.scheduler.start()
            .await
            .map_err(|e| AppError::External(format!("Failed to start scheduler: {}", e)))?;

        info!("✅ Job scheduler started");
        Ok(())
    }

    /// Stop the scheduler gracefully
    pub async fn stop(&mut self) -> Result<(), AppError> {
        info!("🛑 Stopping job scheduler...");
        self.scheduler.shutdown()
            .await
            .map_err(|e| AppError::External(format!("Failed to stop scheduler: {}", e)))?;
        info!("✅ Job scheduler stopped");
        Ok(())
    }

    async fn schedule_job<F, Fut>(
        &mut self,
        schedule: &str,
        job_name: &'static str,
        description: &str,
        job_fn: F,
    ) -> Result<(), AppError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<JobResult, AppError>> + Send + 'static,
    {
        let context = self.context.clone();
        let job_fn = Arc::new(job_fn);

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let context = context.clone();
            let job_fn = job_fn.clone();
            Box::pin(async move {
                run_job(job_name, context, job_fn).await;
            })
        })
        .map_err(|e| AppError::External(format!("Failed to create job {}: {}", job_name, e)))?;

        self.scheduler.add(job)
            .await
            .map_err(|e| AppError::External(format!("Failed to add job {}: {}", job_name, e)))?;

        info!("📅 Scheduled: {} - {} [cron: {}]", job_name, description, schedule);
        Ok(())
    }
}

/// Runs one job invocation and logs its outcome.
pub async fn run_job<F, Fut>(job_name: &str, context: JobContext, job_fn: Arc<F>) -> Option<JobResult>
where
    F: Fn(JobContext) -> Fut,
    Fut: std::future::Future<Output = Result<JobResult, AppError>>,
{
    info!("🏃 Starting job: {}", job_name);
    let started_at = Utc::now();

    let result = job_fn(context).await;

    let duration_ms = (Utc::now() - started_at).num_milliseconds();

    match result {
        Ok(job_result) => {
            info!(
                "✅ Job completed: {} (processed: {}, failed: {}, duration: {}ms)",
                job_name, job_result.items_processed, job_result.items_failed, duration_ms
            );
            Some(job_result)
        }
        Err(e) => {
            error!("❌ Job failed: {} - {} ({}ms)", job_name, e, duration_ms);
            None
        }
    }
}
