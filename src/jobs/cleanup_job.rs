use chrono::Utc;
use tracing::info;

use crate::errors::AppError;
use crate::services::job_scheduler_service::{JobContext, JobResult};

/// Removes expired deals, purges cache entries past their grace period,
/// prunes route histories and deletes samples outside the history window.
pub async fn cleanup_expired(ctx: JobContext) -> Result<JobResult, AppError> {
    let summary = ctx.deal_service.cleanup(Utc::now()).await?;

    info!(
        "🧹 Cleanup: {} expired deals, {} cache entries, {} routes pruned, {} samples",
        summary.expired_deals, summary.cache_entries_purged, summary.routes_pruned, summary.samples_deleted
    );

    let removed = summary.expired_deals as usize
        + summary.cache_entries_purged
        + summary.routes_pruned
        + summary.samples_deleted as usize;

    Ok(JobResult {
        items_processed: removed as i32,
        items_failed: 0,
    })
}
