use std::collections::BTreeMap;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::info;

use crate::errors::AppError;
use crate::external::flight_search::DateRange;
use crate::models::TrackedRoute;
use crate::services::job_scheduler_service::{JobContext, JobResult};

/// Main entry point for the scheduled deal scan.
///
/// Tracked routes are grouped by origin so each origin costs one upstream
/// search. Up to `batch_concurrency` origins are processed at once; their
/// searches still queue through the request scheduler. A failing route is
/// counted and never stops the run.
pub async fn scan_tracked_routes(ctx: JobContext) -> Result<JobResult, AppError> {
    let groups = group_by_origin(&ctx.tracked_routes);

    if groups.is_empty() {
        info!("No tracked routes to scan");
        return Ok(JobResult {
            items_processed: 0,
            items_failed: 0,
        });
    }

    let dates = DateRange::starting(Utc::now().date_naive(), ctx.scan_horizon_days);
    info!(
        "Scanning {} tracked routes across {} origins ({} to {})",
        ctx.tracked_routes.len(),
        groups.len(),
        dates.start,
        dates.end
    );

    let service = &ctx.deal_service;
    let summaries: Vec<_> = stream::iter(groups)
        .map(|(origin, routes)| async move { service.scan_origin(&origin, &routes, dates).await })
        .buffer_unordered(ctx.batch_concurrency.max(1))
        .collect()
        .await;

    let mut processed = 0;
    let mut failed = 0;
    let mut deals = 0;
    for summary in summaries {
        processed += summary.routes_scanned - summary.routes_failed;
        failed += summary.routes_failed;
        deals += summary.deals_found;
    }

    info!("Deal scan found {} deals", deals);

    Ok(JobResult {
        items_processed: processed as i32,
        items_failed: failed as i32,
    })
}

pub fn group_by_origin(routes: &[TrackedRoute]) -> BTreeMap<String, Vec<TrackedRoute>> {
    let mut groups: BTreeMap<String, Vec<TrackedRoute>> = BTreeMap::new();
    for tracked in routes {
        groups
            .entry(tracked.route.origin().to_string())
            .or_default()
            .push(tracked.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_tracked_routes;

    #[test]
    fn test_group_by_origin() {
        let routes = parse_tracked_routes("LHR-JFK, MAN-BCN, a=lhr-cdg").unwrap();
        let groups = group_by_origin(&routes);

        assert_eq!(groups.len(), 2);
        let lhr: Vec<&str> = groups["LHR"].iter().map(|t| t.alert_id.as_str()).collect();
        assert_eq!(lhr, vec!["LHR-JFK", "a"]);
        assert_eq!(groups["MAN"].len(), 1);
    }
}
