use serde::{Deserialize, Serialize};

use super::RouteKey;
use crate::errors::AppError;

/// A route watched by the scheduled deal scan. `alert_id` keys the alert's
/// cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRoute {
    pub alert_id: String,
    pub route: RouteKey,
}

/// Parse `TRACKED_ROUTES`: comma separated `LHR-JFK` or `alert-id=LHR-JFK`
/// entries. Blank entries are skipped.
pub fn parse_tracked_routes(raw: &str) -> Result<Vec<TrackedRoute>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (alert_id, route) = match entry.split_once('=') {
                Some((id, route)) => (id.trim().to_string(), route.trim()),
                None => (String::new(), entry),
            };
            let route: RouteKey = route.parse()?;
            let alert_id = if alert_id.is_empty() {
                route.to_string()
            } else {
                alert_id
            };
            Ok(TrackedRoute { alert_id, route })
        })
        .collect()
}
