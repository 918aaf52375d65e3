mod deal;
mod price_observation;
mod quota;
mod route;
mod route_history;
mod tracked_route;

pub use deal::{DealRecord, DealVerdict, EvaluationMode, NotDealReason};
pub use price_observation::{validate_price, PriceObservation, RecordPriceRequest};
pub use quota::QuotaRecord;
pub use route::{normalize_code, parse_place_code, RouteKey};
pub use route_history::{PriceSample, RouteHistory};
pub use tracked_route::{parse_tracked_routes, TrackedRoute};
