use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use flight_deals_backend::app::create_app;
use flight_deals_backend::external::flight_search::{DateRange, FlightQuote, FlightSearchProvider, SearchError};
use flight_deals_backend::models::{RouteKey, TrackedRoute};
use flight_deals_backend::services::deal_cache::DealCache;
use flight_deals_backend::services::deal_evaluator::{DealEvaluator, EvaluatorConfig};
use flight_deals_backend::services::deal_service::{DealService, DealServiceConfig, DealServiceParts};
use flight_deals_backend::services::deal_store::InMemoryDealStore;
use flight_deals_backend::services::job_scheduler_service::{JobContext, JobResult};
use flight_deals_backend::services::price_history_store::{HistoryConfig, PriceHistoryStore};
use flight_deals_backend::services::quota_tracker::{InMemoryQuotaStore, QuotaTracker};
use flight_deals_backend::services::request_scheduler::{RequestScheduler, SchedulerConfig};
use flight_deals_backend::services::sample_store::InMemorySampleStore;
use flight_deals_backend::state::AppState;
use flight_deals_backend::jobs::{cleanup_job, deal_scan_job};

/// Answers every search from a fixed quote table, failing for listed origins.
struct TableProvider {
    quotes: Vec<FlightQuote>,
    failing_origins: Vec<String>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl TableProvider {
    fn new(quotes: Vec<FlightQuote>, failing_origins: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            quotes,
            failing_origins: failing_origins.iter().map(|o| o.to_string()).collect(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FlightSearchProvider for TableProvider {
    async fn search_prices(
        &self,
        origin: &str,
        destination: Option<&str>,
        dates: DateRange,
    ) -> Result<Vec<FlightQuote>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((origin.to_string(), destination.map(str::to_string)));

        if self.failing_origins.iter().any(|o| o == origin) {
            return Err(SearchError::Server {
                status: 503,
                message: "unavailable".into(),
            });
        }

        Ok(self
            .quotes
            .iter()
            .filter(|q| q.origin == origin)
            .filter(|q| destination.map_or(true, |d| q.destination == d))
            .filter(|q| dates.contains(q.departure_date))
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "table"
    }
}

fn departure() -> NaiveDate {
    Utc::now().date_naive() + Duration::days(45)
}

fn dates() -> DateRange {
    DateRange::starting(departure() - Duration::days(3), 7)
}

fn quote(origin: &str, destination: &str, price: f64) -> FlightQuote {
    FlightQuote {
        origin: origin.into(),
        destination: destination.into(),
        destination_name: format!("{} city", destination),
        price,
        currency: "GBP".into(),
        departure_date: departure(),
        return_date: None,
        airline: "Test Air".into(),
        deep_link: format!("https://book/{}-{}", origin, destination),
    }
}

fn build_service(provider: Arc<TableProvider>, free_signals: u32) -> DealService {
    let scheduler = RequestScheduler::start(
        provider,
        SchedulerConfig {
            requests_per_second: 1_000,
            max_retries: 1,
            base_delay: StdDuration::from_millis(5),
        },
    );
    DealService::new(DealServiceParts {
        history: PriceHistoryStore::new(HistoryConfig::default()),
        evaluator: DealEvaluator::new(EvaluatorConfig::default()),
        scheduler,
        cache: DealCache::new(Duration::minutes(15)),
        quota: QuotaTracker::new(Arc::new(InMemoryQuotaStore::new()), free_signals, None),
        deals: Arc::new(InMemoryDealStore::new()),
        samples: Arc::new(InMemorySampleStore::new()),
        config: DealServiceConfig::default(),
    })
}

async fn seed(service: &DealService, origin: &str, destination: &str, prices: &[f64]) {
    for price in prices {
        service
            .record_observed_price(origin, destination, *price, departure(), "GBP")
            .await
            .unwrap();
    }
}

fn tracked(alert_id: &str, origin: &str, destination: &str) -> TrackedRoute {
    TrackedRoute {
        alert_id: alert_id.into(),
        route: RouteKey::new(origin, destination).unwrap(),
    }
}

#[tokio::test]
async fn test_deal_is_found_and_listed_from_origin() {
    let provider = TableProvider::new(vec![quote("LHR", "JFK", 180.0)], &[]);
    let service = build_service(provider, 3);
    seed(&service, "LHR", "JFK", &[250.0, 250.0, 250.0]).await;

    let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
    assert_eq!(deals.len(), 1);
    let deal = &deals[0];
    assert_eq!(deal.discount_percent, 28);
    assert_eq!(deal.average_price_at_evaluation, 250.0);
    assert!(!deal.is_last_minute);
    assert_eq!(deal.expires_at - deal.created_at, Duration::hours(24));

    let listing = service.find_deals_from_origin("lhr", 5).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].id, deal.id);
}

#[tokio::test]
async fn test_repeated_cheap_quotes_lower_the_baseline() {
    let provider = TableProvider::new(vec![quote("LHR", "CDG", 60.0)], &[]);
    let service = build_service(provider, 3);
    seed(&service, "LHR", "CDG", &[100.0, 100.0, 100.0]).await;

    service.find_deals_for_route("LHR", "CDG", dates()).await.unwrap();

    let history = service.route_history("LHR", "CDG").unwrap().unwrap();
    assert_eq!(history.count, 4);
    assert_eq!(history.min, 60.0);
    assert_eq!(history.average, 90.0);
}

#[tokio::test]
async fn test_scan_job_batches_by_origin_and_isolates_failures() {
    let provider = TableProvider::new(
        vec![quote("LHR", "JFK", 100.0), quote("LHR", "CDG", 99.0), quote("MAN", "BCN", 40.0)],
        &["MAN"],
    );
    let service = build_service(provider.clone(), 3);
    seed(&service, "LHR", "JFK", &[200.0, 200.0, 200.0]).await;
    seed(&service, "LHR", "CDG", &[100.0, 100.0, 100.0]).await;

    let ctx = JobContext {
        deal_service: service.clone(),
        tracked_routes: Arc::new(vec![
            tracked("nyc", "LHR", "JFK"),
            tracked("paris", "LHR", "CDG"),
            tracked("spain", "MAN", "BCN"),
        ]),
        batch_concurrency: 2,
        scan_horizon_days: 60,
    };

    let result = deal_scan_job::scan_tracked_routes(ctx).await.unwrap();
    assert_eq!(result, JobResult { items_processed: 2, items_failed: 1 });

    // One "anywhere" search for LHR; MAN is tried once plus one retry
    let seen = provider.seen.lock().unwrap().clone();
    let lhr_calls: Vec<_> = seen.iter().filter(|(o, _)| o == "LHR").collect();
    assert_eq!(lhr_calls.len(), 1);
    assert_eq!(lhr_calls[0].1, None);
    assert_eq!(seen.iter().filter(|(o, _)| o == "MAN").count(), 2);

    let listing = service.find_deals_from_origin("LHR", 10).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].route.destination(), "JFK");
    assert_eq!(listing[0].discount_percent, 50);
}

#[tokio::test]
async fn test_cleanup_job_runs_on_empty_service() {
    let service = build_service(TableProvider::new(vec![], &[]), 3);
    let ctx = JobContext {
        deal_service: service,
        tracked_routes: Arc::new(Vec::new()),
        batch_concurrency: 1,
        scan_horizon_days: 30,
    };
    let result = cleanup_job::cleanup_expired(ctx).await.unwrap();
    assert_eq!(result.items_failed, 0);
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_http_signal_flow_respects_quota() {
    let provider = TableProvider::new(vec![quote("LHR", "JFK", 100.0)], &[]);
    let service = build_service(provider.clone(), 1);
    let app = create_app(AppState {
        deal_service: service,
        search_window_days: 60,
    });

    let (status, body) = send(app.clone(), Request::get("/api/quota/alice").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 1);

    let search = json!({ "identity": "alice", "origin": "LHR", "destination": "JFK" });
    let (status, body) = send(app.clone(), json_request("POST", "/api/signals", search.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deals");
    assert_eq!(body["remaining"], 0);

    let (status, body) = send(app.clone(), json_request("POST", "/api/signals", search)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["status"], "quota_exceeded");
    assert_eq!(body["limit"], 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let consume = || Request::post("/api/quota/bob/consume").body(Body::empty()).unwrap();
    let (status, body) = send(app.clone(), consume()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consumed"], 1);
    let (_, body) = send(app, consume()).await;
    assert_eq!(body["consumed"], 1);
}

#[tokio::test]
async fn test_http_record_price_and_validation() {
    let service = build_service(TableProvider::new(vec![], &[]), 3);
    let app = create_app(AppState {
        deal_service: service,
        search_window_days: 60,
    });

    let record = json!({
        "origin": "lhr",
        "destination": "jfk",
        "price": 321.5,
        "departure_date": departure().to_string(),
    });
    let (status, body) = send(app.clone(), json_request("POST", "/api/prices", record)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["count"], 1);

    let bad = json!({
        "origin": "LHR",
        "destination": "JFK",
        "price": -5.0,
        "departure_date": departure().to_string(),
    });
    let (status, _) = send(app.clone(), json_request("POST", "/api/prices", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(app.clone(), Request::get("/api/prices/LHR/JFK").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max"], 321.5);

    let (status, _) = send(app, Request::get("/api/deals/route/LHR/LHR").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
