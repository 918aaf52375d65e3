//! Live-pricing upstream adapter.
//!
//! The upstream works in two steps: a search session is created, then polled
//! until the provider reports its results complete. Responses use a
//! normalized-graph shape (itineraries referencing legs, legs referencing
//! places and carriers). Everything in this module stops at the
//! [`FlightQuote`] boundary; nothing past it sees the raw shape.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::external::flight_search::{DateRange, FlightQuote, FlightSearchProvider, SearchError};

const STATUS_COMPLETE: &str = "RESULT_STATUS_COMPLETE";

// ==============================================================================
// Raw upstream schema
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LiveQuery {
    pub origin: String,
    /// `None` means "anywhere".
    pub destination: Option<String>,
    pub outbound_from: NaiveDate,
    pub outbound_to: NaiveDate,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePricesResponse {
    pub session_token: String,
    pub status: String,
    #[serde(default)]
    pub content: LiveContent,
}

impl LivePricesResponse {
    pub fn is_complete(&self) -> bool {
        self.status == STATUS_COMPLETE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveContent {
    #[serde(default)]
    pub results: LiveResults,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveResults {
    #[serde(default)]
    pub itineraries: HashMap<String, RawItinerary>,
    #[serde(default)]
    pub legs: HashMap<String, RawLeg>,
    #[serde(default)]
    pub places: HashMap<String, RawPlace>,
    #[serde(default)]
    pub carriers: HashMap<String, RawCarrier>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItinerary {
    #[serde(default)]
    pub leg_ids: Vec<String>,
    #[serde(default)]
    pub pricing_options: Vec<RawPricingOption>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPricingOption {
    pub price: RawPrice,
    #[serde(default)]
    pub deep_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPrice {
    /// Decimal amount as a string, e.g. `"129.99"`.
    pub amount: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLeg {
    pub origin_place_id: String,
    pub destination_place_id: String,
    pub departure_date_time: RawDate,
    #[serde(default)]
    pub marketing_carrier_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RawDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl RawDate {
    fn to_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPlace {
    pub iata: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawCarrier {
    pub name: String,
}

// ==============================================================================
// Normalization
// ==============================================================================

/// Flatten a response into quotes, cheapest pricing option per itinerary.
/// Itineraries with dangling references or unusable prices are skipped.
pub fn normalize_results(results: &LiveResults, default_currency: &str) -> Vec<FlightQuote> {
    let mut quotes: Vec<FlightQuote> = results
        .itineraries
        .iter()
        .filter_map(|(id, itinerary)| {
            let quote = normalize_itinerary(results, itinerary, default_currency);
            if quote.is_none() {
                debug!("Skipping malformed itinerary {}", id);
            }
            quote
        })
        .collect();

    quotes.sort_by(|a, b| a.price.total_cmp(&b.price));
    quotes
}

fn normalize_itinerary(
    results: &LiveResults,
    itinerary: &RawItinerary,
    default_currency: &str,
) -> Option<FlightQuote> {
    let outbound = results.legs.get(itinerary.leg_ids.first()?)?;
    let inbound = itinerary
        .leg_ids
        .get(1)
        .and_then(|leg_id| results.legs.get(leg_id));

    let (price, option) = itinerary
        .pricing_options
        .iter()
        .filter_map(|option| {
            let amount = option.price.amount.as_deref()?.trim().parse::<f64>().ok()?;
            (amount.is_finite() && amount > 0.0).then_some((amount, option))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))?;

    let origin = results.places.get(&outbound.origin_place_id)?;
    let destination = results.places.get(&outbound.destination_place_id)?;
    let airline = outbound
        .marketing_carrier_ids
        .first()
        .and_then(|id| results.carriers.get(id))
        .map(|c| c.name.clone())
        .unwrap_or_default();

    Some(FlightQuote {
        origin: origin.iata.clone()?.to_ascii_uppercase(),
        destination: destination.iata.clone()?.to_ascii_uppercase(),
        destination_name: destination.name.clone(),
        price,
        currency: option
            .price
            .currency
            .clone()
            .unwrap_or_else(|| default_currency.to_string()),
        departure_date: outbound.departure_date_time.to_date()?,
        return_date: inbound.and_then(|leg| leg.departure_date_time.to_date()),
        airline,
        deep_link: option.deep_link.clone().unwrap_or_default(),
    })
}

// ==============================================================================
// Polling state machine
// ==============================================================================

#[async_trait]
pub trait LivePricingApi: Send + Sync {
    async fn create_session(&self, query: &LiveQuery) -> Result<LivePricesResponse, SearchError>;

    async fn poll_session(&self, session_token: &str) -> Result<LivePricesResponse, SearchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Created(LivePricesResponse),
    Polling { session_token: String, attempt: u32 },
    Complete(LivePricesResponse),
    TimedOut { polls: u32, last: Option<LivePricesResponse> },
}

/// Drives a search session from creation to completion with a bounded
/// number of polls.
pub struct PollingSearch<'a> {
    api: &'a dyn LivePricingApi,
    max_polls: u32,
    poll_interval: Duration,
}

impl<'a> PollingSearch<'a> {
    pub fn new(api: &'a dyn LivePricingApi, max_polls: u32, poll_interval: Duration) -> Self {
        Self {
            api,
            max_polls,
            poll_interval,
        }
    }

    /// Run to a terminal state: `Complete` or `TimedOut`.
    pub async fn run(&self, query: &LiveQuery) -> Result<PollState, SearchError> {
        let mut state = PollState::Created(self.api.create_session(query).await?);
        let mut last: Option<LivePricesResponse> = None;

        loop {
            state = match state {
                PollState::Created(response) => {
                    if response.is_complete() {
                        PollState::Complete(response)
                    } else {
                        let session_token = response.session_token.clone();
                        last = Some(response);
                        PollState::Polling {
                            session_token,
                            attempt: 0,
                        }
                    }
                }
                PollState::Polling {
                    session_token,
                    attempt,
                } => {
                    if attempt >= self.max_polls {
                        PollState::TimedOut {
                            polls: attempt,
                            last: last.take(),
                        }
                    } else {
                        tokio::time::sleep(self.poll_interval).await;
                        let response = self.api.poll_session(&session_token).await?;
                        if response.is_complete() {
                            PollState::Complete(response)
                        } else {
                            last = Some(response);
                            PollState::Polling {
                                session_token,
                                attempt: attempt + 1,
                            }
                        }
                    }
                }
                terminal @ (PollState::Complete(_) | PollState::TimedOut { .. }) => {
                    return Ok(terminal)
                }
            };
        }
    }
}

// ==============================================================================
// HTTP client
// ==============================================================================

pub struct HttpLivePricingApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLivePricingApi {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| SearchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, SearchError> {
        let base_url = std::env::var("SEARCH_API_URL")
            .map_err(|_| SearchError::Config("SEARCH_API_URL not set".into()))?;
        let api_key = std::env::var("SEARCH_API_KEY")
            .map_err(|_| SearchError::Config("SEARCH_API_KEY not set".into()))?;
        Self::new(&base_url, &api_key)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<LivePricesResponse, SearchError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::from_status(status.as_u16(), text));
        }

        resp.json::<LivePricesResponse>()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))
    }
}

#[async_trait]
impl LivePricingApi for HttpLivePricingApi {
    async fn create_session(&self, query: &LiveQuery) -> Result<LivePricesResponse, SearchError> {
        self.post("/search/create", query).await
    }

    async fn poll_session(&self, session_token: &str) -> Result<LivePricesResponse, SearchError> {
        self.post(&format!("/search/poll/{}", session_token), &serde_json::json!({}))
            .await
    }
}

/// [`FlightSearchProvider`] backed by a live-pricing API.
pub struct LivePricingProvider {
    api: Box<dyn LivePricingApi>,
    currency: String,
    max_polls: u32,
    poll_interval: Duration,
}

impl LivePricingProvider {
    pub fn new(api: Box<dyn LivePricingApi>, currency: &str) -> Self {
        Self {
            api,
            currency: currency.to_string(),
            max_polls: 10,
            poll_interval: Duration::from_millis(1500),
        }
    }

    pub fn with_polling(mut self, max_polls: u32, poll_interval: Duration) -> Self {
        self.max_polls = max_polls;
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl FlightSearchProvider for LivePricingProvider {
    async fn search_prices(
        &self,
        origin: &str,
        destination: Option<&str>,
        dates: DateRange,
    ) -> Result<Vec<FlightQuote>, SearchError> {
        let query = LiveQuery {
            origin: origin.to_string(),
            destination: destination.map(str::to_string),
            outbound_from: dates.start,
            outbound_to: dates.end,
            currency: self.currency.clone(),
        };

        let results = match PollingSearch::new(self.api.as_ref(), self.max_polls, self.poll_interval)
            .run(&query)
            .await?
        {
            PollState::Complete(response) => response.content.results,
            PollState::TimedOut { polls, last: Some(partial) } => {
                warn!(
                    "Live pricing for {} did not complete after {} polls, using partial results",
                    origin, polls
                );
                partial.content.results
            }
            PollState::TimedOut { polls, last: None } => {
                return Err(SearchError::TimedOut { polls });
            }
            other => {
                return Err(SearchError::Parse(format!("unexpected poll state {:?}", other)));
            }
        };

        let quotes: Vec<FlightQuote> = normalize_results(&results, &self.currency)
            .into_iter()
            .filter(|q| dates.contains(q.departure_date))
            .filter(|q| destination.map_or(true, |d| q.destination.eq_ignore_ascii_case(d)))
            .collect();

        info!(
            "✓ Live pricing returned {} quotes for {} -> {}",
            quotes.len(),
            origin,
            destination.unwrap_or("anywhere")
        );
        Ok(quotes)
    }

    fn name(&self) -> &'static str {
        "live_pricing"
    }
}
