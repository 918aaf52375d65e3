use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive departure-date window for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if end < start {
            return Err(format!("Date range end {} is before start {}", end, start));
        }
        Ok(Self { start, end })
    }

    /// `days` days starting at `from`.
    pub fn starting(from: NaiveDate, days: u32) -> Self {
        let end = from + chrono::Duration::days(days.saturating_sub(1) as i64);
        Self { start: from, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// One priced itinerary, already normalized from the upstream schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightQuote {
    pub origin: String,
    pub destination: String,
    pub destination_name: String,
    pub price: f64,
    pub currency: String,
    pub departure_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub airline: String,
    pub deep_link: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    #[error("rate limited by upstream")]
    RateLimited,

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("upstream rejected request ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("search timed out after {polls} polls")]
    TimedOut { polls: u32 },

    #[error("provider misconfigured: {0}")]
    Config(String),

    #[error("request scheduler is not running")]
    SchedulerClosed,
}

impl SearchError {
    /// Classify an HTTP status from the upstream.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => SearchError::RateLimited,
            s if s >= 500 => SearchError::Server {
                status: s,
                message: message.into(),
            },
            s => SearchError::Client {
                status: s,
                message: message.into(),
            },
        }
    }

    /// Only 429 and 5xx responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::RateLimited | SearchError::Server { .. })
    }
}

/// Upstream flight price search. `destination: None` asks for every
/// destination reachable from `origin`.
#[async_trait]
pub trait FlightSearchProvider: Send + Sync {
    async fn search_prices(
        &self,
        origin: &str,
        destination: Option<&str>,
        dates: DateRange,
    ) -> Result<Vec<FlightQuote>, SearchError>;

    fn name(&self) -> &'static str;
}
