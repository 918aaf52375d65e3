use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use tracing::info;

use crate::external::flight_search::{DateRange, FlightQuote, FlightSearchProvider, SearchError};

/// Random-walk fares for local development when no upstream is configured.
pub struct MockFlightProvider {
    destinations: Vec<(String, String)>,
    base_price: f64,
    currency: String,
}

impl MockFlightProvider {
    pub fn new(currency: &str) -> Self {
        let destinations = [
            ("BCN", "Barcelona"),
            ("CDG", "Paris Charles de Gaulle"),
            ("FCO", "Rome Fiumicino"),
            ("JFK", "New York John F. Kennedy"),
            ("LIS", "Lisbon"),
            ("AMS", "Amsterdam Schiphol"),
        ]
        .iter()
        .map(|(code, name)| (code.to_string(), name.to_string()))
        .collect();

        Self {
            destinations,
            base_price: 180.0,
            currency: currency.to_string(),
        }
    }
}

#[async_trait]
impl FlightSearchProvider for MockFlightProvider {
    async fn search_prices(
        &self,
        origin: &str,
        destination: Option<&str>,
        dates: DateRange,
    ) -> Result<Vec<FlightQuote>, SearchError> {
        let mut rng = rand::rng();
        let mut quotes = Vec::new();

        let targets: Vec<(String, String)> = match destination {
            Some(code) => vec![self
                .destinations
                .iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(code))
                .cloned()
                .unwrap_or_else(|| (code.to_ascii_uppercase(), code.to_ascii_uppercase()))],
            None => self.destinations.clone(),
        };

        for (code, name) in targets {
            if code.eq_ignore_ascii_case(origin) {
                continue;
            }
            let mut current = self.base_price;
            let mut day = dates.start;
            while day <= dates.end {
                current *= 1.0 + (rng.random::<f64>() - 0.5) * 0.2;
                current = current.max(20.0);
                quotes.push(FlightQuote {
                    origin: origin.to_ascii_uppercase(),
                    destination: code.clone(),
                    destination_name: name.clone(),
                    price: (current * 100.0).round() / 100.0,
                    currency: self.currency.clone(),
                    departure_date: day,
                    return_date: Some(day + Duration::days(7)),
                    airline: "Mock Air".to_string(),
                    deep_link: format!("https://example.invalid/book/{}-{}/{}", origin, code, day),
                });
                day += Duration::days(rng.random_range(3..8));
            }
        }

        info!("Generated {} mock quotes from {}", quotes.len(), origin);
        Ok(quotes)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
