use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::RouteKey;
use crate::errors::AppError;

/// One observed price for a route, as reported by a search or a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub route: RouteKey,
    pub price: f64,
    pub currency: String,
    pub observed_at: DateTime<Utc>,
    pub departure_date: NaiveDate,
}

impl PriceObservation {
    pub fn new(
        route: RouteKey,
        price: f64,
        currency: &str,
        departure_date: NaiveDate,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        validate_price(price)?;
        Ok(Self {
            route,
            price,
            currency: currency.trim().to_ascii_uppercase(),
            observed_at,
            departure_date,
        })
    }
}

pub fn validate_price(price: f64) -> Result<(), AppError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(AppError::Validation(format!(
            "Price must be a positive amount, got {}",
            price
        )));
    }
    Ok(())
}

/// Request body for recording an observed price.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPriceRequest {
    pub origin: String,
    pub destination: String,
    pub price: f64,
    pub currency: Option<String>,
    pub departure_date: NaiveDate,
}
