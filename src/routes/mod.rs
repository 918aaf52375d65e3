pub mod deals;
pub mod health;
pub mod prices;
pub mod quota;
pub mod signals;

use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::external::flight_search::DateRange;

/// Optional `from`/`to` departure dates on search endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct DateQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateQuery {
    pub fn to_range(&self, default_days: u32) -> Result<DateRange, AppError> {
        let start = self.from.unwrap_or_else(|| Utc::now().date_naive());
        match self.to {
            Some(end) => Ok(DateRange::new(start, end)?),
            None => Ok(DateRange::starting(start, default_days)),
        }
    }
}
