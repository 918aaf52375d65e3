use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RouteKey;

/// Namespace for deterministic deal ids.
const DEAL_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5d, 0x0e, 0x7a, 0x51, 0x2c, 0x41, 0x4f, 0x8b, 0x9a, 0x63, 0x1f, 0x0c, 0x44, 0xd2, 0x7e, 0x19,
]);

/// Which caller is asking. The two scoring profiles (interactive and batch)
/// carry different last-minute thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Interactive,
    Batch,
    /// Interactive thresholds plus the provisional low-price branch.
    LastMinute,
}

/// A surfaced deal. Never mutated once created; a newer record for the same
/// route supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: Uuid,
    pub route: RouteKey,
    pub destination_name: String,
    pub price: f64,
    pub currency: String,
    pub discount_percent: i64,
    pub average_price_at_evaluation: f64,
    pub is_last_minute: bool,
    pub provisional: bool,
    pub confidence: f64,
    pub deep_link: String,
    pub departure_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DealRecord {
    /// Id derived from the itinerary (route, price, departure, booking link)
    /// and creation time, so re-persisting the same evaluation is a no-op
    /// while same-priced itineraries from one search stay distinct.
    pub fn derive_id(
        route: &RouteKey,
        price: f64,
        departure_date: NaiveDate,
        deep_link: &str,
        created_at: DateTime<Utc>,
    ) -> Uuid {
        let name = format!(
            "{}|{}|{}|{}|{}",
            route,
            price,
            departure_date,
            deep_link,
            created_at.timestamp_millis()
        );
        Uuid::new_v5(&DEAL_ID_NAMESPACE, name.as_bytes())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotDealReason {
    InsufficientHistory,
    PriceNotLowEnough,
    InvalidBaseline,
    DepartureInPast,
}

impl NotDealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotDealReason::InsufficientHistory => "insufficient_history",
            NotDealReason::PriceNotLowEnough => "price_not_low_enough",
            NotDealReason::InvalidBaseline => "invalid_baseline",
            NotDealReason::DepartureInPast => "departure_in_past",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum DealVerdict {
    Deal(DealRecord),
    NotADeal {
        reason: NotDealReason,
        /// Computed discount, when a baseline existed.
        discount_percent: Option<i64>,
    },
}

impl DealVerdict {
    pub fn into_deal(self) -> Option<DealRecord> {
        match self {
            DealVerdict::Deal(deal) => Some(deal),
            DealVerdict::NotADeal { .. } => None,
        }
    }

    pub fn is_deal(&self) -> bool {
        matches!(self, DealVerdict::Deal(_))
    }
}
