use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::external::flight_search::FlightQuote;
use crate::models::{DealRecord, DealVerdict, EvaluationMode, NotDealReason, RouteHistory, RouteKey};

const BASE_TTL_HOURS: i64 = 24;
const DEEP_DISCOUNT_TTL_HOURS: i64 = 72;
const GOOD_DISCOUNT_TTL_HOURS: i64 = 48;
const LAST_MINUTE_TTL_CAP_HOURS: i64 = 36;
const DEEP_DISCOUNT_PERCENT: i64 = 40;
const GOOD_DISCOUNT_PERCENT: i64 = 30;
const MAX_CONFIDENCE: f64 = 0.99;
// Float error allowance when comparing a discount against a threshold
const DISCOUNT_EPSILON: f64 = 1e-9;

/// Thresholds for one calling mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DealThresholds {
    pub min_discount_percent: f64,
    /// Departures this many days out or fewer count as last-minute.
    pub last_minute_days: i64,
    pub last_minute_min_discount_percent: f64,
}

impl DealThresholds {
    pub fn interactive() -> Self {
        Self {
            min_discount_percent: 20.0,
            last_minute_days: 7,
            last_minute_min_discount_percent: 15.0,
        }
    }

    pub fn batch() -> Self {
        Self {
            min_discount_percent: 20.0,
            last_minute_days: 14,
            last_minute_min_discount_percent: 40.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub interactive: DealThresholds,
    pub batch: DealThresholds,
    pub min_history_entries: usize,
    /// Last-minute prices below this are surfaced even without history.
    pub provisional_price_floor: f64,
    pub provisional_discount_percent: i64,
    pub provisional_average_multiplier: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interactive: DealThresholds::interactive(),
            batch: DealThresholds::batch(),
            min_history_entries: 3,
            provisional_price_floor: 150.0,
            provisional_discount_percent: 20,
            provisional_average_multiplier: 1.25,
        }
    }
}

/// Decides whether a quoted price is a deal against a route's baseline.
pub struct DealEvaluator {
    config: EvaluatorConfig,
}

impl DealEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn thresholds_for(&self, mode: EvaluationMode) -> &DealThresholds {
        match mode {
            EvaluationMode::Batch => &self.config.batch,
            EvaluationMode::Interactive | EvaluationMode::LastMinute => &self.config.interactive,
        }
    }

    pub fn evaluate(
        &self,
        route: &RouteKey,
        quote: &FlightQuote,
        history: Option<&RouteHistory>,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> DealVerdict {
        let thresholds = self.thresholds_for(mode);

        let days_until_departure = (quote.departure_date - now.date_naive()).num_days();
        if days_until_departure < 0 {
            return DealVerdict::NotADeal {
                reason: NotDealReason::DepartureInPast,
                discount_percent: None,
            };
        }
        let is_last_minute = days_until_departure <= thresholds.last_minute_days;

        let sample_count = history.map_or(0, |h| h.count);
        let Some(history) = history.filter(|h| h.count >= self.config.min_history_entries) else {
            if mode == EvaluationMode::LastMinute && quote.price < self.config.provisional_price_floor {
                let discount = self.config.provisional_discount_percent;
                return DealVerdict::Deal(build_record(
                    route,
                    quote,
                    Scoring {
                        discount_percent: discount,
                        average: quote.price * self.config.provisional_average_multiplier,
                        is_last_minute: true,
                        provisional: true,
                        confidence: confidence(sample_count, discount),
                    },
                    now,
                ));
            }
            return DealVerdict::NotADeal {
                reason: NotDealReason::InsufficientHistory,
                discount_percent: None,
            };
        };

        let average = history.average;
        if !average.is_finite() || average <= 0.0 {
            return DealVerdict::NotADeal {
                reason: NotDealReason::InvalidBaseline,
                discount_percent: None,
            };
        }

        let raw_discount = (average - quote.price) / average * 100.0;
        let discount_percent = raw_discount.round() as i64;

        let qualifies = meets(raw_discount, thresholds.min_discount_percent)
            || (is_last_minute && meets(raw_discount, thresholds.last_minute_min_discount_percent));

        if !qualifies {
            return DealVerdict::NotADeal {
                reason: NotDealReason::PriceNotLowEnough,
                discount_percent: Some(discount_percent),
            };
        }

        DealVerdict::Deal(build_record(
            route,
            quote,
            Scoring {
                discount_percent,
                average,
                is_last_minute,
                provisional: false,
                confidence: confidence(history.count, discount_percent),
            },
            now,
        ))
    }
}

struct Scoring {
    discount_percent: i64,
    average: f64,
    is_last_minute: bool,
    provisional: bool,
    confidence: f64,
}

fn meets(discount: f64, threshold: f64) -> bool {
    discount + DISCOUNT_EPSILON >= threshold
}

fn confidence(sample_count: usize, discount_percent: i64) -> f64 {
    let score = 0.5
        + (sample_count as f64 / 20.0) * 0.25
        + (discount_percent as f64 / 100.0) * 0.25;
    score.clamp(0.0, MAX_CONFIDENCE)
}

/// Hours a deal stays eligible.
pub fn deal_ttl_hours(discount_percent: i64, is_last_minute: bool) -> i64 {
    let hours = if discount_percent >= DEEP_DISCOUNT_PERCENT {
        DEEP_DISCOUNT_TTL_HOURS
    } else if discount_percent >= GOOD_DISCOUNT_PERCENT {
        GOOD_DISCOUNT_TTL_HOURS
    } else {
        BASE_TTL_HOURS
    };

    if is_last_minute {
        hours.min(LAST_MINUTE_TTL_CAP_HOURS)
    } else {
        hours
    }
}

fn build_record(route: &RouteKey, quote: &FlightQuote, scoring: Scoring, now: DateTime<Utc>) -> DealRecord {
    DealRecord {
        id: DealRecord::derive_id(route, quote.price, quote.departure_date, &quote.deep_link, now),
        route: route.clone(),
        destination_name: quote.destination_name.clone(),
        price: quote.price,
        currency: quote.currency.clone(),
        discount_percent: scoring.discount_percent,
        average_price_at_evaluation: scoring.average,
        is_last_minute: scoring.is_last_minute,
        provisional: scoring.provisional,
        confidence: scoring.confidence,
        deep_link: quote.deep_link.clone(),
        departure_date: quote.departure_date,
        created_at: now,
        expires_at: now + Duration::hours(deal_ttl_hours(scoring.discount_percent, scoring.is_last_minute)),
    }
}
