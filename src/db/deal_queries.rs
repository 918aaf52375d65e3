use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{DealRecord, RouteKey};

const DEAL_COLUMNS: &str = "id, origin, destination, destination_name, price, currency, \
     discount_percent, average_price_at_evaluation, is_last_minute, provisional, confidence, \
     deep_link, departure_date, created_at, expires_at";

#[derive(Debug, FromRow)]
pub struct DealRow {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
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

impl TryFrom<DealRow> for DealRecord {
    type Error = StoreError;

    fn try_from(row: DealRow) -> Result<Self, Self::Error> {
        let route = RouteKey::new(&row.origin, &row.destination)
            .map_err(|e| StoreError::Corrupt(format!("deal {}: {}", row.id, e)))?;
        Ok(DealRecord {
            id: row.id,
            route,
            destination_name: row.destination_name,
            price: row.price,
            currency: row.currency,
            discount_percent: row.discount_percent,
            average_price_at_evaluation: row.average_price_at_evaluation,
            is_last_minute: row.is_last_minute,
            provisional: row.provisional,
            confidence: row.confidence,
            deep_link: row.deep_link,
            departure_date: row.departure_date,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn into_records(rows: Vec<DealRow>) -> Result<Vec<DealRecord>, StoreError> {
    rows.into_iter().map(DealRecord::try_from).collect()
}

/// Insert a deal. Returns false when a deal with the same id already exists.
pub async fn insert_deal(pool: &PgPool, deal: &DealRecord) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO deals (
            id, origin, destination, destination_name, price, currency,
            discount_percent, average_price_at_evaluation, is_last_minute, provisional,
            confidence, deep_link, departure_date, created_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(deal.id)
    .bind(deal.route.origin())
    .bind(deal.route.destination())
    .bind(&deal.destination_name)
    .bind(deal.price)
    .bind(&deal.currency)
    .bind(deal.discount_percent)
    .bind(deal.average_price_at_evaluation)
    .bind(deal.is_last_minute)
    .bind(deal.provisional)
    .bind(deal.confidence)
    .bind(&deal.deep_link)
    .bind(deal.departure_date)
    .bind(deal.created_at)
    .bind(deal.expires_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Unexpired deals for one route, newest first.
pub async fn fetch_active_for_route(
    pool: &PgPool,
    route: &RouteKey,
    now: DateTime<Utc>,
) -> Result<Vec<DealRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM deals
         WHERE origin = $1 AND destination = $2 AND expires_at >= $3
         ORDER BY created_at DESC",
        DEAL_COLUMNS
    );
    let rows = sqlx::query_as::<_, DealRow>(&sql)
        .bind(route.origin())
        .bind(route.destination())
        .bind(now)
        .fetch_all(pool)
        .await?;

    into_records(rows)
}

/// Newest unexpired deal per destination for an origin, best discount first.
pub async fn fetch_active_from_origin(
    pool: &PgPool,
    origin: &str,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<DealRecord>, StoreError> {
    let sql = format!(
        "SELECT * FROM (
             SELECT DISTINCT ON (destination) {}
             FROM deals
             WHERE origin = $1 AND expires_at >= $2
             ORDER BY destination, created_at DESC
         ) latest
         ORDER BY discount_percent DESC, price ASC
         LIMIT $3",
        DEAL_COLUMNS
    );
    let rows = sqlx::query_as::<_, DealRow>(&sql)
        .bind(origin)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    into_records(rows)
}

pub async fn delete_expired(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM deals WHERE expires_at < $1")
        .bind(before)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
