use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::models::{PriceSample, RouteKey};

#[derive(Debug, FromRow)]
struct SampleRow {
    price: f64,
    observed_at: DateTime<Utc>,
}

pub async fn insert_sample(
    pool: &PgPool,
    route: &RouteKey,
    sample: &PriceSample,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO price_samples (origin, destination, price, observed_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT DO NOTHING",
    )
    .bind(route.origin())
    .bind(route.destination())
    .bind(sample.price)
    .bind(sample.observed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Samples for a route observed at or after `since`, oldest first.
pub async fn fetch_samples_since(
    pool: &PgPool,
    route: &RouteKey,
    since: DateTime<Utc>,
) -> Result<Vec<PriceSample>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SampleRow>(
        "SELECT price, observed_at FROM price_samples
         WHERE origin = $1 AND destination = $2 AND observed_at >= $3
         ORDER BY observed_at ASC",
    )
    .bind(route.origin())
    .bind(route.destination())
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| PriceSample {
            price: row.price,
            observed_at: row.observed_at,
        })
        .collect())
}

pub async fn delete_samples_before(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM price_samples WHERE observed_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
