use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
pub struct QuotaRow {
    pub identity_id: String,
    pub period_start: DateTime<Utc>,
    pub count: i32,
}

pub async fn fetch_quota(pool: &PgPool, identity_id: &str) -> Result<Option<QuotaRow>, sqlx::Error> {
    sqlx::query_as::<_, QuotaRow>(
        "SELECT identity_id, period_start, count FROM quota_usage WHERE identity_id = $1",
    )
    .bind(identity_id)
    .fetch_optional(pool)
    .await
}

/// Count one use in a single statement. The count saturates at `limit`;
/// a period that began before `reset_before` is restarted at `now`.
pub async fn increment_quota(
    pool: &PgPool,
    identity_id: &str,
    limit: i32,
    now: DateTime<Utc>,
    reset_before: Option<DateTime<Utc>>,
) -> Result<QuotaRow, sqlx::Error> {
    sqlx::query_as::<_, QuotaRow>(
        r#"
        INSERT INTO quota_usage (identity_id, period_start, count)
        VALUES ($1, $2, LEAST(1, $3))
        ON CONFLICT (identity_id) DO UPDATE SET
            period_start = CASE
                WHEN $4::timestamptz IS NOT NULL AND quota_usage.period_start < $4
                THEN EXCLUDED.period_start
                ELSE quota_usage.period_start
            END,
            count = CASE
                WHEN $4::timestamptz IS NOT NULL AND quota_usage.period_start < $4
                THEN LEAST(1, $3)
                ELSE LEAST(quota_usage.count + 1, $3)
            END
        RETURNING identity_id, period_start, count
        "#,
    )
    .bind(identity_id)
    .bind(now)
    .bind(limit)
    .bind(reset_before)
    .fetch_one(pool)
    .await
}
