use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};

use super::db::Db;

/// Source tag written with every row so mixed-origin tables stay auditable.
pub const NAV_SOURCE: &str = "api.mfapi.in";

/// One normalized NAV observation, keyed by (scheme_id, date).
#[derive(Debug, Clone)]
pub struct NavRow {
    pub scheme_id: String,
    pub date: NaiveDate,
    pub nav: BigDecimal,
    pub aum: Option<BigDecimal>,
    pub scheme_name: Option<String>,
    pub category: Option<String>,
    pub source: &'static str,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl Db {
    /// Atomic keyed upsert. Concurrent writers racing on the same
    /// (scheme_id, date) key both land on this single statement, so no
    /// fallback path exists. Optional fields coalesce against the stored
    /// row: a sparse later fetch never erases captured metadata.
    pub async fn upsert_nav(&self, row: &NavRow) -> Result<UpsertOutcome> {
        let created: bool = sqlx::query_scalar(
            "INSERT INTO fund_navs (scheme_id, date, nav, aum, scheme_name, category, source, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (scheme_id, date) DO UPDATE
             SET nav = EXCLUDED.nav,
                 aum = COALESCE(EXCLUDED.aum, fund_navs.aum),
                 scheme_name = COALESCE(EXCLUDED.scheme_name, fund_navs.scheme_name),
                 category = COALESCE(EXCLUDED.category, fund_navs.category),
                 source = EXCLUDED.source,
                 updated_at = EXCLUDED.updated_at
             RETURNING (xmax = 0) AS created",
        )
        .persistent(false)
        .bind(&row.scheme_id)
        .bind(row.date)
        .bind(&row.nav)
        .bind(&row.aum)
        .bind(&row.scheme_name)
        .bind(&row.category)
        .bind(row.source)
        .bind(row.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(if created {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    /// Row count for one scheme, optionally bounded to a single date.
    pub async fn count_navs(&self, scheme_id: &str, date: Option<NaiveDate>) -> Result<i64> {
        let count: i64 = match date {
            Some(d) => {
                sqlx::query_scalar(
                    "SELECT count(*) FROM fund_navs WHERE scheme_id = $1 AND date = $2",
                )
                .persistent(false)
                .bind(scheme_id)
                .bind(d)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT count(*) FROM fund_navs WHERE scheme_id = $1")
                    .persistent(false)
                    .bind(scheme_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}
