//! Promotion source contracts + Postgres and fixture-file implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use promo_core::{normalize_date, CoreError, EntryType, PromotionRow, WindowOffsets};
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "promo-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connecting to promotions database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("querying promotions: {0}")]
    Query(#[source] sqlx::Error),
    #[error("promotion {id}: {source}")]
    Date {
        id: i64,
        #[source]
        source: CoreError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait PromotionSource: Send + Sync {
    fn describe(&self) -> String;

    /// Rows that may have a display window containing `today`. Implementations are free
    /// to over-return; callers re-check membership.
    async fn fetch_active(
        &self,
        offsets: &WindowOffsets,
        today: NaiveDate,
    ) -> Result<Vec<PromotionRow>, SourceError>;

    /// Release connections. Safe to call more than once.
    async fn close(&self) {}
}

/// A promotions table row before trimming, type parsing and date normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPromotionRow {
    pub id: i64,
    pub vendor: Option<String>,
    pub entry_type: Option<String>,
    pub date_of_start: Option<String>,
    pub date_of_end: Option<String>,
}

impl RawPromotionRow {
    /// `Ok(None)` for rows the sync ignores; `Err` only for unparseable dates.
    pub fn into_row(self, default_year: i32) -> Result<Option<PromotionRow>, SourceError> {
        let id = self.id;
        let vendor = non_blank(self.vendor);
        let entry_type = non_blank(self.entry_type);
        let start = non_blank(self.date_of_start);
        let (Some(vendor), Some(entry_type), Some(start)) = (vendor, entry_type, start) else {
            debug!(id, "skipping promotion with missing vendor, type or start");
            return Ok(None);
        };

        let entry_type = match EntryType::parse(&entry_type) {
            Ok(t) => t,
            Err(err) => {
                warn!(id, vendor = %vendor, error = %err, "skipping promotion");
                return Ok(None);
            }
        };

        let parse = |text: &str| {
            normalize_date(text, default_year).map_err(|source| SourceError::Date { id, source })
        };
        let start_date = parse(&start)?;
        let end_date = non_blank(self.date_of_end).map(|end| parse(&end)).transpose()?;

        if entry_type == EntryType::Sale && end_date.is_none() {
            warn!(id, vendor = %vendor, "skipping sale without an end date");
            return Ok(None);
        }

        Ok(Some(PromotionRow {
            id,
            vendor,
            entry_type,
            start_date,
            end_date,
        }))
    }
}

pub fn convert_rows(
    raw: Vec<RawPromotionRow>,
    default_year: i32,
) -> Result<Vec<PromotionRow>, SourceError> {
    let mut rows = Vec::with_capacity(raw.len());
    for r in raw {
        if let Some(row) = r.into_row(default_year)? {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Prefilters on the same X/Y/Z rule the core applies, with "today" bound by the caller.
/// `type_key` normalizes the label the way `EntryType::parse` does.
const ACTIVE_PROMOTIONS_SQL: &str = r#"
WITH t AS (
    SELECT "ID"::bigint            AS id,
           "Vendor"                AS vendor,
           "EntryType"             AS entry_type,
           btrim(regexp_replace(lower(replace("EntryType", '_', ' ')), '\s+', ' ', 'g'))
                                   AS type_key,
           "Date_of_Start"::date   AS start_d,
           "Date_of_End"::date     AS end_d
      FROM sm_retail_sales
)
SELECT id,
       vendor,
       entry_type,
       start_d::text AS date_of_start,
       end_d::text   AS date_of_end
  FROM t
 WHERE (
        type_key IN ('sale', 'retail sale')
        AND start_d IS NOT NULL
        AND end_d IS NOT NULL
        AND start_d - $1::int <= $4::date
        AND end_d >= $4::date
       )
    OR (
        type_key = 'price increase'
        AND start_d IS NOT NULL
        AND start_d - $2::int <= $4::date
        AND COALESCE(end_d, start_d + $3::int) >= $4::date
       )
 ORDER BY id
"#;

#[derive(Debug, Clone)]
pub struct PgPromotionSource {
    pool: PgPool,
}

impl PgPromotionSource {
    pub async fn connect(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(SourceError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromotionSource for PgPromotionSource {
    fn describe(&self) -> String {
        "postgres:sm_retail_sales".to_string()
    }

    async fn fetch_active(
        &self,
        offsets: &WindowOffsets,
        today: NaiveDate,
    ) -> Result<Vec<PromotionRow>, SourceError> {
        let rows = sqlx::query(ACTIVE_PROMOTIONS_SQL)
            .bind(clamp_days(offsets.sale_pre_days))
            .bind(clamp_days(offsets.price_increase_pre_days))
            .bind(clamp_days(offsets.price_increase_post_days))
            .bind(today)
            .fetch_all(&self.pool)
            .await
            .map_err(SourceError::Query)?;
        debug!(raw_rows = rows.len(), "fetched promotion rows");

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawPromotionRow {
                id: row.try_get("id").map_err(SourceError::Query)?,
                vendor: row.try_get("vendor").map_err(SourceError::Query)?,
                entry_type: row.try_get("entry_type").map_err(SourceError::Query)?,
                date_of_start: row.try_get("date_of_start").map_err(SourceError::Query)?,
                date_of_end: row.try_get("date_of_end").map_err(SourceError::Query)?,
            });
        }
        convert_rows(raw, today.year())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn clamp_days(days: u32) -> i32 {
    i32::try_from(days).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    promotions: Vec<FixturePromotion>,
}

/// Dates must be YAML strings: an unquoted `2.10` would read as the float `2.1`.
#[derive(Debug, Clone, Deserialize)]
struct FixturePromotion {
    #[serde(default)]
    id: Option<i64>,
    vendor: String,
    entry_type: String,
    start: String,
    #[serde(default)]
    end: Option<String>,
}

/// Rows from a YAML file, for offline runs and demos. Returns every row; the core
/// decides which ones are in their window.
#[derive(Debug, Clone)]
pub struct YamlFixtureSource {
    path: PathBuf,
}

impl YamlFixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, default_year: i32) -> Result<Vec<PromotionRow>, SourceError> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: FixtureFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        let raw = file
            .promotions
            .into_iter()
            .enumerate()
            .map(|(idx, p)| RawPromotionRow {
                id: p.id.unwrap_or(idx as i64 + 1),
                vendor: Some(p.vendor),
                entry_type: Some(p.entry_type),
                date_of_start: Some(p.start),
                date_of_end: p.end,
            })
            .collect();
        convert_rows(raw, default_year)
    }
}

#[async_trait]
impl PromotionSource for YamlFixtureSource {
    fn describe(&self) -> String {
        format!("fixture:{}", self.path.display())
    }

    async fn fetch_active(
        &self,
        _offsets: &WindowOffsets,
        today: NaiveDate,
    ) -> Result<Vec<PromotionRow>, SourceError> {
        self.load(today.year())
    }
}
