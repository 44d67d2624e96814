//! Sync pipeline: promotion rows -> vendor plans -> product metafields.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use promo_core::{aggregate_by_vendor, case_collisions, rows_visible_on, VendorPlan, WindowOffsets};
use promo_source::{PgPromotionSource, PromotionSource, YamlFixtureSource};
use promo_store::{BackoffPolicy, MetadataStore, ShopifyClient, ShopifyConfig};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod decision;
pub mod driver;

pub use decision::{decide, decide_type, field_keys, FieldAction, TypeDecision};
pub use driver::{DriverOptions, DriverStats, LookupCache, ProductSet, SyncDriver, SyncFailure};

pub const CRATE_NAME: &str = "promo-sync";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0}; put it in .env or the environment")]
    Missing(&'static str),
    #[error("no promotion source configured; set DATABASE_URL or PROMO_FIXTURE_PATH")]
    NoSource,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub shop: String,
    pub access_token: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub offsets: WindowOffsets,
    pub dry_run: bool,
    pub db_only: bool,
    pub call_delay: Duration,
    pub namespace: String,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u32| parse_or(get(key), default);
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };

        Self {
            database_url: get("DATABASE_URL"),
            fixture_path: get("PROMO_FIXTURE_PATH").map(PathBuf::from),
            shop: get("SHOPIFY_SHOP").unwrap_or_default(),
            access_token: get("SHOPIFY_TOKEN").unwrap_or_default(),
            api_version: get("SHOPIFY_API_VERSION").unwrap_or_else(|| "2025-01".to_string()),
            request_timeout_secs: parse_or(get("REQUEST_TIMEOUT"), 30),
            user_agent: get("PROMO_USER_AGENT").unwrap_or_else(|| "promo-banner-sync/0.1".to_string()),
            offsets: WindowOffsets::new(
                number("SALE_PRE_DAYS", 0),
                number("PI_PRE_DAYS", 0),
                number("PI_POST_DAYS", 0),
            ),
            dry_run: flag("DRY_RUN", true),
            db_only: flag("DB_ONLY", false),
            call_delay: get("SLEEP_BETWEEN_CALLS")
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(Duration::from_millis(120)),
            namespace: get("METAFIELD_NAMESPACE").unwrap_or_else(|| "custom".to_string()),
            sync_cron: get("SYNC_CRON").unwrap_or_else(|| "0 6 * * *".to_string()),
        }
    }

    pub fn require_store_credentials(&self) -> Result<(), ConfigError> {
        if self.shop.is_empty() {
            return Err(ConfigError::Missing("SHOPIFY_SHOP"));
        }
        if self.access_token.is_empty() {
            return Err(ConfigError::Missing("SHOPIFY_TOKEN"));
        }
        Ok(())
    }

    pub fn shopify_config(&self) -> ShopifyConfig {
        ShopifyConfig {
            shop: self.shop.clone(),
            access_token: self.access_token.clone(),
            api_version: self.api_version.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            namespace: self.namespace.clone(),
            dry_run: self.dry_run,
            call_delay: self.call_delay,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub source: String,
    pub dry_run: bool,
    pub db_only: bool,
    pub rows_read: usize,
    pub rows_in_window: usize,
    pub plans: Vec<VendorPlan>,
    pub stats: DriverStats,
}

impl SyncRunSummary {
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing sync summary")
    }
}

/// Rows and plans computed for one day, before any store access.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub rows_read: usize,
    pub rows_in_window: usize,
    pub plans: Vec<VendorPlan>,
}

pub fn plan_rows(rows: Vec<promo_core::PromotionRow>, offsets: &WindowOffsets, today: NaiveDate) -> PlannedRun {
    let rows_read = rows.len();
    let visible = rows_visible_on(rows, offsets, today);
    if visible.len() < rows_read {
        info!(
            dropped = rows_read - visible.len(),
            "rows outside their display window ignored"
        );
    }
    let plans = aggregate_by_vendor(&visible, offsets);
    for group in case_collisions(&plans) {
        warn!(vendors = ?group, "vendor names differ only by case/whitespace; planned separately");
    }
    PlannedRun {
        rows_read,
        rows_in_window: visible.len(),
        plans,
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch once from `source` and close it on every path.
    pub async fn read_plans(&self, source: &dyn PromotionSource, today: NaiveDate) -> Result<PlannedRun> {
        let fetched = source.fetch_active(&self.config.offsets, today).await;
        source.close().await;
        let rows = fetched.with_context(|| format!("reading promotions from {}", source.describe()))?;
        Ok(plan_rows(rows, &self.config.offsets, today))
    }

    /// Run against explicit collaborators. `store` may be `None` only in db-only mode.
    pub async fn run_with(
        &self,
        source: &dyn PromotionSource,
        store: Option<&dyn MetadataStore>,
        today: NaiveDate,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %today, dry_run = self.config.dry_run);

        async move {
            info!(
                source = %source.describe(),
                x = self.config.offsets.sale_pre_days,
                y = self.config.offsets.price_increase_pre_days,
                z = self.config.offsets.price_increase_post_days,
                "starting promotion sync"
            );
            let planned = self.read_plans(source, today).await?;
            info!(vendors = planned.plans.len(), rows = planned.rows_in_window, "vendor plans computed");

            let stats = if self.config.db_only {
                for plan in &planned.plans {
                    info!(plan = %plan, "planned");
                }
                DriverStats::default()
            } else {
                let store = store.context("metadata store required outside db-only mode")?;
                let mut driver = SyncDriver::new(store, self.config.driver_options());
                for plan in &planned.plans {
                    driver.sync_vendor(plan, today).await;
                }
                driver.finish()
            };

            if !stats.failures.is_empty() {
                warn!(failures = stats.failures.len(), "sync finished with failures");
            }
            info!(
                products = stats.products_touched,
                written = stats.fields_written,
                deleted = stats.fields_deleted,
                "sync complete"
            );

            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                today,
                source: source.describe(),
                dry_run: self.config.dry_run,
                db_only: self.config.db_only,
                rows_read: planned.rows_read,
                rows_in_window: planned.rows_in_window,
                plans: planned.plans,
                stats,
            })
        }
        .instrument(span)
        .await
    }

    /// Build collaborators from the configuration and run once for `today`.
    /// The store client is built before the source is opened, so a bad client
    /// configuration never leaves a database pool behind.
    pub async fn run_once(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let store = self.build_store()?;
        let source = open_source(&self.config).await?;
        let store = store.as_ref().map(|client| client as &dyn MetadataStore);
        self.run_with(source.as_ref(), store, today).await
    }

    /// `None` in db-only mode; otherwise a client for the configured shop.
    pub fn build_store(&self) -> Result<Option<ShopifyClient>> {
        if self.config.db_only {
            return Ok(None);
        }
        self.config.require_store_credentials()?;
        let store = ShopifyClient::new(self.config.shopify_config())?;
        info!(endpoint = store.endpoint(), "shopify client ready");
        Ok(Some(store))
    }

    /// Cron-driven runs, each projecting for the local date at trigger time.
    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let config = self.config.clone();
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let config = config.clone();
            Box::pin(async move {
                let today = Local::now().date_naive();
                match SyncPipeline::new(config).run_once(today).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failures = summary.stats.failures.len(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// Fixture file wins over the database so demos never touch production data.
pub async fn open_source(config: &SyncConfig) -> Result<Box<dyn PromotionSource>> {
    if let Some(path) = &config.fixture_path {
        return Ok(Box::new(YamlFixtureSource::new(path.clone())));
    }
    let Some(url) = &config.database_url else {
        return Err(ConfigError::NoSource.into());
    };
    let source = PgPromotionSource::connect(url)
        .await
        .context("connecting to promotions database")?;
    Ok(Box::new(source))
}

pub async fn run_sync_once_from_env(today: NaiveDate) -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once(today).await
}
