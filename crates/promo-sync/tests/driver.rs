use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use promo_core::{aggregate_by_vendor, normalize_name, EntryType, PromotionRow, WindowOffsets};
use promo_source::{PromotionSource, SourceError};
use promo_store::{Collection, MetafieldInput, MetadataStore, StoreError, UserError};
use promo_sync::decision::{PI_END_KEY, PI_START_KEY, SALE_END_KEY, SALE_START_KEY};
use promo_sync::{DriverOptions, ProductSet, SyncConfig, SyncDriver, SyncPipeline};

#[derive(Default)]
struct StoreState {
    collections: Vec<Collection>,
    collection_products: BTreeMap<String, Vec<String>>,
    /// (vendor, product id)
    catalog: Vec<(String, String)>,
    /// (owner, key) -> (field id, value)
    fields: BTreeMap<(String, String), (String, String)>,
    next_field_id: usize,
    calls: Vec<String>,
    rejected_owners: BTreeSet<String>,
    unavailable_owners: BTreeSet<String>,
    collection_lookup_down: bool,
}

#[derive(Default)]
struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    fn with_collection(vendor: &str, products: &[&str]) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            let id = format!("gid://shopify/Collection/{}", state.collections.len() + 1);
            state.collections.push(Collection {
                id: id.clone(),
                title: vendor.to_string(),
            });
            state
                .collection_products
                .insert(id, products.iter().map(|p| p.to_string()).collect());
        }
        store
    }

    fn add_catalog_product(&self, vendor: &str, product: &str) {
        self.state
            .lock()
            .unwrap()
            .catalog
            .push((vendor.to_string(), product.to_string()));
    }

    fn seed_field(&self, owner: &str, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_field_id += 1;
        let id = format!("gid://shopify/Metafield/{}", state.next_field_id);
        state
            .fields
            .insert((owner.to_string(), key.to_string()), (id, value.to_string()));
    }

    fn field(&self, owner: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .fields
            .get(&(owner.to_string(), key.to_string()))
            .map(|(_, value)| value.clone())
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("set") || c.starts_with("delete"))
            .count()
    }
}

#[async_trait]
impl MetadataStore for FakeStore {
    async fn find_collection_by_title(&self, title: &str) -> Result<Option<Collection>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("collection {title}"));
        if state.collection_lookup_down {
            return Err(StoreError::Transient {
                attempts: 4,
                message: "503 service unavailable".into(),
            });
        }
        let wanted = normalize_name(title);
        Ok(state
            .collections
            .iter()
            .find(|c| normalize_name(&c.title) == wanted)
            .cloned())
    }

    async fn collection_product_ids(&self, collection_id: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("collection_products {collection_id}"));
        Ok(state
            .collection_products
            .get(collection_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn vendor_product_ids(&self, vendor: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("vendor_products {vendor}"));
        let wanted = normalize_name(vendor);
        Ok(state
            .catalog
            .iter()
            .filter(|(v, _)| normalize_name(v) == wanted)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn set_fields(&self, fields: &[MetafieldInput]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let owner = fields.first().map(|f| f.owner_id.clone()).unwrap_or_default();
        state.calls.push(format!(
            "set {owner} {}",
            fields.iter().map(|f| f.key.as_str()).collect::<Vec<_>>().join(",")
        ));
        if state.unavailable_owners.contains(&owner) {
            return Err(StoreError::Transient {
                attempts: 4,
                message: "throttled".into(),
            });
        }
        if state.rejected_owners.contains(&owner) {
            return Err(StoreError::UserErrors {
                operation: "metafieldsSet",
                errors: vec![UserError {
                    field: Some(vec!["metafields".into(), "0".into(), "value".into()]),
                    message: "Value is invalid".into(),
                }],
            });
        }
        for field in fields {
            assert_eq!(field.field_type, "date");
            state.next_field_id += 1;
            let id = format!("gid://shopify/Metafield/{}", state.next_field_id);
            state.fields.insert(
                (field.owner_id.clone(), field.key.clone()),
                (id, field.value.clone()),
            );
        }
        Ok(())
    }

    async fn field_ids(
        &self,
        owner_id: &str,
        _namespace: &str,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("field_ids {owner_id}"));
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .fields
                    .get(&(owner_id.to_string(), key.to_string()))
                    .map(|(id, _)| (key.to_string(), id.clone()))
            })
            .collect())
    }

    async fn delete_field(&self, field_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {field_id}"));
        state.fields.retain(|_, (id, _)| id != field_id);
        Ok(())
    }
}

struct FakeSource {
    rows: Vec<PromotionRow>,
    fail: bool,
    closed: AtomicBool,
}

impl FakeSource {
    fn new(rows: Vec<PromotionRow>) -> Self {
        Self {
            rows,
            fail: false,
            closed: AtomicBool::new(false),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl PromotionSource for FakeSource {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn fetch_active(
        &self,
        _offsets: &WindowOffsets,
        _today: NaiveDate,
    ) -> Result<Vec<PromotionRow>, SourceError> {
        if self.fail {
            return Err(SourceError::Anyhow(anyhow::anyhow!("relation does not exist")));
        }
        Ok(self.rows.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn ymd(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

fn row(id: i64, vendor: &str, entry_type: EntryType, start: NaiveDate, end: Option<NaiveDate>) -> PromotionRow {
    PromotionRow {
        id,
        vendor: vendor.to_string(),
        entry_type,
        start_date: start,
        end_date: end,
    }
}

fn live_options() -> DriverOptions {
    DriverOptions {
        namespace: "custom".to_string(),
        dry_run: false,
        call_delay: Duration::ZERO,
    }
}

fn config(offsets: WindowOffsets, dry_run: bool, db_only: bool) -> SyncConfig {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.offsets = offsets;
    config.dry_run = dry_run;
    config.db_only = db_only;
    config.call_delay = Duration::ZERO;
    config
}

#[tokio::test]
async fn sale_in_pre_roll_writes_real_dates_and_clears_price_increase() {
    let store = FakeStore::with_collection("Acme", &["p1", "p2"]);
    store.seed_field("p1", PI_START_KEY, "2023-12-01");
    let source = FakeSource::new(vec![row(1, "Acme", EntryType::Sale, ymd(2, 7), Some(ymd(2, 17)))]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::new(3, 0, 0), false, false));

    let summary = pipeline
        .run_with(&source, Some(&store), ymd(2, 5))
        .await
        .unwrap();

    for product in ["p1", "p2"] {
        assert_eq!(store.field(product, SALE_START_KEY).as_deref(), Some("2024-02-07"));
        assert_eq!(store.field(product, SALE_END_KEY).as_deref(), Some("2024-02-17"));
    }
    assert_eq!(store.field("p1", PI_START_KEY), None);
    assert_eq!(summary.stats.fields_written, 4);
    assert_eq!(summary.stats.fields_deleted, 1);
    assert_eq!(summary.stats.products_touched, 2);
    assert!(summary.stats.failures.is_empty());
    assert!(source.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn open_price_increase_never_writes_an_end_date() {
    let store = FakeStore::with_collection("Northwind", &["p1"]);
    let source = FakeSource::new(vec![
        row(7, "Northwind", EntryType::PriceIncrease, ymd(2, 4), None),
        row(8, "Northwind", EntryType::Sale, ymd(2, 14), Some(ymd(2, 20))),
    ]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::new(0, 2, 10), false, false));

    for day in [ymd(2, 2), ymd(2, 9), ymd(2, 14)] {
        pipeline.run_with(&source, Some(&store), day).await.unwrap();
        assert_eq!(store.field("p1", PI_START_KEY).as_deref(), Some("2024-02-04"));
        assert_eq!(store.field("p1", PI_END_KEY), None, "on {day}");
    }

    pipeline.run_with(&source, Some(&store), ymd(2, 15)).await.unwrap();
    assert_eq!(store.field("p1", PI_START_KEY), None);
}

#[tokio::test]
async fn stale_price_increase_end_is_cleared_when_the_end_disappears() {
    let store = FakeStore::with_collection("Northwind", &["p1"]);
    store.seed_field("p1", PI_START_KEY, "2024-02-04");
    store.seed_field("p1", PI_END_KEY, "2024-02-20");
    let source = FakeSource::new(vec![row(7, "Northwind", EntryType::PriceIncrease, ymd(2, 4), None)]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::new(0, 2, 10), false, false));

    pipeline.run_with(&source, Some(&store), ymd(2, 6)).await.unwrap();

    assert_eq!(store.field("p1", PI_START_KEY).as_deref(), Some("2024-02-04"));
    assert_eq!(store.field("p1", PI_END_KEY), None);
}

#[tokio::test]
async fn expired_sale_deletes_fields_and_absent_fields_are_a_no_op() {
    let store = FakeStore::with_collection("Acme", &["p1", "p2"]);
    store.seed_field("p1", SALE_START_KEY, "2024-02-07");
    store.seed_field("p1", SALE_END_KEY, "2024-02-17");
    // Filtered out by the source prefilter on a real database; the core re-checks anyway.
    let mut driver = SyncDriver::new(&store, live_options());
    let plans = aggregate_by_vendor(
        &[row(1, "Acme", EntryType::Sale, ymd(2, 7), Some(ymd(2, 17)))],
        &WindowOffsets::new(3, 0, 0),
    );

    driver.sync_vendor(&plans[0], ymd(2, 18)).await;
    let stats = driver.finish();

    assert_eq!(store.field("p1", SALE_START_KEY), None);
    assert_eq!(store.field("p1", SALE_END_KEY), None);
    assert_eq!(stats.fields_deleted, 2);
    assert_eq!(stats.fields_written, 0);
    assert!(stats.failures.is_empty());
    assert!(!store.calls().iter().any(|c| c.starts_with("set")));
}

#[tokio::test]
async fn overlapping_sales_merge_into_one_window() {
    let store = FakeStore::with_collection("Acme", &["p1"]);
    let source = FakeSource::new(vec![
        row(1, "Acme", EntryType::Sale, ymd(2, 1), Some(ymd(2, 10))),
        row(2, "Acme", EntryType::Sale, ymd(2, 5), Some(ymd(2, 20))),
    ]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::default(), false, false));

    let summary = pipeline
        .run_with(&source, Some(&store), ymd(2, 8))
        .await
        .unwrap();

    assert_eq!(summary.plans.len(), 1);
    let window = summary.plans[0].sale.display_window().unwrap();
    assert_eq!((window.start, window.end), (ymd(2, 1), ymd(2, 20)));
    assert_eq!(store.field("p1", SALE_START_KEY).as_deref(), Some("2024-02-01"));
    assert_eq!(store.field("p1", SALE_END_KEY).as_deref(), Some("2024-02-20"));
}

#[tokio::test]
async fn vendor_lookups_are_cached_for_the_run() {
    let store = FakeStore::with_collection("Acme", &["p1"]);
    let mut driver = SyncDriver::new(&store, live_options());
    let offsets = WindowOffsets::default();
    let plans = aggregate_by_vendor(
        &[row(1, "Acme", EntryType::Sale, ymd(2, 1), Some(ymd(2, 10)))],
        &offsets,
    );

    driver.sync_vendor(&plans[0], ymd(2, 5)).await;
    driver.sync_vendor(&plans[0], ymd(2, 6)).await;

    let lookups = store
        .calls()
        .iter()
        .filter(|c| c.starts_with("collection "))
        .count();
    assert_eq!(lookups, 1);
    let (set, ids) = driver.cache().products("Acme").unwrap();
    assert_eq!(set, ProductSet::Collection);
    assert_eq!(ids, ["p1".to_string()]);
}

#[tokio::test]
async fn vendor_without_collection_falls_back_to_product_vendor() {
    let store = FakeStore::default();
    store.add_catalog_product("Blue  Ridge", "p9");
    store.add_catalog_product("Other", "p10");
    let mut driver = SyncDriver::new(&store, live_options());

    let (set, ids) = driver.resolve_products("blue ridge").await.unwrap();

    assert_eq!(set, ProductSet::VendorFilter);
    assert_eq!(ids, vec!["p9".to_string()]);
    assert_eq!(driver.cache().collection("blue ridge"), Some(&None));
}

#[tokio::test]
async fn one_failing_product_does_not_stop_the_others() {
    let store = FakeStore::with_collection("Acme", &["p1", "p2", "p3"]);
    {
        let mut state = store.state.lock().unwrap();
        state.rejected_owners.insert("p1".into());
        state.unavailable_owners.insert("p2".into());
    }
    let mut driver = SyncDriver::new(&store, live_options());
    let plans = aggregate_by_vendor(
        &[row(1, "Acme", EntryType::Sale, ymd(2, 1), Some(ymd(2, 10)))],
        &WindowOffsets::default(),
    );

    driver.sync_vendor(&plans[0], ymd(2, 5)).await;
    let stats = driver.finish();

    assert_eq!(store.field("p3", SALE_START_KEY).as_deref(), Some("2024-02-01"));
    assert_eq!(stats.products_touched, 3);
    assert_eq!(stats.failures.len(), 2);
    let p1 = &stats.failures[0];
    assert_eq!(p1.product_id.as_deref(), Some("p1"));
    assert_eq!(p1.entry_type, Some(EntryType::Sale));
    assert!(!p1.transient);
    assert!(p1.error.contains("Value is invalid"));
    assert!(stats.failures[1].transient);
}

#[tokio::test]
async fn unreachable_vendor_is_recorded_and_skipped() {
    let store = FakeStore::with_collection("Acme", &["p1"]);
    store.state.lock().unwrap().collection_lookup_down = true;
    let mut driver = SyncDriver::new(&store, live_options());
    let plans = aggregate_by_vendor(
        &[row(1, "Acme", EntryType::Sale, ymd(2, 1), Some(ymd(2, 10)))],
        &WindowOffsets::default(),
    );

    driver.sync_vendor(&plans[0], ymd(2, 5)).await;
    let stats = driver.finish();

    assert_eq!(stats.vendors_synced, 0);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].product_id, None);
    assert!(stats.failures[0].transient);
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn dry_run_reads_but_never_mutates() {
    let store = FakeStore::with_collection("Acme", &["p1"]);
    store.seed_field("p1", PI_START_KEY, "2023-12-01");
    let source = FakeSource::new(vec![row(1, "Acme", EntryType::Sale, ymd(2, 7), Some(ymd(2, 17)))]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::new(3, 0, 0), true, false));

    let summary = pipeline
        .run_with(&source, Some(&store), ymd(2, 5))
        .await
        .unwrap();

    assert_eq!(store.mutation_count(), 0);
    assert_eq!(store.field("p1", SALE_START_KEY), None);
    assert_eq!(store.field("p1", PI_START_KEY).as_deref(), Some("2023-12-01"));
    assert!(summary.dry_run);
    assert_eq!(summary.stats.fields_written, 2);
    assert_eq!(summary.stats.fields_deleted, 2);
}

#[tokio::test]
async fn db_only_plans_without_a_store() {
    let source = FakeSource::new(vec![
        row(1, "Acme", EntryType::Sale, ymd(2, 7), Some(ymd(2, 17))),
        row(2, "Zeta", EntryType::PriceIncrease, ymd(3, 1), None),
    ]);
    let pipeline = SyncPipeline::new(config(WindowOffsets::new(3, 0, 0), true, true));

    let summary = pipeline.run_with(&source, None, ymd(2, 5)).await.unwrap();

    assert!(summary.db_only);
    assert_eq!(summary.rows_read, 2);
    assert_eq!(summary.rows_in_window, 1);
    assert_eq!(summary.plans.len(), 1);
    assert_eq!(summary.plans[0].vendor, "Acme");
    assert_eq!(summary.stats.products_touched, 0);
    assert!(summary.to_json_pretty().unwrap().contains("\"vendor\": \"Acme\""));
}

#[tokio::test]
async fn source_is_closed_when_the_fetch_fails() {
    let source = FakeSource::failing();
    let pipeline = SyncPipeline::new(config(WindowOffsets::default(), true, true));

    let err = pipeline.run_with(&source, None, ymd(2, 5)).await.unwrap_err();

    assert!(format!("{err:#}").contains("relation does not exist"));
    assert!(source.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn db_only_run_reads_a_fixture_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promotions.yaml");
    std::fs::write(
        &path,
        r#"promotions:
  - vendor: Acme
    entry_type: Sale
    start: "2.7"
    end: "2.17"
  - vendor: Acme
    entry_type: Price Increase
    start: "2024-03-01"
"#,
    )
    .unwrap();
    let mut config = config(WindowOffsets::new(3, 0, 0), true, true);
    config.fixture_path = Some(path);

    let summary = SyncPipeline::new(config).run_once(ymd(2, 5)).await.unwrap();

    assert_eq!(summary.rows_read, 2);
    assert_eq!(summary.rows_in_window, 1);
    assert_eq!(summary.plans[0].sale.real_start, Some(ymd(2, 7)));
    assert_eq!(summary.plans[0].sale.real_end, Some(ymd(2, 17)));
    assert_eq!(summary.plans[0].price_increase.real_start, None);
}

#[tokio::test]
async fn dry_run_counts_the_stale_price_increase_end_clear() {
    let store = FakeStore::with_collection("Northwind", &["p1"]);
    store.seed_field("p1", PI_END_KEY, "2024-02-20");
    let source = FakeSource::new(vec![row(7, "Northwind", EntryType::PriceIncrease, ymd(2, 4), None)]);

    let dry = SyncPipeline::new(config(WindowOffsets::new(0, 2, 10), true, false))
        .run_with(&source, Some(&store), ymd(2, 6))
        .await
        .unwrap();
    // sale start/end deletions plus the open increase's end clear
    assert_eq!(dry.stats.fields_written, 1);
    assert_eq!(dry.stats.fields_deleted, 3);
    assert_eq!(store.mutation_count(), 0);

    let live = SyncPipeline::new(config(WindowOffsets::new(0, 2, 10), false, false))
        .run_with(&source, Some(&store), ymd(2, 6))
        .await
        .unwrap();
    assert_eq!(live.stats.fields_deleted, 1);
    assert_eq!(store.field("p1", PI_END_KEY), None);
}
