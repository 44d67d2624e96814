//! Applies vendor plans to the products of the metadata store.

use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveDate;
use promo_core::{EntryType, VendorPlan};
use promo_store::{Collection, MetadataStore, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::decision::{decide, TypeDecision};

/// Where a vendor's product ids came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProductSet {
    Collection,
    VendorFilter,
}

/// Vendor lookups memoized for a single run.
#[derive(Debug, Default)]
pub struct LookupCache {
    collections: HashMap<String, Option<Collection>>,
    products: HashMap<String, (ProductSet, Vec<String>)>,
}

impl LookupCache {
    pub fn collection(&self, vendor: &str) -> Option<&Option<Collection>> {
        self.collections.get(vendor)
    }

    pub fn products(&self, vendor: &str) -> Option<(ProductSet, &[String])> {
        self.products
            .get(vendor)
            .map(|(set, ids)| (*set, ids.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub vendor: String,
    pub product_id: Option<String>,
    pub entry_type: Option<EntryType>,
    pub error: String,
    pub transient: bool,
}

/// Counters for one run. In dry-run mode writes and deletes count what would have been sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverStats {
    pub vendors_synced: usize,
    pub products_touched: usize,
    pub fields_written: usize,
    pub fields_deleted: usize,
    pub failures: Vec<SyncFailure>,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub namespace: String,
    pub dry_run: bool,
    /// Pause after each product, to stay under the API rate limit.
    pub call_delay: Duration,
}

pub struct SyncDriver<'a> {
    store: &'a dyn MetadataStore,
    options: DriverOptions,
    cache: LookupCache,
    stats: DriverStats,
}

impl<'a> SyncDriver<'a> {
    pub fn new(store: &'a dyn MetadataStore, options: DriverOptions) -> Self {
        Self {
            store,
            options,
            cache: LookupCache::default(),
            stats: DriverStats::default(),
        }
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn finish(self) -> DriverStats {
        self.stats
    }

    /// Products of the vendor's collection, else catalog products carrying the vendor.
    pub async fn resolve_products(&mut self, vendor: &str) -> Result<(ProductSet, Vec<String>), StoreError> {
        if let Some((set, ids)) = self.cache.products(vendor) {
            return Ok((set, ids.to_vec()));
        }

        let collection = match self.cache.collection(vendor) {
            Some(cached) => cached.clone(),
            None => {
                let found = self.store.find_collection_by_title(vendor).await?;
                self.cache
                    .collections
                    .insert(vendor.to_string(), found.clone());
                found
            }
        };

        let resolved = match collection {
            Some(collection) => {
                info!(vendor, collection = %collection.title, "collection matched");
                (
                    ProductSet::Collection,
                    self.store.collection_product_ids(&collection.id).await?,
                )
            }
            None => {
                info!(vendor, "collection not found; falling back to product vendor");
                (
                    ProductSet::VendorFilter,
                    self.store.vendor_product_ids(vendor).await?,
                )
            }
        };
        self.cache
            .products
            .insert(vendor.to_string(), resolved.clone());
        Ok(resolved)
    }

    pub async fn sync_vendor(&mut self, plan: &VendorPlan, today: NaiveDate) {
        let decisions = decide(plan, today);
        info!(
            vendor = %plan.vendor,
            sale_visible = decisions[0].should_exist,
            price_increase_visible = decisions[1].should_exist,
            "syncing vendor"
        );

        let product_ids = match self.resolve_products(&plan.vendor).await {
            Ok((_, ids)) => ids,
            Err(err) => {
                error!(vendor = %plan.vendor, error = %err, "could not resolve products; skipping vendor");
                self.stats.failures.push(SyncFailure {
                    vendor: plan.vendor.clone(),
                    product_id: None,
                    entry_type: None,
                    transient: err.is_transient(),
                    error: err.to_string(),
                });
                return;
            }
        };
        info!(vendor = %plan.vendor, products = product_ids.len(), "products found");
        self.stats.vendors_synced += 1;

        for product_id in &product_ids {
            for decision in &decisions {
                if let Err(err) = self.apply(product_id, decision).await {
                    warn!(
                        vendor = %plan.vendor,
                        product_id = %product_id,
                        entry_type = %decision.entry_type,
                        error = %err,
                        "abandoning remaining field operations for this type"
                    );
                    self.stats.failures.push(SyncFailure {
                        vendor: plan.vendor.clone(),
                        product_id: Some(product_id.clone()),
                        entry_type: Some(decision.entry_type),
                        transient: err.is_transient(),
                        error: err.to_string(),
                    });
                }
            }
            self.stats.products_touched += 1;

            if !self.options.call_delay.is_zero() {
                tokio::time::sleep(self.options.call_delay).await;
            }
        }
    }

    async fn apply(&mut self, product_id: &str, decision: &TypeDecision) -> Result<(), StoreError> {
        let namespace = self.options.namespace.as_str();
        let payload = decision.payload(product_id, namespace);
        let removals = decision.removals();

        if self.options.dry_run {
            if !payload.is_empty() {
                info!(
                    product_id,
                    fields = ?payload.iter().map(|m| format!("{}.{}={}", m.namespace, m.key, m.value)).collect::<Vec<_>>(),
                    "DRY_RUN write"
                );
                self.stats.fields_written += payload.len();
            }
            if !removals.is_empty() {
                info!(
                    product_id,
                    fields = ?removals.iter().map(|k| format!("{namespace}.{k}")).collect::<Vec<_>>(),
                    "DRY_RUN delete"
                );
                self.stats.fields_deleted += removals.len();
            }
            return Ok(());
        }

        if !payload.is_empty() {
            self.store.set_fields(&payload).await?;
            self.stats.fields_written += payload.len();
        }

        if !removals.is_empty() {
            let existing = self.store.field_ids(product_id, namespace, removals).await?;
            for key in removals {
                let Some(field_id) = existing.get(*key) else {
                    debug!(product_id, key, "field absent; nothing to delete");
                    continue;
                };
                self.store.delete_field(field_id).await?;
                self.stats.fields_deleted += 1;
            }
        }
        Ok(())
    }
}
