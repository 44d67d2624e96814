//! Folding promotion rows into one plan per vendor.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::window::{display_window, DisplayWindow};
use crate::{normalize_name, EntryType, PromotionRow, WindowOffsets};

/// Merged dates for one promotion type of one vendor.
///
/// Display dates decide whether fields exist today; real dates are what gets published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypePlan {
    pub display_start: Option<NaiveDate>,
    pub display_end: Option<NaiveDate>,
    pub real_start: Option<NaiveDate>,
    pub real_end: Option<NaiveDate>,
}

impl TypePlan {
    fn absorb(&mut self, window: DisplayWindow, real_start: NaiveDate, real_end: Option<NaiveDate>) {
        merge_min(&mut self.display_start, window.start);
        merge_max(&mut self.display_end, window.end);
        merge_min(&mut self.real_start, real_start);
        if let Some(end) = real_end {
            merge_max(&mut self.real_end, end);
        }
    }

    pub fn display_window(&self) -> Option<DisplayWindow> {
        Some(DisplayWindow {
            start: self.display_start?,
            end: self.display_end?,
        })
    }

    /// Whether this type's fields should exist on products on `today`.
    pub fn is_visible_on(&self, today: NaiveDate) -> bool {
        self.display_window().is_some_and(|w| w.contains(today))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorPlan {
    pub vendor: String,
    pub sale: TypePlan,
    pub price_increase: TypePlan,
}

impl VendorPlan {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            sale: TypePlan::default(),
            price_increase: TypePlan::default(),
        }
    }

    pub fn get(&self, entry_type: EntryType) -> &TypePlan {
        match entry_type {
            EntryType::Sale => &self.sale,
            EntryType::PriceIncrease => &self.price_increase,
        }
    }

    /// Merge a row into the plan. Rows for another vendor are the caller's problem.
    pub fn absorb(&mut self, row: &PromotionRow, offsets: &WindowOffsets) {
        let window = display_window(row, offsets);
        match row.entry_type {
            EntryType::Sale => {
                let real_end = row.end_date.unwrap_or(row.start_date);
                self.sale.absorb(window, row.start_date, Some(real_end));
            }
            EntryType::PriceIncrease => {
                self.price_increase.absorb(window, row.start_date, row.end_date);
            }
        }
    }
}

impl std::fmt::Display for VendorPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | Sale display: {}->{} real: {}->{} | PI display: {}->{} real: {}->{}",
            self.vendor,
            show(self.sale.display_start),
            show(self.sale.display_end),
            show(self.sale.real_start),
            show(self.sale.real_end),
            show(self.price_increase.display_start),
            show(self.price_increase.display_end),
            show(self.price_increase.real_start),
            show(self.price_increase.real_end),
        )
    }
}

/// One plan per raw vendor string, sorted by vendor.
pub fn aggregate_by_vendor(rows: &[PromotionRow], offsets: &WindowOffsets) -> Vec<VendorPlan> {
    let mut by_vendor: BTreeMap<&str, VendorPlan> = BTreeMap::new();
    for row in rows {
        by_vendor
            .entry(row.vendor.as_str())
            .or_insert_with(|| VendorPlan::new(row.vendor.clone()))
            .absorb(row, offsets);
    }
    by_vendor.into_values().collect()
}

/// Rows whose own display window contains `today`.
pub fn rows_visible_on(rows: Vec<PromotionRow>, offsets: &WindowOffsets, today: NaiveDate) -> Vec<PromotionRow> {
    rows.into_iter()
        .filter(|row| display_window(row, offsets).contains(today))
        .collect()
}

/// Groups of distinct vendor keys that only differ by case or whitespace.
pub fn case_collisions(plans: &[VendorPlan]) -> Vec<Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for plan in plans {
        groups
            .entry(normalize_name(&plan.vendor))
            .or_default()
            .push(plan.vendor.clone());
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

fn merge_min(slot: &mut Option<NaiveDate>, value: NaiveDate) {
    *slot = Some(slot.map_or(value, |current| current.min(value)));
}

fn merge_max(slot: &mut Option<NaiveDate>, value: NaiveDate) {
    *slot = Some(slot.map_or(value, |current| current.max(value)));
}

fn show(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_else(|| "None".to_string())
}
