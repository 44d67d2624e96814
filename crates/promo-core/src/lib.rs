//! Core promotion model, display-window rules and per-vendor plan folding.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dates;
pub mod plan;
pub mod window;

pub use dates::{normalize_date, to_iso};
pub use plan::{aggregate_by_vendor, case_collisions, rows_visible_on, TypePlan, VendorPlan};
pub use window::{display_window, DisplayWindow};

pub const CRATE_NAME: &str = "promo-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed date {input:?}: {reason}")]
    MalformedDate { input: String, reason: String },
    #[error("unknown promotion entry type {0:?}")]
    UnknownEntryType(String),
}

impl CoreError {
    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        Self::MalformedDate {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// The two promotion kinds a banner can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Sale,
    PriceIncrease,
}

impl EntryType {
    pub const ALL: [EntryType; 2] = [EntryType::Sale, EntryType::PriceIncrease];

    /// Normalized column labels and the type each one names.
    pub const LABELS: [(&'static str, EntryType); 3] = [
        ("sale", EntryType::Sale),
        ("retail sale", EntryType::Sale),
        ("price increase", EntryType::PriceIncrease),
    ];

    /// Parse the free-text `EntryType` column. Matching is case and whitespace insensitive,
    /// and underscores are accepted in place of spaces.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let key = normalize_name(&raw.replace('_', " "));
        Self::LABELS
            .iter()
            .find(|(label, _)| *label == key)
            .map(|(_, entry_type)| *entry_type)
            .ok_or_else(|| CoreError::UnknownEntryType(raw.to_string()))
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sale => "Sale",
            Self::PriceIncrease => "Price Increase",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of the promotions table as read for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRow {
    pub id: i64,
    pub vendor: String,
    pub entry_type: EntryType,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// Pre-roll and fallback offsets, in days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOffsets {
    /// X: days a sale banner appears before the sale starts.
    pub sale_pre_days: u32,
    /// Y: days a price-increase banner appears before the increase starts.
    pub price_increase_pre_days: u32,
    /// Z: days an open-ended price-increase banner stays up after the start.
    pub price_increase_post_days: u32,
}

impl WindowOffsets {
    pub fn new(sale_pre_days: u32, price_increase_pre_days: u32, price_increase_post_days: u32) -> Self {
        Self {
            sale_pre_days,
            price_increase_pre_days,
            price_increase_post_days,
        }
    }
}

/// Lowercase and collapse internal whitespace, for title/vendor comparisons.
pub fn normalize_name(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
