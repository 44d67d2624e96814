//! Per-row display window rules.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{EntryType, PromotionRow, WindowOffsets};

/// Inclusive range of days on which a banner is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DisplayWindow {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// Compute when the banner for a single row should be visible.
///
/// | entry type     | start         | end                         |
/// |----------------|---------------|-----------------------------|
/// | Sale           | start - X     | end, else start             |
/// | Price increase | start - Y     | end, else start + Z         |
pub fn display_window(row: &PromotionRow, offsets: &WindowOffsets) -> DisplayWindow {
    match row.entry_type {
        EntryType::Sale => DisplayWindow {
            start: days_before(row.start_date, offsets.sale_pre_days),
            end: row.end_date.unwrap_or(row.start_date),
        },
        EntryType::PriceIncrease => DisplayWindow {
            start: days_before(row.start_date, offsets.price_increase_pre_days),
            end: row
                .end_date
                .unwrap_or_else(|| days_after(row.start_date, offsets.price_increase_post_days)),
        },
    }
}

fn days_before(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_sub_days(Days::new(days.into()))
        .unwrap_or(NaiveDate::MIN)
}

fn days_after(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(days.into()))
        .unwrap_or(NaiveDate::MAX)
}
