//! What each promotion type's product fields should look like today.

use chrono::NaiveDate;
use promo_core::{EntryType, TypePlan, VendorPlan};
use promo_store::MetafieldInput;

pub const SALE_START_KEY: &str = "promo_sale_start_date";
pub const SALE_END_KEY: &str = "promo_sale_end_date";
pub const PI_START_KEY: &str = "promo_pi_start_date";
pub const PI_END_KEY: &str = "promo_pi_end_date";

/// `(start_key, end_key)` for a promotion type.
pub fn field_keys(entry_type: EntryType) -> (&'static str, &'static str) {
    match entry_type {
        EntryType::Sale => (SALE_START_KEY, SALE_END_KEY),
        EntryType::PriceIncrease => (PI_START_KEY, PI_END_KEY),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAction {
    /// Publish real dates; `clear` names this type's keys that must not linger.
    Write {
        fields: Vec<(&'static str, NaiveDate)>,
        clear: Vec<&'static str>,
    },
    /// Outside the display window: remove both fields if present.
    Delete { keys: [&'static str; 2] },
    /// Inside the window but the real dates are incomplete; leave fields untouched.
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDecision {
    pub entry_type: EntryType,
    pub should_exist: bool,
    pub action: FieldAction,
}

impl TypeDecision {
    pub fn payload(&self, owner_id: &str, namespace: &str) -> Vec<MetafieldInput> {
        match &self.action {
            FieldAction::Write { fields, .. } => fields
                .iter()
                .map(|(key, date)| MetafieldInput::date(owner_id, namespace, key, *date))
                .collect(),
            FieldAction::Delete { .. } | FieldAction::Hold => Vec::new(),
        }
    }

    /// Keys to remove if they exist on the product.
    pub fn removals(&self) -> &[&'static str] {
        match &self.action {
            FieldAction::Write { clear, .. } => clear.as_slice(),
            FieldAction::Delete { keys } => keys.as_slice(),
            FieldAction::Hold => &[],
        }
    }
}

pub fn decide(plan: &VendorPlan, today: NaiveDate) -> [TypeDecision; 2] {
    EntryType::ALL.map(|entry_type| decide_type(entry_type, plan.get(entry_type), today))
}

pub fn decide_type(entry_type: EntryType, plan: &TypePlan, today: NaiveDate) -> TypeDecision {
    let (start_key, end_key) = field_keys(entry_type);
    let should_exist = plan.is_visible_on(today);

    let action = if !should_exist {
        FieldAction::Delete {
            keys: [start_key, end_key],
        }
    } else {
        match (entry_type, plan.real_start, plan.real_end) {
            (_, Some(start), Some(end)) => FieldAction::Write {
                fields: vec![(start_key, start), (end_key, end)],
                clear: Vec::new(),
            },
            (EntryType::PriceIncrease, Some(start), None) => FieldAction::Write {
                fields: vec![(start_key, start)],
                clear: vec![end_key],
            },
            _ => FieldAction::Hold,
        }
    };

    TypeDecision {
        entry_type,
        should_exist,
        action,
    }
}
