//! Product metadata store contract + Shopify Admin GraphQL client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod shopify;

pub use shopify::{admin_endpoint, ShopifyClient, ShopifyConfig};

pub const CRATE_NAME: &str = "promo-store";

/// One `metafieldsSet` input entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetafieldInput {
    pub owner_id: String,
    pub namespace: String,
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub value: String,
}

impl MetafieldInput {
    pub fn date(owner_id: &str, namespace: &str, key: &str, date: NaiveDate) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            field_type: "date".to_string(),
            value: promo_core::to_iso(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub title: String,
}

/// Field-level validation error reported by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserError {
    #[serde(default)]
    pub field: Option<Vec<String>>,
    pub message: String,
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(path) if !path.is_empty() => write!(f, "{}: {}", path.join("."), self.message),
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    Transient { attempts: usize, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("graphql errors: {0}")]
    Graphql(String),
    #[error("{operation} rejected: {}", join_user_errors(.errors))]
    UserErrors {
        operation: &'static str,
        errors: Vec<UserError>,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

fn join_user_errors(errors: &[UserError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Queries and mutations the sync needs from the commerce platform.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Collection whose normalized title equals the normalized `title`.
    async fn find_collection_by_title(&self, title: &str) -> Result<Option<Collection>, StoreError>;

    async fn collection_product_ids(&self, collection_id: &str) -> Result<Vec<String>, StoreError>;

    /// Catalog products whose normalized vendor equals the normalized `vendor`.
    async fn vendor_product_ids(&self, vendor: &str) -> Result<Vec<String>, StoreError>;

    async fn set_fields(&self, fields: &[MetafieldInput]) -> Result<(), StoreError>;

    /// Opaque ids of the fields that exist on `owner_id`, keyed by field key.
    async fn field_ids(
        &self,
        owner_id: &str,
        namespace: &str,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>, StoreError>;

    async fn delete_field(&self, field_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
