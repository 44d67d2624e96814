//! Shopify Admin GraphQL implementation of [`MetadataStore`].

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use promo_core::normalize_name;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, Collection, MetadataStore,
    MetafieldInput, RetryDisposition, StoreError, UserError,
};

const PAGE_SIZE: u32 = 250;

const COLLECTIONS_BY_TITLE: &str = r#"
query($q: String!) {
  collections(first: 20, query: $q) {
    nodes { id title }
  }
}
"#;

const COLLECTION_PRODUCTS: &str = r#"
query($id: ID!, $cursor: String) {
  collection(id: $id) {
    products(first: 250, after: $cursor) {
      pageInfo { hasNextPage endCursor }
      nodes { id }
    }
  }
}
"#;

const PRODUCTS_BY_VENDOR: &str = r#"
query($q: String!, $cursor: String) {
  products(first: 250, after: $cursor, query: $q) {
    pageInfo { hasNextPage endCursor }
    nodes { id vendor }
  }
}
"#;

const METAFIELDS_SET: &str = r#"
mutation($m: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $m) {
    metafields { id namespace key }
    userErrors { field message }
  }
}
"#;

const PRODUCT_METAFIELDS: &str = r#"
query($id: ID!, $keys: [String!]) {
  product(id: $id) {
    metafields(first: 10, keys: $keys) {
      nodes { id namespace key }
    }
  }
}
"#;

const METAFIELD_DELETE: &str = r#"
mutation($id: ID!) {
  metafieldDelete(input: {id: $id}) {
    deletedId
    userErrors { field message }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    /// `example.myshopify.com` or a full `https://` base URL.
    pub shop: String,
    pub access_token: String,
    pub api_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

pub fn admin_endpoint(shop: &str, api_version: &str) -> String {
    let shop = shop.trim();
    let base = if shop.starts_with("http://") || shop.starts_with("https://") {
        shop.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", shop.trim_end_matches('/'))
    };
    format!("{base}/admin/api/{api_version}/graphql.json")
}

#[derive(Debug)]
pub struct ShopifyClient {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    extensions: Option<JsonValue>,
}

impl GraphqlError {
    fn is_throttled(&self) -> bool {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(JsonValue::as_str)
            == Some("THROTTLED")
    }
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    page_info: PageInfo,
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CollectionsData {
    collections: Nodes<Collection>,
}

#[derive(Debug, Deserialize)]
struct CollectionProductsData {
    collection: Option<CollectionProducts>,
}

#[derive(Debug, Deserialize)]
struct CollectionProducts {
    products: Connection<IdNode>,
}

#[derive(Debug, Deserialize)]
struct IdNode {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    products: Connection<VendorNode>,
}

#[derive(Debug, Deserialize)]
struct VendorNode {
    id: String,
    #[serde(default)]
    vendor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductMetafieldsData {
    product: Option<ProductMetafields>,
}

#[derive(Debug, Deserialize)]
struct ProductMetafields {
    metafields: Nodes<MetafieldNode>,
}

#[derive(Debug, Deserialize)]
struct MetafieldNode {
    id: String,
    namespace: String,
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationPayload {
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: Option<MutationPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldDeleteData {
    metafield_delete: Option<MutationPayload>,
}

impl ShopifyClient {
    pub fn new(config: ShopifyConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: admin_endpoint(&config.shop, &config.api_version),
            access_token: config.access_token,
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST one GraphQL document, retrying rate limits, server errors and throttling.
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        variables: JsonValue,
    ) -> Result<T, StoreError> {
        let payload = json!({ "query": query, "variables": variables });
        let mut last_error = String::new();

        for attempt in 0..=self.backoff.max_retries {
            let can_retry = attempt < self.backoff.max_retries;
            debug!(operation, attempt, "shopify graphql request");

            let resp = match self
                .client
                .post(&self.endpoint)
                .header("X-Shopify-Access-Token", &self.access_token)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(StoreError::Request(err));
                    }
                    last_error = err.to_string();
                    if can_retry {
                        self.pause_before_retry(operation, attempt, &last_error).await;
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                if classify_status(status) == RetryDisposition::NonRetryable {
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: self.endpoint.clone(),
                    });
                }
                let body = resp.text().await.unwrap_or_default();
                last_error = format!("http status {status}: {body}");
                if can_retry {
                    self.pause_before_retry(operation, attempt, &last_error).await;
                    continue;
                }
                break;
            }

            let body: GraphqlResponse<T> = resp.json().await?;
            if !body.errors.is_empty() {
                let message = body
                    .errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                if !body.errors.iter().any(GraphqlError::is_throttled) {
                    return Err(StoreError::Graphql(message));
                }
                last_error = format!("throttled: {message}");
                if can_retry {
                    self.pause_before_retry(operation, attempt, &last_error).await;
                    continue;
                }
                break;
            }

            return body
                .data
                .ok_or_else(|| StoreError::Decode(format!("{operation} returned no data")));
        }

        Err(StoreError::Transient {
            attempts: self.backoff.max_retries + 1,
            message: last_error,
        })
    }

    async fn pause_before_retry(&self, operation: &str, attempt: usize, error: &str) {
        let delay = self.backoff.delay_for_attempt(attempt);
        warn!(operation, attempt, ?delay, error, "transient shopify failure; retrying");
        tokio::time::sleep(delay).await;
    }

    async fn search_collections(&self, query: String) -> Result<Vec<Collection>, StoreError> {
        let data: CollectionsData = self
            .execute("collections", COLLECTIONS_BY_TITLE, json!({ "q": query }))
            .await?;
        Ok(data.collections.nodes)
    }
}

#[async_trait]
impl MetadataStore for ShopifyClient {
    async fn find_collection_by_title(&self, title: &str) -> Result<Option<Collection>, StoreError> {
        let target = normalize_name(title);
        // Quoted phrase first; some titles only match the loose form.
        for query in [
            format!("title:{}", quote_search_term(title)),
            format!("title:{}", title.trim()),
        ] {
            let hit = self
                .search_collections(query)
                .await?
                .into_iter()
                .find(|c| normalize_name(&c.title) == target);
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    async fn collection_product_ids(&self, collection_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: CollectionProductsData = self
                .execute(
                    "collection.products",
                    COLLECTION_PRODUCTS,
                    json!({ "id": collection_id, "cursor": cursor }),
                )
                .await?;
            let Some(collection) = data.collection else {
                return Err(StoreError::Decode(format!("collection {collection_id} not found")));
            };
            let page = collection.products;
            ids.extend(page.nodes.into_iter().map(|n| n.id));
            match next_cursor(page.page_info) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(collection_id, count = ids.len(), page_size = PAGE_SIZE, "listed collection products");
        Ok(ids)
    }

    async fn vendor_product_ids(&self, vendor: &str) -> Result<Vec<String>, StoreError> {
        let target = normalize_name(vendor);
        let query = format!("vendor:{}", quote_search_term(vendor));
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: ProductsData = self
                .execute(
                    "products",
                    PRODUCTS_BY_VENDOR,
                    json!({ "q": query, "cursor": cursor }),
                )
                .await?;
            let page = data.products;
            ids.extend(
                page.nodes
                    .into_iter()
                    .filter(|n| normalize_name(n.vendor.as_deref().unwrap_or_default()) == target)
                    .map(|n| n.id),
            );
            match next_cursor(page.page_info) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn set_fields(&self, fields: &[MetafieldInput]) -> Result<(), StoreError> {
        let data: MetafieldsSetData = self
            .execute("metafieldsSet", METAFIELDS_SET, json!({ "m": fields }))
            .await?;
        let payload = data
            .metafields_set
            .ok_or_else(|| StoreError::Decode("metafieldsSet payload missing".into()))?;
        reject_user_errors("metafieldsSet", payload.user_errors)
    }

    async fn field_ids(
        &self,
        owner_id: &str,
        namespace: &str,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let qualified = keys
            .iter()
            .map(|k| format!("{namespace}.{k}"))
            .collect::<Vec<_>>();
        let data: ProductMetafieldsData = self
            .execute(
                "product.metafields",
                PRODUCT_METAFIELDS,
                json!({ "id": owner_id, "keys": qualified }),
            )
            .await?;
        let Some(product) = data.product else {
            return Ok(BTreeMap::new());
        };
        Ok(product
            .metafields
            .nodes
            .into_iter()
            .filter(|mf| mf.namespace == namespace && keys.contains(&mf.key.as_str()))
            .map(|mf| (mf.key, mf.id))
            .collect())
    }

    async fn delete_field(&self, field_id: &str) -> Result<(), StoreError> {
        let data: MetafieldDeleteData = self
            .execute("metafieldDelete", METAFIELD_DELETE, json!({ "id": field_id }))
            .await?;
        let payload = data
            .metafield_delete
            .ok_or_else(|| StoreError::Decode("metafieldDelete payload missing".into()))?;
        reject_user_errors("metafieldDelete", payload.user_errors)
    }
}

fn next_cursor(page_info: PageInfo) -> Option<String> {
    if page_info.has_next_page {
        page_info.end_cursor
    } else {
        None
    }
}

fn reject_user_errors(operation: &'static str, errors: Vec<UserError>) -> Result<(), StoreError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StoreError::UserErrors { operation, errors })
    }
}

/// Double-quote a search term for the Admin search syntax.
fn quote_search_term(term: &str) -> String {
    format!("\"{}\"", term.trim().replace('\\', "\\\\").replace('"', "\\\""))
}
