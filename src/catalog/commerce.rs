use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::record::{CatalogRecord, ExternalRefs, Source};
use super::{send_json_with_retries, CatalogError, CommerceStore};
use crate::util::env::{env_opt, env_parse, env_req};

/// Auth header understood by the commerce platform's admin API.
pub const ACCESS_TOKEN_HEADER: &str = "X-Commerce-Access-Token";

#[derive(Clone, Debug)]
pub struct CommerceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub page_size: u32,
    /// Safety cap so a misbehaving cursor can never loop forever.
    pub max_pages: u32,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl CommerceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: env_req("COMMERCE_BASE_URL")?.trim_end_matches('/').to_string(),
            token: env_opt("COMMERCE_API_TOKEN"),
            page_size: env_parse("COMMERCE_PAGE_SIZE", 250u32),
            max_pages: env_parse("COMMERCE_MAX_PAGES", 200u32),
            timeout_secs: env_parse("RECON_HTTP_TIMEOUT_SECS", 30u64),
            retry_attempts: env_parse("RECON_MAX_RETRIES", 3u32),
            retry_base_delay_ms: env_parse("RECON_BACKOFF_MS", 300u64),
        })
    }
}

/// Product shape returned by the admin listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommerceProduct {
    pub id: u64,
    pub title: String,
    pub handle: String,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub images: Vec<Value>,
    #[serde(default)]
    pub variants: Vec<CommerceVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommerceVariant {
    pub id: u64,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductsPage {
    #[serde(default)]
    products: Vec<CommerceProduct>,
}

#[derive(Clone)]
pub struct CommerceClient {
    http: Client,
    cfg: Arc<CommerceConfig>,
}

impl CommerceClient {
    pub fn new(cfg: CommerceConfig) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            cfg: Arc::new(cfg),
        })
    }

    fn page_url(&self, since_id: u64) -> String {
        format!(
            "{}/admin/api/products.json?limit={}&since_id={}",
            self.cfg.base_url, self.cfg.page_size, since_id
        )
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<Value, CatalogError> {
        let mut req = self.http.get(url);
        if let Some(token) = self.cfg.token.as_deref() {
            req = req.header(ACCESS_TOKEN_HEADER, token);
        }
        send_json_with_retries(
            req,
            what,
            self.cfg.retry_attempts,
            self.cfg.retry_base_delay_ms,
        )
        .await
    }

    /// Walk the whole catalog with since_id pagination.
    pub async fn fetch_all_products(&self) -> Result<Vec<CommerceProduct>, CatalogError> {
        let mut out: Vec<CommerceProduct> = Vec::new();
        let mut since_id = 0u64;
        let mut pages = 0u32;
        loop {
            if pages >= self.cfg.max_pages {
                warn!(pages, fetched = out.len(), "commerce pagination hit the page cap; truncating");
                break;
            }
            let url = self.page_url(since_id);
            let payload = self.get_json(&url, "commerce page").await?;
            let page: ProductsPage = serde_json::from_value(payload)?;
            if page.products.is_empty() {
                break;
            }
            pages += 1;
            debug!(page = pages, batch = page.products.len(), since_id, "commerce page fetched");
            since_id = page.products.iter().map(|p| p.id).max().unwrap_or(since_id);
            out.extend(page.products);
        }
        info!(products = out.len(), pages, "commerce fetch complete");
        Ok(out)
    }
}

#[async_trait]
impl CommerceStore for CommerceClient {
    async fn fetch_products(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        Ok(self
            .fetch_all_products()
            .await?
            .iter()
            .map(record_from_product)
            .collect())
    }
}

/// (variant id, sku) pairs recorded in a commerce record's payload.
pub fn variant_skus(record: &CatalogRecord) -> Vec<(String, String)> {
    record
        .raw_payload
        .get("variants")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| {
                    let id = id_value(v.get("id")?)?;
                    let sku = v
                        .get("sku")
                        .and_then(|s| s.as_str())
                        .map(str::trim)
                        .filter(|s| !s.is_empty())?;
                    Some((id, sku.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn id_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn record_from_product(p: &CommerceProduct) -> CatalogRecord {
    let created_at = p
        .created_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let handle = p.handle.trim();
    let product_id = p.id.to_string();
    // Empty-string fields from the API read as absent.
    let classification = p
        .product_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let mut raw_payload = Map::new();
    raw_payload.insert(
        "variants".to_string(),
        serde_json::to_value(&p.variants).unwrap_or(Value::Array(Vec::new())),
    );
    CatalogRecord {
        id: Source::Commerce.qualify(&product_id),
        source: Source::Commerce,
        title: p.title.trim().to_string(),
        slug: (!handle.is_empty()).then(|| handle.to_string()),
        external: ExternalRefs {
            product_id: Some(product_id),
            variant_ids: p.variants.iter().map(|v| v.id.to_string()).collect(),
            handle: (!handle.is_empty()).then(|| handle.to_string()),
        },
        classification,
        has_media: !p.images.is_empty(),
        is_draft: p.status.as_deref() == Some("draft"),
        created_at,
        units: Vec::new(),
        raw_payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(raw: &str) -> CommerceProduct {
        serde_json::from_str(raw).expect("test product")
    }

    #[test]
    fn maps_listing_product() {
        let rec = record_from_product(&product(
            r#"{
                "id": 98123,
                "title": "Del Mar",
                "handle": "delmar",
                "product_type": "essence",
                "status": "active",
                "created_at": "2022-11-02T08:00:00-04:00",
                "images": [{"src": "a.jpg"}],
                "variants": [
                    {"id": 1, "sku": "DM-6ML", "title": "6ml"},
                    {"id": 2, "sku": "DM-50ML", "title": "50ml"}
                ]
            }"#,
        ));
        assert_eq!(rec.id, "commerce:98123");
        assert_eq!(rec.slug.as_deref(), Some("delmar"));
        assert_eq!(rec.external.product_id.as_deref(), Some("98123"));
        assert_eq!(rec.external.variant_ids, vec!["1", "2"]);
        assert!(rec.has_media);
        assert!(!rec.is_draft);
        assert_eq!(rec.classification.as_deref(), Some("essence"));
    }

    #[test]
    fn empty_product_type_reads_as_absent() {
        let rec = record_from_product(&product(
            r#"{"id": 1, "title": "X", "handle": "x", "product_type": ""}"#,
        ));
        assert_eq!(rec.classification, None);
    }

    #[test]
    fn draft_status_is_flagged() {
        let rec = record_from_product(&product(
            r#"{"id": 1, "title": "X", "handle": "x", "status": "draft"}"#,
        ));
        assert!(rec.is_draft);
    }

    #[test]
    fn variant_skus_skips_blank_skus() {
        let rec = record_from_product(&product(
            r#"{
                "id": 5, "title": "Y", "handle": "y",
                "variants": [
                    {"id": 10, "sku": "Y-6ML"},
                    {"id": 11, "sku": "  "},
                    {"id": 12}
                ]
            }"#,
        ));
        let skus = variant_skus(&rec);
        assert_eq!(skus, vec![("10".to_string(), "Y-6ML".to_string())]);
    }
}
