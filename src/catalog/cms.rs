use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::record::{self, CatalogRecord, ExternalRefs, MutationPlan, Source, DRAFT_PREFIX};
use super::{send_json_with_retries, CatalogError, CmsStore};
use crate::util::env::{env_opt, env_parse, env_req};

/// CMS field names the engine reads and writes.
pub const FIELD_TITLE: &str = "title";
pub const FIELD_SLUG: &str = "slug";
pub const FIELD_SECTION: &str = "section";
pub const FIELD_SIZES: &str = "sizes";
pub const FIELD_COMMERCE_PRODUCT_ID: &str = "commerceProductId";
pub const FIELD_COMMERCE_VARIANT_IDS: &str = "commerceVariantIds";
pub const FIELD_COMMERCE_HANDLE: &str = "commerceHandle";

/// Document envelope fields owned by the store, never merged.
const SYSTEM_FIELDS: [&str; 5] = ["_id", "_rev", "_type", "_createdAt", "_updatedAt"];
/// Fields lifted into the typed record and excluded from merge patches.
/// Commerce identifiers stay out so a merge can never move a link silently.
const MERGE_EXCLUDED_FIELDS: [&str; 5] = [
    FIELD_TITLE,
    FIELD_SLUG,
    FIELD_COMMERCE_PRODUCT_ID,
    FIELD_COMMERCE_VARIANT_IDS,
    FIELD_COMMERCE_HANDLE,
];

#[derive(Clone, Debug)]
pub struct CmsConfig {
    pub base_url: String,
    pub dataset: String,
    pub token: Option<String>,
    pub doc_type: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl CmsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: env_req("CMS_BASE_URL")?.trim_end_matches('/').to_string(),
            dataset: env_req("CMS_DATASET")?,
            token: env_opt("CMS_API_TOKEN"),
            doc_type: env_opt("RECON_CMS_DOC_TYPE").unwrap_or_else(|| "product".into()),
            timeout_secs: env_parse("RECON_HTTP_TIMEOUT_SECS", 30u64),
            retry_attempts: env_parse("RECON_MAX_RETRIES", 3u32),
            retry_base_delay_ms: env_parse("RECON_BACKOFF_MS", 300u64),
        })
    }
}

#[derive(Clone)]
pub struct CmsClient {
    http: Client,
    cfg: Arc<CmsConfig>,
}

impl CmsClient {
    pub fn new(cfg: CmsConfig) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            cfg: Arc::new(cfg),
        })
    }

    fn query_url(&self, query: &str) -> String {
        format!(
            "{}/v1/data/query/{}?query={}",
            self.cfg.base_url,
            self.cfg.dataset,
            urlencoding::encode(query)
        )
    }

    fn mutate_url(&self) -> String {
        format!("{}/v1/data/mutate/{}", self.cfg.base_url, self.cfg.dataset)
    }

    async fn send_with_retries(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Value, CatalogError> {
        send_json_with_retries(
            req,
            what,
            self.cfg.retry_attempts,
            self.cfg.retry_base_delay_ms,
        )
        .await
    }

    async fn get_json(&self, url: &str) -> Result<Value, CatalogError> {
        let mut req = self.http.get(url);
        if let Some(token) = self.cfg.token.as_deref() {
            req = req.bearer_auth(token);
        }
        self.send_with_retries(req, "query").await
    }

    /// Apply a batch of mutations as one atomic transaction.
    pub async fn mutate(&self, mutations: &[Value]) -> Result<Value, CatalogError> {
        if mutations.is_empty() {
            return Ok(json!({ "results": [] }));
        }
        let token = self
            .cfg
            .token
            .as_deref()
            .ok_or(CatalogError::MissingCredential("CMS_API_TOKEN"))?;
        let body = json!({ "mutations": mutations });
        let req = self.http.post(self.mutate_url()).bearer_auth(token).json(&body);
        self.send_with_retries(req, "mutate").await
    }

    /// All documents of the configured type, drafts included.
    pub async fn fetch_all(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        let query = format!(r#"*[_type == "{}"]"#, self.cfg.doc_type);
        let url = self.query_url(&query);
        info!(dataset = %self.cfg.dataset, doc_type = %self.cfg.doc_type, "cms fetch");
        let payload = self.get_json(&url).await?;
        let docs = payload
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::with_capacity(docs.len());
        let mut skipped = 0usize;
        for doc in &docs {
            match record_from_doc(doc) {
                Some(rec) => out.push(rec),
                None => {
                    skipped += 1;
                    warn!(sample = %sample_of(doc), "cms document without _id; skipped");
                }
            }
        }
        info!(fetched = out.len(), skipped, "cms fetch complete");
        Ok(out)
    }

    pub async fn patch(
        &self,
        doc_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Value, CatalogError> {
        self.mutate(&[json!({ "patch": { "id": doc_id, "set": fields } })])
            .await
    }

    pub async fn delete(&self, doc_id: &str) -> Result<Value, CatalogError> {
        self.mutate(&[json!({ "delete": { "id": doc_id } })]).await
    }

    pub async fn create_or_replace(&self, doc: &Value) -> Result<Value, CatalogError> {
        self.mutate(&[json!({ "createOrReplace": doc })]).await
    }
}

#[async_trait]
impl CmsStore for CmsClient {
    async fn fetch_products(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        self.fetch_all().await
    }

    async fn commit_plan(&self, plan: &MutationPlan) -> Result<(), CatalogError> {
        let mutations = plan_mutations(plan);
        if mutations.is_empty() {
            return Ok(());
        }
        info!(
            group = %plan.group_key,
            survivor = %plan.survivor_id,
            deletes = plan.delete_ids.len(),
            "cms commit transaction"
        );
        self.mutate(&mutations).await.map(|_| ())
    }

    async fn apply_link(
        &self,
        doc_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<(), CatalogError> {
        self.patch(doc_id, patch).await.map(|_| ())
    }
}

/// Patch-then-delete mutation list for one group; a single transaction.
fn plan_mutations(plan: &MutationPlan) -> Vec<Value> {
    let mut mutations: Vec<Value> = Vec::new();
    if !plan.patch.is_empty() {
        mutations.push(json!({
            "patch": { "id": record::strip_source(&plan.survivor_id), "set": plan.patch }
        }));
    }
    for id in &plan.delete_ids {
        mutations.push(json!({ "delete": { "id": record::strip_source(id) } }));
    }
    mutations
}

fn record_from_doc(doc: &Value) -> Option<CatalogRecord> {
    let obj = doc.as_object()?;
    let doc_id = obj.get("_id").and_then(|v| v.as_str())?.to_string();
    let title = string_field(obj, FIELD_TITLE).unwrap_or_default();
    let slug = slug_field(obj);
    let classification = string_field(obj, FIELD_SECTION);
    let created_at = obj
        .get("_createdAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let has_media = ["image", "images", "mainImage"]
        .iter()
        .any(|k| non_empty_field(obj, k));
    let units = obj
        .get(FIELD_SIZES)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let external = ExternalRefs {
        product_id: string_field(obj, FIELD_COMMERCE_PRODUCT_ID),
        variant_ids: variant_id_values(obj.get(FIELD_COMMERCE_VARIANT_IDS)),
        handle: string_field(obj, FIELD_COMMERCE_HANDLE),
    };
    let mut raw_payload = Map::new();
    for (k, v) in obj {
        if SYSTEM_FIELDS.contains(&k.as_str()) || MERGE_EXCLUDED_FIELDS.contains(&k.as_str()) {
            continue;
        }
        raw_payload.insert(k.clone(), v.clone());
    }
    Some(CatalogRecord {
        id: Source::Cms.qualify(&doc_id),
        source: Source::Cms,
        title,
        slug,
        external,
        classification,
        has_media,
        is_draft: doc_id.starts_with(DRAFT_PREFIX),
        created_at,
        units,
        raw_payload,
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn slug_field(obj: &Map<String, Value>) -> Option<String> {
    match obj.get(FIELD_SLUG) {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(Value::Object(o)) => o
            .get("current")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn non_empty_field(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn variant_id_values(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Object(o)) => o.values().filter_map(value_as_id).collect(),
        Some(Value::Array(a)) => a.iter().filter_map(value_as_id).collect(),
        _ => Vec::new(),
    }
}

fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sample_of(v: &Value) -> String {
    v.to_string().chars().take(120).collect()
}
