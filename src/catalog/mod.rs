//! Thin clients for the two remote catalogs and the normalized record model.

pub mod cms;
pub mod commerce;
pub mod record;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;

pub use cms::{CmsClient, CmsConfig};
pub use commerce::{CommerceClient, CommerceConfig};
pub use record::{
    CatalogRecord, ExternalRefs, LinkConfidence, LinkPlan, MatchGroup, MutationPlan, SkippedDelete,
    Source, DRAFT_PREFIX,
};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("config: {0}")]
    Config(String),
}

impl CatalogError {
    /// Transient failures worth retrying: network errors, 429, 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Net(_) => true,
            CatalogError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Backoff delay with random jitter so parallel retries don't align.
pub(crate) fn jittered(base: Duration) -> Duration {
    let cap = (base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..=cap);
    base + Duration::from_millis(jitter)
}

/// Send a request, retrying transient failures (network, 429, 5xx) with
/// exponential backoff, and parse the body as JSON. 4xx fails fast.
pub(crate) async fn send_json_with_retries(
    req: reqwest::RequestBuilder,
    what: &str,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<Value, CatalogError> {
    use tracing::{debug, warn};

    let max_attempts = max_attempts.max(1);
    let mut delay = Duration::from_millis(base_delay_ms.max(1));
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Some(attempt_req) = req.try_clone() else {
            return Err(CatalogError::Config(format!(
                "{what}: request body not retryable"
            )));
        };
        let resp = match attempt_req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(attempt, what, error = %e, "catalog network error");
                if attempt >= max_attempts {
                    return Err(CatalogError::Net(e));
                }
                tokio::time::sleep(jittered(delay)).await;
                delay = delay.saturating_mul(2);
                continue;
            }
        };
        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(attempt, what, error = %e, "catalog body read error");
                if attempt >= max_attempts {
                    return Err(CatalogError::Net(e));
                }
                tokio::time::sleep(jittered(delay)).await;
                delay = delay.saturating_mul(2);
                continue;
            }
        };
        if !status.is_success() {
            let transient = status.as_u16() == 429 || status.as_u16() >= 500;
            if transient && attempt < max_attempts {
                warn!(attempt, what, status = status.as_u16(), "catalog transient http error; retrying");
                tokio::time::sleep(jittered(delay)).await;
                delay = delay.saturating_mul(2);
                continue;
            }
            return Err(CatalogError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!(what, status = status.as_u16(), body_len = body.len(), "catalog response");
        return Ok(serde_json::from_str(&body)?);
    }
}

/// Write-capable view of the CMS catalog. The engine mutates nothing else.
#[async_trait]
pub trait CmsStore: Send + Sync {
    /// Snapshot every product document, drafts included.
    async fn fetch_products(&self) -> Result<Vec<CatalogRecord>, CatalogError>;
    /// Apply one duplicate-group resolution as a single atomic transaction.
    async fn commit_plan(&self, plan: &MutationPlan) -> Result<(), CatalogError>;
    /// Patch commerce identifiers (and optionally a section) onto one document.
    async fn apply_link(&self, doc_id: &str, patch: &Map<String, Value>)
        -> Result<(), CatalogError>;
}

/// Read-only view of the Commerce catalog.
#[async_trait]
pub trait CommerceStore: Send + Sync {
    async fn fetch_products(&self) -> Result<Vec<CatalogRecord>, CatalogError>;
}
