use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::grouping::{draft_pairs, group_records, select_survivor};
use super::linker::link_record;
use super::planner::plan_group;
use super::report::{ReportEvent, RunMode, RunReport};
use crate::catalog::cms::{FIELD_COMMERCE_PRODUCT_ID, FIELD_COMMERCE_VARIANT_IDS, FIELD_SECTION};
use crate::catalog::record::strip_source;
use crate::catalog::{
    CatalogRecord, CmsStore, CommerceStore, LinkConfidence, LinkPlan, Source,
};
use crate::normalization::MatchConfig;

/// The two catalog adapters, injected so tests can run against fakes.
#[derive(Clone)]
pub struct ReconDeps {
    pub cms: Arc<dyn CmsStore>,
    /// Absent for CMS-only scopes so audit runs need no commerce credentials.
    pub commerce: Option<Arc<dyn CommerceStore>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunScope {
    Audit,
    Dedupe,
    Link,
    Full,
}

impl RunScope {
    pub fn needs_commerce(self) -> bool {
        matches!(self, RunScope::Link | RunScope::Full)
    }

    fn dedupes(self) -> bool {
        matches!(self, RunScope::Dedupe | RunScope::Full)
    }

    fn links(self) -> bool {
        matches!(self, RunScope::Link | RunScope::Full)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    pub scope: RunScope,
    pub execute: bool,
    pub confirm_heuristic: bool,
    pub link_concurrency: usize,
}

impl RunOptions {
    pub fn dry_run(scope: RunScope) -> Self {
        Self {
            scope,
            execute: false,
            confirm_heuristic: false,
            link_concurrency: 4,
        }
    }
}

/// Drive one reconciliation run to completion.
///
/// Stage order: fetch, group and score, plan, commit (execute only), link,
/// commit (execute only). Failures inside one group or one link are recorded
/// in the report and the run continues; only precondition failures (adapter
/// missing, catalog unreachable) abort the whole run.
pub async fn run(deps: &ReconDeps, opts: RunOptions, config: &MatchConfig) -> Result<RunReport> {
    let mode = if opts.execute {
        RunMode::Execute
    } else {
        RunMode::DryRun
    };
    let report = Mutex::new(RunReport::new(mode));
    info!(scope = ?opts.scope, mode = %mode, "reconciliation: starting");

    let (cms_records, commerce_records) = fetch_catalogs(deps, opts.scope).await?;
    {
        let mut rep = lock_report(&report);
        rep.push(ReportEvent::Fetched {
            source: Source::Cms,
            records: cms_records.len(),
        });
        if opts.scope.needs_commerce() {
            rep.push(ReportEvent::Fetched {
                source: Source::Commerce,
                records: commerce_records.len(),
            });
        }
    }
    info!(
        cms = cms_records.len(),
        commerce = commerce_records.len(),
        "fetch: complete"
    );

    let grouped = group_records(&cms_records, config);
    {
        let mut rep = lock_report(&report);
        for (draft_id, published_id) in draft_pairs(&cms_records) {
            rep.push(ReportEvent::DraftPair {
                draft_id,
                published_id,
            });
        }
        for entry in &grouped.manual_attention {
            rep.push(ReportEvent::ManualAttention {
                id: entry.id.clone(),
                reason: entry.reason.clone(),
            });
        }
    }
    info!(
        groups = grouped.groups.len(),
        manual = grouped.manual_attention.len(),
        "group: complete"
    );

    if opts.scope == RunScope::Audit {
        let report = into_report(report);
        info!(run_id = %report.run_id, "audit: complete");
        return Ok(report);
    }

    if opts.scope.dedupes() {
        let mut plans = Vec::new();
        for group in &grouped.groups {
            let plan = plan_group(group);
            if group.is_duplicate_set() {
                lock_report(&report).push(ReportEvent::GroupPlanned {
                    member_ids: group.members.iter().map(|m| m.id.clone()).collect(),
                    plan: plan.clone(),
                });
            }
            if !plan.is_noop() {
                plans.push(plan);
            }
        }
        info!(actionable_groups = plans.len(), "dedupe: planning complete");

        if opts.execute {
            for plan in &plans {
                match deps.cms.commit_plan(plan).await {
                    Ok(()) => {
                        info!(
                            group = %plan.group_key,
                            survivor = %plan.survivor_id,
                            deletes = plan.delete_ids.len(),
                            "dedupe: group committed"
                        );
                        lock_report(&report).push(ReportEvent::GroupCommitted {
                            group_key: plan.group_key.clone(),
                            survivor_id: plan.survivor_id.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(group = %plan.group_key, error = %e, "dedupe: group commit failed; continuing");
                        lock_report(&report).push(ReportEvent::GroupFailed {
                            group_key: plan.group_key.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    if opts.scope.links() {
        let survivors: Vec<CatalogRecord> = grouped
            .groups
            .iter()
            .filter_map(|g| select_survivor(g).cloned())
            .collect();
        link_stage(deps, &opts, config, survivors, commerce_records, &report).await;
    }

    let report = into_report(report);
    info!(run_id = %report.run_id, mode = %mode, "reconciliation: complete");
    Ok(report)
}

async fn fetch_catalogs(
    deps: &ReconDeps,
    scope: RunScope,
) -> Result<(Vec<CatalogRecord>, Vec<CatalogRecord>)> {
    if scope.needs_commerce() {
        let commerce = deps
            .commerce
            .as_ref()
            .context("commerce adapter not configured")?;
        let (cms, com) = tokio::join!(deps.cms.fetch_products(), commerce.fetch_products());
        Ok((
            cms.context("cms fetch failed")?,
            com.context("commerce fetch failed")?,
        ))
    } else {
        let cms = deps
            .cms
            .fetch_products()
            .await
            .context("cms fetch failed")?;
        Ok((cms, Vec::new()))
    }
}

/// Match canonical records against the commerce catalog, then serially
/// commit the accepted plans. Matching is pure and runs under a
/// concurrency bound; the report stays in deterministic record order.
async fn link_stage(
    deps: &ReconDeps,
    opts: &RunOptions,
    config: &MatchConfig,
    candidates: Vec<CatalogRecord>,
    commerce_records: Vec<CatalogRecord>,
    report: &Mutex<RunReport>,
) {
    let mut eligible = Vec::new();
    for rec in candidates {
        if rec.external.product_id.is_some() {
            lock_report(report).push(ReportEvent::LinkSkipped {
                cms_id: rec.id.clone(),
                reason: "already-linked".to_string(),
            });
        } else {
            eligible.push(rec);
        }
    }

    let commerce = Arc::new(commerce_records);
    let config = Arc::new(config.clone());
    let sem = Arc::new(Semaphore::new(opts.link_concurrency.max(1)));
    let tasks: Vec<_> = eligible
        .iter()
        .map(|rec| {
            let rec = rec.clone();
            let commerce = Arc::clone(&commerce);
            let config = Arc::clone(&config);
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await;
                link_record(&rec, &commerce, &config)
            })
        })
        .collect();
    let outcomes = join_all(tasks).await;

    let mut to_commit: Vec<LinkPlan> = Vec::new();
    {
        let mut rep = lock_report(report);
        for (rec, outcome) in eligible.iter().zip(outcomes) {
            match outcome {
                Ok(Some(plan)) => {
                    rep.push(ReportEvent::LinkPlanned { plan: plan.clone() });
                    if opts.execute {
                        if plan.confidence == LinkConfidence::Heuristic && !opts.confirm_heuristic
                        {
                            rep.push(ReportEvent::LinkHeld {
                                cms_id: plan.cms_id.clone(),
                            });
                        } else {
                            to_commit.push(plan);
                        }
                    }
                }
                Ok(None) => rep.push(ReportEvent::LinkUnmatched {
                    cms_id: rec.id.clone(),
                    title: rec.title.clone(),
                }),
                Err(e) => rep.push(ReportEvent::LinkFailed {
                    cms_id: rec.id.clone(),
                    error: e.to_string(),
                }),
            }
        }
    }
    info!(accepted = to_commit.len(), "link: matching complete");

    for plan in &to_commit {
        let patch = link_patch(plan);
        match deps.cms.apply_link(strip_source(&plan.cms_id), &patch).await {
            Ok(()) => {
                info!(
                    cms_id = %plan.cms_id,
                    product = %plan.commerce_product_id,
                    confidence = %plan.confidence,
                    "link: committed"
                );
                lock_report(report).push(ReportEvent::LinkCommitted {
                    cms_id: plan.cms_id.clone(),
                    commerce_product_id: plan.commerce_product_id.clone(),
                });
            }
            Err(e) => {
                warn!(cms_id = %plan.cms_id, error = %e, "link: commit failed; continuing");
                lock_report(report).push(ReportEvent::LinkFailed {
                    cms_id: plan.cms_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// CMS patch for one accepted link plan. Heuristic plans only reach this
/// point once confirmed, so any proposed section rides along here.
fn link_patch(plan: &LinkPlan) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(
        FIELD_COMMERCE_PRODUCT_ID.to_string(),
        Value::String(plan.commerce_product_id.clone()),
    );
    if !plan.commerce_variant_ids.is_empty() {
        let mut variants = Map::new();
        for (unit, id) in &plan.commerce_variant_ids {
            variants.insert(unit.clone(), Value::String(id.clone()));
        }
        patch.insert(FIELD_COMMERCE_VARIANT_IDS.to_string(), Value::Object(variants));
    }
    if let Some(section) = &plan.proposed_section {
        patch.insert(FIELD_SECTION.to_string(), Value::String(section.clone()));
    }
    patch
}

fn lock_report(report: &Mutex<RunReport>) -> MutexGuard<'_, RunReport> {
    report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn into_report(report: Mutex<RunReport>) -> RunReport {
    report
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
