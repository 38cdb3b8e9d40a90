use serde_json::{Map, Value};
use tracing::debug;

use super::grouping::{compare_precedence, select_survivor};
use crate::catalog::cms::{FIELD_SLUG, FIELD_TITLE};
use crate::catalog::{CatalogRecord, MatchGroup, MutationPlan, SkippedDelete};

pub const SKIP_EXCLUSIVE_COMMERCE_LINK: &str = "exclusive-commerce-link";

/// Resolve one identity group into a merge patch plus a guarded delete set.
///
/// The guard is structural: a loser holding a commerce reference the survivor
/// lacks is never emitted as a delete, so the only copy of linked data cannot
/// be destroyed. Plans are re-derived from remote state every run.
pub fn plan_group(group: &MatchGroup) -> MutationPlan {
    let mut plan = MutationPlan {
        group_key: group.key.clone(),
        survivor_id: String::new(),
        patch: Map::new(),
        delete_ids: Vec::new(),
        skipped: Vec::new(),
    };
    let Some(survivor) = select_survivor(group) else {
        return plan;
    };
    plan.survivor_id = survivor.id.clone();
    if !group.is_duplicate_set() {
        return plan;
    }

    let losers: Vec<&CatalogRecord> = group
        .members
        .iter()
        .filter(|m| m.id != survivor.id)
        .collect();

    // Merge source: the loser contributing the most fields the survivor
    // is missing.
    let donor = losers
        .iter()
        .map(|loser| (enrichment_fields(loser, survivor), *loser))
        .filter(|(fields, _)| !fields.is_empty())
        .max_by(|(fields_a, a), (fields_b, b)| {
            fields_a
                .len()
                .cmp(&fields_b.len())
                .then_with(|| compare_precedence(a, b))
        });
    if let Some((fields, donor)) = donor {
        debug!(group = %group.key, donor = %donor.id, fields = fields.len(), "merge donor selected");
        for (key, value) in fields {
            plan.patch.insert(key.to_string(), value.clone());
        }
    }

    // Title and slug are lifted out of raw_payload, so the donor merge never
    // sees them; a survivor missing either takes it from the best loser that
    // has one.
    if !survivor.has_title() {
        if let Some(titled) = best_loser(&losers, |l| l.has_title()) {
            plan.patch.insert(
                FIELD_TITLE.to_string(),
                Value::String(titled.title.trim().to_string()),
            );
        }
    }
    if survivor.slug.is_none() {
        let donated = best_loser(&losers, |l| l.slug.is_some()).and_then(|l| l.slug.clone());
        if let Some(slug) = donated {
            plan.patch.insert(FIELD_SLUG.to_string(), Value::String(slug));
        }
    }

    for loser in losers {
        if holds_exclusive_commerce_link(loser, survivor) {
            plan.skipped.push(SkippedDelete {
                id: loser.id.clone(),
                reason: SKIP_EXCLUSIVE_COMMERCE_LINK.to_string(),
            });
        } else {
            plan.delete_ids.push(loser.id.clone());
        }
    }
    plan
}

fn best_loser<'a>(
    losers: &[&'a CatalogRecord],
    has: impl Fn(&CatalogRecord) -> bool,
) -> Option<&'a CatalogRecord> {
    losers
        .iter()
        .copied()
        .filter(|l| has(l))
        .max_by(|a, b| compare_precedence(a, b))
}

/// Payload fields present on the donor but absent or empty on the survivor.
fn enrichment_fields<'a>(
    donor: &'a CatalogRecord,
    survivor: &CatalogRecord,
) -> Vec<(&'a str, &'a Value)> {
    donor
        .raw_payload
        .iter()
        .filter(|(key, value)| {
            value_has_content(value)
                && !survivor
                    .raw_payload
                    .get(*key)
                    .map(value_has_content)
                    .unwrap_or(false)
        })
        .map(|(key, value)| (key.as_str(), value))
        .collect()
}

fn value_has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn holds_exclusive_commerce_link(loser: &CatalogRecord, survivor: &CatalogRecord) -> bool {
    if let Some(product_id) = &loser.external.product_id {
        if survivor.external.product_id.as_ref() != Some(product_id) {
            return true;
        }
    }
    if let Some(handle) = &loser.external.handle {
        if survivor.external.handle.as_ref() != Some(handle) {
            return true;
        }
    }
    loser
        .external
        .variant_ids
        .iter()
        .any(|v| !survivor.external.variant_ids.contains(v))
}
