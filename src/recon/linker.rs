use std::collections::BTreeMap;

use tracing::debug;

use crate::catalog::commerce::variant_skus;
use crate::catalog::{CatalogRecord, LinkConfidence, LinkPlan};
use crate::normalization::identity::{sku_matches_unit, title_similarity};
use crate::normalization::{normalize_key, MatchConfig};

/// Match one canonical CMS record against the commerce catalog.
///
/// Tier precedence: exact slug/handle equality, then the curated
/// title-to-handle alias table, then the heuristic tier. Heuristic plans are
/// proposals until explicitly confirmed. No match is not an error.
pub fn link_record(
    cms: &CatalogRecord,
    commerce: &[CatalogRecord],
    config: &MatchConfig,
) -> Option<LinkPlan> {
    let (candidate, confidence) = find_candidate(cms, commerce, config)?;
    debug!(cms = %cms.id, commerce = %candidate.id, confidence = %confidence, "link candidate");
    Some(build_plan(cms, candidate, confidence, config))
}

fn find_candidate<'a>(
    cms: &CatalogRecord,
    commerce: &'a [CatalogRecord],
    config: &MatchConfig,
) -> Option<(&'a CatalogRecord, LinkConfidence)> {
    if let Some(slug) = cms.slug_key() {
        if let Some(hit) = by_handle(commerce, &slug) {
            return Some((hit, LinkConfidence::Exact));
        }
    }
    if cms.has_title() {
        if let Some(handle) = config.linked_handle(&cms.title_key()) {
            if let Some(hit) = by_handle(commerce, &normalize_key(handle)) {
                return Some((hit, LinkConfidence::Alias));
            }
        }
    }
    heuristic_candidate(cms, commerce, config).map(|hit| (hit, LinkConfidence::Heuristic))
}

fn by_handle<'a>(commerce: &'a [CatalogRecord], handle_key: &str) -> Option<&'a CatalogRecord> {
    commerce
        .iter()
        .find(|c| c.slug_key().as_deref() == Some(handle_key))
}

fn heuristic_candidate<'a>(
    cms: &CatalogRecord,
    commerce: &'a [CatalogRecord],
    config: &MatchConfig,
) -> Option<&'a CatalogRecord> {
    if !cms.has_title() {
        return None;
    }
    let own = config.strip_decorative(&cms.title_key());
    let own_section = config.infer_section(&own);
    let mut best: Option<(f64, &CatalogRecord)> = None;
    for candidate in commerce {
        let theirs_raw = if candidate.has_title() {
            candidate.title_key()
        } else {
            match candidate.slug_key() {
                Some(key) => key,
                None => continue,
            }
        };
        let theirs = config.strip_decorative(&theirs_raw);
        if config.alias_equivalent(&own, &theirs) {
            return Some(candidate);
        }
        let similarity = title_similarity(&own, &theirs);
        if similarity >= config.min_title_similarity
            && own_section.is_some()
            && own_section == config.infer_section(&theirs)
        {
            match best {
                Some((top, _)) if top >= similarity => {}
                _ => best = Some((similarity, candidate)),
            }
        }
    }
    best.map(|(_, candidate)| candidate)
}

fn build_plan(
    cms: &CatalogRecord,
    commerce: &CatalogRecord,
    confidence: LinkConfidence,
    config: &MatchConfig,
) -> LinkPlan {
    let skus = variant_skus(commerce);
    let mut commerce_variant_ids = BTreeMap::new();
    let mut unmatched_units = Vec::new();
    for label in &cms.units {
        let Some(unit) = config.extract_unit(label) else {
            unmatched_units.push(label.clone());
            continue;
        };
        match skus.iter().find(|(_, sku)| sku_matches_unit(sku, &unit)) {
            Some((variant_id, _)) => {
                commerce_variant_ids.insert(unit, variant_id.clone());
            }
            None => unmatched_units.push(label.clone()),
        }
    }
    let proposed_section = match confidence {
        LinkConfidence::Heuristic => config
            .infer_section(&config.strip_decorative(&cms.title_key()))
            .filter(|section| cms.classification.as_deref() != Some(section))
            .map(str::to_string),
        _ => None,
    };
    LinkPlan {
        cms_id: cms.id.clone(),
        commerce_product_id: commerce.doc_id().to_string(),
        commerce_variant_ids,
        unmatched_units,
        confidence,
        proposed_section,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExternalRefs, Source};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map};

    fn cms(id: &str, title: &str, slug: Option<&str>, units: &[&str]) -> CatalogRecord {
        CatalogRecord {
            id: Source::Cms.qualify(id),
            source: Source::Cms,
            title: title.to_string(),
            slug: slug.map(str::to_string),
            external: ExternalRefs::default(),
            classification: None,
            has_media: false,
            is_draft: false,
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            units: units.iter().map(|u| u.to_string()).collect(),
            raw_payload: Map::new(),
        }
    }

    fn commerce(id: u64, title: &str, handle: &str, variants: &[(u64, &str)]) -> CatalogRecord {
        let mut raw_payload = Map::new();
        raw_payload.insert(
            "variants".to_string(),
            json!(variants
                .iter()
                .map(|(vid, sku)| json!({"id": vid, "sku": sku}))
                .collect::<Vec<_>>()),
        );
        CatalogRecord {
            id: Source::Commerce.qualify(&id.to_string()),
            source: Source::Commerce,
            title: title.to_string(),
            slug: Some(handle.to_string()),
            external: ExternalRefs {
                product_id: Some(id.to_string()),
                variant_ids: variants.iter().map(|(vid, _)| vid.to_string()).collect(),
                handle: Some(handle.to_string()),
            },
            classification: None,
            has_media: false,
            is_draft: false,
            created_at: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            units: Vec::new(),
            raw_payload,
        }
    }

    #[test]
    fn exact_slug_handle_match() {
        let config = MatchConfig::builtin();
        let shop = vec![commerce(9001, "Kyoto", "kyoto", &[(11, "KY-6ML")])];
        let plan = link_record(&cms("kyoto", "Kyoto", Some("kyoto"), &["6ml"]), &shop, &config)
            .unwrap();
        assert_eq!(plan.confidence, LinkConfidence::Exact);
        assert_eq!(plan.commerce_product_id, "9001");
        assert_eq!(plan.commerce_variant_ids.get("6ml"), Some(&"11".to_string()));
        assert!(plan.unmatched_units.is_empty());
        assert_eq!(plan.proposed_section, None);
    }

    #[test]
    fn alias_table_bridges_renamed_handle() {
        let config = MatchConfig::builtin();
        let shop = vec![
            commerce(7001, "Kyoto", "kyoto", &[]),
            commerce(7002, "Delmar", "delmar", &[(21, "DM-6ML"), (22, "DM-50ML")]),
        ];
        let record = cms("del-mare", "Del Mare", Some("del-mare"), &["6ml", "100ml"]);
        let plan = link_record(&record, &shop, &config).unwrap();
        assert_eq!(plan.confidence, LinkConfidence::Alias);
        assert_eq!(plan.commerce_product_id, "7002");
        assert_eq!(plan.commerce_variant_ids.get("6ml"), Some(&"21".to_string()));
        assert_eq!(plan.unmatched_units, vec!["100ml"]);
    }

    #[test]
    fn heuristic_equality_after_stripping_suffixes() {
        let config = MatchConfig::builtin();
        let shop = vec![commerce(5005, "Cairo Musk", "cairo-musk", &[])];
        let record = cms("x1c2v3b4n5m6", "Cairo Musk Extrait de Parfum", None, &[]);
        let plan = link_record(&record, &shop, &config).unwrap();
        assert_eq!(plan.confidence, LinkConfidence::Heuristic);
        assert_eq!(plan.commerce_product_id, "5005");
    }

    #[test]
    fn heuristic_spelling_alias_equivalence() {
        let config = MatchConfig::builtin();
        let shop = vec![commerce(5006, "Okume", "okume-parfum", &[])];
        let record = cms("okoume", "Okoume", None, &[]);
        let plan = link_record(&record, &shop, &config).unwrap();
        assert_eq!(plan.confidence, LinkConfidence::Heuristic);
        assert_eq!(plan.commerce_product_id, "5006");
    }

    #[test]
    fn near_title_needs_section_agreement() {
        let config = MatchConfig::builtin();

        // Both titles carry essence vocabulary: accepted.
        let shop = vec![commerce(3003, "Oud Royal", "oud-royal-x", &[])];
        let record = cms("oud-royale", "Oud Royale", None, &[]);
        let plan = link_record(&record, &shop, &config).unwrap();
        assert_eq!(plan.confidence, LinkConfidence::Heuristic);
        assert_eq!(plan.proposed_section, Some("essence".to_string()));

        // Near-identical titles with no section vocabulary: refused.
        let shop = vec![commerce(3004, "Velvet Rosa", "velvet-rosa", &[])];
        let record = cms("velvet-rose", "Velvet Rose", None, &[]);
        assert!(link_record(&record, &shop, &config).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let config = MatchConfig::builtin();
        let shop = vec![commerce(1001, "Another Thing", "another-thing", &[])];
        let record = cms("completely-different", "Completely Different", None, &[]);
        assert!(link_record(&record, &shop, &config).is_none());
    }

    #[test]
    fn unparseable_size_label_reports_unmatched() {
        let config = MatchConfig::builtin();
        let shop = vec![commerce(9001, "Kyoto", "kyoto", &[(11, "KY-6ML")])];
        let record = cms("kyoto", "Kyoto", Some("kyoto"), &["6ml", "gift box"]);
        let plan = link_record(&record, &shop, &config).unwrap();
        assert_eq!(plan.unmatched_units, vec!["gift box"]);
    }
}
